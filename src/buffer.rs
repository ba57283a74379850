//! Aggregation buffer.
//!
//! A fixed-capacity hash table mapping values to their numbers. Keys are copied into a single
//! pre-sized byte arena, entries and collision chains are addressed by index. Once the table
//! is full it is flushed to a partition and cleared, the backing storage is reused for the
//! next partition.

use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::BuildHasher;

use crate::error::{Result, SortError};

/// Initial capacity of an entry number list.
pub const INITIAL_NUMBERS_CAPACITY: usize = 16;

/// Chain link terminating a collision chain (also marks an empty bucket).
const CHAIN_END: i32 = -1;
/// Chain link of a cleared entry.
const VACANT: i32 = -2;

/// Buffered value with its numbers.
struct AggregationEntry {
    hash: u64,
    /// Index of the next entry in the same bucket, [`CHAIN_END`] or [`VACANT`].
    next: i32,
    key_offset: usize,
    key_len: usize,
    numbers: Vec<i64>,
}

impl AggregationEntry {
    fn is_live(&self) -> bool {
        self.next >= CHAIN_END
    }

    fn key<'a>(&self, arena: &'a [u8]) -> &'a [u8] {
        &arena[self.key_offset..self.key_offset + self.key_len]
    }
}

/// Fixed-capacity hash table over a key arena.
pub struct AggregationBuffer {
    hash_builder: RandomState,
    /// Head entry index of every bucket chain.
    buckets: Vec<i32>,
    /// Entry slots, slots beyond `count` keep their number lists allocated for reuse.
    entries: Vec<AggregationEntry>,
    count: usize,
    capacity: usize,
    arena: Vec<u8>,
    arena_capacity: usize,
}

impl AggregationBuffer {
    /// Creates a buffer holding up to `capacity` distinct values whose keys take
    /// up to `arena_capacity` bytes in total.
    pub fn new(capacity: usize, arena_capacity: usize) -> Result<Self> {
        if capacity == 0 || capacity > i32::MAX as usize {
            return Err(SortError::InvalidConfig(format!(
                "buffer capacity must be in range 1..={}, got {}",
                i32::MAX,
                capacity
            )));
        }

        return Ok(AggregationBuffer {
            hash_builder: RandomState::new(),
            buckets: vec![CHAIN_END; capacity],
            entries: Vec::with_capacity(capacity),
            count: 0,
            capacity,
            arena: Vec::with_capacity(arena_capacity),
            arena_capacity,
        });
    }

    /// Adds a number to the value's entry.
    ///
    /// Returns `false` without changing the buffer if the value is a new key and either the entry
    /// table is full or the arena has no room for the key.
    pub fn try_add(&mut self, number: i64, value: &[u8]) -> Result<bool> {
        let hash = self.hash_builder.hash_one(value);
        let bucket = (hash % self.capacity as u64) as usize;

        if let Some(idx) = self.find(hash, bucket, value)? {
            self.entries[idx].numbers.push(number);
            return Ok(true);
        }

        if self.count == self.capacity || self.arena_capacity - self.arena.len() < value.len() {
            return Ok(false);
        }

        let key_offset = self.arena.len();
        self.arena.extend_from_slice(value);

        let idx = self.count;
        let head = self.buckets[bucket];
        if idx < self.entries.len() {
            let entry = &mut self.entries[idx];
            entry.hash = hash;
            entry.next = head;
            entry.key_offset = key_offset;
            entry.key_len = value.len();
            entry.numbers.push(number);
        } else {
            let mut numbers = Vec::with_capacity(INITIAL_NUMBERS_CAPACITY);
            numbers.push(number);
            self.entries.push(AggregationEntry {
                hash,
                next: head,
                key_offset,
                key_len: value.len(),
                numbers,
            });
        }
        self.buckets[bucket] = idx as i32;
        self.count += 1;

        return Ok(true);
    }

    /// Checks whether the number was added for the value.
    pub fn contains(&self, value: &[u8], number: i64) -> Result<bool> {
        let hash = self.hash_builder.hash_one(value);
        let bucket = (hash % self.capacity as u64) as usize;

        return Ok(match self.find(hash, bucket, value)? {
            Some(idx) => self.entries[idx].numbers.contains(&number),
            None => false,
        });
    }

    fn find(&self, hash: u64, bucket: usize, value: &[u8]) -> Result<Option<usize>> {
        let mut link = self.buckets[bucket];
        let mut walked = 0;

        while link >= 0 {
            let entry = &self.entries[link as usize];
            if entry.hash == hash && entry.key(&self.arena) == value {
                return Ok(Some(link as usize));
            }

            walked += 1;
            if walked > self.count {
                return Err(SortError::TooManyCollisions {
                    walked,
                    entries: self.count,
                });
            }
            link = entry.next;
        }

        return Ok(None);
    }

    /// Removes all entries keeping the allocated storage.
    pub fn clear(&mut self) {
        if self.count == 0 {
            return;
        }

        for entry in &mut self.entries[..self.count] {
            entry.next = VACANT;
            entry.numbers.clear();
            // bounds memory held by hot keys at the cost of regrowing their lists
            entry.numbers.shrink_to(INITIAL_NUMBERS_CAPACITY);
        }
        self.buckets.fill(CHAIN_END);
        self.arena.clear();
        self.count = 0;
    }

    /// Returns live entries as `(value, numbers)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[i64])> + '_ {
        let arena = &self.arena;
        self.entries[..self.count]
            .iter()
            .filter(|entry| entry.is_live())
            .map(move |entry| (entry.key(arena), entry.numbers.as_slice()))
    }

    /// Returns live entries with mutable number lists in insertion order.
    pub fn entries_mut(&mut self) -> impl Iterator<Item = (&[u8], &mut [i64])> + '_ {
        let arena = &self.arena;
        self.entries[..self.count]
            .iter_mut()
            .filter(|entry| entry.is_live())
            .map(move |entry| (entry.key(arena), entry.numbers.as_mut_slice()))
    }

    /// Returns the number of buffered values.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of arena bytes taken by keys.
    pub fn arena_used(&self) -> usize {
        self.arena.len()
    }

    pub fn arena_capacity(&self) -> usize {
        self.arena_capacity
    }
}

impl fmt::Display for AggregationBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arena = if self.arena_capacity == 0 {
            100.0
        } else {
            self.arena.len() as f64 / self.arena_capacity as f64 * 100.0
        };
        let entries = self.count as f64 / self.capacity as f64 * 100.0;

        write!(f, "arena {:.1}%, entries {:.1}%", arena, entries)
    }
}
