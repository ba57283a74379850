//! `bigsort` sorts numbered text records that don't fit into the main memory.
//!
//! Every input line has the form `<number>. <value>\r\n`. The output contains the same records grouped by
//! `value` in ordinal (byte-wise) order, with the numbers of every value sorted in ascending order.
//!
//! # Overview
//!
//! Inputs below a size threshold are aggregated in a single in-memory map and written out directly.
//! Larger inputs go through the external pipeline:
//!
//! * **Aggregation:**
//!   records are collected into a fixed-capacity hash table whose keys live in a pre-sized byte arena,
//!   so ingestion doesn't allocate once the buffer is warmed up.
//! * **Spilling:**
//!   when the table or the arena is exhausted, the buffer is sorted on a thread pool, written to a
//!   partition file and cleared for reuse.
//! * **Merging:**
//!   all partitions are merged with explicit tie detection, so numbers of a value that was split across
//!   several partitions end up in a single sorted group.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use bigsort::ExternalSorterBuilder;
//!
//! fn main() {
//!     let sorter = ExternalSorterBuilder::new()
//!         .with_tmp_dir(Path::new("./"))
//!         .with_buffer_capacity(500_000)
//!         .with_arena_capacity(64 * 1024 * 1024)
//!         .build()
//!         .unwrap();
//!
//!     let stats = sorter.sort_file(Path::new("input.txt"), Path::new("output.txt")).unwrap();
//!     log::info!("{} records sorted", stats.records);
//! }
//! ```

pub mod buffer;
pub mod codec;
pub mod error;
pub mod merger;
pub mod partition;
pub mod sort;
pub mod strategy;

pub use buffer::AggregationBuffer;
pub use codec::{Record, RecordBuf, RecordReader};
pub use error::{Location, Result, SortError};
pub use merger::{find_partitions, MergeStats, PartitionMerger};
pub use partition::{PartitionReader, PartitionWriter};
pub use sort::{ExternalSorter, ExternalSorterBuilder, Phase, Progress, SortStats};
pub use strategy::{PartitionStrategy, SmallFileStrategy, SortStrategy};

/// Maximum value length in characters.
pub const VALUE_MAX_LEN: usize = 1024;

/// Maximum value length in bytes (every character takes at most 4 bytes in UTF-8).
pub const VALUE_MAX_BYTES: usize = VALUE_MAX_LEN * 4;

/// Length of the longest 64-bit integer text representation (`-9223372036854775808`).
pub const NUMBER_MAX_LEN: usize = 20;

/// Separator between a record number and its value.
pub const NUMBER_POSTFIX: &[u8] = b". ";

/// Partition file name pattern, `*` is replaced by the zero-padded partition index.
pub const PARTITION_FILE_PATTERN: &str = "partition-*.tmp";
