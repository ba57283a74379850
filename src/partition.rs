//! Partition files.
//!
//! A partition is a sequence of `<value>\n<n1>|<n2>|...\n` blocks in ascending value order,
//! numbers of every block are sorted in ascending order too.

use std::fs;
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};

use rayon::prelude::*;

use crate::buffer::AggregationBuffer;
use crate::codec::{self, LF, NUMBER_SEPARATOR};
use crate::error::{Location, Result, SortError};
use crate::{NUMBER_MAX_LEN, PARTITION_FILE_PATTERN, VALUE_MAX_BYTES};

fn partition_io(partition: usize, path: &Path, source: io::Error) -> SortError {
    SortError::PartitionIo {
        partition,
        path: path.to_path_buf(),
        source,
    }
}

/// Returns the path of the partition with the given index.
pub fn partition_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(PARTITION_FILE_PATTERN.replace('*', &format!("{:03}", index)))
}

/// Writes aggregation buffers to partition files of a directory.
pub struct PartitionWriter {
    dir: PathBuf,
    rw_buf_size: Option<usize>,
    paths: Vec<PathBuf>,
}

impl PartitionWriter {
    /// Creates a partition writer.
    ///
    /// # Arguments
    /// * `dir` - Directory the partitions are created in
    /// * `rw_buf_size` - Partition file write buffer size
    pub fn new(dir: &Path, rw_buf_size: Option<usize>) -> Self {
        PartitionWriter {
            dir: dir.to_path_buf(),
            rw_buf_size,
            paths: Vec::new(),
        }
    }

    /// Sorts the buffer on the thread pool, saves it as the next partition and clears it.
    /// Returns the path of the created partition.
    pub fn write(&mut self, buffer: &mut AggregationBuffer, thread_pool: &rayon::ThreadPool) -> Result<&Path> {
        let index = self.paths.len();
        let path = partition_path(&self.dir, index);

        log::debug!("sorting partition {} data ({}) ...", index, buffer);
        let mut entries: Vec<(&[u8], &mut [i64])> = buffer.entries_mut().collect();
        thread_pool.install(|| {
            entries.par_sort_unstable_by(|a, b| a.0.cmp(b.0));
            entries
                .par_iter_mut()
                .for_each(|(_, numbers)| numbers.sort_unstable());
        });

        log::debug!("saving partition {} to {}", index, path.display());
        Self::dump(&path, &entries, self.rw_buf_size).map_err(|err| partition_io(index, &path, err))?;
        drop(entries);

        buffer.clear();
        self.paths.push(path);

        return Ok(&self.paths[index]);
    }

    fn dump(path: &Path, entries: &[(&[u8], &mut [i64])], buf_size: Option<usize>) -> io::Result<()> {
        let file = fs::File::create(path)?;
        let mut writer = match buf_size {
            Some(buf_size) => io::BufWriter::with_capacity(buf_size, file),
            None => io::BufWriter::new(file),
        };

        for (value, numbers) in entries {
            codec::write_partition_block(&mut writer, value, numbers)?;
        }

        return writer.flush();
    }

    /// Returns the number of written partitions.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn into_paths(self) -> Vec<PathBuf> {
        self.paths
    }
}

/// Partition reader cursor.
///
/// The cursor is positioned at a value block, numbers of the block are read lazily
/// by [`PartitionReader::next_number`].
pub struct PartitionReader<R = io::BufReader<fs::File>> {
    reader: R,
    index: usize,
    path: PathBuf,
    value: Vec<u8>,
    exhausted: bool,
    numbers_pending: bool,
    line: u64,
    position: u64,
}

impl PartitionReader {
    /// Opens a partition file and reads its first value.
    pub fn open(index: usize, path: &Path, buf_size: Option<usize>) -> Result<Self> {
        let file = fs::File::open(path).map_err(|err| partition_io(index, path, err))?;
        let reader = match buf_size {
            Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
            None => io::BufReader::new(file),
        };

        PartitionReader::new(index, path, reader)
    }
}

impl<R: BufRead> PartitionReader<R> {
    /// Creates a cursor over partition data and reads its first value.
    ///
    /// # Arguments
    /// * `index` - Partition index reported in errors
    /// * `path` - Partition path reported in errors
    /// * `reader` - Partition data
    pub fn new(index: usize, path: &Path, reader: R) -> Result<Self> {
        let mut partition_reader = PartitionReader {
            reader,
            index,
            path: path.to_path_buf(),
            value: Vec::with_capacity(VALUE_MAX_BYTES),
            exhausted: false,
            numbers_pending: false,
            line: 1,
            position: 0,
        };
        partition_reader.read_value()?;

        return Ok(partition_reader);
    }

    /// Returns the current value, [`None`] if the partition is exhausted.
    pub fn value(&self) -> Option<&[u8]> {
        if self.exhausted {
            None
        } else {
            Some(&self.value)
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of bytes consumed from the partition.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Reads the next number of the current value block.
    pub fn next_number(&mut self) -> Result<Option<i64>> {
        if self.exhausted || !self.numbers_pending {
            return Ok(None);
        }

        let mut digits = [0u8; NUMBER_MAX_LEN];
        let mut len = 0;
        let mut last = false;

        loop {
            let available = self
                .reader
                .fill_buf()
                .map_err(|err| partition_io(self.index, &self.path, err))?;
            if available.is_empty() {
                if len == 0 {
                    return Err(self.truncated());
                }
                last = true;
                break;
            }

            let (end, delimiter) = match memchr::memchr2(NUMBER_SEPARATOR, LF, available) {
                Some(pos) => (pos, Some(available[pos])),
                None => (available.len(), None),
            };
            if len + end > NUMBER_MAX_LEN {
                let fits = NUMBER_MAX_LEN - len;
                digits[len..].copy_from_slice(&available[..fits]);
                return Err(self.malformed_number(&digits));
            }
            digits[len..len + end].copy_from_slice(&available[..end]);
            len += end;

            match delimiter {
                Some(NUMBER_SEPARATOR) => {
                    self.consume(end + 1);
                    break;
                }
                Some(_) => {
                    self.consume(end + 1);
                    last = true;
                    break;
                }
                None => self.consume(end),
            }
        }

        let number = codec::parse_number(&digits[..len]).ok_or_else(|| self.malformed_number(&digits[..len]))?;
        if last {
            self.numbers_pending = false;
            self.line += 1;
        }

        return Ok(Some(number));
    }

    /// Appends the remaining numbers of the current value block.
    pub fn read_numbers_into(&mut self, numbers: &mut Vec<i64>) -> Result<()> {
        while let Some(number) = self.next_number()? {
            numbers.push(number);
        }

        return Ok(());
    }

    /// Moves the cursor to the next value block, skipping unread numbers of the current one.
    /// Returns `false` once the partition is exhausted.
    pub fn advance(&mut self) -> Result<bool> {
        if self.exhausted {
            return Ok(false);
        }

        while self.next_number()?.is_some() {}
        self.read_value()?;

        return Ok(!self.exhausted);
    }

    fn read_value(&mut self) -> Result<()> {
        self.value.clear();
        let mut started = false;

        loop {
            let available = self
                .reader
                .fill_buf()
                .map_err(|err| partition_io(self.index, &self.path, err))?;
            if available.is_empty() {
                if started {
                    return Err(self.truncated());
                }
                self.exhausted = true;
                return Ok(());
            }
            started = true;

            let (end, found) = match memchr::memchr(LF, available) {
                Some(pos) => (pos, true),
                None => (available.len(), false),
            };
            if self.value.len() + end > VALUE_MAX_BYTES {
                return Err(SortError::CapacityExceeded(format!(
                    "partition value is longer than {} bytes in {}",
                    VALUE_MAX_BYTES,
                    self.location()
                )));
            }
            self.value.extend_from_slice(&available[..end]);

            let consumed = end + found as usize;
            self.consume(consumed);
            if found {
                break;
            }
        }

        self.line += 1;
        self.numbers_pending = true;

        return Ok(());
    }

    fn consume(&mut self, amount: usize) {
        self.reader.consume(amount);
        self.position += amount as u64;
    }

    fn location(&self) -> Location {
        Location::new(Some(self.path.clone()), self.line)
    }

    fn malformed_number(&self, text: &[u8]) -> SortError {
        SortError::MalformedNumber {
            text: String::from_utf8_lossy(text).into_owned(),
            location: self.location(),
        }
    }

    fn truncated(&self) -> SortError {
        partition_io(
            self.index,
            &self.path,
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("value block is truncated at line {}", self.line),
            ),
        )
    }
}
