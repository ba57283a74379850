//! Sort strategies.
//!
//! A strategy is selected once per run from the input size: small inputs are aggregated in an unbounded
//! map and written out directly, large inputs are spilled to sorted partitions and merged.

use std::collections::HashMap;
use std::io::prelude::*;
use std::path::Path;

use rayon::prelude::*;

use crate::buffer::{AggregationBuffer, INITIAL_NUMBERS_CAPACITY};
use crate::codec::{self, Record};
use crate::error::{Result, SortError};
use crate::merger::PartitionMerger;
use crate::partition::PartitionWriter;
use crate::sort::{ProgressFn, SortStats};

/// Sort strategy interface.
pub trait SortStrategy {
    /// Adds a record to the strategy state.
    fn aggregate(&mut self, record: Record<'_>) -> Result<()>;

    /// Writes all aggregated records to the output in sorted order.
    fn finalize(self: Box<Self>, output: &mut dyn Write) -> Result<SortStats>;
}

/// In-memory strategy for inputs below the size threshold.
pub struct SmallFileStrategy<'a> {
    data: HashMap<Vec<u8>, Vec<i64>>,
    thread_pool: &'a rayon::ThreadPool,
    records: u64,
}

impl<'a> SmallFileStrategy<'a> {
    pub fn new(thread_pool: &'a rayon::ThreadPool) -> Self {
        SmallFileStrategy {
            data: HashMap::with_capacity(2048),
            thread_pool,
            records: 0,
        }
    }
}

impl<'a> SortStrategy for SmallFileStrategy<'a> {
    fn aggregate(&mut self, record: Record<'_>) -> Result<()> {
        self.records += 1;
        match self.data.get_mut(record.value) {
            Some(numbers) => numbers.push(record.number),
            None => {
                let mut numbers = Vec::with_capacity(INITIAL_NUMBERS_CAPACITY);
                numbers.push(record.number);
                self.data.insert(record.value.to_vec(), numbers);
            }
        }

        return Ok(());
    }

    fn finalize(self: Box<Self>, output: &mut dyn Write) -> Result<SortStats> {
        let SmallFileStrategy {
            data,
            thread_pool,
            records,
        } = *self;

        log::debug!("sorting {} values ...", data.len());
        let mut entries: Vec<(Vec<u8>, Vec<i64>)> = data.into_iter().collect();
        thread_pool.install(|| {
            entries.par_sort_unstable_by(|a, b| a.0.cmp(&b.0));
            entries
                .par_iter_mut()
                .for_each(|(_, numbers)| numbers.sort_unstable());
        });

        log::debug!("saving sorted data");
        for (value, numbers) in &entries {
            for &number in numbers {
                codec::write_record(output, number, value)?;
            }
        }
        output.flush()?;

        return Ok(SortStats {
            records,
            values: entries.len() as u64,
            partitions: 0,
        });
    }
}

/// Spill-to-partitions strategy for inputs above the size threshold.
///
/// Records are accumulated in an [`AggregationBuffer`]; every time the buffer is exhausted it is
/// written to a sorted partition and cleared. On finalization the last buffer is flushed and all
/// partitions are merged into the output.
pub struct PartitionStrategy<'a> {
    buffer: AggregationBuffer,
    writer: PartitionWriter,
    thread_pool: &'a rayon::ThreadPool,
    rw_buf_size: Option<usize>,
    delete_partitions: bool,
    progress: Option<ProgressFn>,
    records: u64,
}

impl<'a> PartitionStrategy<'a> {
    /// Creates a partitioning strategy.
    ///
    /// # Arguments
    /// * `buffer` - Aggregation buffer reused for every partition
    /// * `dir` - Directory partitions are written to
    /// * `thread_pool` - Pool used to sort partitions and merged values
    /// * `rw_buf_size` - Partition file read/write buffer size
    /// * `delete_partitions` - Remove partition files after the merge
    /// * `progress` - Merge progress callback
    pub fn new(
        buffer: AggregationBuffer,
        dir: &Path,
        thread_pool: &'a rayon::ThreadPool,
        rw_buf_size: Option<usize>,
        delete_partitions: bool,
        progress: Option<ProgressFn>,
    ) -> Self {
        PartitionStrategy {
            buffer,
            writer: PartitionWriter::new(dir, rw_buf_size),
            thread_pool,
            rw_buf_size,
            delete_partitions,
            progress,
            records: 0,
        }
    }

    /// Returns the number of partitions written so far.
    pub fn partitions(&self) -> usize {
        self.writer.len()
    }

    fn spill(&mut self) -> Result<()> {
        let index = self.writer.len();
        let path = self.writer.write(&mut self.buffer, self.thread_pool)?;
        log::info!("partition {} written to {}", index, path.display());

        return Ok(());
    }
}

impl<'a> SortStrategy for PartitionStrategy<'a> {
    fn aggregate(&mut self, record: Record<'_>) -> Result<()> {
        self.records += 1;
        if self.buffer.try_add(record.number, record.value)? {
            return Ok(());
        }

        self.spill()?;

        if !self.buffer.try_add(record.number, record.value)? {
            return Err(SortError::CapacityExceeded(format!(
                "value of {} bytes doesn't fit into an empty buffer (arena: {} bytes)",
                record.value.len(),
                self.buffer.arena_capacity()
            )));
        }

        return Ok(());
    }

    fn finalize(self: Box<Self>, output: &mut dyn Write) -> Result<SortStats> {
        let mut strategy = *self;
        if !strategy.buffer.is_empty() {
            strategy.spill()?;
        }
        drop(strategy.buffer);

        let paths = strategy.writer.into_paths();
        let stats = PartitionMerger::open(&paths, strategy.rw_buf_size)?
            .delete_partitions(strategy.delete_partitions)
            .with_progress(strategy.progress)
            .merge(output, strategy.thread_pool)?;
        debug_assert_eq!(stats.records, strategy.records);

        return Ok(SortStats {
            records: strategy.records,
            values: stats.values,
            partitions: paths.len(),
        });
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::{PartitionStrategy, SmallFileStrategy, SortStrategy};
    use crate::buffer::AggregationBuffer;
    use crate::codec::Record;
    use crate::error::SortError;

    #[fixture]
    fn thread_pool() -> rayon::ThreadPool {
        rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap()
    }

    fn run(mut strategy: Box<dyn SortStrategy + '_>, records: &[(i64, &str)]) -> String {
        for (number, value) in records {
            strategy.aggregate(Record::new(*number, value.as_bytes())).unwrap();
        }

        let mut output = Vec::new();
        strategy.finalize(&mut output).unwrap();

        return String::from_utf8(output).unwrap();
    }

    #[rstest]
    fn test_small_file_strategy(thread_pool: rayon::ThreadPool) {
        let output = run(
            Box::new(SmallFileStrategy::new(&thread_pool)),
            &[(5, "apple"), (2, "banana"), (9, "apple")],
        );

        assert_eq!(output, "5. apple\r\n9. apple\r\n2. banana\r\n");
    }

    #[rstest]
    fn test_partition_strategy_spills(thread_pool: rayon::ThreadPool) {
        let tmp_dir = tempfile::tempdir_in("./").unwrap();
        let buffer = AggregationBuffer::new(2, 64).unwrap();
        let mut strategy = PartitionStrategy::new(buffer, tmp_dir.path(), &thread_pool, None, true, None);

        let records = [(9, "banana"), (5, "apple"), (1, "cherry"), (2, "banana"), (7, "apple"), (3, "banana")];
        for (number, value) in records {
            strategy.aggregate(Record::new(number, value.as_bytes())).unwrap();
        }
        assert_eq!(strategy.partitions(), 2);

        let mut output = Vec::new();
        let stats = Box::new(strategy).finalize(&mut output).unwrap();

        assert_eq!(
            String::from_utf8(output).unwrap(),
            "5. apple\r\n7. apple\r\n2. banana\r\n3. banana\r\n9. banana\r\n1. cherry\r\n"
        );
        assert_eq!(stats.records, 6);
        assert_eq!(stats.values, 3);
        assert_eq!(stats.partitions, 3);
        assert_eq!(std::fs::read_dir(tmp_dir.path()).unwrap().count(), 0);
    }

    #[rstest]
    fn test_partition_strategy_empty_input(thread_pool: rayon::ThreadPool) {
        let tmp_dir = tempfile::tempdir_in("./").unwrap();
        let buffer = AggregationBuffer::new(2, 64).unwrap();

        let output = run(
            Box::new(PartitionStrategy::new(buffer, tmp_dir.path(), &thread_pool, None, true, None)),
            &[],
        );
        assert_eq!(output, "");
    }

    #[rstest]
    fn test_partition_strategy_value_too_large(thread_pool: rayon::ThreadPool) {
        let tmp_dir = tempfile::tempdir_in("./").unwrap();
        let buffer = AggregationBuffer::new(2, 4).unwrap();
        let mut strategy = PartitionStrategy::new(buffer, tmp_dir.path(), &thread_pool, None, true, None);

        strategy.aggregate(Record::new(1, b"abc")).unwrap();
        let result = strategy.aggregate(Record::new(2, b"abcdef"));
        assert!(matches!(result, Err(SortError::CapacityExceeded(_))));
    }
}
