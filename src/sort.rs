//! External sorter.

use std::fs;
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::buffer::AggregationBuffer;
use crate::codec::RecordReader;
use crate::error::{Result, SortError};
use crate::merger::{MergeStats, PartitionMerger};
use crate::strategy::{PartitionStrategy, SmallFileStrategy, SortStrategy};

/// Default number of distinct values buffered before a partition is written.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1_000_000;
/// Default key arena size in bytes.
pub const DEFAULT_ARENA_CAPACITY: usize = 256 * 1024 * 1024;
/// Inputs smaller than this are sorted in memory.
pub const DEFAULT_SMALL_FILE_THRESHOLD: u64 = 1_000_000_000;
/// Minimal number of processed bytes between two progress reports.
pub const PROGRESS_STEP: u64 = 100 * 1024 * 1024;

const INPUT_BUF_SIZE: usize = 8 * 1024 * 1024;
const OUTPUT_BUF_SIZE: usize = 64 * 1024;

/// Sorting phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Input records are being aggregated (and spilled to partitions).
    Splitting,
    /// Partitions are being merged into the output.
    Merging,
}

/// Progress report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub phase: Phase,
    /// Bytes processed so far.
    pub processed: u64,
    /// Total bytes to be processed, if known.
    pub total: Option<u64>,
}

/// Progress callback.
pub type ProgressFn = Arc<dyn Fn(Progress) + Send + Sync>;

/// Sorting result summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SortStats {
    /// Number of sorted records.
    pub records: u64,
    /// Number of distinct values.
    pub values: u64,
    /// Number of partitions written, zero for in-memory sorting.
    pub partitions: usize,
}

/// External sorter builder. Provides methods for [`ExternalSorter`] initialization.
#[derive(Clone)]
pub struct ExternalSorterBuilder {
    /// Number of threads to be used to sort data in parallel.
    threads_number: Option<usize>,
    /// Directory to be used to store temporary data.
    tmp_dir: Option<Box<Path>>,
    /// Partition file read/write buffer size.
    rw_buf_size: Option<usize>,
    /// Number of distinct values per partition.
    buffer_capacity: usize,
    /// Key arena size in bytes.
    arena_capacity: usize,
    /// Input size the partitioning strategy is used from.
    small_file_threshold: u64,
    /// Keep partition files after the merge.
    keep_partitions: bool,
    /// Progress callback.
    progress: Option<ProgressFn>,
}

impl ExternalSorterBuilder {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        ExternalSorterBuilder::default()
    }

    /// Builds an [`ExternalSorter`] instance using provided configuration.
    pub fn build(self) -> Result<ExternalSorter> {
        ExternalSorter::new(self)
    }

    fn validate(&self) -> Result<()> {
        if self.buffer_capacity == 0 || self.buffer_capacity > i32::MAX as usize {
            return Err(SortError::InvalidConfig(format!(
                "buffer capacity must be in range 1..={}",
                i32::MAX
            )));
        }
        if self.rw_buf_size == Some(0) {
            return Err(SortError::InvalidConfig("read/write buffer size must be positive".to_string()));
        }
        if self.keep_partitions && self.tmp_dir.is_none() {
            return Err(SortError::InvalidConfig(
                "temporary directory must be set to keep partitions".to_string(),
            ));
        }

        return Ok(());
    }

    /// Sets number of threads to be used to sort data in parallel.
    pub fn with_threads_number(mut self, threads_number: usize) -> ExternalSorterBuilder {
        self.threads_number = Some(threads_number);
        return self;
    }

    /// Sets directory to be used to store temporary data.
    pub fn with_tmp_dir(mut self, path: &Path) -> ExternalSorterBuilder {
        self.tmp_dir = Some(path.into());
        return self;
    }

    /// Sets partition read/write buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> ExternalSorterBuilder {
        self.rw_buf_size = Some(buf_size);
        return self;
    }

    /// Sets number of distinct values buffered before a partition is written.
    pub fn with_buffer_capacity(mut self, capacity: usize) -> ExternalSorterBuilder {
        self.buffer_capacity = capacity;
        return self;
    }

    /// Sets key arena size in bytes.
    pub fn with_arena_capacity(mut self, capacity: usize) -> ExternalSorterBuilder {
        self.arena_capacity = capacity;
        return self;
    }

    /// Sets input size in bytes starting from which data is spilled to partitions.
    pub fn with_small_file_threshold(mut self, threshold: u64) -> ExternalSorterBuilder {
        self.small_file_threshold = threshold;
        return self;
    }

    /// Keeps partition files in the temporary directory after the merge.
    pub fn with_keep_partitions(mut self, keep_partitions: bool) -> ExternalSorterBuilder {
        self.keep_partitions = keep_partitions;
        return self;
    }

    /// Sets a progress callback.
    pub fn with_progress<F>(mut self, progress: F) -> ExternalSorterBuilder
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(progress));
        return self;
    }
}

impl Default for ExternalSorterBuilder {
    fn default() -> Self {
        ExternalSorterBuilder {
            threads_number: None,
            tmp_dir: None,
            rw_buf_size: None,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            arena_capacity: DEFAULT_ARENA_CAPACITY,
            small_file_threshold: DEFAULT_SMALL_FILE_THRESHOLD,
            keep_partitions: false,
            progress: None,
        }
    }
}

/// Directory partitions are written to.
enum WorkDir {
    /// Removed with all its partitions when dropped.
    Temp(tempfile::TempDir),
    /// Partitions are kept after the merge.
    Kept(PathBuf),
}

impl WorkDir {
    fn path(&self) -> &Path {
        match self {
            WorkDir::Temp(dir) => dir.path(),
            WorkDir::Kept(path) => path,
        }
    }
}

/// External sorter.
pub struct ExternalSorter {
    /// Sorting thread pool.
    thread_pool: rayon::ThreadPool,
    /// Directory to be used to store temporary data.
    tmp_dir: Option<Box<Path>>,
    /// Partition file read/write buffer size.
    rw_buf_size: Option<usize>,
    buffer_capacity: usize,
    arena_capacity: usize,
    small_file_threshold: u64,
    keep_partitions: bool,
    progress: Option<ProgressFn>,
}

impl ExternalSorter {
    /// Creates a new external sorter instance, rejecting inconsistent configurations.
    pub fn new(builder: ExternalSorterBuilder) -> Result<Self> {
        builder.validate()?;

        return Ok(ExternalSorter {
            thread_pool: Self::init_thread_pool(builder.threads_number)?,
            tmp_dir: builder.tmp_dir,
            rw_buf_size: builder.rw_buf_size,
            buffer_capacity: builder.buffer_capacity,
            arena_capacity: builder.arena_capacity,
            small_file_threshold: builder.small_file_threshold,
            keep_partitions: builder.keep_partitions,
            progress: builder.progress,
        });
    }

    fn init_thread_pool(threads_number: Option<usize>) -> Result<rayon::ThreadPool> {
        let mut thread_pool_builder = rayon::ThreadPoolBuilder::new();

        if let Some(threads_number) = threads_number {
            log::info!("initializing thread-pool (threads: {})", threads_number);
            thread_pool_builder = thread_pool_builder.num_threads(threads_number);
        } else {
            log::info!("initializing thread-pool (threads: default)");
        }
        let thread_pool = thread_pool_builder.build()?;

        return Ok(thread_pool);
    }

    fn init_work_dir(&self) -> Result<WorkDir> {
        if self.keep_partitions {
            if let Some(tmp_path) = &self.tmp_dir {
                log::info!("using {} as a partitions directory", tmp_path.display());
                return Ok(WorkDir::Kept(tmp_path.to_path_buf()));
            }
        }

        let tmp_dir = if let Some(tmp_path) = &self.tmp_dir {
            tempfile::tempdir_in(tmp_path)
        } else {
            tempfile::tempdir()
        }
        .map_err(SortError::TempDir)?;

        log::info!("using {} as a temporary directory", tmp_dir.path().display());

        return Ok(WorkDir::Temp(tmp_dir));
    }

    /// Sorts an input file into an output file.
    ///
    /// # Arguments
    /// * `input` - File to be sorted, its size selects the sorting strategy
    /// * `output` - Result file, must differ from the input
    pub fn sort_file(&self, input: &Path, output: &Path) -> Result<SortStats> {
        if output.exists() && fs::canonicalize(input)? == fs::canonicalize(output)? {
            return Err(SortError::InvalidConfig(format!(
                "output {} must differ from the input",
                output.display()
            )));
        }

        let input_file = fs::File::open(input)?;
        let input_len = input_file.metadata()?.len();
        let reader = RecordReader::new(io::BufReader::with_capacity(INPUT_BUF_SIZE, input_file)).with_path(input);

        let mut writer = io::BufWriter::with_capacity(OUTPUT_BUF_SIZE, fs::File::create(output)?);
        let stats = self.sort_records(reader, input_len, &mut writer)?;
        writer.flush()?;

        return Ok(stats);
    }

    /// Sorts records from the input stream into the output stream.
    ///
    /// # Arguments
    /// * `input` - Input records
    /// * `input_len` - Input size in bytes used to select the sorting strategy
    /// * `output` - Sorted records destination
    pub fn sort<R, W>(&self, input: R, input_len: u64, mut output: W) -> Result<SortStats>
    where
        R: BufRead,
        W: Write,
    {
        let stats = self.sort_records(RecordReader::new(input), input_len, &mut output)?;
        output.flush()?;

        return Ok(stats);
    }

    fn sort_records<R: BufRead>(
        &self,
        mut reader: RecordReader<R>,
        input_len: u64,
        output: &mut dyn Write,
    ) -> Result<SortStats> {
        let work_dir;
        let mut strategy: Box<dyn SortStrategy + '_> = if input_len < self.small_file_threshold {
            log::info!("sorting {} bytes in memory", input_len);
            Box::new(SmallFileStrategy::new(&self.thread_pool))
        } else {
            log::info!(
                "sorting {} bytes using partitions (buffer: {} values, arena: {} bytes)",
                input_len,
                self.buffer_capacity,
                self.arena_capacity
            );
            work_dir = self.init_work_dir()?;
            Box::new(PartitionStrategy::new(
                AggregationBuffer::new(self.buffer_capacity, self.arena_capacity)?,
                work_dir.path(),
                &self.thread_pool,
                self.rw_buf_size,
                matches!(work_dir, WorkDir::Temp(_)),
                self.progress.clone(),
            ))
        };

        let mut reported = 0;
        while let Some(record) = reader.read_record()? {
            strategy.aggregate(record)?;

            let position = reader.position();
            if position - reported >= PROGRESS_STEP {
                self.report(Phase::Splitting, position, input_len);
                reported = position;
            }
        }
        self.report(Phase::Splitting, reader.position(), input_len);
        log::debug!("splitting done ({} lines)", reader.line() - 1);

        let stats = strategy.finalize(output)?;
        log::info!(
            "sorting done ({} records, {} values, {} partitions)",
            stats.records,
            stats.values,
            stats.partitions
        );

        return Ok(stats);
    }

    /// Merges existing partition files into the output stream.
    ///
    /// # Arguments
    /// * `paths` - Partition files, every one sorted by value
    /// * `output` - Merged records destination
    /// * `delete_partitions` - Remove partition files after a successful merge
    pub fn merge_partitions<W: Write>(
        &self,
        paths: &[PathBuf],
        mut output: W,
        delete_partitions: bool,
    ) -> Result<MergeStats> {
        PartitionMerger::open(paths, self.rw_buf_size)?
            .delete_partitions(delete_partitions)
            .with_progress(self.progress.clone())
            .merge(&mut output, &self.thread_pool)
    }

    fn report(&self, phase: Phase, processed: u64, total: u64) {
        if let Some(progress) = &self.progress {
            progress(Progress {
                phase,
                processed,
                total: Some(total),
            });
        }
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::io;
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use rstest::*;

    use super::{ExternalSorter, ExternalSorterBuilder, Phase, Progress};
    use crate::codec::RecordBuf;
    use crate::error::SortError;
    use crate::merger::find_partitions;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir_in("./").unwrap()
    }

    fn sorter(tmp_dir: &Path, threshold: u64, capacity: usize) -> ExternalSorter {
        ExternalSorterBuilder::new()
            .with_threads_number(2)
            .with_tmp_dir(tmp_dir)
            .with_buffer_capacity(capacity)
            .with_arena_capacity(capacity * 64)
            .with_small_file_threshold(threshold)
            .build()
            .unwrap()
    }

    fn sort_bytes(sorter: &ExternalSorter, input: &[u8]) -> Vec<u8> {
        let mut output = Vec::new();
        sorter
            .sort(io::Cursor::new(input), input.len() as u64, &mut output)
            .unwrap();

        return output;
    }

    fn render(records: &[RecordBuf]) -> Vec<u8> {
        let mut output = Vec::new();
        for record in records {
            crate::codec::write_record(&mut output, record.number, &record.value).unwrap();
        }

        return output;
    }

    fn random_records(count: usize, seed: u64) -> Vec<RecordBuf> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let values: Vec<String> = (0..40)
            .map(|idx| format!("{} value {}", ["Apple", "apple", "Банан", "", "cherry"][idx % 5], idx / 5))
            .collect();

        (0..count)
            .map(|_| {
                let value = values.choose(&mut rng).unwrap();
                RecordBuf::new(rng.gen_range(-1000..1000), value.as_bytes())
            })
            .collect()
    }

    #[rstest]
    #[case(u64::MAX, 16)]
    #[case(0, 16)]
    #[case(0, 1)]
    fn test_concrete_scenario(tmp_dir: tempfile::TempDir, #[case] threshold: u64, #[case] capacity: usize) {
        let sorter = sorter(tmp_dir.path(), threshold, capacity);
        let output = sort_bytes(&sorter, b"5. apple\r\n2. banana\r\n9. apple\r\n");

        assert_eq!(output, b"5. apple\r\n9. apple\r\n2. banana\r\n");
    }

    #[rstest]
    #[case(u64::MAX, 1000, 2000)]
    #[case(0, 1000, 2000)]
    #[case(0, 7, 1000)]
    #[case(0, 1, 200)]
    fn test_external_sorter(
        tmp_dir: tempfile::TempDir,
        #[case] threshold: u64,
        #[case] capacity: usize,
        #[case] count: usize,
    ) {
        let mut records = random_records(count, 42);
        let input = render(&records);

        let sorter = sorter(tmp_dir.path(), threshold, capacity);
        let output = sort_bytes(&sorter, &input);

        records.sort();
        assert_eq!(output, render(&records));

        // sorting a sorted file reproduces it
        assert_eq!(sort_bytes(&sorter, &output), output);
    }

    #[rstest]
    fn test_sort_file(tmp_dir: tempfile::TempDir) {
        let mut records = random_records(500, 7);
        let input_path = tmp_dir.path().join("input.txt");
        let output_path = tmp_dir.path().join("output.txt");
        fs::write(&input_path, render(&records)).unwrap();

        let stats = sorter(tmp_dir.path(), 0, 5)
            .sort_file(&input_path, &output_path)
            .unwrap();

        records.sort();
        assert_eq!(fs::read(&output_path).unwrap(), render(&records));
        assert_eq!(stats.records, 500);
        assert!(stats.partitions > 1);
        assert!(find_partitions(tmp_dir.path(), crate::PARTITION_FILE_PATTERN).unwrap().is_empty());
        assert_eq!(fs::read_dir(tmp_dir.path()).unwrap().count(), 2);
    }

    #[rstest]
    fn test_keep_partitions(tmp_dir: tempfile::TempDir) {
        let sorter = ExternalSorterBuilder::new()
            .with_tmp_dir(tmp_dir.path())
            .with_buffer_capacity(2)
            .with_arena_capacity(128)
            .with_small_file_threshold(0)
            .with_keep_partitions(true)
            .build()
            .unwrap();

        let mut output = Vec::new();
        let input = b"1. a\r\n2. b\r\n3. c\r\n4. a\r\n";
        let stats = sorter.sort(&input[..], input.len() as u64, &mut output).unwrap();
        assert_eq!(output, b"1. a\r\n4. a\r\n2. b\r\n3. c\r\n");

        let paths = find_partitions(tmp_dir.path(), crate::PARTITION_FILE_PATTERN).unwrap();
        assert_eq!(paths.len(), stats.partitions);
        assert_eq!(paths.len(), 2);

        let mut merged = Vec::new();
        let merge_stats = sorter.merge_partitions(&paths, &mut merged, true).unwrap();
        assert_eq!(merged, output);
        assert_eq!(merge_stats.records, 4);
        assert!(paths.iter().all(|path| !path.exists()));
    }

    #[rstest]
    fn test_malformed_input(tmp_dir: tempfile::TempDir) {
        let sorter = sorter(tmp_dir.path(), 0, 4);
        let mut output = Vec::new();
        let input = b"1. a\r\nx. b\r\n";

        match sorter.sort(&input[..], input.len() as u64, &mut output) {
            Err(SortError::MalformedNumber { text, location }) => {
                assert_eq!(text, "x");
                assert_eq!(location.line, 2);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[rstest]
    fn test_progress(tmp_dir: tempfile::TempDir) {
        let reports: Arc<Mutex<Vec<Progress>>> = Arc::default();
        let collected = reports.clone();
        let sorter = ExternalSorterBuilder::new()
            .with_tmp_dir(tmp_dir.path())
            .with_buffer_capacity(1)
            .with_arena_capacity(64)
            .with_small_file_threshold(0)
            .with_progress(move |progress| collected.lock().unwrap().push(progress))
            .build()
            .unwrap();

        let input = b"1. a\r\n2. b\r\n";
        sorter.sort(&input[..], input.len() as u64, io::sink()).unwrap();

        let reports = reports.lock().unwrap();
        assert_eq!(reports.first().map(|report| report.phase), Some(Phase::Splitting));
        assert_eq!(reports[0].processed, input.len() as u64);
        let merging = reports.last().unwrap();
        assert_eq!(merging.phase, Phase::Merging);
        assert_eq!(merging.processed, merging.total.unwrap());
    }

    #[rstest]
    fn test_in_place_sort_rejected(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("input.txt");
        fs::write(&path, b"1. a\r\n").unwrap();

        let result = sorter(tmp_dir.path(), 0, 4).sort_file(&path, &path);
        assert!(matches!(result, Err(SortError::InvalidConfig(_))));
        assert_eq!(fs::read(&path).unwrap(), b"1. a\r\n");
    }

    #[test]
    fn test_invalid_config() {
        assert!(ExternalSorterBuilder::new().with_buffer_capacity(0).build().is_err());
        assert!(ExternalSorterBuilder::new().with_rw_buf_size(0).build().is_err());
        assert!(ExternalSorterBuilder::new().with_keep_partitions(true).build().is_err());

        let result = ExternalSorter::new(ExternalSorterBuilder::new().with_keep_partitions(true));
        assert!(matches!(result, Err(SortError::InvalidConfig(_))));
        let result = ExternalSorter::new(ExternalSorterBuilder::new().with_buffer_capacity(0));
        assert!(matches!(result, Err(SortError::InvalidConfig(_))));
    }
}
