//! K-way partition merger.

use std::cmp::Ordering;
use std::fs;
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};

use rayon::prelude::*;

use crate::codec;
use crate::error::{Result, SortError};
use crate::partition::PartitionReader;
use crate::sort::{Phase, Progress, ProgressFn, PROGRESS_STEP};

/// Selects the indices of all inputs holding the minimal value.
///
/// `values` yields the current value of every input, [`None`] for exhausted inputs.
/// `group` is cleared and filled with the indices of the inputs whose value is ordinal-equal to the minimum,
/// it stays empty if all inputs are exhausted.
pub fn select_min_group<'a, I>(values: I, group: &mut Vec<usize>)
where
    I: IntoIterator<Item = Option<&'a [u8]>>,
{
    group.clear();
    let mut min: Option<&[u8]> = None;

    for (idx, value) in values.into_iter().enumerate() {
        let value = match value {
            Some(value) => value,
            None => continue,
        };

        match min.map(|min| value.cmp(min)) {
            None | Some(Ordering::Less) => {
                min = Some(value);
                group.clear();
                group.push(idx);
            }
            Some(Ordering::Equal) => group.push(idx),
            Some(Ordering::Greater) => {}
        }
    }
}

/// Lists partition files of a directory whose names match the pattern, ordered by name.
///
/// The pattern may contain `*` wildcards matching any (possibly empty) part of the name
/// and `?` wildcards matching exactly one character.
pub fn find_partitions(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let pattern: Vec<char> = pattern.chars().collect();

    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }

        let name = entry.file_name();
        let name = match name.to_str() {
            Some(name) => name,
            None => continue,
        };
        if mask_matches(&pattern, name) {
            paths.push(entry.path());
        }
    }
    paths.sort();

    return Ok(paths);
}

/// Matches a file name against a `*`/`?` mask, backtracking to the last `*` on mismatch.
fn mask_matches(mask: &[char], name: &str) -> bool {
    let name: Vec<char> = name.chars().collect();
    let (mut mi, mut ni) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while ni < name.len() {
        match mask.get(mi) {
            Some('*') => {
                backtrack = Some((mi, ni));
                mi += 1;
            }
            Some(&ch) if ch == '?' || ch == name[ni] => {
                mi += 1;
                ni += 1;
            }
            _ => match backtrack {
                Some((star, consumed)) => {
                    backtrack = Some((star, consumed + 1));
                    mi = star + 1;
                    ni = consumed + 1;
                }
                None => return false,
            },
        }
    }

    mask[mi..].iter().all(|&ch| ch == '*')
}

/// Merge result summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Number of written value groups.
    pub values: u64,
    /// Number of written records.
    pub records: u64,
}

/// Merges sorted partitions into a single sorted record stream.
///
/// Values present in several partitions are merged into a single group
/// with the numbers of all the partitions sorted in ascending order.
pub struct PartitionMerger<R = io::BufReader<fs::File>> {
    readers: Vec<PartitionReader<R>>,
    group: Vec<usize>,
    numbers: Vec<i64>,
    delete_partitions: bool,
    progress: Option<ProgressFn>,
    total: u64,
}

impl PartitionMerger {
    /// Opens partition files.
    ///
    /// # Arguments
    /// * `paths` - Partition files, every one sorted by value
    /// * `buf_size` - Partition file read buffer size
    pub fn open(paths: &[PathBuf], buf_size: Option<usize>) -> Result<Self> {
        let mut total = 0;
        let mut readers = Vec::with_capacity(paths.len());
        for (idx, path) in paths.iter().enumerate() {
            let metadata = fs::metadata(path).map_err(|err| SortError::PartitionIo {
                partition: idx,
                path: path.clone(),
                source: err,
            })?;
            total += metadata.len();
            readers.push(PartitionReader::open(idx, path, buf_size)?);
        }

        log::info!("merging {} partitions ({} bytes)", readers.len(), total);

        let mut merger = PartitionMerger::new(readers);
        merger.total = total;

        return Ok(merger);
    }
}

impl<R: BufRead> PartitionMerger<R> {
    /// Creates a merger over opened partition readers.
    pub fn new(readers: Vec<PartitionReader<R>>) -> Self {
        PartitionMerger {
            group: Vec::with_capacity(readers.len()),
            readers,
            numbers: Vec::new(),
            delete_partitions: false,
            progress: None,
            total: 0,
        }
    }

    /// Removes partition files after a successful merge.
    pub fn delete_partitions(mut self, delete_partitions: bool) -> Self {
        self.delete_partitions = delete_partitions;
        return self;
    }

    /// Sets a merge progress callback.
    pub fn with_progress(mut self, progress: Option<ProgressFn>) -> Self {
        self.progress = progress;
        return self;
    }

    /// Merges all partitions into the output.
    ///
    /// # Arguments
    /// * `output` - Sorted records destination
    /// * `thread_pool` - Pool used to sort numbers of values split across partitions
    pub fn merge<W: Write + ?Sized>(mut self, output: &mut W, thread_pool: &rayon::ThreadPool) -> Result<MergeStats> {
        let mut stats = MergeStats::default();
        let mut reported = 0;

        loop {
            let processed = self.processed();
            if processed - reported >= PROGRESS_STEP {
                self.report(processed);
                reported = processed;
            }

            select_min_group(self.readers.iter().map(|reader| reader.value()), &mut self.group);
            if self.group.is_empty() {
                break;
            }

            stats.values += 1;
            stats.records += if let [idx] = self.group[..] {
                Self::write_single(&mut self.readers[idx], output)?
            } else {
                self.write_merged(output, thread_pool)?
            };

            for &idx in &self.group {
                self.readers[idx].advance()?;
            }
        }

        self.report(self.processed());
        output.flush()?;

        let paths: Vec<(usize, PathBuf)> = self
            .readers
            .into_iter()
            .map(|reader| (reader.index(), reader.path().to_path_buf()))
            .collect();
        if self.delete_partitions {
            for (idx, path) in paths {
                log::debug!("removing partition {}", path.display());
                fs::remove_file(&path).map_err(|err| SortError::PartitionIo {
                    partition: idx,
                    path: path.clone(),
                    source: err,
                })?;
            }
        }

        log::info!("merge done ({} values, {} records)", stats.values, stats.records);

        return Ok(stats);
    }

    fn write_single<W: Write + ?Sized>(reader: &mut PartitionReader<R>, output: &mut W) -> Result<u64> {
        let mut records = 0;
        while let Some(number) = reader.next_number()? {
            let value = reader.value().unwrap_or_default();
            codec::write_record(output, number, value)?;
            records += 1;
        }

        return Ok(records);
    }

    fn write_merged<W: Write + ?Sized>(&mut self, output: &mut W, thread_pool: &rayon::ThreadPool) -> Result<u64> {
        self.numbers.clear();
        for &idx in &self.group {
            self.readers[idx].read_numbers_into(&mut self.numbers)?;
        }

        let numbers = &mut self.numbers;
        thread_pool.install(|| numbers.par_sort_unstable());

        let value = self.readers[self.group[0]].value().unwrap_or_default();
        for &number in &self.numbers {
            codec::write_record(output, number, value)?;
        }

        return Ok(self.numbers.len() as u64);
    }

    fn processed(&self) -> u64 {
        self.readers.iter().map(|reader| reader.position()).sum()
    }

    fn report(&self, processed: u64) {
        if let Some(progress) = &self.progress {
            progress(Progress {
                phase: Phase::Merging,
                processed,
                total: Some(self.total),
            });
        }
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::io;
    use std::path::Path;

    use rstest::*;

    use super::{find_partitions, select_min_group, MergeStats, PartitionMerger};
    use crate::partition::PartitionReader;

    #[fixture]
    fn thread_pool() -> rayon::ThreadPool {
        rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap()
    }

    fn merge(partitions: &[&[u8]], thread_pool: &rayon::ThreadPool) -> (String, MergeStats) {
        let readers = partitions
            .iter()
            .enumerate()
            .map(|(idx, data)| PartitionReader::new(idx, Path::new("partition"), io::Cursor::new(*data)).unwrap())
            .collect();

        let mut output = Vec::new();
        let stats = PartitionMerger::new(readers).merge(&mut output, thread_pool).unwrap();

        return (String::from_utf8(output).unwrap(), stats);
    }

    #[rstest]
    #[case(vec![], vec![])]
    #[case(vec![None, None], vec![])]
    #[case(vec![Some("b"), Some("a"), None], vec![1])]
    #[case(vec![Some("b"), None, Some("b"), Some("c")], vec![0, 2])]
    #[case(vec![Some("b"), Some("a"), Some("a"), Some("a")], vec![1, 2, 3])]
    #[case(vec![Some(""), Some("a")], vec![0])]
    #[case(vec![Some("ab"), Some("a"), Some("abc")], vec![1])]
    fn test_select_min_group(#[case] values: Vec<Option<&str>>, #[case] expected: Vec<usize>) {
        let mut group = vec![42];
        select_min_group(values.iter().map(|value| value.map(str::as_bytes)), &mut group);

        assert_eq!(group, expected);
    }

    #[rstest]
    fn test_merge_ties(thread_pool: rayon::ThreadPool) {
        let (output, stats) = merge(&[b"banana\n5\n", b"banana\n2|9\n"], &thread_pool);

        assert_eq!(output, "2. banana\r\n5. banana\r\n9. banana\r\n");
        assert_eq!(stats, MergeStats { values: 1, records: 3 });
    }

    #[rstest]
    fn test_merge_interleaved(thread_pool: rayon::ThreadPool) {
        let (output, stats) = merge(
            &[
                b"apple\n3|8\ncherry\n1\n",
                b"",
                b"banana\n4\ncherry\n-5|7\ndate\n0\n",
                b"apple\n1\ndate\n2\n",
            ],
            &thread_pool,
        );

        let expected = [
            "1. apple",
            "3. apple",
            "8. apple",
            "4. banana",
            "-5. cherry",
            "1. cherry",
            "7. cherry",
            "0. date",
            "2. date",
        ];
        assert_eq!(output, expected.map(|line| format!("{}\r\n", line)).concat());
        assert_eq!(stats, MergeStats { values: 4, records: 9 });
    }

    #[rstest]
    fn test_merge_files(thread_pool: rayon::ThreadPool) {
        let tmp_dir = tempfile::tempdir_in("./").unwrap();
        fs::write(tmp_dir.path().join("partition-000.tmp"), b"b\n1|2\n").unwrap();
        fs::write(tmp_dir.path().join("partition-001.tmp"), b"a\n5\nb\n0\n").unwrap();
        fs::write(tmp_dir.path().join("other.txt"), b"not a partition").unwrap();

        let paths = find_partitions(tmp_dir.path(), crate::PARTITION_FILE_PATTERN).unwrap();
        assert_eq!(paths.len(), 2);

        let mut output = Vec::new();
        let stats = PartitionMerger::open(&paths, Some(4))
            .unwrap()
            .delete_partitions(true)
            .merge(&mut output, &thread_pool)
            .unwrap();

        assert_eq!(output, b"5. a\r\n0. b\r\n1. b\r\n2. b\r\n");
        assert_eq!(stats, MergeStats { values: 2, records: 4 });
        assert!(paths.iter().all(|path| !path.exists()));
        assert!(tmp_dir.path().join("other.txt").exists());
    }

    #[rstest]
    #[case("partition-???.tmp", vec!["partition-000.tmp", "partition-001.tmp"])]
    #[case("part-*-*.tmp", vec!["part-a-1.tmp"])]
    #[case("part*", vec!["part-a-1.tmp", "partition-000.tmp", "partition-001.tmp", "partition-1.tmp"])]
    #[case("*-?.tmp", vec!["part-a-1.tmp", "partition-1.tmp"])]
    #[case("partition-00?.tm", vec![])]
    #[case("*", vec!["part-a-1.tmp", "partition-000.tmp", "partition-001.tmp", "partition-1.tmp"])]
    fn test_find_partitions_wildcards(#[case] pattern: &str, #[case] expected: Vec<&str>) {
        let tmp_dir = tempfile::tempdir_in("./").unwrap();
        for name in ["partition-000.tmp", "partition-001.tmp", "partition-1.tmp", "part-a-1.tmp"] {
            fs::write(tmp_dir.path().join(name), b"").unwrap();
        }

        let names: Vec<String> = find_partitions(tmp_dir.path(), pattern)
            .unwrap()
            .iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn test_find_partitions() {
        let tmp_dir = tempfile::tempdir_in("./").unwrap();
        for name in ["partition-002.tmp", "partition-000.tmp", "partition-.tmp", "partition.tmp", "x.tmp"] {
            fs::write(tmp_dir.path().join(name), b"").unwrap();
        }
        fs::create_dir(tmp_dir.path().join("partition-dir.tmp")).unwrap();

        let names: Vec<String> = find_partitions(tmp_dir.path(), "partition-*.tmp")
            .unwrap()
            .iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["partition-.tmp", "partition-000.tmp", "partition-002.tmp"]);

        let names = find_partitions(tmp_dir.path(), "x.tmp").unwrap();
        assert_eq!(names.len(), 1);
    }
}
