//! Sorting errors.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Position of a malformed record or partition block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    /// Source file, if the stream was opened from one.
    pub path: Option<PathBuf>,
    /// 1-based line number.
    pub line: u64,
}

impl Location {
    pub fn new(path: Option<PathBuf>, line: u64) -> Self {
        Location { path, line }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "line {} of {}", self.line, path.display()),
            None => write!(f, "line {}", self.line),
        }
    }
}

/// Sorting error.
#[derive(Error, Debug)]
pub enum SortError {
    /// Number token is not a valid 64-bit signed integer.
    #[error("string '{text}' isn't a number in {location}")]
    MalformedNumber { text: String, location: Location },

    /// A structural delimiter is missing.
    #[error("expected '{}', but '{}' found in {location}", escaped(.expected), escaped(.found))]
    UnexpectedDelimiter { expected: u8, found: u8, location: Location },

    /// Hash chain walk exceeded the number of live entries.
    #[error("too many collisions: walked {walked} chain links with {entries} live entries")]
    TooManyCollisions { walked: usize, entries: usize },

    /// A record or key doesn't fit the configured limits.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Partition file could not be written or read.
    #[error("partition {partition} ({}) I/O operation failed: {source}", .path.display())]
    PartitionIo {
        partition: usize,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Temporary directory or file creation error.
    #[error("temporary directory or file not created: {0}")]
    TempDir(#[source] io::Error),

    /// Workers thread pool initialization error.
    #[error("thread pool initialization failed: {0}")]
    ThreadPoolBuildError(#[from] rayon::ThreadPoolBuildError),

    /// Sorter configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Input or output stream error.
    #[error("I/O operation failed: {0}")]
    IO(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, SortError>;

fn escaped(byte: &u8) -> std::ascii::EscapeDefault {
    std::ascii::escape_default(*byte)
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use super::{Location, SortError};

    #[test]
    fn test_error_messages() {
        let err = SortError::MalformedNumber {
            text: "12a".to_string(),
            location: Location::new(Some(PathBuf::from("input.txt")), 3),
        };
        assert_eq!(err.to_string(), "string '12a' isn't a number in line 3 of input.txt");

        let err = SortError::UnexpectedDelimiter {
            expected: b'\n',
            found: b'x',
            location: Location::new(None, 7),
        };
        assert_eq!(err.to_string(), "expected '\\n', but 'x' found in line 7");
    }
}
