//! Record line and partition block codec.
//!
//! Record lines have the form `<number>. <value>\r\n`, partition blocks have the form
//! `<value>\n<n1>|<n2>|...|<nk>\n`. Both are decoded through fixed scratch buffers,
//! so reading and writing records doesn't allocate per record.

use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};

use crate::error::{Location, Result, SortError};
use crate::{NUMBER_MAX_LEN, NUMBER_POSTFIX, VALUE_MAX_BYTES, VALUE_MAX_LEN};

const DOT: u8 = b'.';
const SPACE: u8 = b' ';
pub(crate) const CR: u8 = b'\r';
pub(crate) const LF: u8 = b'\n';
pub(crate) const NUMBER_SEPARATOR: u8 = b'|';

/// A record borrowed from a reader scratch buffer.
///
/// Records are ordered by value first (byte-wise) and by number second.
/// The borrowed value is overwritten by the next read, use [`Record::to_record_buf`] to retain it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Record<'a> {
    pub value: &'a [u8],
    pub number: i64,
}

impl<'a> Record<'a> {
    pub fn new(number: i64, value: &'a [u8]) -> Self {
        Record { value, number }
    }

    /// Copies the record out of the scratch buffer.
    pub fn to_record_buf(&self) -> RecordBuf {
        RecordBuf::new(self.number, self.value)
    }
}

/// An owned record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordBuf {
    pub value: Vec<u8>,
    pub number: i64,
}

impl RecordBuf {
    pub fn new(number: i64, value: impl Into<Vec<u8>>) -> Self {
        RecordBuf {
            value: value.into(),
            number,
        }
    }
}

/// Record line reader.
pub struct RecordReader<R> {
    reader: R,
    path: Option<PathBuf>,
    value: Vec<u8>,
    line: u64,
    position: u64,
}

impl<R: BufRead> RecordReader<R> {
    pub fn new(reader: R) -> Self {
        RecordReader {
            reader,
            path: None,
            value: Vec::with_capacity(VALUE_MAX_BYTES),
            line: 1,
            position: 0,
        }
    }

    /// Sets the path reported in error locations.
    pub fn with_path(mut self, path: &Path) -> Self {
        self.path = Some(path.to_path_buf());
        return self;
    }

    /// Number of the line to be read next.
    pub fn line(&self) -> u64 {
        self.line
    }

    /// Number of bytes consumed from the underlying reader.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Reads the next record. Returns [`None`] if the stream ended at a record boundary.
    pub fn read_record(&mut self) -> Result<Option<Record<'_>>> {
        if self.reader.fill_buf()?.is_empty() {
            return Ok(None);
        }

        let number = self.read_number()?;
        match self.read_byte()? {
            None | Some(SPACE) => {}
            Some(found) => return Err(self.unexpected(SPACE, found)),
        }
        self.read_value()?;
        self.line += 1;

        return Ok(Some(Record::new(number, &self.value)));
    }

    fn read_number(&mut self) -> Result<i64> {
        let mut digits = [0u8; NUMBER_MAX_LEN];
        let mut len = 0;

        loop {
            let available = self.reader.fill_buf()?;
            if available.is_empty() {
                break;
            }

            let (chunk, found) = match memchr::memchr(DOT, available) {
                Some(pos) => (&available[..pos], true),
                None => (available, false),
            };
            if len + chunk.len() > NUMBER_MAX_LEN {
                let fits = NUMBER_MAX_LEN - len;
                digits[len..].copy_from_slice(&chunk[..fits]);
                return Err(self.malformed_number(&digits));
            }
            digits[len..len + chunk.len()].copy_from_slice(chunk);
            len += chunk.len();

            let consumed = chunk.len() + found as usize;
            self.consume(consumed);
            if found {
                break;
            }
        }

        parse_number(&digits[..len]).ok_or_else(|| self.malformed_number(&digits[..len]))
    }

    fn read_value(&mut self) -> Result<()> {
        self.value.clear();

        loop {
            let available = self.reader.fill_buf()?;
            if available.is_empty() {
                break;
            }

            let (end, delimiter) = match memchr::memchr2(CR, LF, available) {
                Some(pos) => (pos, Some(available[pos])),
                None => (available.len(), None),
            };
            if self.value.len() + end > VALUE_MAX_BYTES {
                return Err(self.value_too_long());
            }
            self.value.extend_from_slice(&available[..end]);

            match delimiter {
                Some(CR) => {
                    self.consume(end + 1);
                    break;
                }
                Some(found) => {
                    self.consume(end);
                    return Err(self.unexpected(CR, found));
                }
                None => self.consume(end),
            }
        }

        if self.value.len() > VALUE_MAX_LEN && char_count(&self.value) > VALUE_MAX_LEN {
            return Err(self.value_too_long());
        }

        match self.read_byte()? {
            None | Some(LF) => Ok(()),
            Some(found) => Err(self.unexpected(LF, found)),
        }
    }

    fn read_byte(&mut self) -> Result<Option<u8>> {
        let byte = match self.reader.fill_buf()?.first() {
            Some(&byte) => byte,
            None => return Ok(None),
        };
        self.consume(1);

        return Ok(Some(byte));
    }

    fn consume(&mut self, amount: usize) {
        self.reader.consume(amount);
        self.position += amount as u64;
    }

    fn location(&self) -> Location {
        Location::new(self.path.clone(), self.line)
    }

    fn malformed_number(&self, text: &[u8]) -> SortError {
        SortError::MalformedNumber {
            text: String::from_utf8_lossy(text).into_owned(),
            location: self.location(),
        }
    }

    fn unexpected(&self, expected: u8, found: u8) -> SortError {
        SortError::UnexpectedDelimiter {
            expected,
            found,
            location: self.location(),
        }
    }

    fn value_too_long(&self) -> SortError {
        SortError::CapacityExceeded(format!(
            "value is longer than {} characters in {}",
            VALUE_MAX_LEN,
            self.location()
        ))
    }
}

/// Parses a decimal 64-bit signed integer.
pub(crate) fn parse_number(digits: &[u8]) -> Option<i64> {
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// Counts UTF-8 encoded characters (every byte that isn't a continuation byte).
pub(crate) fn char_count(value: &[u8]) -> usize {
    value.iter().filter(|&&byte| (byte & 0xC0) != 0x80).count()
}

/// Writes a number using a stack buffer.
pub fn write_number<W: Write + ?Sized>(writer: &mut W, number: i64) -> io::Result<()> {
    let mut buf = itoa::Buffer::new();
    writer.write_all(buf.format(number).as_bytes())
}

/// Writes a `<number>. <value>\r\n` line.
pub fn write_record<W: Write + ?Sized>(writer: &mut W, number: i64, value: &[u8]) -> io::Result<()> {
    write_number(writer, number)?;
    writer.write_all(NUMBER_POSTFIX)?;
    writer.write_all(value)?;
    writer.write_all(b"\r\n")
}

/// Writes a `<value>\n<n1>|<n2>|...\n` partition block.
pub fn write_partition_block<W: Write + ?Sized>(writer: &mut W, value: &[u8], numbers: &[i64]) -> io::Result<()> {
    writer.write_all(value)?;
    writer.write_all(&[LF])?;
    for (idx, number) in numbers.iter().enumerate() {
        if idx > 0 {
            writer.write_all(&[NUMBER_SEPARATOR])?;
        }
        write_number(writer, *number)?;
    }
    writer.write_all(&[LF])
}
