//! Minimal binary key/value record format
//!
//! Each record is `key_len: u32 LE, value_len: u32 LE, key, value`. The
//! pipeline treats the stream as opaque `(key, value)` pairs; the value is
//! the payload and the key rides along as a tag. The writer exists for
//! data-prep tooling and tests.

use std::io::{BufReader, BufWriter, Read, Write};

use crate::types::error::SourceError;
use crate::types::Result;

/// Streaming reader over seqfile records.
pub struct SeqFileReader<R: Read> {
    inner: BufReader<R>,
    name: String,
}

impl<R: Read> SeqFileReader<R> {
    /// Wrap `inner`, using `name` in malformed-record diagnostics.
    pub fn new(inner: R, name: impl Into<String>) -> Self {
        Self {
            inner: BufReader::new(inner),
            name: name.into(),
        }
    }

    /// Read the next `(key, value)` record, `None` at a clean end of file.
    pub fn next_record(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut lens = [0u8; 8];
        match read_exact_or_eof(&mut self.inner, &mut lens)? {
            ReadState::Eof => return Ok(None),
            ReadState::Partial => {
                return Err(SourceError::BadRecord {
                    file: self.name.clone(),
                    detail: "truncated record header".into(),
                }
                .into())
            }
            ReadState::Full => {}
        }
        let key_len = u32::from_le_bytes(lens[0..4].try_into().unwrap()) as usize;
        let value_len = u32::from_le_bytes(lens[4..8].try_into().unwrap()) as usize;

        let mut key = vec![0u8; key_len];
        let mut value = vec![0u8; value_len];
        self.inner.read_exact(&mut key).map_err(|_| SourceError::BadRecord {
            file: self.name.clone(),
            detail: format!("truncated key of {key_len} bytes"),
        })?;
        self.inner
            .read_exact(&mut value)
            .map_err(|_| SourceError::BadRecord {
                file: self.name.clone(),
                detail: format!("truncated value of {value_len} bytes"),
            })?;
        Ok(Some((key, value)))
    }
}

enum ReadState {
    Full,
    Partial,
    Eof,
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<ReadState> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(if filled == 0 {
                ReadState::Eof
            } else {
                ReadState::Partial
            });
        }
        filled += n;
    }
    Ok(ReadState::Full)
}

/// Appends seqfile records to a writer.
pub struct SeqFileWriter<W: Write> {
    inner: BufWriter<W>,
}

impl<W: Write> SeqFileWriter<W> {
    /// Wrap `inner` for appending.
    pub fn new(inner: W) -> Self {
        Self {
            inner: BufWriter::new(inner),
        }
    }

    /// Append one `(key, value)` record.
    pub fn append(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.write_all(&(key.len() as u32).to_le_bytes())?;
        self.inner.write_all(&(value.len() as u32).to_le_bytes())?;
        self.inner.write_all(key)?;
        self.inner.write_all(value)?;
        Ok(())
    }

    /// Flush buffered records.
    pub fn finish(mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }
}
