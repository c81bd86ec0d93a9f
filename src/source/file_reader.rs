//! Record readers for the supported on-disk file formats

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::source::seqfile::SeqFileReader;
use crate::types::{Result, Sample, Tag};

/// On-disk record format of a source file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    /// UTF-8 byte stream, one record per `\n`-delimited line with the
    /// trailing delimiter stripped.
    #[serde(rename = "textfile")]
    Text,
    /// Binary key/value records; the value becomes the payload and the
    /// key rides along as a tag.
    #[serde(rename = "seqfile")]
    Seq,
}

/// Iterator over the records of one opened file.
pub(crate) enum RecordIter {
    Text { lines: BufReader<File> },
    Seq { records: SeqFileReader<File> },
}

impl RecordIter {
    pub(crate) fn open(path: &Path, filetype: FileType) -> Result<Self> {
        let file = File::open(path)?;
        Ok(match filetype {
            FileType::Text => RecordIter::Text {
                lines: BufReader::new(file),
            },
            FileType::Seq => RecordIter::Seq {
                records: SeqFileReader::new(file, path.display().to_string()),
            },
        })
    }

    /// Pull the next record as a sample; `None` at end of file.
    pub(crate) fn next_sample(&mut self) -> Result<Option<Sample>> {
        match self {
            RecordIter::Text { lines } => {
                let mut line = Vec::new();
                let n = lines.read_until(b'\n', &mut line)?;
                if n == 0 {
                    return Ok(None);
                }
                if line.last() == Some(&b'\n') {
                    line.pop();
                }
                Ok(Some(Sample::from_payload(line)))
            }
            RecordIter::Seq { records } => Ok(records
                .next_record()?
                .map(|(key, value)| Sample::new(value, vec![Tag::Blob(key)]))),
        }
    }
}
