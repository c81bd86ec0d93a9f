//! Local filesystem source: partitioned file lists replayed across passes

use std::path::PathBuf;
use std::sync::Arc;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::pipeline::{Reader, ReaderFactory};
use crate::source::file_reader::{FileType, RecordIter};
use crate::types::error::{PipelineError, SourceError};
use crate::types::{Item, Result};

/// Settings describing where and how to read a corpus.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Data location, e.g. `file://path/to/data`; bare `.`/`/` paths are
    /// also treated as local.
    pub uri: String,
    /// Record format of the files.
    pub filetype: FileType,
    /// This node's partition id.
    pub part_id: usize,
    /// Total number of partitions.
    pub part_count: usize,
    /// Times to replay the corpus; zero or negative means forever.
    pub pass_count: i32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            uri: String::new(),
            filetype: FileType::Seq,
            part_id: 0,
            part_count: 1,
            pass_count: 1,
        }
    }
}

/// A partitioned view over the files under a local uri.
///
/// Files are listed lexicographically and file `i` belongs to this source
/// iff `i mod part_count == part_id`. Each pass opens the partition's
/// files in a fresh random order.
#[derive(Debug)]
pub struct LocalSource {
    config: SourceConfig,
    total_files: usize,
    files: Arc<Vec<PathBuf>>,
}

impl LocalSource {
    /// Whether this source can open `uri`.
    pub fn is_supported(uri: &str) -> bool {
        uri.starts_with("file://") || uri.starts_with('.') || uri.starts_with('/')
    }

    fn strip_scheme(uri: &str) -> &str {
        uri.strip_prefix("file:/").unwrap_or(uri)
    }

    /// Open the source, listing and partitioning its files.
    pub fn new(config: SourceConfig) -> Result<Self> {
        let uri = config.uri.trim();
        if !Self::is_supported(uri) {
            return Err(SourceError::UnsupportedScheme(uri.to_string()).into());
        }
        if config.part_count == 0 || config.part_id >= config.part_count {
            return Err(PipelineError::InvalidArgument(format!(
                "partition {}/{} is not valid",
                config.part_id, config.part_count
            ))
            .into());
        }

        let root = PathBuf::from(Self::strip_scheme(uri));
        let mut all = Vec::new();
        if root.is_file() {
            all.push(root);
        } else {
            for entry in std::fs::read_dir(&root)? {
                let path = entry?.path();
                if path.is_file() {
                    all.push(path);
                }
            }
        }
        all.sort();

        let total_files = all.len();
        let files = Self::partition(all, config.part_id, config.part_count);
        if files.is_empty() {
            return Err(SourceError::EmptyPartition {
                uri: uri.to_string(),
                part_id: config.part_id,
                part_count: config.part_count,
            }
            .into());
        }
        tracing::debug!(
            "source {} holds {}/{} files for partition {}/{}",
            uri,
            files.len(),
            total_files,
            config.part_id,
            config.part_count
        );
        Ok(Self {
            config: SourceConfig {
                uri: uri.to_string(),
                ..config
            },
            total_files,
            files: Arc::new(files),
        })
    }

    /// Keep file `i` iff `i mod part_count == part_id`.
    pub fn partition(files: Vec<PathBuf>, part_id: usize, part_count: usize) -> Vec<PathBuf> {
        files
            .into_iter()
            .enumerate()
            .filter(|(i, _)| i % part_count == part_id)
            .map(|(_, f)| f)
            .collect()
    }

    /// Files of this partition, in lexicographic order.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Total files under the uri before partitioning.
    pub fn total_files(&self) -> usize {
        self.total_files
    }

    /// Restartable reader over this partition's records.
    ///
    /// `pass_count` overrides the configured value; zero or negative
    /// replays forever.
    pub fn reader(&self, pass_count: Option<i32>) -> ReaderFactory {
        let files = self.files.clone();
        let filetype = self.config.filetype;
        let pass_count = pass_count.unwrap_or(self.config.pass_count);
        Arc::new(move || {
            let mut order: Vec<usize> = (0..files.len()).collect();
            order.shuffle(&mut rand::rng());
            Box::new(SourceIter {
                files: files.clone(),
                filetype,
                pass_count,
                passes_done: 0,
                order,
                next_file: 0,
                current: None,
                total_samples: 0,
                done: false,
            }) as Reader
        })
    }
}

struct SourceIter {
    files: Arc<Vec<PathBuf>>,
    filetype: FileType,
    pass_count: i32,
    passes_done: i32,
    order: Vec<usize>,
    next_file: usize,
    current: Option<OpenFile>,
    total_samples: u64,
    done: bool,
}

struct OpenFile {
    index: usize,
    records: RecordIter,
    samples: u64,
}

impl Iterator for SourceIter {
    type Item = Result<Item>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if let Some(open) = self.current.as_mut() {
                match open.records.next_sample() {
                    Ok(Some(sample)) => {
                        open.samples += 1;
                        return Some(Ok(Item::Sample(sample)));
                    }
                    Ok(None) => {
                        self.total_samples += open.samples;
                        tracing::debug!(
                            "read {}/{} samples from {}",
                            open.samples,
                            self.total_samples,
                            self.files[open.index].display()
                        );
                        self.current = None;
                    }
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
                continue;
            }

            if self.next_file >= self.order.len() {
                self.passes_done += 1;
                if self.pass_count > 0 && self.passes_done >= self.pass_count {
                    self.done = true;
                    return None;
                }
                self.order.shuffle(&mut rand::rng());
                self.next_file = 0;
            }

            let index = self.order[self.next_file];
            self.next_file += 1;
            match RecordIter::open(&self.files[index], self.filetype) {
                Ok(records) => {
                    self.current = Some(OpenFile {
                        index,
                        records,
                        samples: 0,
                    });
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_corpus(lines_per_file: &[&[&str]]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (i, lines) in lines_per_file.iter().enumerate() {
            let mut content = lines.join("\n");
            content.push('\n');
            std::fs::write(dir.path().join(format!("part-{i:04}")), content).unwrap();
        }
        dir
    }

    fn text_config(uri: String, part_id: usize, part_count: usize) -> SourceConfig {
        SourceConfig {
            uri,
            filetype: FileType::Text,
            part_id,
            part_count,
            pass_count: 1,
        }
    }

    fn read_all(source: &LocalSource, passes: Option<i32>) -> Vec<String> {
        source.reader(passes)()
            .map(|r| match r.unwrap() {
                Item::Sample(s) => String::from_utf8(s.payload.to_vec()).unwrap(),
                Item::Batch(_) => panic!("unexpected batch"),
            })
            .collect()
    }

    #[test]
    fn partition_assignment_is_index_mod_count() {
        let files: Vec<PathBuf> = (0..7).map(|i| PathBuf::from(format!("f{i}"))).collect();
        let part = LocalSource::partition(files, 1, 3);
        assert_eq!(
            part,
            vec![PathBuf::from("f1"), PathBuf::from("f4")]
        );
    }

    #[test]
    fn reads_every_record_of_the_partition() {
        let dir = write_corpus(&[&["a0", "a1"], &["b0"], &["c0", "c1", "c2"]]);
        let cfg = text_config(dir.path().display().to_string(), 0, 1);
        let source = LocalSource::new(cfg).unwrap();
        assert_eq!(source.total_files(), 3);
        let mut got = read_all(&source, None);
        got.sort();
        assert_eq!(got, vec!["a0", "a1", "b0", "c0", "c1", "c2"]);
    }

    #[test]
    fn partitioned_source_sees_only_its_files() {
        let dir = write_corpus(&[&["a0"], &["b0"], &["c0"], &["d0"]]);
        let cfg = text_config(dir.path().display().to_string(), 1, 2);
        let source = LocalSource::new(cfg).unwrap();
        let mut got = read_all(&source, None);
        got.sort();
        assert_eq!(got, vec!["b0", "d0"]);
    }

    #[test]
    fn pass_count_replays_the_corpus() {
        let dir = write_corpus(&[&["x", "y"]]);
        let cfg = text_config(dir.path().display().to_string(), 0, 1);
        let source = LocalSource::new(cfg).unwrap();
        let got = read_all(&source, Some(3));
        assert_eq!(got.len(), 6);
    }

    #[test]
    fn file_scheme_uri_resolves() {
        let dir = write_corpus(&[&["hello"]]);
        let cfg = text_config(format!("file:/{}", dir.path().display()), 0, 1);
        let source = LocalSource::new(cfg).unwrap();
        assert_eq!(read_all(&source, None), vec!["hello"]);
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        let cfg = text_config("hdfs://cluster/data".into(), 0, 1);
        let err = LocalSource::new(cfg).unwrap_err();
        assert!(matches!(
            err,
            crate::types::Error::Source(SourceError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn empty_partition_is_rejected() {
        let dir = write_corpus(&[&["only"]]);
        let cfg = text_config(dir.path().display().to_string(), 1, 2);
        let err = LocalSource::new(cfg).unwrap_err();
        assert!(matches!(
            err,
            crate::types::Error::Source(SourceError::EmptyPartition { .. })
        ));
    }
}
