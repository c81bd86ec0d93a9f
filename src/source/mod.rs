//! Data sources: partitioned file lists and record readers

mod file_reader;
mod local;
mod seqfile;

pub use file_reader::FileType;
pub use local::{LocalSource, SourceConfig};
pub use seqfile::{SeqFileReader, SeqFileWriter};
