//! Parallel ZIP archive creation.
//!
//! [`ParallelZip`] accepts entries in order, compresses them on worker
//! threads under a [`RateLimiter`](crate::rate_limit::RateLimiter) budget and
//! writes them through a single sink thread in exactly the order they were
//! submitted. Large deflated files are split into blocks compressed in
//! parallel; entries of existing archives can be copied without
//! recompression.

use std::io;
use std::path::PathBuf;

pub mod deflate;
pub mod format;
pub mod parallel;
pub mod reader;
pub mod source;
pub mod writer;

pub use format::{DosTime, FileHeader, Method};
pub use parallel::{FileEntry, ParallelZip, ZipOptions};
pub use reader::{ArchiveReader, SourceEntry};
pub use source::EntrySource;
pub use writer::ArchiveWriter;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("cannot open {}: {source}", path.display())]
    Open { path: PathBuf, source: io::Error },

    #[error("cannot create {}: {source}", path.display())]
    Create { path: PathBuf, source: io::Error },

    #[error("compression failed: {0}")]
    Compress(String),

    #[error("malformed archive: {0}")]
    Malformed(String),

    #[error("unsupported compression method {0}")]
    UnsupportedMethod(u16),

    #[error("CRC mismatch in {name}: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch {
        name: String,
        expected: u32,
        actual: u32,
    },

    #[error("duplicate entry {0}")]
    DuplicateEntry(String),

    #[error("invalid entry name {0:?}")]
    InvalidName(String),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("compression worker exited without a result")]
    WorkerLost,

    #[error("archive writer already failed")]
    Aborted,
}
