//! Error types for the Shades storage engine.
//!
//! Per the error-handling design, most failures here are fatal: the
//! single-writer, transactional-commit model leaves no room for partial
//! recovery. Callers that can legitimately retry (nursery exhaustion,
//! EAGAIN-equivalent async submission) are documented at each call site;
//! everything else should be logged and the process terminated.

use thiserror::Error;

/// Crate-wide result alias, re-exported from `lib.rs`.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("short I/O: expected {expected} bytes, got {actual}")]
    ShortIo { expected: usize, actual: usize },

    #[error("page {0} failed magic cookie validation: database is corrupt or misconfigured")]
    CorruptPage(u64),

    #[error("no valid root block found in any backing file")]
    NoRoot,

    #[error("cell type tag {0} is not present in the catalog")]
    UnknownCellType(u8),

    #[error("out of main-memory pages: working set exceeds configured db_size")]
    OutOfPages,

    #[error("out of disk pages: no free page remains for the next root")]
    OutOfDiskPages,

    #[error("nursery exhausted")]
    NurseryExhausted,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("assertion failed: {0}")]
    Assertion(String),

    #[error("file open/create failed for {path}: {source}")]
    FileOpen {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Whether this error is, per spec §7, fatal (unrecoverable for the
    /// process) as opposed to one the caller should transparently retry.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::NurseryExhausted)
    }
}
