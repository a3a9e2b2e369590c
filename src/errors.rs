use std::path::PathBuf;

use thiserror::Error;

/// Failures while reading the persisted sync state or its journal. Any of
/// these aborts the channel without touching the files.
#[derive(Error, Debug)]
pub enum StateError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("incomplete {what} at {}:{line}", .path.display())]
    Incomplete {
        what: &'static str,
        path: PathBuf,
        line: usize,
    },
    #[error("invalid {what} at {}:{line}", .path.display())]
    Invalid {
        what: &'static str,
        path: PathBuf,
        line: usize,
    },
    #[error("incompatible journal version {got:?} in {} (expected {expected})", .path.display())]
    JournalVersion {
        got: String,
        path: PathBuf,
        expected: &'static str,
    },
    #[error("journal entry at {}:{line} refers to an unknown sync record", .path.display())]
    UnknownRecord { path: PathBuf, line: usize },
    #[error("store '{0}' does not support in-box sync state")]
    NoInBoxState(String),
    #[error("invalid sync state location '{}'", .0.display())]
    BadLocation(PathBuf),
}

/// Failures while taking the per-channel advisory lock.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("channel is locked by another process")]
    Contended,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
