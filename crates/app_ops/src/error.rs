//! Engine error types

use app_fs::FsError;
use std::path::PathBuf;
use thiserror::Error;

/// Classes of recoverable per-item errors
///
/// The worker keys its skip-all memory on this, so "skip all collisions"
/// does not also swallow an unrelated access-denied error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemErrorKind {
    NotFound,
    AccessDenied,
    AlreadyExists,
    DiskFull,
    NotReady,
    InvalidName,
    Io,
}

impl ItemErrorKind {
    pub fn of(err: &FsError) -> Self {
        match err {
            FsError::NotFound(_) => ItemErrorKind::NotFound,
            FsError::AccessDenied(_) => ItemErrorKind::AccessDenied,
            FsError::AlreadyExists(_) => ItemErrorKind::AlreadyExists,
            FsError::DiskFull(_) => ItemErrorKind::DiskFull,
            FsError::NotReady(_) => ItemErrorKind::NotReady,
            FsError::InvalidName(_) => ItemErrorKind::InvalidName,
            FsError::Encoding(_) | FsError::Io(_) => ItemErrorKind::Io,
        }
    }
}

/// Engine errors
///
/// Per-item errors never appear here; they are resolved inside the
/// worker's retry loop. Only setup failures and user cancellation
/// terminate an operation through this type.
#[derive(Debug, Error)]
pub enum OpError {
    /// Operation could not start; nothing was touched on disk
    #[error("operation setup failed: {0}")]
    Setup(String),

    /// Recoverable error escaped the retry loop (internal use)
    #[error("{source} (while processing {path})")]
    Item {
        path: PathBuf,
        #[source]
        source: FsError,
    },

    #[error("operation cancelled by user")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, OpError>;
