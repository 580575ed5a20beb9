//! LightningOps File System Abstraction Layer
//!
//! Provides the collaborators the operation engine dispatches through:
//! - UniversalPath: Safe path handling with UNC prefix support
//! - PathMedia: drive-kind classification (fixed / removable / network)
//! - FsOps: the per-path-kind capability set (copy, move, delete,
//!   create dir, change attrs, check path) and the local-disk impl
//! - Filename validity checks for target names
//! - Byte conversion tables for in-place text recoding

mod universal_path;
mod media;
mod sanitize;
mod recode;
mod adapter;

pub use universal_path::UniversalPath;
pub use media::PathMedia;
pub use sanitize::{is_valid_filename, invalid_name_reason, sanitize_filename};
pub use recode::{ConvertTable, EolPolicy, Recoder};
pub use adapter::{
    is_cross_device, AttrChange, CopyControl, CopyEnd, CopyOptions, DiskFs, FsOps, ItemMeta,
    TransferSink,
};

use std::path::Path;
use thiserror::Error;

/// File system errors, classified so the engine can key its
/// skip-all/overwrite-all memory on the error kind
#[derive(Error, Debug)]
pub enum FsError {
    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Disk full: {0}")]
    DiskFull(String),

    #[error("Device not ready: {0}")]
    NotReady(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FsError>;

// Raw OS codes that io::ErrorKind does not distinguish
#[cfg(windows)]
const OS_DISK_FULL: &[i32] = &[39 /* HANDLE_DISK_FULL */, 112 /* DISK_FULL */];
#[cfg(windows)]
const OS_NOT_READY: &[i32] = &[21 /* NOT_READY */];
#[cfg(not(windows))]
const OS_DISK_FULL: &[i32] = &[28 /* ENOSPC */];
#[cfg(not(windows))]
const OS_NOT_READY: &[i32] = &[123 /* ENOMEDIUM */, 6 /* ENXIO */];

impl FsError {
    /// Classify a raw IO error against the path it occurred on
    pub fn classify(err: std::io::Error, path: &Path) -> Self {
        let name = path.display().to_string();
        if let Some(code) = err.raw_os_error() {
            if OS_DISK_FULL.contains(&code) {
                return FsError::DiskFull(name);
            }
            if OS_NOT_READY.contains(&code) {
                return FsError::NotReady(name);
            }
        }
        match err.kind() {
            std::io::ErrorKind::NotFound => FsError::NotFound(name),
            std::io::ErrorKind::PermissionDenied => FsError::AccessDenied(name),
            std::io::ErrorKind::AlreadyExists => FsError::AlreadyExists(name),
            _ => FsError::Io(err),
        }
    }
}
