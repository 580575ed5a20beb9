//! Drive-kind classification for operation planning
//!
//! The engine sizes its copy buffers and routes path probes by what kind
//! of media a path lives on; the classification is advisory only.

use std::path::Path;

/// What kind of storage a path resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathMedia {
    /// Local fixed disk, USB disk, flash drive, CD/DVD, or RAM disk
    Fixed,
    /// Floppy or other slow removable media
    Removable,
    /// UNC path or mapped network drive
    Network,
    /// Could not be determined
    Unknown,
}

impl PathMedia {
    /// Fast media never needs a probe thread; availability checks can
    /// run synchronously on the calling thread
    pub fn is_fast(self) -> bool {
        matches!(self, PathMedia::Fixed)
    }

    pub fn is_network(self) -> bool {
        matches!(self, PathMedia::Network)
    }

    /// Classify the media a path lives on
    pub fn of(path: &Path) -> PathMedia {
        classify(path)
    }
}

#[cfg(windows)]
fn classify(path: &Path) -> PathMedia {
    use std::os::windows::ffi::OsStrExt;
    use windows::core::PCWSTR;
    use windows::Win32::Storage::FileSystem::GetDriveTypeW;

    let display = path.to_string_lossy();
    let stripped = display
        .strip_prefix(r"\\?\")
        .unwrap_or(&display);

    // UNC without a drive letter is always remote
    if stripped.starts_with(r"\\") {
        return PathMedia::Network;
    }

    let bytes = stripped.as_bytes();
    if bytes.len() < 2 || !bytes[0].is_ascii_alphabetic() || bytes[1] != b':' {
        return PathMedia::Unknown;
    }

    let root = format!("{}:\\", bytes[0] as char);
    let wide: Vec<u16> = std::ffi::OsStr::new(&root)
        .encode_wide()
        .chain(std::iter::once(0))
        .collect();

    // DRIVE_* constants from winbase.h
    match unsafe { GetDriveTypeW(PCWSTR(wide.as_ptr())) } {
        3 | 5 | 6 => PathMedia::Fixed, // DRIVE_FIXED, DRIVE_CDROM, DRIVE_RAMDISK
        2 => PathMedia::Removable,     // DRIVE_REMOVABLE
        4 => PathMedia::Network,       // DRIVE_REMOTE
        _ => PathMedia::Unknown,
    }
}

#[cfg(not(windows))]
fn classify(path: &Path) -> PathMedia {
    let display = path.to_string_lossy();
    if display.starts_with("//") {
        return PathMedia::Network;
    }
    // Common removable/network mount points on Unix-like systems
    for prefix in ["/media/", "/run/media/", "/mnt/floppy"] {
        if display.starts_with(prefix) {
            return PathMedia::Removable;
        }
    }
    for prefix in ["/net/", "/smb/", "/nfs/"] {
        if display.starts_with(prefix) {
            return PathMedia::Network;
        }
    }
    PathMedia::Fixed
}
