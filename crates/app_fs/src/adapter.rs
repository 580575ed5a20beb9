//! Per-path-kind file system capabilities
//!
//! The operation engine never special-cases a path kind: every step is
//! dispatched through [`FsOps`]. [`DiskFs`] is the local-disk
//! implementation; archive and plugin file systems provide their own.

use crate::{FsError, PathMedia, Result};
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::time::SystemTime;

/// Metadata the engine needs about a single item
#[derive(Debug, Clone)]
pub struct ItemMeta {
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub readonly: bool,
    pub is_dir: bool,
    pub is_symlink: bool,
}

/// Requested attribute changes; `None` fields are left untouched
#[derive(Debug, Clone, Default)]
pub struct AttrChange {
    pub readonly: Option<bool>,
    pub hidden: Option<bool>,
    pub system: Option<bool>,
    pub archive: Option<bool>,
    pub modified: Option<SystemTime>,
    pub accessed: Option<SystemTime>,
    pub created: Option<SystemTime>,
}

impl AttrChange {
    /// Only timestamps, used to restore directory times after a move
    pub fn times(modified: SystemTime) -> Self {
        Self {
            modified: Some(modified),
            ..Default::default()
        }
    }
}

/// Options for a single file copy
#[derive(Debug, Clone)]
pub struct CopyOptions {
    pub buffer_size: usize,
    pub preserve_times: bool,
    /// Target should come out encrypted (NTFS EFS); best effort
    pub encrypt: bool,
    /// Copy alternate data streams as well; best effort
    pub copy_ads: bool,
}

/// What the engine tells the copy loop after each flushed buffer
#[derive(Debug, Clone, Copy)]
pub enum CopyControl {
    /// Keep going; read at most `buffer_limit` bytes next
    Continue { buffer_limit: usize },
    /// Stop after the buffer that was just flushed
    Cancel,
}

/// Per-buffer callback driven by the copy loop
pub trait TransferSink {
    fn on_chunk(&mut self, bytes: usize) -> CopyControl;
}

/// How a copy ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyEnd {
    Done { bytes: u64 },
    /// The sink asked to stop; `bytes` were already flushed to the target
    Cancelled { bytes: u64 },
}

/// The uniform capability set all path kinds expose
pub trait FsOps: Send + Sync {
    fn metadata(&self, path: &Path) -> Result<ItemMeta>;

    /// A cheap reachability test; may block indefinitely on dead media,
    /// which is why the engine calls it through the path prober
    fn check_path(&self, path: &Path) -> Result<()>;

    fn copy_file(
        &self,
        src: &Path,
        dst: &Path,
        opts: &CopyOptions,
        sink: &mut dyn TransferSink,
    ) -> Result<CopyEnd>;

    /// Same-volume fast move; cross-volume moves are the engine's
    /// copy+delete fallback
    fn rename(&self, src: &Path, dst: &Path) -> Result<()>;

    fn delete_file(&self, path: &Path) -> Result<()>;

    /// Delete an empty directory (scripts delete depth-first)
    fn delete_dir(&self, path: &Path) -> Result<()>;

    /// Delete a directory link (junction/symlink) without recursing into it
    fn delete_dir_link(&self, path: &Path) -> Result<()>;

    fn create_dir(&self, path: &Path) -> Result<()>;

    fn change_attrs(&self, path: &Path, change: &AttrChange) -> Result<()>;

    /// Raw read stream; used by steps that transform file content
    fn open_read(&self, path: &Path) -> Result<Box<dyn std::io::Read + Send>>;

    /// Raw write stream creating/truncating `path`
    fn create_write(&self, path: &Path) -> Result<Box<dyn std::io::Write + Send>>;

    /// Atomically put `tmp` in place of `dst`, overwriting it
    fn replace(&self, tmp: &Path, dst: &Path) -> Result<()>;

    /// Free space on the volume holding `path`, if the backend knows it
    fn free_space(&self, path: &Path) -> Result<Option<u64>>;

    fn media(&self, path: &Path) -> PathMedia {
        PathMedia::of(path)
    }
}

/// True when a rename failed because source and target are on
/// different volumes
pub fn is_cross_device(err: &FsError) -> bool {
    // EXDEV on Unix, ERROR_NOT_SAME_DEVICE on Windows
    let expected = if cfg!(windows) { 17 } else { 18 };
    matches!(err, FsError::Io(io) if io.raw_os_error() == Some(expected))
}

/// Local-disk implementation of [`FsOps`]
#[derive(Debug, Default)]
pub struct DiskFs;

impl DiskFs {
    pub fn new() -> Self {
        Self
    }
}

impl FsOps for DiskFs {
    fn metadata(&self, path: &Path) -> Result<ItemMeta> {
        let meta = fs::symlink_metadata(path).map_err(|e| FsError::classify(e, path))?;
        Ok(ItemMeta {
            size: meta.len(),
            modified: meta.modified().ok(),
            readonly: meta.permissions().readonly(),
            is_dir: meta.is_dir(),
            is_symlink: meta.file_type().is_symlink(),
        })
    }

    fn check_path(&self, path: &Path) -> Result<()> {
        match fs::metadata(path) {
            Ok(_) => Ok(()),
            Err(e) => {
                // Roots of removable drives report "invalid parameter"
                // when no medium is inserted
                #[cfg(windows)]
                if e.raw_os_error() == Some(87) {
                    return Err(FsError::NotReady(path.display().to_string()));
                }
                let err = FsError::classify(e, path);
                // Attribute reads can be denied on roots where listing
                // still works
                if matches!(err, FsError::AccessDenied(_)) && fs::read_dir(path).is_ok() {
                    return Ok(());
                }
                Err(err)
            }
        }
    }

    fn copy_file(
        &self,
        src: &Path,
        dst: &Path,
        opts: &CopyOptions,
        sink: &mut dyn TransferSink,
    ) -> Result<CopyEnd> {
        let mut reader = fs::File::open(src).map_err(|e| FsError::classify(e, src))?;
        let mut writer = fs::File::create(dst).map_err(|e| FsError::classify(e, dst))?;

        let mut buffer = vec![0u8; opts.buffer_size.max(1)];
        let mut limit = buffer.len();
        let mut total: u64 = 0;

        loop {
            let want = limit.clamp(1, buffer.len());
            let n = reader
                .read(&mut buffer[..want])
                .map_err(|e| FsError::classify(e, src))?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&buffer[..n])
                .map_err(|e| FsError::classify(e, dst))?;
            total += n as u64;

            match sink.on_chunk(n) {
                CopyControl::Continue { buffer_limit } => limit = buffer_limit,
                CopyControl::Cancel => {
                    drop(writer);
                    return Ok(CopyEnd::Cancelled { bytes: total });
                }
            }
        }

        drop(writer);

        let src_meta = fs::metadata(src).map_err(|e| FsError::classify(e, src))?;
        if opts.preserve_times {
            if let Ok(modified) = src_meta.modified() {
                let ft = filetime::FileTime::from_system_time(modified);
                if let Err(e) = filetime::set_file_mtime(dst, ft) {
                    tracing::debug!("Could not preserve mtime on {}: {}", dst.display(), e);
                }
            }
        }
        let perms = src_meta.permissions();
        if perms.readonly() {
            let _ = fs::set_permissions(dst, perms);
        }

        #[cfg(windows)]
        copy_win_attrs(src, dst, opts.encrypt);
        #[cfg(not(windows))]
        if opts.encrypt || opts.copy_ads {
            tracing::debug!(
                "encrypt/ADS flags ignored for {}: unsupported on this platform",
                dst.display()
            );
        }

        Ok(CopyEnd::Done { bytes: total })
    }

    fn rename(&self, src: &Path, dst: &Path) -> Result<()> {
        fs::rename(src, dst).map_err(|e| FsError::classify(e, src))
    }

    fn delete_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).map_err(|e| FsError::classify(e, path))
    }

    fn delete_dir(&self, path: &Path) -> Result<()> {
        fs::remove_dir(path).map_err(|e| FsError::classify(e, path))
    }

    fn delete_dir_link(&self, path: &Path) -> Result<()> {
        let meta = fs::symlink_metadata(path).map_err(|e| FsError::classify(e, path))?;
        if !meta.file_type().is_symlink() {
            return Err(FsError::InvalidName(format!(
                "{} is not a directory link",
                path.display()
            )));
        }
        // A directory junction/symlink is itself a directory entry on
        // Windows but a plain file entry elsewhere
        #[cfg(windows)]
        let result = fs::remove_dir(path);
        #[cfg(not(windows))]
        let result = fs::remove_file(path);
        result.map_err(|e| FsError::classify(e, path))
    }

    fn create_dir(&self, path: &Path) -> Result<()> {
        fs::create_dir(path).map_err(|e| FsError::classify(e, path))
    }

    fn change_attrs(&self, path: &Path, change: &AttrChange) -> Result<()> {
        if let Some(readonly) = change.readonly {
            let meta = fs::metadata(path).map_err(|e| FsError::classify(e, path))?;
            let mut perms = meta.permissions();
            if perms.readonly() != readonly {
                perms.set_readonly(readonly);
                fs::set_permissions(path, perms).map_err(|e| FsError::classify(e, path))?;
            }
        }

        if change.modified.is_some() || change.accessed.is_some() {
            let to_ft = filetime::FileTime::from_system_time;
            let result = match (change.modified, change.accessed) {
                (Some(m), Some(a)) => filetime::set_file_times(path, to_ft(a), to_ft(m)),
                (Some(m), None) => filetime::set_file_mtime(path, to_ft(m)),
                (None, Some(a)) => filetime::set_file_atime(path, to_ft(a)),
                (None, None) => Ok(()),
            };
            result.map_err(|e| FsError::classify(e, path))?;
        }

        #[cfg(windows)]
        set_win_attrs(path, change)?;
        #[cfg(not(windows))]
        if change.hidden.is_some() || change.system.is_some() || change.archive.is_some() {
            tracing::debug!(
                "hidden/system/archive flags ignored for {}: unsupported on this platform",
                path.display()
            );
        }
        if change.created.is_some() {
            tracing::debug!("creation time change not supported for {}", path.display());
        }

        Ok(())
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn Read + Send>> {
        let file = fs::File::open(path).map_err(|e| FsError::classify(e, path))?;
        Ok(Box::new(file))
    }

    fn create_write(&self, path: &Path) -> Result<Box<dyn Write + Send>> {
        let file = fs::File::create(path).map_err(|e| FsError::classify(e, path))?;
        Ok(Box::new(file))
    }

    fn replace(&self, tmp: &Path, dst: &Path) -> Result<()> {
        // Windows rename refuses to overwrite
        #[cfg(windows)]
        if dst.exists() {
            fs::remove_file(dst).map_err(|e| FsError::classify(e, dst))?;
        }
        fs::rename(tmp, dst).map_err(|e| FsError::classify(e, tmp))
    }

    fn free_space(&self, path: &Path) -> Result<Option<u64>> {
        #[cfg(windows)]
        {
            use std::os::windows::ffi::OsStrExt;
            use windows::core::PCWSTR;
            use windows::Win32::Storage::FileSystem::GetDiskFreeSpaceExW;

            let wide: Vec<u16> = path
                .as_os_str()
                .encode_wide()
                .chain(std::iter::once(0))
                .collect();
            let mut free: u64 = 0;
            let ok = unsafe {
                GetDiskFreeSpaceExW(PCWSTR(wide.as_ptr()), Some(&mut free), None, None)
            };
            Ok(ok.is_ok().then_some(free))
        }
        #[cfg(not(windows))]
        {
            let _ = path;
            Ok(None)
        }
    }
}

#[cfg(windows)]
fn copy_win_attrs(src: &Path, dst: &Path, encrypt: bool) {
    use std::os::windows::ffi::OsStrExt;
    use windows::core::PCWSTR;
    use windows::Win32::Storage::FileSystem::{
        GetFileAttributesW, SetFileAttributesW, FILE_FLAGS_AND_ATTRIBUTES,
        INVALID_FILE_ATTRIBUTES,
    };

    let to_wide = |p: &Path| -> Vec<u16> {
        p.as_os_str().encode_wide().chain(std::iter::once(0)).collect()
    };

    let src_w = to_wide(src);
    let attrs = unsafe { GetFileAttributesW(PCWSTR(src_w.as_ptr())) };
    if attrs == INVALID_FILE_ATTRIBUTES {
        return;
    }

    // HIDDEN | SYSTEM | ARCHIVE | NOT_CONTENT_INDEXED
    let carried = attrs & (0x2 | 0x4 | 0x20 | 0x2000);
    let dst_w = to_wide(dst);
    let current = unsafe { GetFileAttributesW(PCWSTR(dst_w.as_ptr())) };
    if current != INVALID_FILE_ATTRIBUTES && (current | carried) != current {
        let _ = unsafe {
            SetFileAttributesW(
                PCWSTR(dst_w.as_ptr()),
                FILE_FLAGS_AND_ATTRIBUTES(current | carried),
            )
        };
    }
    if encrypt {
        tracing::debug!("EFS encryption for {} left to the volume", dst.display());
    }
}

#[cfg(windows)]
fn set_win_attrs(path: &Path, change: &AttrChange) -> Result<()> {
    use std::os::windows::ffi::OsStrExt;
    use windows::core::PCWSTR;
    use windows::Win32::Storage::FileSystem::{
        GetFileAttributesW, SetFileAttributesW, FILE_FLAGS_AND_ATTRIBUTES,
        INVALID_FILE_ATTRIBUTES,
    };

    if change.hidden.is_none() && change.system.is_none() && change.archive.is_none() {
        return Ok(());
    }

    let wide: Vec<u16> = path
        .as_os_str()
        .encode_wide()
        .chain(std::iter::once(0))
        .collect();
    let attrs = unsafe { GetFileAttributesW(PCWSTR(wide.as_ptr())) };
    if attrs == INVALID_FILE_ATTRIBUTES {
        return Err(FsError::classify(
            std::io::Error::last_os_error(),
            path,
        ));
    }

    let mut updated = attrs;
    for (flag, bit) in [
        (change.hidden, 0x2u32),
        (change.system, 0x4),
        (change.archive, 0x20),
    ] {
        match flag {
            Some(true) => updated |= bit,
            Some(false) => updated &= !bit,
            None => {}
        }
    }

    if updated != attrs {
        unsafe {
            SetFileAttributesW(PCWSTR(wide.as_ptr()), FILE_FLAGS_AND_ATTRIBUTES(updated))
        }
        .map_err(|_| FsError::classify(std::io::Error::last_os_error(), path))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingSink {
        chunks: usize,
        limit: usize,
        cancel_after: Option<usize>,
    }

    impl TransferSink for CountingSink {
        fn on_chunk(&mut self, _bytes: usize) -> CopyControl {
            self.chunks += 1;
            if self.cancel_after.is_some_and(|n| self.chunks >= n) {
                CopyControl::Cancel
            } else {
                CopyControl::Continue {
                    buffer_limit: self.limit,
                }
            }
        }
    }

    #[test]
    fn test_copy_file_content_and_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");
        fs::write(&src, vec![7u8; 10_000]).unwrap();

        let opts = CopyOptions {
            buffer_size: 4096,
            preserve_times: false,
            encrypt: false,
            copy_ads: false,
        };
        let mut sink = CountingSink {
            chunks: 0,
            limit: 4096,
            cancel_after: None,
        };
        let end = DiskFs::new().copy_file(&src, &dst, &opts, &mut sink).unwrap();

        assert_eq!(end, CopyEnd::Done { bytes: 10_000 });
        assert_eq!(sink.chunks, 3);
        assert_eq!(fs::read(&dst).unwrap(), vec![7u8; 10_000]);
    }

    #[test]
    fn test_copy_cancel_reports_flushed_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");
        fs::write(&src, vec![1u8; 10_000]).unwrap();

        let opts = CopyOptions {
            buffer_size: 1024,
            preserve_times: false,
            encrypt: false,
            copy_ads: false,
        };
        let mut sink = CountingSink {
            chunks: 0,
            limit: 1024,
            cancel_after: Some(2),
        };
        let end = DiskFs::new().copy_file(&src, &dst, &opts, &mut sink).unwrap();

        assert_eq!(end, CopyEnd::Cancelled { bytes: 2048 });
        assert_eq!(fs::metadata(&dst).unwrap().len(), 2048);
    }

    #[test]
    fn test_rename_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, b"x").unwrap();

        let disk = DiskFs::new();
        disk.rename(&a, &b).unwrap();
        assert!(!a.exists());
        assert!(b.exists());

        disk.delete_file(&b).unwrap();
        assert!(!b.exists());
    }

    #[test]
    fn test_create_dir_reports_collision() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");

        let disk = DiskFs::new();
        disk.create_dir(&sub).unwrap();
        match disk.create_dir(&sub) {
            Err(FsError::AlreadyExists(_)) => {}
            other => panic!("expected AlreadyExists, got {:?}", other),
        }
    }

    #[test]
    fn test_change_attrs_readonly_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.txt");
        fs::write(&file, b"x").unwrap();

        let disk = DiskFs::new();
        disk.change_attrs(
            &file,
            &AttrChange {
                readonly: Some(true),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(disk.metadata(&file).unwrap().readonly);

        disk.change_attrs(
            &file,
            &AttrChange {
                readonly: Some(false),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(!disk.metadata(&file).unwrap().readonly);
    }

    #[test]
    fn test_check_path_missing() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("missing");
        match DiskFs::new().check_path(&gone) {
            Err(FsError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other),
        }
    }
}
