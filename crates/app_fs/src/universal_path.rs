//! UniversalPath - Safe path handling for Windows with UNC prefix support

use std::path::{Path, PathBuf};

/// A path wrapper that handles Windows path limitations
///
/// Features:
/// - Automatic UNC prefix (\\?\) for long path support
/// - Lossy UTF-8 display string for progress reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniversalPath {
    /// Raw path for file system operations (with UNC prefix on Windows)
    raw: PathBuf,

    /// UTF-8 display string (lossy conversion for UI)
    display: String,
}

impl UniversalPath {
    /// Create a new UniversalPath from any path-like type
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let raw = Self::normalize_path(path.as_ref());
        let display = raw.to_string_lossy().to_string();

        Self { raw, display }
    }

    /// Get the raw path for file system operations
    pub fn as_path(&self) -> &Path {
        &self.raw
    }

    /// Get the raw PathBuf (owned)
    pub fn to_path_buf(&self) -> PathBuf {
        self.raw.clone()
    }

    /// Get the display string for UI
    pub fn display(&self) -> &str {
        &self.display
    }

    /// Get parent directory
    pub fn parent(&self) -> Option<Self> {
        self.raw.parent().map(Self::new)
    }

    /// Get file name
    pub fn file_name(&self) -> Option<&str> {
        self.raw.file_name()?.to_str()
    }

    /// Get file extension
    pub fn extension(&self) -> Option<&str> {
        self.raw.extension()?.to_str()
    }

    /// Check if path exists
    pub fn exists(&self) -> bool {
        self.raw.exists()
    }

    /// Check if path is a directory
    pub fn is_dir(&self) -> bool {
        self.raw.is_dir()
    }

    /// Join with another path component
    pub fn join<P: AsRef<Path>>(&self, path: P) -> Self {
        Self::new(self.raw.join(path))
    }

    /// Normalize path and add UNC prefix on Windows
    #[cfg(windows)]
    fn normalize_path(path: &Path) -> PathBuf {
        use std::path::Component;

        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .unwrap_or_default()
                .join(path)
        };

        // Normalize components (resolve . and ..)
        let mut normalized = PathBuf::new();
        for component in absolute.components() {
            match component {
                Component::ParentDir => {
                    normalized.pop();
                }
                Component::CurDir => {}
                _ => normalized.push(component),
            }
        }

        // Add UNC prefix if not present
        let path_str = normalized.to_string_lossy();
        if !path_str.starts_with(r"\\?\") && !path_str.starts_with(r"\\.\") {
            PathBuf::from(format!(r"\\?\{}", path_str))
        } else {
            normalized
        }
    }

    #[cfg(not(windows))]
    fn normalize_path(path: &Path) -> PathBuf {
        path.to_path_buf()
    }
}

impl AsRef<Path> for UniversalPath {
    fn as_ref(&self) -> &Path {
        &self.raw
    }
}

impl From<PathBuf> for UniversalPath {
    fn from(path: PathBuf) -> Self {
        Self::new(path)
    }
}

impl From<&Path> for UniversalPath {
    fn from(path: &Path) -> Self {
        Self::new(path)
    }
}

impl From<&str> for UniversalPath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl std::fmt::Display for UniversalPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display without UNC prefix for readability
        let display = self.display.strip_prefix(r"\\?\").unwrap_or(&self.display);
        write!(f, "{}", display)
    }
}
