//! RAII-managed image files.
//!
//! A [`Disk`] is an image file being built. It is removed when dropped
//! unless it has been committed, so a creation step that fails halfway
//! leaves nothing behind.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use mosaic_shared::errors::{MosaicError, MosaicResult};

/// Disk image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskFormat {
    /// Flat raw image, usually carrying a filesystem.
    Raw,
    /// QCOW2 (QEMU Copy-On-Write v2).
    Qcow2,
}

impl DiskFormat {
    /// Get string representation of this format.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Raw => "raw",
            DiskFormat::Qcow2 => "qcow2",
        }
    }
}

/// Image file under construction.
#[derive(Debug)]
pub struct Disk {
    path: PathBuf,
    format: DiskFormat,
    committed: bool,
}

impl Disk {
    /// Take ownership of `path`; it is deleted on drop until committed.
    pub fn new(path: PathBuf, format: DiskFormat) -> Self {
        Self {
            path,
            format,
            committed: false,
        }
    }

    /// Create a sparse raw image of `size_bytes`.
    ///
    /// Fails with `AlreadyExists` rather than truncating an existing file.
    pub fn create_sparse(path: &Path, size_bytes: u64) -> MosaicResult<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    MosaicError::AlreadyExists(path.display().to_string())
                }
                _ => MosaicError::Storage(format!(
                    "Failed to create image {}: {}",
                    path.display(),
                    e
                )),
            })?;
        let disk = Self::new(path.to_path_buf(), DiskFormat::Raw);

        file.set_len(size_bytes).map_err(|e| {
            MosaicError::Storage(format!(
                "Failed to size image {} to {} bytes: {}",
                path.display(),
                size_bytes,
                e
            ))
        })?;

        tracing::debug!("Created sparse image {} ({} bytes)", path.display(), size_bytes);
        Ok(disk)
    }

    /// Get the disk path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the disk format.
    pub fn format(&self) -> DiskFormat {
        self.format
    }

    /// Keep the file in place.
    pub fn commit(mut self) -> PathBuf {
        self.committed = true;
        self.path.clone()
    }

    /// Rename the file to `dest` and keep it there.
    ///
    /// `rename(2)` is atomic, so `dest` either appears complete or not at
    /// all.
    pub fn commit_as(mut self, dest: &Path) -> MosaicResult<PathBuf> {
        std::fs::rename(&self.path, dest).map_err(|e| {
            MosaicError::Storage(format!(
                "Failed to move {} to {}: {}",
                self.path.display(),
                dest.display(),
                e
            ))
        })?;
        self.committed = true;
        Ok(dest.to_path_buf())
    }
}

impl Drop for Disk {
    fn drop(&mut self) {
        if self.committed {
            return;
        }

        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!("Failed to cleanup disk {}: {}", self.path.display(), e);
            } else {
                tracing::debug!("Cleaned up disk: {}", self.path.display());
            }
        }
    }
}
