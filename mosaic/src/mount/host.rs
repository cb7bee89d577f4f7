//! Host mount-table primitive.
//!
//! Everything that touches the host mount table goes through
//! [`HostMounter`], so the core can be exercised without privileges by
//! swapping in a simulated mounter.

use std::path::{Path, PathBuf};

use mosaic_shared::errors::MosaicResult;

/// What kind of mount to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountKind {
    /// Bind-mount an existing directory (`MS_BIND`).
    Bind,
    /// Mount a device or image carrying the named filesystem.
    Filesystem(String),
}

/// A single host mount request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    pub source: PathBuf,
    pub target: PathBuf,
    pub kind: MountKind,
    /// Caller flags, handed to `mount(2)` untouched.
    pub flags: u32,
    /// Filesystem-specific options string.
    pub data: Option<String>,
}

impl MountRequest {
    /// Bind `source` at `target`.
    pub fn bind(source: impl Into<PathBuf>, target: impl Into<PathBuf>, flags: u32) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            kind: MountKind::Bind,
            flags,
            data: None,
        }
    }

    /// Mount the filesystem on `device` at `target`.
    pub fn filesystem(
        device: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
        fstype: impl Into<String>,
        flags: u32,
    ) -> Self {
        Self {
            source: device.into(),
            target: target.into(),
            kind: MountKind::Filesystem(fstype.into()),
            flags,
            data: None,
        }
    }
}

/// Mount/unmount at a path. Implementations must be thread-safe.
pub trait HostMounter: Send + Sync {
    /// Perform the mount described by `req`.
    fn mount(&self, req: &MountRequest) -> MosaicResult<()>;

    /// Unmount whatever is mounted at `target`; `flags` go to `umount2(2)`.
    fn unmount(&self, target: &Path, flags: u32) -> MosaicResult<()>;
}

/// [`HostMounter`] backed by the real `mount(2)`/`umount2(2)` via nix.
#[derive(Debug, Default, Clone, Copy)]
pub struct NixMounter;

#[cfg(target_os = "linux")]
impl HostMounter for NixMounter {
    fn mount(&self, req: &MountRequest) -> MosaicResult<()> {
        use mosaic_shared::errors::MosaicError;
        use nix::mount::{MsFlags, mount};

        let mut flags = MsFlags::from_bits_truncate(req.flags as libc::c_ulong);
        let fstype = match &req.kind {
            MountKind::Bind => {
                flags |= MsFlags::MS_BIND;
                None
            }
            MountKind::Filesystem(fs) => Some(fs.as_str()),
        };

        tracing::debug!(
            source = %req.source.display(),
            target = %req.target.display(),
            ?fstype,
            flags = req.flags,
            "mount"
        );

        mount(
            Some(req.source.as_path()),
            req.target.as_path(),
            fstype,
            flags,
            req.data.as_deref(),
        )
        .map_err(|e| {
            MosaicError::Storage(format!(
                "Failed to mount {} to {}: {}",
                req.source.display(),
                req.target.display(),
                e
            ))
        })
    }

    fn unmount(&self, target: &Path, flags: u32) -> MosaicResult<()> {
        use mosaic_shared::errors::MosaicError;
        use nix::mount::{MntFlags, umount2};

        tracing::debug!(target = %target.display(), flags, "umount");

        umount2(target, MntFlags::from_bits_truncate(flags as libc::c_int)).map_err(|e| {
            MosaicError::Storage(format!("Failed to unmount {}: {}", target.display(), e))
        })
    }
}

#[cfg(not(target_os = "linux"))]
impl HostMounter for NixMounter {
    fn mount(&self, req: &MountRequest) -> MosaicResult<()> {
        Err(mosaic_shared::errors::MosaicError::Unsupported(format!(
            "mounting {} requires Linux",
            req.target.display()
        )))
    }

    fn unmount(&self, target: &Path, _flags: u32) -> MosaicResult<()> {
        Err(mosaic_shared::errors::MosaicError::Unsupported(format!(
            "unmounting {} requires Linux",
            target.display()
        )))
    }
}
