//! Backend driver contract.
//!
//! A [`Driver`] is one opened pool's backend. The core owns all state
//! machine rules (mount state, block-device refcounts, capability gating);
//! a driver only performs the storage operations themselves and is never
//! called for an operation its reported [`Features`] do not allow.

mod registry;

use std::path::{Path, PathBuf};

use mosaic_shared::errors::{MosaicError, MosaicResult};

use crate::features::Features;
use crate::mount::MountTransaction;

pub use registry::{DriverContext, DriverFactory, DriverRegistration, DriverRegistry};

/// Storage backend for one opened pool.
///
/// All methods take `&self`: volume handles may call into the driver from
/// several threads. Flags are passed through from the caller uninterpreted.
pub trait Driver: Send + Sync {
    /// Backend kind, as named in pool descriptors.
    fn kind(&self) -> &str;

    /// Capabilities of this pool. Called once, at open time.
    fn features(&self) -> Features;

    /// Mount the pool as a whole at `path`.
    fn mount_pool(&self, txn: &mut MountTransaction<'_>, path: &Path, flags: u32) -> MosaicResult<()> {
        let _ = (txn, flags);
        Err(MosaicError::Unsupported(format!(
            "{} pools cannot be mounted as a whole (at {})",
            self.kind(),
            path.display()
        )))
    }

    /// Whether a volume exists. Must not change any state.
    fn have_volume(&self, name: &str, flags: u32) -> MosaicResult<bool>;

    /// Validate that a volume can be opened.
    ///
    /// # Returns
    /// * `Err(NotFound)` - no such volume
    fn open_volume(&self, name: &str, flags: u32) -> MosaicResult<()>;

    /// Create a volume of `size_in_blocks`, optionally with a filesystem.
    ///
    /// Drivers without `MANAGE_SIZE` receive `size_in_blocks == 0`.
    fn create_volume(
        &self,
        name: &str,
        size_in_blocks: u64,
        flags: u32,
        with_fs: bool,
    ) -> MosaicResult<()>;

    /// Create `to` as a copy of `from`. Only called with `CLONE`.
    fn clone_volume(&self, from: &str, to: &str, flags: u32) -> MosaicResult<()> {
        let _ = (to, flags);
        Err(MosaicError::Unsupported(format!(
            "{} cannot clone {}",
            self.kind(),
            from
        )))
    }

    /// Permanently destroy a volume's storage.
    fn drop_volume(&self, name: &str, flags: u32) -> MosaicResult<()>;

    /// Change a volume's size. Only called with `MANAGE_SIZE`.
    fn resize_volume(&self, name: &str, size_in_blocks: u64, flags: u32) -> MosaicResult<()> {
        let _ = (size_in_blocks, flags);
        Err(MosaicError::Unsupported(format!(
            "{} cannot resize {}",
            self.kind(),
            name
        )))
    }

    /// Mount a volume's filesystem at `path`.
    fn mount_volume(
        &self,
        txn: &mut MountTransaction<'_>,
        name: &str,
        path: &Path,
        flags: u32,
    ) -> MosaicResult<()>;

    /// Attach a raw block device for a volume. Only called with `BLOCK_DEV`.
    fn attach_block_device(&self, name: &str, flags: u32) -> MosaicResult<PathBuf> {
        let _ = flags;
        Err(MosaicError::Unsupported(format!(
            "{} cannot expose a block device for {}",
            self.kind(),
            name
        )))
    }

    /// Detach a device previously returned by `attach_block_device`.
    fn detach_block_device(&self, name: &str, device: &Path) -> MosaicResult<()> {
        Err(MosaicError::Unsupported(format!(
            "{} cannot detach {} for {}",
            self.kind(),
            device.display(),
            name
        )))
    }

    /// Current size in 512-byte blocks.
    fn volume_size(&self, name: &str) -> MosaicResult<u64>;

    /// Release backend state. Called exactly once, when the pool closes.
    fn close(&self) -> MosaicResult<()> {
        Ok(())
    }
}

/// Check that `name` is usable as a volume name in any backend.
pub fn validate_volume_name(name: &str) -> MosaicResult<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\0');
    if bad {
        return Err(MosaicError::InvalidArgument(format!(
            "invalid volume name '{}'",
            name.escape_default()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_volume_name() {
        assert!(validate_volume_name("test_vol").is_ok());
        assert!(validate_volume_name("vol.v2").is_ok());

        for bad in ["", ".", "..", "a/b", "nul\0"] {
            assert!(
                matches!(
                    validate_volume_name(bad),
                    Err(MosaicError::InvalidArgument(_))
                ),
                "{:?} should be rejected",
                bad
            );
        }
    }
}
