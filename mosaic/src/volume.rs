//! Volume handle.
//!
//! A [`Volume`] borrows its [`Pool`] and layers two independent pieces of
//! state over "the volume exists": where the handle has it mounted, and how
//! many block-device references the handle holds.
//!
//! Handles are `Sync`. Operations on one handle are serialized by its own
//! locks; two handles on the same volume, or two processes, are not
//! coordinated with each other and callers must serialize them.
//!
//! Every operation that can bring a handle into use (mount, block device,
//! clone, resize, size) holds the handle's drop gate shared for its whole
//! duration; `destroy` holds it exclusively from the busy check until the
//! storage is gone, so nothing can mount or attach in between.

use std::path::{Path, PathBuf};

use mosaic_shared::errors::{MosaicError, MosaicResult};
use parking_lot::{RwLock, RwLockReadGuard};

use crate::block_device::BlockDeviceBroker;
use crate::driver::validate_volume_name;
use crate::features::Feature;
use crate::mount::MountSlot;
use crate::pool::Pool;

/// Snapshot of a volume handle's state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeStatus {
    /// Where this handle has the volume mounted.
    pub mount_path: Option<PathBuf>,
    /// Block device currently attached through this handle.
    pub block_device: Option<PathBuf>,
    /// Outstanding `get_block_device` calls.
    pub block_device_refs: u32,
}

impl VolumeStatus {
    pub fn is_mounted(&self) -> bool {
        self.mount_path.is_some()
    }

    pub fn has_block_device(&self) -> bool {
        self.block_device_refs > 0
    }
}

/// Handle on one volume of a pool.
pub struct Volume<'p> {
    pool: &'p Pool,
    name: String,
    slot: MountSlot,
    block_device: BlockDeviceBroker,
    /// Drop gate; `true` once the volume's storage has been destroyed.
    destroyed: RwLock<bool>,
}

impl std::fmt::Debug for Volume<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("pool", &self.pool.name())
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}

impl<'p> Volume<'p> {
    pub(crate) fn new(pool: &'p Pool, name: &str) -> Self {
        Self {
            pool,
            name: name.to_string(),
            slot: MountSlot::new(),
            block_device: BlockDeviceBroker::new(),
            destroyed: RwLock::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &'p Pool {
        self.pool
    }

    pub fn status(&self) -> VolumeStatus {
        VolumeStatus {
            mount_path: self.slot.mounted_at(),
            block_device: self.block_device.path(),
            block_device_refs: self.block_device.refs(),
        }
    }

    /// Create `new_name` as a copy of this volume and open it.
    ///
    /// Either the copy exists afterwards or nothing does: a partially
    /// created target is removed before the error is returned.
    ///
    /// # Returns
    /// * `Err(Unsupported)` - the pool cannot clone
    /// * `Err(AlreadyExists)` - `new_name` is taken
    pub fn clone_to(&self, new_name: &str, flags: u32) -> MosaicResult<Volume<'p>> {
        self.pool.features().require(Feature::Clone, "clone")?;
        let _live = self.live()?;
        validate_volume_name(new_name)?;

        let driver = self.pool.driver();
        if driver.have_volume(new_name, 0)? {
            return Err(MosaicError::AlreadyExists(format!(
                "cannot clone {} to {}: target exists",
                self.name, new_name
            )));
        }

        if let Err(e) = driver.clone_volume(&self.name, new_name, flags) {
            match driver.have_volume(new_name, 0) {
                Ok(true) => {
                    tracing::debug!(
                        volume = %self.name,
                        target = new_name,
                        "Clone failed, removing partial target"
                    );
                    if let Err(cleanup) = driver.drop_volume(new_name, 0) {
                        tracing::warn!(
                            "Failed to remove partial clone {}: {}",
                            new_name,
                            cleanup
                        );
                    }
                }
                Ok(false) => {}
                Err(probe) => {
                    tracing::warn!("Cannot check for partial clone {}: {}", new_name, probe);
                }
            }
            return Err(e);
        }

        tracing::info!(volume = %self.name, target = new_name, "Cloned volume");
        Ok(Volume::new(self.pool, new_name))
    }

    /// Permanently destroy the volume's storage.
    ///
    /// After success the handle refuses further volume operations with
    /// `NotFound`; it can still be closed.
    ///
    /// # Returns
    /// * `Err(Busy)` - mounted, or a block device is attached; storage is
    ///   left intact
    pub fn destroy(&self, flags: u32) -> MosaicResult<()> {
        let mut destroyed = self.destroyed.write();
        if *destroyed {
            return Err(self.gone());
        }

        if let Some(path) = self.slot.mounted_at() {
            return Err(MosaicError::Busy(format!(
                "{} is mounted at {}",
                self.name,
                path.display()
            )));
        }
        let refs = self.block_device.refs();
        if refs > 0 {
            return Err(MosaicError::Busy(format!(
                "{} has {} block device reference(s) outstanding",
                self.name, refs
            )));
        }

        self.pool.driver().drop_volume(&self.name, flags)?;
        *destroyed = true;
        tracing::info!(pool = %self.pool.name(), volume = %self.name, "Dropped volume");
        Ok(())
    }

    /// Change the volume's size.
    ///
    /// # Returns
    /// * `Err(Unsupported)` - the pool does not manage size (checked before
    ///   anything else), or the backend cannot shrink
    pub fn resize(&self, size_in_blocks: u64, flags: u32) -> MosaicResult<()> {
        self.pool.features().require(Feature::ManageSize, "resize")?;
        let _live = self.live()?;

        self.pool
            .driver()
            .resize_volume(&self.name, size_in_blocks, flags)?;
        tracing::info!(volume = %self.name, size_in_blocks, "Resized volume");
        Ok(())
    }

    /// Mount the volume's filesystem at `path`.
    ///
    /// # Returns
    /// * `Err(AlreadyMounted)` - this handle already has it mounted
    /// * `Err(PathTooLong)` - `path` exceeds the platform limit
    pub fn mount(&self, path: impl AsRef<Path>, flags: u32) -> MosaicResult<()> {
        let _live = self.live()?;
        let path = path.as_ref();
        let driver = self.pool.driver();
        self.pool
            .mounts()
            .mount(&self.slot, &self.name, path, |txn| {
                driver.mount_volume(txn, &self.name, path, flags)
            })
    }

    /// Unmount the volume from `path`.
    ///
    /// # Returns
    /// * `Err(NotMounted)` - not mounted by this handle, or not at `path`
    pub fn unmount(&self, path: impl AsRef<Path>, flags: u32) -> MosaicResult<()> {
        self.pool
            .mounts()
            .unmount(&self.slot, &self.name, path.as_ref(), flags)
    }

    /// Attach (or share) a raw block device for the volume.
    ///
    /// # Returns
    /// * `Err(Unsupported)` - the pool cannot expose block devices
    /// * `Err(PathTooLong)` - the backend returned an over-long path; the
    ///   device has already been detached again
    pub fn get_block_device(&self, flags: u32) -> MosaicResult<PathBuf> {
        self.pool
            .features()
            .require(Feature::BlockDev, "block device access")?;
        let _live = self.live()?;

        let driver = self.pool.driver();
        self.block_device.acquire(
            &self.name,
            || driver.attach_block_device(&self.name, flags),
            |device| driver.detach_block_device(&self.name, device),
        )
    }

    /// Release one `get_block_device` reference.
    ///
    /// # Returns
    /// * `Err(NotAttached)` - no reference is outstanding
    pub fn put_block_device(&self) -> MosaicResult<()> {
        let driver = self.pool.driver();
        self.block_device
            .release(&self.name, |device| driver.detach_block_device(&self.name, device))
    }

    /// Current size in 512-byte blocks.
    pub fn size(&self) -> MosaicResult<u64> {
        let _live = self.live()?;
        self.pool.driver().volume_size(&self.name)
    }

    /// Close the handle without touching the volume's storage.
    ///
    /// A mount made through this handle is unmounted and any block device
    /// it holds is detached.
    pub fn close(self) -> MosaicResult<()> {
        self.teardown()
    }

    /// Shared hold on the drop gate; fails once the volume is destroyed.
    fn live(&self) -> MosaicResult<RwLockReadGuard<'_, bool>> {
        let destroyed = self.destroyed.read();
        if *destroyed {
            return Err(self.gone());
        }
        Ok(destroyed)
    }

    fn gone(&self) -> MosaicError {
        MosaicError::NotFound(format!("volume '{}' has been dropped", self.name))
    }

    // Idempotent: a second call finds nothing mounted and nothing attached.
    fn teardown(&self) -> MosaicResult<()> {
        let unmounted = self.pool.mounts().release(&self.slot, &self.name);
        let driver = self.pool.driver();
        let detached = self
            .block_device
            .release_all(&self.name, |device| driver.detach_block_device(&self.name, device));
        unmounted.and(detached)
    }
}

impl Drop for Volume<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            tracing::warn!(volume = %self.name, "Error while closing volume handle: {}", e);
        }
    }
}
