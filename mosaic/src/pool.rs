//! Pool handle.
//!
//! A [`Pool`] is one opened storage pool. It owns the backend driver and the
//! capability set negotiated at open time, and hands out [`Volume`] handles
//! that borrow it. Closing consumes the pool, so a closed pool cannot be
//! used and cannot be closed while any volume handle is still alive.

use std::path::Path;
use std::sync::Arc;

use mosaic_shared::errors::{MosaicError, MosaicResult};

use crate::descriptor::PoolDescriptor;
use crate::driver::{Driver, DriverContext, DriverRegistry, validate_volume_name};
use crate::features::{Feature, Features};
use crate::mount::{HostMounter, MountCoordinator, MountSlot, NixMounter};
use crate::options::MosaicOptions;
use crate::volume::Volume;

/// An opened storage pool.
///
/// `Pool` is `Sync`; volume handles from several threads may share it.
pub struct Pool {
    name: String,
    descriptor: PoolDescriptor,
    driver: Box<dyn Driver>,
    features: Features,
    mounts: MountCoordinator,
    slot: MountSlot,
    closed: bool,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("kind", &self.descriptor.kind)
            .field("location", &self.descriptor.location)
            .field("features", &self.features)
            .field("mounted_at", &self.slot.mounted_at())
            .finish()
    }
}

impl Pool {
    /// Open a pool with the built-in drivers, the real host mounter and
    /// options taken from the environment.
    ///
    /// # Returns
    /// * `Err(NotFound)` - the locator does not resolve, or names an
    ///   unregistered backend kind
    /// * `Err(BackendInitFailed)` - the descriptor is malformed or the
    ///   backend failed to initialize
    pub fn open(locator: &str, flags: u32) -> MosaicResult<Self> {
        Self::open_with(
            DriverRegistry::global(),
            Arc::new(NixMounter),
            MosaicOptions::from_env(),
            locator,
            flags,
        )
    }

    /// Open a pool with an explicit registry, host mounter and options.
    pub fn open_with(
        registry: &DriverRegistry,
        mounter: Arc<dyn HostMounter>,
        options: MosaicOptions,
        locator: &str,
        flags: u32,
    ) -> MosaicResult<Self> {
        let descriptor = PoolDescriptor::resolve(locator)?;
        let ctx = DriverContext {
            descriptor: &descriptor,
            options: &options,
            flags,
        };

        let driver = registry.open(&ctx).map_err(|e| match e {
            MosaicError::NotFound(_) | MosaicError::BackendInitFailed(_) => e,
            other => MosaicError::BackendInitFailed(format!(
                "{} pool at {}: {}",
                descriptor.kind,
                descriptor.location.display(),
                other
            )),
        })?;
        let features = driver.features();

        tracing::info!(
            pool = locator,
            kind = %descriptor.kind,
            %features,
            "Opened pool"
        );

        Ok(Self {
            name: locator.to_string(),
            descriptor,
            driver,
            features,
            mounts: MountCoordinator::new(mounter),
            slot: MountSlot::new(),
            closed: false,
        })
    }

    /// The locator this pool was opened with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backend kind the locator resolved to.
    pub fn kind(&self) -> &str {
        &self.descriptor.kind
    }

    pub fn descriptor(&self) -> &PoolDescriptor {
        &self.descriptor
    }

    /// Capabilities negotiated at open time. Never changes.
    pub fn features(&self) -> Features {
        self.features
    }

    pub fn can_clone(&self) -> bool {
        self.features.supports(Feature::Clone)
    }

    pub fn can_manage_size(&self) -> bool {
        self.features.supports(Feature::ManageSize)
    }

    pub fn can_block_dev(&self) -> bool {
        self.features.supports(Feature::BlockDev)
    }

    pub fn can_migrate(&self) -> bool {
        self.features.supports(Feature::Migrate)
    }

    /// Mount the pool as a whole at `path`.
    ///
    /// # Returns
    /// * `Err(AlreadyMounted)` - the pool is already mounted
    /// * `Err(Unsupported)` - the backend has no whole-pool mount
    pub fn mount(&self, path: impl AsRef<Path>, flags: u32) -> MosaicResult<()> {
        let path = path.as_ref();
        self.mounts.mount(&self.slot, &self.name, path, |txn| {
            self.driver.mount_pool(txn, path, flags)
        })
    }

    /// Unmount the pool from `path`.
    ///
    /// # Returns
    /// * `Err(NotMounted)` - the pool is not mounted at `path`
    pub fn unmount(&self, path: impl AsRef<Path>, flags: u32) -> MosaicResult<()> {
        self.mounts.unmount(&self.slot, &self.name, path.as_ref(), flags)
    }

    /// Path the pool is mounted at, if any.
    pub fn mounted_at(&self) -> Option<std::path::PathBuf> {
        self.slot.mounted_at()
    }

    /// Whether a volume exists. Never changes any state.
    pub fn have_volume(&self, name: &str, flags: u32) -> MosaicResult<bool> {
        validate_volume_name(name)?;
        self.driver.have_volume(name, flags)
    }

    /// Open a handle on an existing volume.
    ///
    /// # Returns
    /// * `Err(NotFound)` - no such volume
    pub fn open_volume(&self, name: &str, flags: u32) -> MosaicResult<Volume<'_>> {
        validate_volume_name(name)?;
        self.driver.open_volume(name, flags)?;
        tracing::debug!(pool = %self.name, volume = name, "Opened volume");
        Ok(Volume::new(self, name))
    }

    /// Create a volume and return a handle on it.
    ///
    /// `size_in_blocks` is honored only by pools that manage size; other
    /// pools ignore it.
    ///
    /// # Returns
    /// * `Err(AlreadyExists)` - a volume with that name exists
    /// * `Err(InvalidArgument)` - the name is unusable
    pub fn create_volume(
        &self,
        name: &str,
        size_in_blocks: u64,
        flags: u32,
        with_fs: bool,
    ) -> MosaicResult<Volume<'_>> {
        validate_volume_name(name)?;
        if self.driver.have_volume(name, 0)? {
            return Err(MosaicError::AlreadyExists(format!(
                "volume '{}' already exists in {}",
                name, self.name
            )));
        }

        let size = if self.can_manage_size() {
            size_in_blocks
        } else {
            if size_in_blocks != 0 {
                tracing::debug!(
                    pool = %self.name,
                    volume = name,
                    size_in_blocks,
                    "Pool does not manage size, ignoring requested size"
                );
            }
            0
        };

        self.driver.create_volume(name, size, flags, with_fs)?;
        tracing::info!(
            pool = %self.name,
            volume = name,
            size_in_blocks = size,
            with_fs,
            "Created volume"
        );
        Ok(Volume::new(self, name))
    }

    /// Close the pool, releasing backend state.
    ///
    /// Any pool mount still in place is torn down first. Errors are
    /// reported; backend state is released regardless.
    pub fn close(mut self) -> MosaicResult<()> {
        self.shutdown()
    }

    pub(crate) fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    pub(crate) fn mounts(&self) -> &MountCoordinator {
        &self.mounts
    }

    fn shutdown(&mut self) -> MosaicResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let unmounted = self.mounts.release(&self.slot, &self.name);
        let closed = self.driver.close();
        tracing::debug!(pool = %self.name, "Closed pool");
        unmounted.and(closed)
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(pool = %self.name, "Error while releasing pool: {}", e);
        }
    }
}
