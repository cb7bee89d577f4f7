//! Pools whose location is a host directory.

use std::path::{Path, PathBuf};

use mosaic_shared::errors::{MosaicError, MosaicResult};

use crate::driver::DriverContext;
use crate::mount::{MountRequest, MountTransaction};

/// A pool location directory, checked at open time.
#[derive(Debug, Clone)]
pub(crate) struct PoolDir {
    location: PathBuf,
}

impl PoolDir {
    /// Open the descriptor's location, which must be an existing directory.
    pub(crate) fn open(ctx: &DriverContext<'_>) -> MosaicResult<Self> {
        let location = &ctx.descriptor.location;
        let meta = std::fs::metadata(location).map_err(|e| {
            MosaicError::BackendInitFailed(format!(
                "{} pool location {}: {}",
                ctx.descriptor.kind,
                location.display(),
                e
            ))
        })?;
        if !meta.is_dir() {
            return Err(MosaicError::BackendInitFailed(format!(
                "{} pool location {} is not a directory",
                ctx.descriptor.kind,
                location.display()
            )));
        }
        Ok(Self {
            location: location.clone(),
        })
    }

    pub(crate) fn location(&self) -> &Path {
        &self.location
    }

    /// Path of the named entry inside the pool.
    pub(crate) fn entry(&self, name: &str) -> PathBuf {
        self.location.join(name)
    }

    /// Bind the whole pool location at `path`.
    pub(crate) fn bind_pool(
        &self,
        txn: &mut MountTransaction<'_>,
        path: &Path,
        flags: u32,
    ) -> MosaicResult<()> {
        txn.mount(&MountRequest::bind(&self.location, path, flags))
    }

    /// Bind one directory entry of the pool at `path`.
    pub(crate) fn bind_entry(
        &self,
        txn: &mut MountTransaction<'_>,
        name: &str,
        path: &Path,
        flags: u32,
    ) -> MosaicResult<()> {
        let source = self.entry(name);
        if !source.is_dir() {
            return Err(MosaicError::NotFound(format!(
                "volume directory {}",
                source.display()
            )));
        }
        txn.mount(&MountRequest::bind(source, path, flags))
    }

    /// Whether `name` exists as a directory.
    pub(crate) fn has_dir(&self, name: &str) -> bool {
        self.entry(name).is_dir()
    }
}
