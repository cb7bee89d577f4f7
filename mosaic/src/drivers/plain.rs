//! `plain` driver: every volume is a sub-directory of the pool location.
//!
//! A directory already is a filesystem, so volumes are always created
//! "with filesystem" and have no size of their own; their size is what
//! they currently use. No optional capabilities.

use std::path::Path;

use mosaic_shared::errors::{MosaicError, MosaicResult};

use super::subdir::PoolDir;
use crate::constants::kinds;
use crate::driver::{Driver, DriverContext};
use crate::features::Features;
use crate::mount::MountTransaction;
use crate::util;

#[derive(Debug)]
pub struct PlainDriver {
    dir: PoolDir,
}

impl PlainDriver {
    pub fn open(ctx: &DriverContext<'_>) -> MosaicResult<Self> {
        if let Some(fs) = &ctx.descriptor.default_fs {
            return Err(MosaicError::BackendInitFailed(format!(
                "plain pools cannot carry a default filesystem (got '{}')",
                fs
            )));
        }
        Ok(Self {
            dir: PoolDir::open(ctx)?,
        })
    }
}

#[cfg(feature = "builtin-drivers")]
inventory::submit! {
    crate::driver::DriverRegistration {
        kind: kinds::PLAIN,
        factory: |ctx| Ok(Box::new(PlainDriver::open(ctx)?)),
    }
}

impl Driver for PlainDriver {
    fn kind(&self) -> &str {
        kinds::PLAIN
    }

    fn features(&self) -> Features {
        Features::empty()
    }

    fn mount_pool(&self, txn: &mut MountTransaction<'_>, path: &Path, flags: u32) -> MosaicResult<()> {
        self.dir.bind_pool(txn, path, flags)
    }

    fn have_volume(&self, name: &str, _flags: u32) -> MosaicResult<bool> {
        Ok(self.dir.has_dir(name))
    }

    fn open_volume(&self, name: &str, _flags: u32) -> MosaicResult<()> {
        if self.dir.has_dir(name) {
            Ok(())
        } else {
            Err(MosaicError::NotFound(format!(
                "volume '{}' in {}",
                name,
                self.dir.location().display()
            )))
        }
    }

    fn create_volume(
        &self,
        name: &str,
        _size_in_blocks: u64,
        _flags: u32,
        with_fs: bool,
    ) -> MosaicResult<()> {
        if !with_fs {
            return Err(MosaicError::Unsupported(format!(
                "plain volume '{}' must be created with a filesystem",
                name
            )));
        }
        std::fs::create_dir(self.dir.entry(name))?;
        Ok(())
    }

    fn drop_volume(&self, name: &str, _flags: u32) -> MosaicResult<()> {
        std::fs::remove_dir_all(self.dir.entry(name))?;
        Ok(())
    }

    fn mount_volume(
        &self,
        txn: &mut MountTransaction<'_>,
        name: &str,
        path: &Path,
        flags: u32,
    ) -> MosaicResult<()> {
        self.dir.bind_entry(txn, name, path, flags)
    }

    fn volume_size(&self, name: &str) -> MosaicResult<u64> {
        let path = self.dir.entry(name);
        if !path.is_dir() {
            return Err(MosaicError::NotFound(format!("volume '{}'", name)));
        }
        util::disk_usage_blocks(&path)
    }
}
