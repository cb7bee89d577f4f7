//! `btrfs` driver: every volume is a subvolume under the pool location.
//!
//! Clones are writable snapshots. Volumes and the pool itself are mounted
//! by binding their directories.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use mosaic_shared::errors::{MosaicError, MosaicResult};

use super::subdir::PoolDir;
use crate::constants::kinds;
use crate::driver::{Driver, DriverContext};
use crate::features::Features;
use crate::mount::MountTransaction;
use crate::util;

#[derive(Debug)]
pub struct BtrfsDriver {
    dir: PoolDir,
    btrfs: PathBuf,
}

#[cfg(feature = "builtin-drivers")]
inventory::submit! {
    crate::driver::DriverRegistration {
        kind: kinds::BTRFS,
        factory: |ctx| Ok(Box::new(BtrfsDriver::open(ctx)?)),
    }
}

impl BtrfsDriver {
    pub fn open(ctx: &DriverContext<'_>) -> MosaicResult<Self> {
        let dir = PoolDir::open(ctx)?;
        let btrfs = util::find_binary("btrfs", ctx.options).map_err(MosaicError::backend_init)?;
        Ok(Self { dir, btrfs })
    }

    fn subvolume(&self, args: &[&OsStr]) -> MosaicResult<()> {
        let mut full: Vec<&OsStr> = vec![OsStr::new("subvolume")];
        full.extend_from_slice(args);
        util::run_tool(&self.btrfs, full)?;
        Ok(())
    }
}

impl Driver for BtrfsDriver {
    fn kind(&self) -> &str {
        kinds::BTRFS
    }

    fn features(&self) -> Features {
        Features::CLONE
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
                "subvolume '{}' in {}",
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
                "btrfs volume '{}' must be created with a filesystem",
                name
            )));
        }
        let target = self.dir.entry(name);
        self.subvolume(&[OsStr::new("create"), target.as_os_str()])
    }

    fn clone_volume(&self, from: &str, to: &str, _flags: u32) -> MosaicResult<()> {
        let source = self.dir.entry(from);
        let target = self.dir.entry(to);
        self.subvolume(&[
            OsStr::new("snapshot"),
            source.as_os_str(),
            target.as_os_str(),
        ])
    }

    fn drop_volume(&self, name: &str, _flags: u32) -> MosaicResult<()> {
        let target = self.dir.entry(name);
        self.subvolume(&[OsStr::new("delete"), target.as_os_str()])
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
            return Err(MosaicError::NotFound(format!("subvolume '{}'", name)));
        }
        util::disk_usage_blocks(&path)
    }
}
