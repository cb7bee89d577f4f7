//! `qcow2` driver: every volume is a qcow2 image.
//!
//! Images are formatted natively; clones are copy-on-write children backed
//! by their source. Block devices and mounts go through `qemu-nbd`. The
//! pool as a whole has no mountable form.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use mosaic_shared::constants::block::bytes_to_blocks;
use mosaic_shared::errors::{MosaicError, MosaicResult};

use super::image_bytes;
use super::subdir::PoolDir;
use crate::constants::{filenames, kinds};
use crate::disk::qcow2::{self, BackingFormat};
use crate::disk::{mkfs, nbd};
use crate::driver::{Driver, DriverContext};
use crate::features::Features;
use crate::mount::{MountRequest, MountTransaction};
use crate::options::MosaicOptions;
use crate::util;

#[derive(Debug)]
pub struct Qcow2Driver {
    dir: PoolDir,
    default_fs: String,
    options: Arc<MosaicOptions>,
}

#[cfg(feature = "builtin-drivers")]
inventory::submit! {
    crate::driver::DriverRegistration {
        kind: kinds::QCOW2,
        factory: |ctx| Ok(Box::new(Qcow2Driver::open(ctx)?)),
    }
}

impl Qcow2Driver {
    pub fn open(ctx: &DriverContext<'_>) -> MosaicResult<Self> {
        Ok(Self {
            dir: PoolDir::open(ctx)?,
            default_fs: ctx.default_fs().to_string(),
            options: Arc::new(ctx.options.clone()),
        })
    }

    fn image(&self, name: &str) -> PathBuf {
        filenames::image_path(self.dir.location(), name, filenames::QCOW2_SUFFIX)
    }

    fn existing_image(&self, name: &str) -> MosaicResult<PathBuf> {
        let image = self.image(name);
        if image.is_file() {
            Ok(image)
        } else {
            Err(MosaicError::NotFound(format!(
                "volume '{}' ({})",
                name,
                image.display()
            )))
        }
    }

    /// Connect an image to nbd, run `f` with the device, then disconnect.
    fn with_nbd<T>(
        &self,
        image: &Path,
        f: impl FnOnce(&Path) -> MosaicResult<T>,
    ) -> MosaicResult<T> {
        let device = nbd::connect(image, &self.options)?;
        let result = f(&device);
        let disconnected = nbd::disconnect(&device, &self.options);
        let value = result?;
        disconnected?;
        Ok(value)
    }

    /// Volumes backed by `name` (their clones).
    fn dependents(&self, name: &str) -> MosaicResult<Vec<String>> {
        let image = self.image(name).canonicalize()?;
        let mut found = Vec::new();
        for entry in std::fs::read_dir(self.dir.location())? {
            let path = entry?.path();
            if path.extension() != Some(OsStr::new(filenames::QCOW2_SUFFIX)) {
                continue;
            }
            // An image we cannot read might be a clone; refuse rather than orphan it
            let header = qcow2::read_header(&path).map_err(|e| {
                MosaicError::Storage(format!(
                    "Cannot check whether {} is backed by '{}': {}",
                    path.display(),
                    name,
                    e
                ))
            })?;
            if header.backing_file.as_deref().map(Path::new) == Some(image.as_path()) {
                found.push(path.display().to_string());
            }
        }
        Ok(found)
    }
}

impl Driver for Qcow2Driver {
    fn kind(&self) -> &str {
        kinds::QCOW2
    }

    fn features(&self) -> Features {
        Features::CLONE | Features::MANAGE_SIZE | Features::BLOCK_DEV
    }

    fn have_volume(&self, name: &str, _flags: u32) -> MosaicResult<bool> {
        Ok(self.image(name).is_file())
    }

    fn open_volume(&self, name: &str, _flags: u32) -> MosaicResult<()> {
        self.existing_image(name).map(|_| ())
    }

    fn create_volume(
        &self,
        name: &str,
        size_in_blocks: u64,
        _flags: u32,
        with_fs: bool,
    ) -> MosaicResult<()> {
        let disk = qcow2::create_image(&self.image(name), image_bytes(name, size_in_blocks)?)?;
        if with_fs {
            self.with_nbd(disk.path(), |device| {
                mkfs::make_filesystem(device, &self.default_fs, &self.options)
            })?;
        }
        disk.commit();
        Ok(())
    }

    fn clone_volume(&self, from: &str, to: &str, _flags: u32) -> MosaicResult<()> {
        let base = self.existing_image(from)?;
        let size = qcow2::virtual_size(&base)?;
        qcow2::create_cow_child(&base, BackingFormat::Qcow2, &self.image(to), size)?.commit();
        Ok(())
    }

    fn drop_volume(&self, name: &str, _flags: u32) -> MosaicResult<()> {
        let dependents = self.dependents(name)?;
        if !dependents.is_empty() {
            return Err(MosaicError::Busy(format!(
                "volume '{}' backs {}",
                name,
                dependents.join(", ")
            )));
        }
        std::fs::remove_file(self.image(name))?;
        Ok(())
    }

    fn resize_volume(&self, name: &str, size_in_blocks: u64, _flags: u32) -> MosaicResult<()> {
        let image = self.existing_image(name)?;
        let new_bytes = image_bytes(name, size_in_blocks)?;
        let current = qcow2::virtual_size(&image)?;
        if new_bytes < current {
            return Err(MosaicError::Unsupported(format!(
                "shrinking qcow2 volume '{}' from {} to {} bytes",
                name, current, new_bytes
            )));
        }
        if new_bytes == current {
            return Ok(());
        }

        // Refuse before touching the image if its filesystem cannot follow
        let fstype = self.with_nbd(&image, |device| mkfs::probe_filesystem(device, &self.options))?;
        if let Some(fs) = &fstype {
            mkfs::check_resizable(fs, &self.options)?;
        }

        let qemu_img = util::find_binary("qemu-img", &self.options)?;
        qemu_img_resize(&qemu_img, &image, new_bytes, false)?;

        if let Some(fs) = fstype {
            let grown = self.with_nbd(&image, |device| {
                mkfs::resize_filesystem(device, &fs, None, &self.options)
            });
            if let Err(e) = grown {
                if let Err(restore) = qemu_img_resize(&qemu_img, &image, current, true) {
                    tracing::warn!(
                        "Failed to restore {} to {} bytes: {}",
                        image.display(),
                        current,
                        restore
                    );
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn mount_volume(
        &self,
        txn: &mut MountTransaction<'_>,
        name: &str,
        path: &Path,
        flags: u32,
    ) -> MosaicResult<()> {
        let image = self.existing_image(name)?;
        let device = nbd::connect(&image, &self.options)?;
        let options = self.options.clone();
        let release_device = device.clone();
        txn.on_release(format!("nbd device {}", device.display()), move || {
            nbd::disconnect(&release_device, &options)
        });

        let fstype = mkfs::probe_filesystem(&device, &self.options)?.ok_or_else(|| {
            MosaicError::Unsupported(format!("volume '{}' has no filesystem to mount", name))
        })?;
        txn.mount(&MountRequest::filesystem(device, path, fstype, flags))
    }

    fn attach_block_device(&self, name: &str, _flags: u32) -> MosaicResult<PathBuf> {
        let image = self.existing_image(name)?;
        nbd::connect(&image, &self.options)
    }

    fn detach_block_device(&self, _name: &str, device: &Path) -> MosaicResult<()> {
        nbd::disconnect(device, &self.options)
    }

    fn volume_size(&self, name: &str) -> MosaicResult<u64> {
        let image = self.existing_image(name)?;
        Ok(bytes_to_blocks(qcow2::virtual_size(&image)?))
    }
}

fn qemu_img_resize(qemu_img: &Path, image: &Path, size_bytes: u64, shrink: bool) -> MosaicResult<()> {
    let size = size_bytes.to_string();
    let mut args = vec![OsStr::new("resize")];
    if shrink {
        args.push(OsStr::new("--shrink"));
    }
    args.extend([
        OsStr::new("-f"),
        OsStr::new("qcow2"),
        image.as_os_str(),
        OsStr::new(&size),
    ]);
    util::run_tool(qemu_img, args)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::PoolDescriptor;

    const MIB_BLOCKS: u64 = 2048;

    fn open_in(dir: &Path) -> Qcow2Driver {
        let desc = PoolDescriptor::new(kinds::QCOW2, dir);
        let opts = MosaicOptions::default();
        Qcow2Driver::open(&DriverContext {
            descriptor: &desc,
            options: &opts,
            flags: 0,
        })
        .unwrap()
    }

    #[test]
    fn test_create_reports_size() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open_in(dir.path());

        driver.create_volume("disk", 64 * MIB_BLOCKS, 0, false).unwrap();
        assert!(driver.have_volume("disk", 0).unwrap());
        assert_eq!(driver.volume_size("disk").unwrap(), 64 * MIB_BLOCKS);
    }

    #[test]
    fn test_clone_is_cow_child() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open_in(dir.path());
        driver.create_volume("base", 64 * MIB_BLOCKS, 0, false).unwrap();

        driver.clone_volume("base", "child", 0).unwrap();
        assert_eq!(driver.volume_size("child").unwrap(), 64 * MIB_BLOCKS);

        let header = qcow2::read_header(&dir.path().join("child.qcow2")).unwrap();
        let base = dir.path().join("base.qcow2").canonicalize().unwrap();
        assert_eq!(header.backing_file.as_deref(), base.to_str());
    }

    #[test]
    fn test_drop_base_with_clone_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open_in(dir.path());
        driver.create_volume("base", 64 * MIB_BLOCKS, 0, false).unwrap();
        driver.clone_volume("base", "child", 0).unwrap();

        let err = driver.drop_volume("base", 0).unwrap_err();
        assert!(matches!(err, MosaicError::Busy(_)));
        assert!(driver.have_volume("base", 0).unwrap());

        driver.drop_volume("child", 0).unwrap();
        driver.drop_volume("base", 0).unwrap();
        assert!(!driver.have_volume("base", 0).unwrap());
    }

    #[test]
    fn test_shrink_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open_in(dir.path());
        driver.create_volume("disk", 64 * MIB_BLOCKS, 0, false).unwrap();

        let err = driver.resize_volume("disk", MIB_BLOCKS, 0).unwrap_err();
        assert!(matches!(err, MosaicError::Unsupported(_)));
        assert_eq!(driver.volume_size("disk").unwrap(), 64 * MIB_BLOCKS);

        // Same size is a no-op
        driver.resize_volume("disk", 64 * MIB_BLOCKS, 0).unwrap();
    }

    #[test]
    fn test_overflowing_size_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open_in(dir.path());

        let err = driver.create_volume("huge", (1 << 55) + 8, 0, false).unwrap_err();
        assert!(matches!(err, MosaicError::InvalidArgument(_)));
        assert!(!driver.have_volume("huge", 0).unwrap());

        driver.create_volume("disk", 64 * MIB_BLOCKS, 0, false).unwrap();
        let err = driver.resize_volume("disk", u64::MAX, 0).unwrap_err();
        assert!(matches!(err, MosaicError::InvalidArgument(_)));
        assert_eq!(driver.volume_size("disk").unwrap(), 64 * MIB_BLOCKS);
    }

    #[test]
    fn test_drop_with_unreadable_image_in_pool_fails() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open_in(dir.path());
        driver.create_volume("base", 64 * MIB_BLOCKS, 0, false).unwrap();
        std::fs::write(dir.path().join("mangled.qcow2"), b"not an image").unwrap();

        let err = driver.drop_volume("base", 0).unwrap_err();
        assert!(matches!(err, MosaicError::Storage(_)));
        assert!(err.to_string().contains("mangled.qcow2"));
        assert!(driver.have_volume("base", 0).unwrap());
    }

    #[test]
    fn test_pool_mount_unsupported() {
        use crate::mount::{MountCoordinator, MountSlot, NixMounter};

        let dir = tempfile::tempdir().unwrap();
        let driver = open_in(dir.path());
        let coord = MountCoordinator::new(std::sync::Arc::new(NixMounter));
        let slot = MountSlot::new();
        let target = dir.path().join("mnt");

        let err = coord
            .mount(&slot, "pool", &target, |txn| driver.mount_pool(txn, &target, 0))
            .unwrap_err();
        assert!(matches!(err, MosaicError::Unsupported(_)));
        assert!(!slot.is_mounted());
    }
}
