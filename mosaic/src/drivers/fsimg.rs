//! `fsimg` driver: every volume is a sparse raw image file.
//!
//! Volumes live at `<location>/<name>.img`. A volume created with a
//! filesystem gets one from `mkfs.<fs>`; mounting loop-attaches the image
//! and mounts the loop device, and the loop device is released on unmount.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use mosaic_shared::constants::block::bytes_to_blocks;
use mosaic_shared::errors::{MosaicError, MosaicResult};

use super::image_bytes;
use super::subdir::PoolDir;
use crate::constants::{filenames, kinds};
use crate::disk::{Disk, DiskFormat, loop_device, mkfs};
use crate::driver::{Driver, DriverContext};
use crate::features::Features;
use crate::mount::{MountRequest, MountTransaction};
use crate::options::MosaicOptions;

#[derive(Debug)]
pub struct FsImageDriver {
    dir: PoolDir,
    default_fs: String,
    options: Arc<MosaicOptions>,
}

#[cfg(feature = "builtin-drivers")]
inventory::submit! {
    crate::driver::DriverRegistration {
        kind: kinds::FSIMG,
        factory: |ctx| Ok(Box::new(FsImageDriver::open(ctx)?)),
    }
}

impl FsImageDriver {
    pub fn open(ctx: &DriverContext<'_>) -> MosaicResult<Self> {
        Ok(Self {
            dir: PoolDir::open(ctx)?,
            default_fs: ctx.default_fs().to_string(),
            options: Arc::new(ctx.options.clone()),
        })
    }

    fn image(&self, name: &str) -> PathBuf {
        filenames::image_path(self.dir.location(), name, filenames::FSIMG_SUFFIX)
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
}

impl Driver for FsImageDriver {
    fn kind(&self) -> &str {
        kinds::FSIMG
    }

    fn features(&self) -> Features {
        Features::CLONE | Features::MANAGE_SIZE | Features::BLOCK_DEV
    }

    fn mount_pool(&self, txn: &mut MountTransaction<'_>, path: &Path, flags: u32) -> MosaicResult<()> {
        self.dir.bind_pool(txn, path, flags)
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
        let size_bytes = image_bytes(name, size_in_blocks)?;
        let disk = Disk::create_sparse(&self.image(name), size_bytes)?;
        if with_fs {
            mkfs::make_filesystem(disk.path(), &self.default_fs, &self.options)?;
        }
        disk.commit();
        Ok(())
    }

    fn clone_volume(&self, from: &str, to: &str, _flags: u32) -> MosaicResult<()> {
        let source = self.existing_image(from)?;
        let staging = self.dir.entry(&format!(".{}.{}.partial", to, filenames::FSIMG_SUFFIX));
        let disk = Disk::new(staging, DiskFormat::Raw);

        // Shares extents on btrfs/XFS, falls back to a byte copy elsewhere
        reflink_copy::reflink_or_copy(&source, disk.path()).map_err(|e| {
            MosaicError::Storage(format!(
                "Failed to copy {} to {}: {}",
                source.display(),
                disk.path().display(),
                e
            ))
        })?;
        disk.commit_as(&self.image(to))?;
        Ok(())
    }

    fn drop_volume(&self, name: &str, _flags: u32) -> MosaicResult<()> {
        std::fs::remove_file(self.image(name))?;
        Ok(())
    }

    fn resize_volume(&self, name: &str, size_in_blocks: u64, _flags: u32) -> MosaicResult<()> {
        let image = self.existing_image(name)?;
        let new_bytes = image_bytes(name, size_in_blocks)?;
        let current = std::fs::metadata(&image)?.len();
        if new_bytes == current {
            return Ok(());
        }

        // Refuse before touching the image if its filesystem cannot follow
        let fstype = mkfs::probe_filesystem(&image, &self.options)?;
        if let Some(fs) = &fstype {
            mkfs::check_resizable(fs, &self.options)?;
        }

        let file = std::fs::OpenOptions::new().write(true).open(&image)?;
        if new_bytes < current {
            if let Some(fs) = &fstype {
                mkfs::resize_filesystem(&image, fs, Some(new_bytes), &self.options)?;
            }
            file.set_len(new_bytes)?;
            return Ok(());
        }

        file.set_len(new_bytes)?;
        if let Some(fs) = &fstype {
            if let Err(e) = mkfs::resize_filesystem(&image, fs, None, &self.options) {
                if let Err(restore) = file.set_len(current) {
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
        let fstype = mkfs::probe_filesystem(&image, &self.options)?.ok_or_else(|| {
            MosaicError::Unsupported(format!("volume '{}' has no filesystem to mount", name))
        })?;

        let device = loop_device::attach(&image, &self.options)?;
        let options = self.options.clone();
        let release_device = device.clone();
        txn.on_release(format!("loop device {}", device.display()), move || {
            loop_device::detach(&release_device, &options)
        });

        txn.mount(&MountRequest::filesystem(device, path, fstype, flags))
    }

    fn attach_block_device(&self, name: &str, _flags: u32) -> MosaicResult<PathBuf> {
        let image = self.existing_image(name)?;
        loop_device::attach(&image, &self.options)
    }

    fn detach_block_device(&self, _name: &str, device: &Path) -> MosaicResult<()> {
        loop_device::detach(device, &self.options)
    }

    fn volume_size(&self, name: &str) -> MosaicResult<u64> {
        let image = self.existing_image(name)?;
        Ok(bytes_to_blocks(std::fs::metadata(image)?.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::PoolDescriptor;

    fn open_in(dir: &Path) -> FsImageDriver {
        open_with(dir, MosaicOptions::default())
    }

    fn open_with(dir: &Path, opts: MosaicOptions) -> FsImageDriver {
        let desc = PoolDescriptor::new(kinds::FSIMG, dir);
        FsImageDriver::open(&DriverContext {
            descriptor: &desc,
            options: &opts,
            flags: 0,
        })
        .unwrap()
    }

    /// Install a shell script named `name` in `tools`.
    fn fake_tool(tools: &Path, name: &str, script: &str) {
        use std::os::unix::fs::PermissionsExt;
        let tool = tools.join(name);
        std::fs::write(&tool, script).unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_create_raw_volume_has_requested_size() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open_in(dir.path());

        driver.create_volume("data", 2048, 0, false).unwrap();
        assert!(driver.have_volume("data", 0).unwrap());
        assert!(dir.path().join("data.img").is_file());
        assert_eq!(driver.volume_size("data").unwrap(), 2048);
    }

    #[test]
    fn test_create_zero_size_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open_in(dir.path());
        let err = driver.create_volume("data", 0, 0, false).unwrap_err();
        assert!(matches!(err, MosaicError::InvalidArgument(_)));
        assert!(!driver.have_volume("data", 0).unwrap());
    }

    #[test]
    fn test_clone_copies_contents() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open_in(dir.path());
        driver.create_volume("src", 64, 0, false).unwrap();
        std::fs::write(dir.path().join("src.img"), b"image bytes").unwrap();

        driver.clone_volume("src", "dst", 0).unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("dst.img")).unwrap(),
            b"image bytes"
        );
        assert!(!dir.path().join(".dst.img.partial").exists());
    }

    #[test]
    fn test_clone_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open_in(dir.path());
        let err = driver.clone_volume("nope", "dst", 0).unwrap_err();
        assert!(matches!(err, MosaicError::NotFound(_)));
        assert!(!driver.have_volume("dst", 0).unwrap());
    }

    #[test]
    fn test_resize_without_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open_in(dir.path());
        driver.create_volume("data", 1024, 0, false).unwrap();

        driver.resize_volume("data", 4096, 0).unwrap();
        assert_eq!(driver.volume_size("data").unwrap(), 4096);

        driver.resize_volume("data", 512, 0).unwrap();
        assert_eq!(driver.volume_size("data").unwrap(), 512);
    }

    #[test]
    fn test_overflowing_size_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open_in(dir.path());

        let err = driver.create_volume("v", (1 << 55) + 8, 0, false).unwrap_err();
        assert!(matches!(err, MosaicError::InvalidArgument(_)));
        assert!(!driver.have_volume("v", 0).unwrap());

        driver.create_volume("v", 1024, 0, false).unwrap();
        let err = driver.resize_volume("v", u64::MAX, 0).unwrap_err();
        assert!(matches!(err, MosaicError::InvalidArgument(_)));
        assert_eq!(driver.volume_size("v").unwrap(), 1024);
    }

    #[test]
    fn test_resize_unresizable_fs_leaves_image() {
        let dir = tempfile::tempdir().unwrap();
        let tools = tempfile::tempdir().unwrap();
        fake_tool(tools.path(), "blkid", "#!/bin/sh\necho xfs\n");
        let driver = open_with(
            dir.path(),
            MosaicOptions::default().with_tool_path(tools.path()),
        );
        driver.create_volume("data", 1024, 0, false).unwrap();

        let err = driver.resize_volume("data", 4096, 0).unwrap_err();
        assert!(matches!(err, MosaicError::Unsupported(_)));
        assert_eq!(driver.volume_size("data").unwrap(), 1024);

        let err = driver.resize_volume("data", 512, 0).unwrap_err();
        assert!(matches!(err, MosaicError::Unsupported(_)));
        assert_eq!(driver.volume_size("data").unwrap(), 1024);
    }

    #[test]
    fn test_failed_fs_grow_restores_image() {
        let dir = tempfile::tempdir().unwrap();
        let tools = tempfile::tempdir().unwrap();
        fake_tool(tools.path(), "e2fsck", "#!/bin/sh\necho corrupt >&2\nexit 8\n");
        fake_tool(tools.path(), "resize2fs", "#!/bin/sh\nexit 0\n");
        let driver = open_with(
            dir.path(),
            MosaicOptions::default().with_tool_path(tools.path()),
        );
        driver.create_volume("data", 1024, 0, false).unwrap();

        // Stamp an ext superblock magic so the image probes as ext4
        let image = dir.path().join("data.img");
        let mut bytes = std::fs::read(&image).unwrap();
        let at = crate::disk::constants::ext4::MAGIC_OFFSET as usize;
        bytes[at..at + 2].copy_from_slice(&crate::disk::constants::ext4::MAGIC.to_le_bytes());
        std::fs::write(&image, &bytes).unwrap();

        let err = driver.resize_volume("data", 4096, 0).unwrap_err();
        assert!(matches!(err, MosaicError::Storage(_)));
        assert_eq!(driver.volume_size("data").unwrap(), 1024);
    }

    #[test]
    fn test_drop() {
        let dir = tempfile::tempdir().unwrap();
        let driver = open_in(dir.path());
        driver.create_volume("data", 8, 0, false).unwrap();
        driver.drop_volume("data", 0).unwrap();
        assert!(!driver.have_volume("data", 0).unwrap());
        assert!(matches!(
            driver.drop_volume("data", 0),
            Err(MosaicError::NotFound(_))
        ));
    }
}
