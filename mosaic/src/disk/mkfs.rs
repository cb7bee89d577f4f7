//! Filesystem creation and resizing with the host's mkfs tools.

use std::path::{Path, PathBuf};

use mosaic_shared::errors::{MosaicError, MosaicResult};

use super::constants::ext4;
use crate::constants::block::bytes_to_blocks;
use crate::options::MosaicOptions;
use crate::util;

/// Arguments that make `mkfs.<fstype>` run unattended on an image file.
fn mkfs_args(fstype: &str) -> &'static [&'static str] {
    match fstype {
        // -F: force, don't ask questions. -q: quiet.
        "ext2" | "ext3" | "ext4" => &["-F", "-q"],
        "xfs" | "btrfs" => &["-f", "-q"],
        _ => &[],
    }
}

/// Put a `fstype` filesystem on `target` (an image file or a device).
pub fn make_filesystem(target: &Path, fstype: &str, options: &MosaicOptions) -> MosaicResult<()> {
    if fstype.is_empty() || fstype.contains('/') {
        return Err(MosaicError::InvalidArgument(format!(
            "invalid filesystem type '{}'",
            fstype
        )));
    }

    let mkfs = util::find_binary(&format!("mkfs.{}", fstype), options)?;
    let mut args: Vec<&std::ffi::OsStr> = mkfs_args(fstype).iter().map(std::ffi::OsStr::new).collect();
    args.push(target.as_os_str());

    util::run_tool(&mkfs, args)?;
    tracing::debug!("Created {} filesystem on {}", fstype, target.display());
    Ok(())
}

/// Fail unless a `fstype` filesystem can be resized offline with the tools
/// installed here. Only the ext family can.
///
/// Callers check this before changing the container size, so an
/// unresizable filesystem never leaves the container half-resized.
pub fn check_resizable(fstype: &str, options: &MosaicOptions) -> MosaicResult<()> {
    resize_tools(fstype, options).map(|_| ())
}

/// Resize the filesystem on `target`.
///
/// With `size_bytes`, the filesystem is resized to that size (shrink before
/// truncating the container); without, it grows to fill the container.
pub fn resize_filesystem(
    target: &Path,
    fstype: &str,
    size_bytes: Option<u64>,
    options: &MosaicOptions,
) -> MosaicResult<()> {
    let (e2fsck, resize2fs) = resize_tools(fstype, options)?;
    // resize2fs refuses to shrink without a fresh fsck
    check_ext_filesystem(&e2fsck, target)?;

    let mut args = vec![target.as_os_str().to_os_string()];
    if let Some(bytes) = size_bytes {
        // "s" = 512-byte sectors
        args.push(format!("{}s", bytes_to_blocks(bytes)).into());
    }
    util::run_tool(&resize2fs, args)?;
    tracing::debug!("Resized {} filesystem on {}", fstype, target.display());
    Ok(())
}

/// `(e2fsck, resize2fs)` for a resizable filesystem type.
fn resize_tools(fstype: &str, options: &MosaicOptions) -> MosaicResult<(PathBuf, PathBuf)> {
    match fstype {
        "ext2" | "ext3" | "ext4" => Ok((
            util::find_binary("e2fsck", options)?,
            util::find_binary("resize2fs", options)?,
        )),
        other => Err(MosaicError::Unsupported(format!(
            "offline resize of {} filesystems",
            other
        ))),
    }
}

/// Detect the filesystem on `target`.
///
/// The ext family is recognized from its superblock directly; anything
/// else is left to `blkid` when it is installed.
pub fn probe_filesystem(target: &Path, options: &MosaicOptions) -> MosaicResult<Option<String>> {
    if has_ext_magic(target)? {
        return Ok(Some("ext4".to_string()));
    }

    let blkid = match util::find_binary("blkid", options) {
        Ok(blkid) => blkid,
        Err(_) => return Ok(None),
    };
    let output = std::process::Command::new(&blkid)
        .args(["-o", "value", "-s", "TYPE"])
        .arg(target)
        .output()
        .map_err(|e| MosaicError::Storage(format!("Failed to run {}: {}", blkid.display(), e)))?;

    // Exit status 2: nothing recognizable on the device
    match output.status.code() {
        Some(0) => {
            let fstype = String::from_utf8_lossy(&output.stdout).trim().to_string();
            Ok((!fstype.is_empty()).then_some(fstype))
        }
        Some(2) => Ok(None),
        code => Err(MosaicError::Storage(format!(
            "blkid on {} failed with exit code {:?}: {}",
            target.display(),
            code,
            String::from_utf8_lossy(&output.stderr).trim()
        ))),
    }
}

fn has_ext_magic(target: &Path) -> MosaicResult<bool> {
    use std::io::{Read, Seek, SeekFrom};

    let mut file = std::fs::File::open(target)?;
    let mut magic = [0u8; 2];
    if file.seek(SeekFrom::Start(ext4::MAGIC_OFFSET)).is_err() {
        return Ok(false);
    }
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(u16::from_le_bytes(magic) == ext4::MAGIC),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn check_ext_filesystem(e2fsck: &Path, target: &Path) -> MosaicResult<()> {
    // -f: check even if clean. -p: repair without asking.
    let output = std::process::Command::new(e2fsck)
        .arg("-fp")
        .arg(target)
        .output()
        .map_err(|e| MosaicError::Storage(format!("Failed to run {}: {}", e2fsck.display(), e)))?;

    // 0: clean, 1: errors corrected
    match output.status.code() {
        Some(0) | Some(1) => Ok(()),
        code => Err(MosaicError::Storage(format!(
            "e2fsck on {} failed with exit code {:?}: {}",
            target.display(),
            code,
            String::from_utf8_lossy(&output.stderr).trim()
        ))),
    }
}
