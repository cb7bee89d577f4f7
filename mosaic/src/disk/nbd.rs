//! Network block devices for qcow2 images, via `qemu-nbd`.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use mosaic_shared::errors::{MosaicError, MosaicResult};

use super::constants::devices::{MAX_NBD_DEVICES, SYSFS_BLOCK};
use crate::options::MosaicOptions;
use crate::util;

/// Whether `/dev/nbd<index>` is free, judging by its sysfs `pid` file.
///
/// The kernel publishes the serving process's pid while a device is
/// connected; a pid that no longer exists is treated as free.
fn is_free(sysfs_root: &Path, index: u32) -> bool {
    let node = sysfs_root.join(format!("nbd{}", index));
    if !node.exists() {
        return false;
    }
    match std::fs::read_to_string(node.join("pid")) {
        Ok(pid) => match pid.trim().parse::<u32>() {
            Ok(pid) => !util::is_process_alive(pid),
            Err(_) => false,
        },
        Err(_) => true,
    }
}

fn find_free_in(sysfs_root: &Path) -> MosaicResult<PathBuf> {
    (0..MAX_NBD_DEVICES)
        .find(|&i| is_free(sysfs_root, i))
        .map(|i| PathBuf::from(format!("/dev/nbd{}", i)))
        .ok_or_else(|| {
            MosaicError::Storage(format!(
                "no free nbd device among /dev/nbd0..{} (is the nbd module loaded?)",
                MAX_NBD_DEVICES - 1
            ))
        })
}

/// Connect `image` to the first free `/dev/nbdN`.
pub fn connect(image: &Path, options: &MosaicOptions) -> MosaicResult<PathBuf> {
    let qemu_nbd = util::find_binary("qemu-nbd", options)?;
    let device = find_free_in(Path::new(SYSFS_BLOCK))?;

    let mut connect_arg = std::ffi::OsString::from("--connect=");
    connect_arg.push(device.as_os_str());
    util::run_tool(
        &qemu_nbd,
        [
            connect_arg.as_os_str(),
            OsStr::new("--format=qcow2"),
            image.as_os_str(),
        ],
    )?;

    tracing::debug!("Connected {} to {}", image.display(), device.display());
    Ok(device)
}

/// Disconnect an nbd device.
pub fn disconnect(device: &Path, options: &MosaicOptions) -> MosaicResult<()> {
    let qemu_nbd = util::find_binary("qemu-nbd", options)?;
    util::run_tool(&qemu_nbd, [OsStr::new("--disconnect"), device.as_os_str()])?;
    tracing::debug!("Disconnected {}", device.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_sysfs(nodes: &[(u32, Option<&str>)]) -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        for (index, pid) in nodes {
            let node = root.path().join(format!("nbd{}", index));
            std::fs::create_dir(&node).unwrap();
            if let Some(pid) = pid {
                std::fs::write(node.join("pid"), pid).unwrap();
            }
        }
        root
    }

    #[test]
    fn test_skips_connected_devices() {
        let me = std::process::id().to_string();
        let root = fake_sysfs(&[(0, Some(me.as_str())), (1, None), (2, None)]);
        assert_eq!(find_free_in(root.path()).unwrap(), PathBuf::from("/dev/nbd1"));
    }

    #[test]
    fn test_stale_pid_is_free() {
        // pid_max on Linux never reaches this value
        let root = fake_sysfs(&[(0, Some("2147483646"))]);
        assert_eq!(find_free_in(root.path()).unwrap(), PathBuf::from("/dev/nbd0"));
    }

    #[test]
    fn test_no_nodes() {
        let root = fake_sysfs(&[]);
        let err = find_free_in(root.path()).unwrap_err();
        assert!(matches!(err, MosaicError::Storage(_)));
    }
}
