//! Loop devices for raw image files, via `losetup`.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use mosaic_shared::errors::{MosaicError, MosaicResult};

use crate::options::MosaicOptions;
use crate::util;

/// Attach `image` to the first free loop device and return its path.
pub fn attach(image: &Path, options: &MosaicOptions) -> MosaicResult<PathBuf> {
    let losetup = util::find_binary("losetup", options)?;
    let stdout = util::run_tool(
        &losetup,
        [OsStr::new("--find"), OsStr::new("--show"), image.as_os_str()],
    )?;

    let device = parse_device(&stdout).ok_or_else(|| {
        MosaicError::Storage(format!(
            "losetup did not report a device for {}: '{}'",
            image.display(),
            stdout.trim()
        ))
    })?;
    tracing::debug!("Attached {} to {}", image.display(), device.display());
    Ok(device)
}

/// Detach a loop device.
pub fn detach(device: &Path, options: &MosaicOptions) -> MosaicResult<()> {
    let losetup = util::find_binary("losetup", options)?;
    util::run_tool(&losetup, [OsStr::new("-d"), device.as_os_str()])?;
    tracing::debug!("Detached {}", device.display());
    Ok(())
}

fn parse_device(stdout: &str) -> Option<PathBuf> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    line.starts_with("/dev/").then(|| PathBuf::from(line))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device() {
        assert_eq!(parse_device("/dev/loop3\n"), Some(PathBuf::from("/dev/loop3")));
        assert_eq!(parse_device("\n  /dev/loop12  \n"), Some(PathBuf::from("/dev/loop12")));
        assert_eq!(parse_device(""), None);
        assert_eq!(parse_device("losetup: cannot find an unused loop device"), None);
    }
}
