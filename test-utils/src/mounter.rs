//! In-process [`HostMounter`] that simulates bind-mount visibility.
//!
//! A bind mount copies the source tree into the target; unmounting moves
//! whatever the target holds back into the source and empties the target.
//! From the caller's side files written under a mount point persist across
//! unmount/re-mount and are invisible while unmounted, as with a real bind
//! mount. Filesystem mounts of devices are only recorded.

use std::path::{Path, PathBuf};

use mosaic::{HostMounter, MosaicError, MosaicResult, MountKind, MountRequest};
use parking_lot::Mutex;

use crate::fs_util;

#[derive(Debug, Default)]
struct MounterState {
    /// Active mounts, most recent last.
    active: Vec<MountRequest>,
    history: Vec<String>,
    fail_unmount: bool,
    fail_mount_targets: Vec<PathBuf>,
}

#[derive(Debug, Default)]
pub struct SimulatedMounter {
    state: Mutex<MounterState>,
}

impl SimulatedMounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether something is mounted at `target`.
    pub fn is_mounted(&self, target: &Path) -> bool {
        self.state.lock().active.iter().any(|m| m.target == target)
    }

    pub fn active_mounts(&self) -> usize {
        self.state.lock().active.len()
    }

    /// `mount <target>` / `umount <target>` lines, in order.
    pub fn history(&self) -> Vec<String> {
        self.state.lock().history.clone()
    }

    /// Make every unmount fail with `Storage` (think EBUSY).
    pub fn fail_unmounts(&self, on: bool) {
        self.state.lock().fail_unmount = on;
    }

    /// Make mounts at `target` fail.
    pub fn fail_mounts_at(&self, target: impl Into<PathBuf>) {
        self.state.lock().fail_mount_targets.push(target.into());
    }
}

impl HostMounter for SimulatedMounter {
    fn mount(&self, req: &MountRequest) -> MosaicResult<()> {
        let mut state = self.state.lock();
        if state.fail_mount_targets.iter().any(|t| *t == req.target) {
            return Err(MosaicError::Storage(format!(
                "simulated mount failure at {}",
                req.target.display()
            )));
        }
        if !req.target.is_dir() {
            return Err(MosaicError::NotFound(format!(
                "mount point {}",
                req.target.display()
            )));
        }

        if req.kind == MountKind::Bind {
            if !req.source.is_dir() {
                return Err(MosaicError::NotFound(format!(
                    "bind source {}",
                    req.source.display()
                )));
            }
            fs_util::copy_tree(&req.source, &req.target)?;
        }

        state.history.push(format!("mount {}", req.target.display()));
        state.active.push(req.clone());
        Ok(())
    }

    fn unmount(&self, target: &Path, _flags: u32) -> MosaicResult<()> {
        let mut state = self.state.lock();
        if state.fail_unmount {
            return Err(MosaicError::Storage(format!(
                "simulated busy unmount at {}",
                target.display()
            )));
        }
        let index = state
            .active
            .iter()
            .rposition(|m| m.target == target)
            .ok_or_else(|| {
                MosaicError::Storage(format!("{} is not a mount point", target.display()))
            })?;
        let req = state.active.remove(index);

        if req.kind == MountKind::Bind {
            fs_util::clear_dir(&req.source)?;
            fs_util::copy_tree(target, &req.source)?;
            fs_util::clear_dir(target)?;
        }

        state.history.push(format!("umount {}", target.display()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_visibility() {
        let src = tempfile::tempdir().unwrap();
        let mnt = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a"), b"1").unwrap();
        let mounter = SimulatedMounter::new();

        mounter
            .mount(&MountRequest::bind(src.path(), mnt.path(), 0))
            .unwrap();
        assert!(mnt.path().join("a").exists());
        std::fs::write(mnt.path().join("b"), b"2").unwrap();

        mounter.unmount(mnt.path(), 0).unwrap();
        assert!(!mnt.path().join("b").exists());
        assert!(src.path().join("b").exists());

        mounter
            .mount(&MountRequest::bind(src.path(), mnt.path(), 0))
            .unwrap();
        assert!(mnt.path().join("b").exists());
    }

    #[test]
    fn test_unmount_unknown_target() {
        let mnt = tempfile::tempdir().unwrap();
        let mounter = SimulatedMounter::new();
        assert!(mounter.unmount(mnt.path(), 0).is_err());
    }
}
