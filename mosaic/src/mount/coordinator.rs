//! Mount state machine shared by pools and volumes.
//!
//! ```text
//! Unmounted --mount()--> Mounted --unmount()--> Unmounted
//! ```
//!
//! A backend mount runs inside a [`MountTransaction`]. Every host mount it
//! performs and every release it registers (loop/nbd detach, ...) is
//! recorded; if the backend fails, the transaction is unwound before the
//! error is returned, so a failed mount never leaves anything behind.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use mosaic_shared::constants::paths::PATH_MAX;
use mosaic_shared::errors::{MosaicError, MosaicResult};
use parking_lot::Mutex;

use super::host::{HostMounter, MountRequest};

type ReleaseFn = Box<dyn FnOnce() -> MosaicResult<()> + Send>;

enum MountStep {
    /// A host mount at this target.
    Mounted(PathBuf),
    /// Something to release once everything above it is unmounted.
    Release { what: String, action: ReleaseFn },
}

impl fmt::Debug for MountStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountStep::Mounted(target) => write!(f, "Mounted({})", target.display()),
            MountStep::Release { what, .. } => write!(f, "Release({})", what),
        }
    }
}

/// Recorder handed to drivers while they perform a mount.
pub struct MountTransaction<'a> {
    mounter: &'a dyn HostMounter,
    steps: Vec<MountStep>,
}

impl<'a> MountTransaction<'a> {
    fn new(mounter: &'a dyn HostMounter) -> Self {
        Self {
            mounter,
            steps: Vec::new(),
        }
    }

    /// Perform a host mount and record it for unwinding.
    pub fn mount(&mut self, req: &MountRequest) -> MosaicResult<()> {
        self.mounter.mount(req)?;
        self.steps.push(MountStep::Mounted(req.target.clone()));
        Ok(())
    }

    /// Register a release to run when the mount is torn down or rolled back.
    ///
    /// Releases run in reverse registration order, interleaved with the
    /// unmounts recorded around them.
    pub fn on_release<F>(&mut self, what: impl Into<String>, action: F)
    where
        F: FnOnce() -> MosaicResult<()> + Send + 'static,
    {
        self.steps.push(MountStep::Release {
            what: what.into(),
            action: Box::new(action),
        });
    }

    /// Number of recorded steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn rollback(self) {
        let mounter = self.mounter;
        let mut stack = MountStack { steps: self.steps };
        if let Err(e) = stack.unwind(mounter, 0) {
            tracing::warn!("Mount rollback incomplete: {}", e);
        }
    }

    fn commit(self) -> MountStack {
        MountStack { steps: self.steps }
    }
}

/// Committed mount steps, unwound on unmount.
#[derive(Debug, Default)]
struct MountStack {
    steps: Vec<MountStep>,
}

impl MountStack {
    /// Unwind in reverse order.
    ///
    /// A failed unmount stops the unwind: anything beneath a still-mounted
    /// target cannot be released, so those steps stay on the stack and the
    /// entity remains mounted. A failed release is logged and the unwind
    /// continues; the first such error is returned once the stack is empty.
    fn unwind(&mut self, mounter: &dyn HostMounter, flags: u32) -> MosaicResult<()> {
        let mut first_err = None;

        while let Some(step) = self.steps.pop() {
            match step {
                MountStep::Mounted(target) => {
                    if let Err(e) = mounter.unmount(&target, flags) {
                        self.steps.push(MountStep::Mounted(target));
                        return Err(e);
                    }
                }
                MountStep::Release { what, action } => {
                    if let Err(e) = action() {
                        tracing::warn!("Failed to release {}: {}", what, e);
                        first_err.get_or_insert(e);
                    }
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[derive(Debug)]
struct ActiveMount {
    path: PathBuf,
    stack: MountStack,
}

/// Mount state of one entity (a pool or a volume handle).
#[derive(Debug, Default)]
pub struct MountSlot {
    state: Mutex<Option<ActiveMount>>,
}

impl MountSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Path this entity is mounted at, if any.
    pub fn mounted_at(&self) -> Option<PathBuf> {
        self.state.lock().as_ref().map(|m| m.path.clone())
    }

    pub fn is_mounted(&self) -> bool {
        self.state.lock().is_some()
    }
}

/// Performs mounts and unmounts through a [`HostMounter`].
#[derive(Clone)]
pub struct MountCoordinator {
    mounter: Arc<dyn HostMounter>,
}

impl fmt::Debug for MountCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountCoordinator").finish_non_exhaustive()
    }
}

impl MountCoordinator {
    pub fn new(mounter: Arc<dyn HostMounter>) -> Self {
        Self { mounter }
    }

    /// Mount `entity` at `path` by running `perform` in a transaction.
    ///
    /// # Returns
    /// * `Err(AlreadyMounted)` - the slot is already mounted (nothing is done)
    /// * `Err(PathTooLong)` - `path` exceeds the platform limit
    /// * `Err(..)` - whatever `perform` returned, after rolling back
    pub fn mount<F>(&self, slot: &MountSlot, entity: &str, path: &Path, perform: F) -> MosaicResult<()>
    where
        F: FnOnce(&mut MountTransaction<'_>) -> MosaicResult<()>,
    {
        let mut state = slot.state.lock();
        if let Some(active) = state.as_ref() {
            return Err(MosaicError::AlreadyMounted(format!(
                "{} is already mounted at {}",
                entity,
                active.path.display()
            )));
        }
        check_path_len(path)?;

        let mut txn = MountTransaction::new(self.mounter.as_ref());
        if let Err(e) = perform(&mut txn) {
            tracing::debug!(
                "Mount of {} at {} failed, rolling back {} step(s)",
                entity,
                path.display(),
                txn.len()
            );
            txn.rollback();
            return Err(e);
        }

        tracing::info!("Mounted {} at {}", entity, path.display());
        *state = Some(ActiveMount {
            path: path.to_path_buf(),
            stack: txn.commit(),
        });
        Ok(())
    }

    /// Unmount `entity` from `path`.
    ///
    /// # Returns
    /// * `Err(NotMounted)` - the slot is not mounted, or mounted elsewhere
    /// * `Err(..)` - the host unmount failed; the entity stays mounted if its
    ///   top-level unmount failed, and is unmounted if only a release failed
    pub fn unmount(&self, slot: &MountSlot, entity: &str, path: &Path, flags: u32) -> MosaicResult<()> {
        let mut state = slot.state.lock();
        let active = match state.as_mut() {
            Some(active) if active.path == path => active,
            Some(active) => {
                return Err(MosaicError::NotMounted(format!(
                    "{} is mounted at {}, not {}",
                    entity,
                    active.path.display(),
                    path.display()
                )));
            }
            None => {
                return Err(MosaicError::NotMounted(format!("{} is not mounted", entity)));
            }
        };

        let result = active.stack.unwind(self.mounter.as_ref(), flags);
        let fully_unmounted = !active
            .stack
            .steps
            .iter()
            .any(|s| matches!(s, MountStep::Mounted(_)));
        if fully_unmounted {
            tracing::info!("Unmounted {} from {}", entity, path.display());
            *state = None;
        }
        result
    }

    /// Tear down whatever `slot` has mounted; used when a handle goes away.
    pub fn release(&self, slot: &MountSlot, entity: &str) -> MosaicResult<()> {
        let path = match slot.mounted_at() {
            Some(path) => path,
            None => return Ok(()),
        };
        self.unmount(slot, entity, &path, 0)
    }
}

/// Reject paths the host would not accept rather than truncating them.
pub(crate) fn check_path_len(path: &Path) -> MosaicResult<()> {
    let len = path.as_os_str().len();
    if len >= PATH_MAX {
        return Err(MosaicError::PathTooLong {
            path: path.display().to_string(),
            len,
            max: PATH_MAX,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records mounts; fails mounts whose target ends in "bad".
    #[derive(Default)]
    struct RecordingMounter {
        log: Mutex<Vec<String>>,
        fail_unmount: Mutex<bool>,
    }

    impl HostMounter for RecordingMounter {
        fn mount(&self, req: &MountRequest) -> MosaicResult<()> {
            if req.target.ends_with("bad") {
                return Err(MosaicError::Storage("mount refused".into()));
            }
            self.log
                .lock()
                .push(format!("mount {}", req.target.display()));
            Ok(())
        }

        fn unmount(&self, target: &Path, _flags: u32) -> MosaicResult<()> {
            if *self.fail_unmount.lock() {
                return Err(MosaicError::Storage("device busy".into()));
            }
            self.log.lock().push(format!("umount {}", target.display()));
            Ok(())
        }
    }

    fn coordinator() -> (MountCoordinator, Arc<RecordingMounter>) {
        let mounter = Arc::new(RecordingMounter::default());
        (MountCoordinator::new(mounter.clone()), mounter)
    }

    #[test]
    fn test_mount_unmount_cycle() {
        let (coord, mounter) = coordinator();
        let slot = MountSlot::new();
        let path = Path::new("/mnt/a");

        coord
            .mount(&slot, "vol", path, |txn| {
                txn.mount(&MountRequest::bind("/src", path, 0))
            })
            .unwrap();
        assert_eq!(slot.mounted_at().as_deref(), Some(path));

        coord.unmount(&slot, "vol", path, 0).unwrap();
        assert!(!slot.is_mounted());
        assert_eq!(*mounter.log.lock(), vec!["mount /mnt/a", "umount /mnt/a"]);
    }

    #[test]
    fn test_double_mount_rejected() {
        let (coord, mounter) = coordinator();
        let slot = MountSlot::new();
        let path = Path::new("/mnt/a");

        coord
            .mount(&slot, "vol", path, |txn| {
                txn.mount(&MountRequest::bind("/src", path, 0))
            })
            .unwrap();
        let err = coord
            .mount(&slot, "vol", Path::new("/mnt/b"), |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, MosaicError::AlreadyMounted(_)));
        assert_eq!(mounter.log.lock().len(), 1);
    }

    #[test]
    fn test_unmount_when_not_mounted() {
        let (coord, _) = coordinator();
        let slot = MountSlot::new();
        let err = coord
            .unmount(&slot, "vol", Path::new("/mnt/a"), 0)
            .unwrap_err();
        assert!(matches!(err, MosaicError::NotMounted(_)));
    }

    #[test]
    fn test_unmount_wrong_path() {
        let (coord, _) = coordinator();
        let slot = MountSlot::new();
        coord
            .mount(&slot, "vol", Path::new("/mnt/a"), |txn| {
                txn.mount(&MountRequest::bind("/src", "/mnt/a", 0))
            })
            .unwrap();

        let err = coord
            .unmount(&slot, "vol", Path::new("/mnt/other"), 0)
            .unwrap_err();
        assert!(matches!(err, MosaicError::NotMounted(_)));
        assert!(slot.is_mounted());
    }

    #[test]
    fn test_failed_mount_rolls_back_intermediate_steps() {
        let (coord, mounter) = coordinator();
        let slot = MountSlot::new();
        let released = Arc::new(AtomicUsize::new(0));
        let released_clone = released.clone();

        let err = coord
            .mount(&slot, "vol", Path::new("/mnt/bad"), |txn| {
                txn.on_release("loop0", move || {
                    released_clone.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
                txn.mount(&MountRequest::bind("/src", "/mnt/staging", 0))?;
                txn.mount(&MountRequest::bind("/mnt/staging", "/mnt/bad", 0))
            })
            .unwrap_err();

        assert!(matches!(err, MosaicError::Storage(_)));
        assert!(!slot.is_mounted());
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(
            *mounter.log.lock(),
            vec!["mount /mnt/staging", "umount /mnt/staging"]
        );
    }

    #[test]
    fn test_unmount_runs_releases_after_unmount() {
        let (coord, mounter) = coordinator();
        let slot = MountSlot::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        let mounter_log = mounter.clone();

        coord
            .mount(&slot, "vol", Path::new("/mnt/a"), |txn| {
                txn.on_release("nbd0", move || {
                    // By now the filesystem must already be unmounted.
                    let unmounted = mounter_log
                        .log
                        .lock()
                        .iter()
                        .any(|l| l == "umount /mnt/a");
                    log_clone.lock().push(unmounted);
                    Ok(())
                });
                txn.mount(&MountRequest::filesystem("/dev/nbd0", "/mnt/a", "ext4", 0))
            })
            .unwrap();

        coord.unmount(&slot, "vol", Path::new("/mnt/a"), 0).unwrap();
        assert_eq!(*log.lock(), vec![true]);
    }

    #[test]
    fn test_failed_unmount_keeps_mounted() {
        let (coord, mounter) = coordinator();
        let slot = MountSlot::new();
        coord
            .mount(&slot, "vol", Path::new("/mnt/a"), |txn| {
                txn.mount(&MountRequest::bind("/src", "/mnt/a", 0))
            })
            .unwrap();

        *mounter.fail_unmount.lock() = true;
        assert!(coord.unmount(&slot, "vol", Path::new("/mnt/a"), 0).is_err());
        assert!(slot.is_mounted());

        *mounter.fail_unmount.lock() = false;
        coord.unmount(&slot, "vol", Path::new("/mnt/a"), 0).unwrap();
        assert!(!slot.is_mounted());
    }

    #[test]
    fn test_failed_release_still_unmounts() {
        let (coord, _) = coordinator();
        let slot = MountSlot::new();
        coord
            .mount(&slot, "vol", Path::new("/mnt/a"), |txn| {
                txn.on_release("loop3", || Err(MosaicError::Storage("losetup -d failed".into())));
                txn.mount(&MountRequest::filesystem("/dev/loop3", "/mnt/a", "ext4", 0))
            })
            .unwrap();

        let err = coord
            .unmount(&slot, "vol", Path::new("/mnt/a"), 0)
            .unwrap_err();
        assert!(err.to_string().contains("losetup"));
        assert!(!slot.is_mounted());
    }

    #[test]
    fn test_path_too_long() {
        let (coord, mounter) = coordinator();
        let slot = MountSlot::new();
        let long = PathBuf::from(format!("/{}", "m".repeat(PATH_MAX)));

        let err = coord.mount(&slot, "vol", &long, |_| Ok(())).unwrap_err();
        assert!(matches!(err, MosaicError::PathTooLong { .. }));
        assert!(mounter.log.lock().is_empty());
    }
}
