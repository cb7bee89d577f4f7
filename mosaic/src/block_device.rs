//! Reference-counted block-device exposure.
//!
//! Each volume handle owns one [`BlockDeviceBroker`]. The first
//! `acquire` attaches the device through the backend; later acquisitions
//! share the cached path. The device is detached only when the last
//! reference is released. The count lives under a mutex held across the
//! backend call, so concurrent acquire/release on one handle can never
//! double-attach or double-detach.

use std::path::{Path, PathBuf};

use mosaic_shared::errors::{MosaicError, MosaicResult};
use parking_lot::Mutex;

use crate::mount::check_path_len;

#[derive(Debug, Default)]
struct Attachment {
    refs: u32,
    path: Option<PathBuf>,
}

/// Tracks outstanding block-device acquisitions for one volume.
#[derive(Debug, Default)]
pub struct BlockDeviceBroker {
    state: Mutex<Attachment>,
}

impl BlockDeviceBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a reference, attaching on first use.
    ///
    /// `attach` runs only when no reference is outstanding. If the path it
    /// returns is too long for the host, `detach` is called on it right away
    /// and `PathTooLong` is returned.
    pub fn acquire<A, D>(&self, volume: &str, attach: A, detach: D) -> MosaicResult<PathBuf>
    where
        A: FnOnce() -> MosaicResult<PathBuf>,
        D: FnOnce(&Path) -> MosaicResult<()>,
    {
        let mut state = self.state.lock();

        if let Some(path) = state.path.clone().filter(|_| state.refs > 0) {
            state.refs += 1;
            tracing::debug!(
                "Reusing block device {} for {} (refs={})",
                path.display(),
                volume,
                state.refs
            );
            return Ok(path);
        }

        let path = attach()?;
        if let Err(e) = check_path_len(&path) {
            if let Err(detach_err) = detach(&path) {
                tracing::warn!(
                    "Failed to detach over-long block device for {}: {}",
                    volume,
                    detach_err
                );
            }
            return Err(e);
        }

        tracing::info!("Attached block device {} for {}", path.display(), volume);
        state.refs = 1;
        state.path = Some(path.clone());
        Ok(path)
    }

    /// Drop a reference, detaching when it was the last one.
    ///
    /// If `detach` fails, the broker stays attached with a single reference
    /// so the caller can retry.
    pub fn release<D>(&self, volume: &str, detach: D) -> MosaicResult<()>
    where
        D: FnOnce(&Path) -> MosaicResult<()>,
    {
        let mut state = self.state.lock();

        if state.refs == 0 {
            return Err(MosaicError::NotAttached(format!(
                "{} has no outstanding block device",
                volume
            )));
        }

        state.refs -= 1;
        if state.refs > 0 {
            tracing::debug!("Released block device ref for {} (refs={})", volume, state.refs);
            return Ok(());
        }

        let path = match state.path.take() {
            Some(path) => path,
            None => return Ok(()),
        };

        if let Err(e) = detach(&path) {
            state.refs = 1;
            state.path = Some(path);
            return Err(e);
        }

        tracing::info!("Detached block device {} for {}", path.display(), volume);
        Ok(())
    }

    /// Release every outstanding reference at once (handle teardown).
    pub fn release_all<D>(&self, volume: &str, detach: D) -> MosaicResult<()>
    where
        D: FnOnce(&Path) -> MosaicResult<()>,
    {
        let mut state = self.state.lock();
        if state.refs == 0 {
            return Ok(());
        }
        if state.refs > 1 {
            tracing::warn!(
                "Dropping {} outstanding block device reference(s) for {}",
                state.refs,
                volume
            );
        }
        state.refs = 1;
        drop(state);
        self.release(volume, detach)
    }

    /// Current device path, if attached.
    pub fn path(&self) -> Option<PathBuf> {
        self.state.lock().path.clone()
    }

    /// Outstanding references.
    pub fn refs(&self) -> u32 {
        self.state.lock().refs
    }

    pub fn is_attached(&self) -> bool {
        self.refs() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mosaic_shared::constants::paths::PATH_MAX;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        attach: AtomicUsize,
        detach: AtomicUsize,
    }

    impl Counters {
        fn attach(&self) -> MosaicResult<PathBuf> {
            self.attach.fetch_add(1, Ordering::SeqCst);
            Ok(PathBuf::from("/dev/loop7"))
        }

        fn detach(&self, _path: &Path) -> MosaicResult<()> {
            self.detach.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_second_acquire_reuses_path() {
        let broker = BlockDeviceBroker::new();
        let c = Counters::default();

        let p1 = broker.acquire("v", || c.attach(), |p| c.detach(p)).unwrap();
        let p2 = broker.acquire("v", || c.attach(), |p| c.detach(p)).unwrap();

        assert_eq!(p1, p2);
        assert_eq!(c.attach.load(Ordering::SeqCst), 1);
        assert_eq!(broker.refs(), 2);
    }

    #[test]
    fn test_detach_only_on_last_release() {
        let broker = BlockDeviceBroker::new();
        let c = Counters::default();
        broker.acquire("v", || c.attach(), |p| c.detach(p)).unwrap();
        broker.acquire("v", || c.attach(), |p| c.detach(p)).unwrap();

        broker.release("v", |p| c.detach(p)).unwrap();
        assert_eq!(c.detach.load(Ordering::SeqCst), 0);
        assert!(broker.is_attached());

        broker.release("v", |p| c.detach(p)).unwrap();
        assert_eq!(c.detach.load(Ordering::SeqCst), 1);
        assert!(!broker.is_attached());
        assert_eq!(broker.path(), None);
    }

    #[test]
    fn test_release_without_acquire() {
        let broker = BlockDeviceBroker::new();
        let c = Counters::default();
        let err = broker.release("v", |p| c.detach(p)).unwrap_err();
        assert!(matches!(err, MosaicError::NotAttached(_)));
        assert_eq!(c.detach.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failed_attach_leaves_detached() {
        let broker = BlockDeviceBroker::new();
        let err = broker
            .acquire(
                "v",
                || Err(MosaicError::Storage("no free loop device".into())),
                |_| Ok(()),
            )
            .unwrap_err();
        assert!(matches!(err, MosaicError::Storage(_)));
        assert_eq!(broker.refs(), 0);
    }

    #[test]
    fn test_path_too_long_detaches_immediately() {
        let broker = BlockDeviceBroker::new();
        let c = Counters::default();
        let long = PathBuf::from(format!("/dev/{}", "x".repeat(PATH_MAX)));

        let err = broker
            .acquire("v", || Ok(long.clone()), |p| c.detach(p))
            .unwrap_err();
        assert!(matches!(err, MosaicError::PathTooLong { .. }));
        assert_eq!(c.detach.load(Ordering::SeqCst), 1);
        assert!(!broker.is_attached());
    }

    #[test]
    fn test_failed_detach_stays_attached() {
        let broker = BlockDeviceBroker::new();
        let c = Counters::default();
        broker.acquire("v", || c.attach(), |p| c.detach(p)).unwrap();

        let err = broker
            .release("v", |_| Err(MosaicError::Storage("device busy".into())))
            .unwrap_err();
        assert!(matches!(err, MosaicError::Storage(_)));
        assert_eq!(broker.refs(), 1);
        assert_eq!(broker.path(), Some(PathBuf::from("/dev/loop7")));

        broker.release("v", |p| c.detach(p)).unwrap();
        assert!(!broker.is_attached());
    }

    #[test]
    fn test_release_all() {
        let broker = BlockDeviceBroker::new();
        let c = Counters::default();
        for _ in 0..3 {
            broker.acquire("v", || c.attach(), |p| c.detach(p)).unwrap();
        }
        broker.release_all("v", |p| c.detach(p)).unwrap();
        assert_eq!(c.detach.load(Ordering::SeqCst), 1);
        assert!(!broker.is_attached());

        // Nothing outstanding: no-op
        broker.release_all("v", |p| c.detach(p)).unwrap();
        assert_eq!(c.detach.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_acquire_attaches_once() {
        let broker = Arc::new(BlockDeviceBroker::new());
        let c = Arc::new(Counters::default());

        std::thread::scope(|s| {
            for _ in 0..8 {
                let broker = broker.clone();
                let c = c.clone();
                s.spawn(move || {
                    broker.acquire("v", || c.attach(), |p| c.detach(p)).unwrap();
                });
            }
        });
        assert_eq!(c.attach.load(Ordering::SeqCst), 1);
        assert_eq!(broker.refs(), 8);

        std::thread::scope(|s| {
            for _ in 0..8 {
                let broker = broker.clone();
                let c = c.clone();
                s.spawn(move || {
                    broker.release("v", |p| c.detach(p)).unwrap();
                });
            }
        });
        assert_eq!(c.detach.load(Ordering::SeqCst), 1);
        assert!(!broker.is_attached());
    }
}
