//! Configurable in-process driver.
//!
//! Volumes are directories under the pool location (so a simulated bind
//! mount has something to show) plus an in-memory record of their size.
//! Every driver call is counted, and any operation can be made to fail.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};

use mosaic::{
    Driver, DriverContext, DriverFactory, DriverRegistry, Features, MosaicError, MosaicResult,
    MountRequest, MountTransaction,
};
use parking_lot::Mutex;

use crate::fs_util;

/// Size every volume reports when the fake does not manage size.
pub const UNMANAGED_SIZE: u64 = 2048;

/// Driver operations that can be counted and made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    Open,
    Close,
    Have,
    OpenVolume,
    Create,
    Clone,
    Drop,
    Resize,
    MountPool,
    MountVolume,
    /// The release registered by a volume mount (think loop detach).
    MountRelease,
    Attach,
    Detach,
    Size,
}

#[derive(Debug, Clone)]
struct FakeVolume {
    size_in_blocks: u64,
    has_fs: bool,
}

#[derive(Debug, Default)]
struct FakeState {
    volumes: BTreeMap<String, FakeVolume>,
    calls: HashMap<FakeOp, usize>,
    failing: HashSet<FakeOp>,
    /// Sizes the core handed to create_volume, in call order.
    create_sizes: Vec<u64>,
    attached: Vec<PathBuf>,
    next_device: u32,
    long_device_paths: bool,
    /// Clone creates the target and then fails.
    partial_clone: bool,
    /// Drops meet the test thread here on entry and again before removing.
    drop_gate: Option<Arc<Barrier>>,
}

/// Shared handle on a fake backend; every pool opened through it sees the
/// same volumes and counters.
#[derive(Debug, Clone)]
pub struct FakeBackend {
    features: Features,
    state: Arc<Mutex<FakeState>>,
}

impl FakeBackend {
    pub fn new(features: Features) -> Self {
        Self {
            features,
            state: Arc::new(Mutex::new(FakeState::default())),
        }
    }

    pub fn features(&self) -> Features {
        self.features
    }

    /// Factory for [`DriverRegistry::register`].
    pub fn factory(&self) -> DriverFactory {
        let backend = self.clone();
        Arc::new(move |ctx: &DriverContext<'_>| {
            backend.record(FakeOp::Open)?;
            Ok(Box::new(FakeDriver {
                backend: backend.clone(),
                root: ctx.descriptor.location.clone(),
            }) as Box<dyn Driver>)
        })
    }

    /// Register this backend under `kind`.
    pub fn register(&self, registry: &DriverRegistry, kind: &str) {
        registry.register(kind, self.factory());
    }

    /// Make `op` fail with `Storage` until healed.
    pub fn fail(&self, op: FakeOp) {
        self.state.lock().failing.insert(op);
    }

    pub fn heal(&self, op: FakeOp) {
        self.state.lock().failing.remove(&op);
    }

    /// Make clones leave a half-made target behind before failing.
    pub fn fail_clone_partially(&self) {
        self.state.lock().partial_clone = true;
    }

    /// Hold every later drop inside the backend. The dropping thread waits
    /// on the returned barrier once when it arrives and once more before it
    /// removes anything.
    pub fn pause_drops(&self) -> Arc<Barrier> {
        let gate = Arc::new(Barrier::new(2));
        self.state.lock().drop_gate = Some(gate.clone());
        gate
    }

    /// Make attach return device paths longer than `PATH_MAX`.
    pub fn return_long_device_paths(&self, on: bool) {
        self.state.lock().long_device_paths = on;
    }

    /// Number of times `op` reached the driver.
    pub fn calls(&self, op: FakeOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Sizes passed to `create_volume`, in call order.
    pub fn create_sizes(&self) -> Vec<u64> {
        self.state.lock().create_sizes.clone()
    }

    pub fn volume_names(&self) -> Vec<String> {
        self.state.lock().volumes.keys().cloned().collect()
    }

    /// Block devices currently attached.
    pub fn attached_devices(&self) -> Vec<PathBuf> {
        self.state.lock().attached.clone()
    }

    pub fn has_filesystem(&self, name: &str) -> Option<bool> {
        self.state.lock().volumes.get(name).map(|v| v.has_fs)
    }

    fn record(&self, op: FakeOp) -> MosaicResult<()> {
        let mut state = self.state.lock();
        *state.calls.entry(op).or_default() += 1;
        if state.failing.contains(&op) {
            return Err(MosaicError::Storage(format!("injected {:?} failure", op)));
        }
        Ok(())
    }
}

/// A [`Driver`] backed by a [`FakeBackend`].
pub struct FakeDriver {
    backend: FakeBackend,
    root: PathBuf,
}

impl FakeDriver {
    fn volume_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn not_found(name: &str) -> MosaicError {
        MosaicError::NotFound(format!("fake volume '{}'", name))
    }
}

impl Driver for FakeDriver {
    fn kind(&self) -> &str {
        "fake"
    }

    fn features(&self) -> Features {
        self.backend.features
    }

    fn mount_pool(&self, txn: &mut MountTransaction<'_>, path: &Path, flags: u32) -> MosaicResult<()> {
        self.backend.record(FakeOp::MountPool)?;
        txn.mount(&MountRequest::bind(&self.root, path, flags))
    }

    fn have_volume(&self, name: &str, _flags: u32) -> MosaicResult<bool> {
        self.backend.record(FakeOp::Have)?;
        Ok(self.backend.state.lock().volumes.contains_key(name))
    }

    fn open_volume(&self, name: &str, _flags: u32) -> MosaicResult<()> {
        self.backend.record(FakeOp::OpenVolume)?;
        if self.backend.state.lock().volumes.contains_key(name) {
            Ok(())
        } else {
            Err(Self::not_found(name))
        }
    }

    fn create_volume(
        &self,
        name: &str,
        size_in_blocks: u64,
        _flags: u32,
        with_fs: bool,
    ) -> MosaicResult<()> {
        self.backend.record(FakeOp::Create)?;
        let mut state = self.backend.state.lock();
        state.create_sizes.push(size_in_blocks);
        if state.volumes.contains_key(name) {
            return Err(MosaicError::AlreadyExists(name.to_string()));
        }

        std::fs::create_dir_all(self.volume_dir(name))?;
        let size_in_blocks = if self.backend.features.contains(Features::MANAGE_SIZE) {
            size_in_blocks
        } else {
            UNMANAGED_SIZE
        };
        state.volumes.insert(
            name.to_string(),
            FakeVolume {
                size_in_blocks,
                has_fs: with_fs,
            },
        );
        Ok(())
    }

    fn clone_volume(&self, from: &str, to: &str, _flags: u32) -> MosaicResult<()> {
        self.backend.record(FakeOp::Clone)?;
        let mut state = self.backend.state.lock();
        let source = state
            .volumes
            .get(from)
            .cloned()
            .ok_or_else(|| Self::not_found(from))?;

        std::fs::create_dir_all(self.volume_dir(to))?;
        state.volumes.insert(to.to_string(), source);
        if state.partial_clone {
            return Err(MosaicError::Storage(format!(
                "clone of {} to {} interrupted",
                from, to
            )));
        }
        fs_util::copy_tree(&self.volume_dir(from), &self.volume_dir(to))?;
        Ok(())
    }

    fn drop_volume(&self, name: &str, _flags: u32) -> MosaicResult<()> {
        self.backend.record(FakeOp::Drop)?;
        let gate = self.backend.state.lock().drop_gate.clone();
        if let Some(gate) = gate {
            gate.wait();
            gate.wait();
        }
        let mut state = self.backend.state.lock();
        if state.volumes.remove(name).is_none() {
            return Err(Self::not_found(name));
        }
        let dir = self.volume_dir(name);
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    fn resize_volume(&self, name: &str, size_in_blocks: u64, _flags: u32) -> MosaicResult<()> {
        self.backend.record(FakeOp::Resize)?;
        let mut state = self.backend.state.lock();
        let volume = state
            .volumes
            .get_mut(name)
            .ok_or_else(|| Self::not_found(name))?;
        volume.size_in_blocks = size_in_blocks;
        Ok(())
    }

    fn mount_volume(
        &self,
        txn: &mut MountTransaction<'_>,
        name: &str,
        path: &Path,
        flags: u32,
    ) -> MosaicResult<()> {
        self.backend.record(FakeOp::MountVolume)?;
        if !self.backend.state.lock().volumes.contains_key(name) {
            return Err(Self::not_found(name));
        }

        let backend = self.backend.clone();
        txn.on_release(format!("fake staging for {}", name), move || {
            backend.record(FakeOp::MountRelease)
        });
        txn.mount(&MountRequest::bind(self.volume_dir(name), path, flags))
    }

    fn attach_block_device(&self, name: &str, _flags: u32) -> MosaicResult<PathBuf> {
        self.backend.record(FakeOp::Attach)?;
        let mut state = self.backend.state.lock();
        if !state.volumes.contains_key(name) {
            return Err(Self::not_found(name));
        }

        let index = state.next_device;
        state.next_device += 1;
        let device = if state.long_device_paths {
            PathBuf::from(format!("/dev/{}{}", "x".repeat(5000), index))
        } else {
            PathBuf::from(format!("/dev/fake{}", index))
        };
        state.attached.push(device.clone());
        Ok(device)
    }

    fn detach_block_device(&self, _name: &str, device: &Path) -> MosaicResult<()> {
        self.backend.record(FakeOp::Detach)?;
        let mut state = self.backend.state.lock();
        let before = state.attached.len();
        state.attached.retain(|d| d != device);
        if state.attached.len() == before {
            return Err(MosaicError::NotAttached(device.display().to_string()));
        }
        Ok(())
    }

    fn volume_size(&self, name: &str) -> MosaicResult<u64> {
        self.backend.record(FakeOp::Size)?;
        self.backend
            .state
            .lock()
            .volumes
            .get(name)
            .map(|v| v.size_in_blocks)
            .ok_or_else(|| Self::not_found(name))
    }

    fn close(&self) -> MosaicResult<()> {
        self.backend.record(FakeOp::Close)
    }
}
