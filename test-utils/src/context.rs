//! Ready-made pool fixture: a fake backend registered under `fake`, a
//! simulated mounter and scratch directories.

use std::path::PathBuf;
use std::sync::Arc;

use mosaic::{DriverRegistry, Features, MosaicOptions, MosaicResult, Pool};
use tempfile::TempDir;

use crate::fake_driver::FakeBackend;
use crate::mounter::SimulatedMounter;

pub const FAKE_KIND: &str = "fake";

pub struct TestContext {
    pub registry: DriverRegistry,
    pub backend: FakeBackend,
    pub mounter: Arc<SimulatedMounter>,
    /// Pool location (volume directories live here).
    pub location: TempDir,
    /// Parent for mount points.
    pub mnt_root: TempDir,
}

impl TestContext {
    pub fn new(features: Features) -> Self {
        let registry = DriverRegistry::empty();
        let backend = FakeBackend::new(features);
        backend.register(&registry, FAKE_KIND);

        Self {
            registry,
            backend,
            mounter: Arc::new(SimulatedMounter::new()),
            location: TempDir::new().expect("create pool dir"),
            mnt_root: TempDir::new().expect("create mount root"),
        }
    }

    /// A fake backend with every capability.
    pub fn full() -> Self {
        Self::new(Features::all())
    }

    /// Inline locator for this context's pool.
    pub fn locator(&self) -> String {
        format!("{}:{}", FAKE_KIND, self.location.path().display())
    }

    pub fn open_pool(&self) -> MosaicResult<Pool> {
        Pool::open_with(
            &self.registry,
            self.mounter.clone(),
            MosaicOptions::default(),
            &self.locator(),
            0,
        )
    }

    /// Create (if needed) and return a mount point directory.
    pub fn mount_point(&self, name: &str) -> PathBuf {
        let path = self.mnt_root.path().join(name);
        std::fs::create_dir_all(&path).expect("create mount point");
        path
    }
}
