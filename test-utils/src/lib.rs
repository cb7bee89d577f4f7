//! Shared fixtures for mosaic tests.
//!
//! Everything here runs without privileges or real storage:
//! - [`FakeBackend`] / [`FakeDriver`] - a driver with call counters and
//!   switchable failures
//! - [`SimulatedMounter`] - a host mounter that simulates bind mounts
//! - [`TestContext`] - both of the above wired to scratch directories

mod context;
mod fake_driver;
mod fs_util;
mod mounter;

pub use context::{FAKE_KIND, TestContext};
pub use fake_driver::{FakeBackend, FakeDriver, FakeOp, UNMANAGED_SIZE};
pub use mounter::SimulatedMounter;
