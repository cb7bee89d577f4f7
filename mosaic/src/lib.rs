//! Mosaic: one volume-management API over heterogeneous storage backends.
//!
//! Open a storage pool, check which optional capabilities its backend has,
//! then create, mount, clone, resize and drop volumes in it without any
//! backend-specific code:
//!
//! ```no_run
//! use mosaic::{MosaicResult, Pool};
//!
//! fn provision() -> MosaicResult<()> {
//!     let pool = Pool::open("/etc/mosaic/images.mos", 0)?;
//!     let vol = pool.create_volume("rootfs", 4 << 20, 0, true)?;
//!     if pool.can_clone() {
//!         vol.clone_to("rootfs-snap", 0)?.close()?;
//!     }
//!     vol.mount("/mnt/rootfs", 0)?;
//!     // ...
//!     vol.unmount("/mnt/rootfs", 0)?;
//!     vol.close()?;
//!     pool.close()
//! }
//! ```
//!
//! Backends plug in through the [`Driver`] trait and the
//! [`DriverRegistry`]; the `plain`, `fsimg`, `btrfs` and `qcow2` drivers
//! ship with the crate.

pub mod block_device;
pub mod constants;
pub mod descriptor;
pub mod disk;
pub mod driver;
pub mod drivers;
pub mod features;
pub mod logging;
pub mod mount;
pub mod options;
pub mod pool;
pub mod util;
pub mod volume;

pub use descriptor::PoolDescriptor;
pub use driver::{Driver, DriverContext, DriverFactory, DriverRegistration, DriverRegistry};
pub use features::{Feature, Features};
pub use logging::LogLevel;
pub use mosaic_shared::{MosaicError, MosaicResult};
pub use mount::{HostMounter, MountKind, MountRequest, MountTransaction, NixMounter};
pub use options::MosaicOptions;
pub use pool::Pool;
pub use volume::{Volume, VolumeStatus};
