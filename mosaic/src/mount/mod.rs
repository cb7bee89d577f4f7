//! Mount coordination for pools and volumes.
//!
//! - `HostMounter` - the host mount/unmount primitive (real or simulated)
//! - `MountCoordinator` - per-entity state machine with rollback

mod coordinator;
mod host;

pub(crate) use coordinator::check_path_len;
pub use coordinator::{MountCoordinator, MountSlot, MountTransaction};
pub use host::{HostMounter, MountKind, MountRequest, NixMounter};
