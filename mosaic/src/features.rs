//! Pool capability negotiation.
//!
//! A pool reports its capabilities once, at open time. Internally they are
//! a [`Features`] flag set; at the API boundary they are the raw `u64` bits
//! from [`mosaic_shared::constants::features`].

use bitflags::bitflags;
use mosaic_shared::constants::features as bits;
use mosaic_shared::errors::{MosaicError, MosaicResult};

bitflags! {
    /// Set of optional capabilities a pool's backend supports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Features: u64 {
        const CLONE = bits::CLONE;
        const MANAGE_SIZE = bits::DISK_SIZE_MGMT;
        const BLOCK_DEV = bits::BDEV;
        const MIGRATE = bits::MIGRATE;
    }
}

/// A single capability, used to gate operations.
///
/// Gated operations name the capability they need with this enum rather
/// than testing bits by hand, so a new capability shows up in every
/// exhaustive match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    Clone,
    ManageSize,
    BlockDev,
    Migrate,
}

impl Feature {
    /// All capabilities, in bit order.
    pub const ALL: [Feature; 4] = [
        Feature::Clone,
        Feature::ManageSize,
        Feature::BlockDev,
        Feature::Migrate,
    ];

    /// The flag this capability corresponds to.
    pub fn flag(self) -> Features {
        match self {
            Feature::Clone => Features::CLONE,
            Feature::ManageSize => Features::MANAGE_SIZE,
            Feature::BlockDev => Features::BLOCK_DEV,
            Feature::Migrate => Features::MIGRATE,
        }
    }

    /// Human-readable name, used in error messages and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Feature::Clone => "clone",
            Feature::ManageSize => "size management",
            Feature::BlockDev => "block device",
            Feature::Migrate => "migration",
        }
    }
}

impl Features {
    /// Check a single capability.
    pub fn supports(self, feature: Feature) -> bool {
        self.contains(feature.flag())
    }

    /// Fail with `Unsupported` unless `feature` is present.
    pub fn require(self, feature: Feature, what: &str) -> MosaicResult<()> {
        if self.supports(feature) {
            Ok(())
        } else {
            Err(MosaicError::Unsupported(format!(
                "{} requires {} support, which this pool lacks",
                what,
                feature.as_str()
            )))
        }
    }
}

impl std::fmt::Display for Features {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = Feature::ALL
            .iter()
            .filter(|feat| self.supports(**feat))
            .map(|feat| feat.as_str())
            .collect();
        if names.is_empty() {
            write!(f, "0x{:x} (none)", self.bits())
        } else {
            write!(f, "0x{:x} ({})", self.bits(), names.join(", "))
        }
    }
}
