//! Driver registry.
//!
//! Built-in drivers register themselves at compile time with
//! `inventory::submit!`; embedders and tests can add more at runtime with
//! [`DriverRegistry::register`]. Lookup is by the pool's declared kind and
//! an unknown kind is a hard `NotFound`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use mosaic_shared::errors::{MosaicError, MosaicResult};
use parking_lot::RwLock;

use super::Driver;
use crate::descriptor::PoolDescriptor;
use crate::options::MosaicOptions;

/// Everything a driver factory gets to open a pool.
#[derive(Debug, Clone, Copy)]
pub struct DriverContext<'a> {
    pub descriptor: &'a PoolDescriptor,
    pub options: &'a MosaicOptions,
    /// Open flags, passed through from `Pool::open`.
    pub flags: u32,
}

impl DriverContext<'_> {
    /// Filesystem for new volumes: the descriptor's, else the options'.
    pub fn default_fs(&self) -> &str {
        self.descriptor
            .default_fs
            .as_deref()
            .unwrap_or(&self.options.default_fs)
    }
}

/// Factory that opens a pool for one backend kind.
pub type DriverFactory =
    Arc<dyn Fn(&DriverContext<'_>) -> MosaicResult<Box<dyn Driver>> + Send + Sync>;

/// Type alias for compile-time factory functions.
pub type DriverFactoryFn = fn(&DriverContext<'_>) -> MosaicResult<Box<dyn Driver>>;

/// Registration entry submitted by driver implementations via inventory.
pub struct DriverRegistration {
    pub kind: &'static str,
    pub factory: DriverFactoryFn,
}

// Collect all driver registrations at compile time
inventory::collect!(DriverRegistration);

/// Maps backend kinds to driver factories.
pub struct DriverRegistry {
    factories: RwLock<HashMap<String, DriverFactory>>,
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl DriverRegistry {
    /// A registry with no drivers.
    pub fn empty() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// A registry holding every compile-time registered driver.
    pub fn builtin() -> Self {
        let registry = Self::empty();
        for registration in inventory::iter::<DriverRegistration> {
            let factory = registration.factory;
            registry.register(registration.kind, Arc::new(move |ctx: &DriverContext<'_>| factory(ctx)));
        }
        registry
    }

    /// Process-wide registry used by `Pool::open`.
    pub fn global() -> &'static DriverRegistry {
        static GLOBAL: OnceLock<DriverRegistry> = OnceLock::new();
        GLOBAL.get_or_init(DriverRegistry::builtin)
    }

    /// Register (or replace) the factory for `kind`.
    pub fn register(&self, kind: impl Into<String>, factory: DriverFactory) {
        let kind = kind.into();
        tracing::debug!(driver = %kind, "Registering driver");
        if self.factories.write().insert(kind.clone(), factory).is_some() {
            tracing::debug!(driver = %kind, "Replaced existing driver registration");
        }
    }

    /// Remove the factory for `kind`. Returns whether one was registered.
    pub fn unregister(&self, kind: &str) -> bool {
        self.factories.write().remove(kind).is_some()
    }

    /// Check if a driver kind is registered.
    pub fn is_registered(&self, kind: &str) -> bool {
        self.factories.read().contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self.factories.read().keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Open a pool with the driver registered for its kind.
    ///
    /// # Returns
    /// * `Ok(Box<dyn Driver>)` - backend opened
    /// * `Err(NotFound)` - no driver registered for `ctx.descriptor.kind`
    /// * `Err(..)` - whatever the factory returned
    pub fn open(&self, ctx: &DriverContext<'_>) -> MosaicResult<Box<dyn Driver>> {
        let kind = ctx.descriptor.kind.as_str();
        // Clone the factory out so the lock is not held during backend init.
        let factory = self.factories.read().get(kind).cloned();

        match factory {
            Some(factory) => {
                tracing::debug!(driver = kind, location = %ctx.descriptor.location.display(), "Opening pool");
                factory(ctx)
            }
            None => Err(MosaicError::NotFound(format!(
                "Driver '{}' is not registered. Available drivers: {:?}",
                kind,
                self.kinds()
            ))),
        }
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::Features;
    use crate::mount::MountTransaction;
    use std::path::Path;

    struct NullDriver;

    impl Driver for NullDriver {
        fn kind(&self) -> &str {
            "null"
        }
        fn features(&self) -> Features {
            Features::empty()
        }
        fn have_volume(&self, _name: &str, _flags: u32) -> MosaicResult<bool> {
            Ok(false)
        }
        fn open_volume(&self, name: &str, _flags: u32) -> MosaicResult<()> {
            Err(MosaicError::NotFound(name.into()))
        }
        fn create_volume(&self, _: &str, _: u64, _: u32, _: bool) -> MosaicResult<()> {
            Ok(())
        }
        fn drop_volume(&self, _: &str, _: u32) -> MosaicResult<()> {
            Ok(())
        }
        fn mount_volume(
            &self,
            _: &mut MountTransaction<'_>,
            _: &str,
            _: &Path,
            _: u32,
        ) -> MosaicResult<()> {
            Ok(())
        }
        fn volume_size(&self, _: &str) -> MosaicResult<u64> {
            Ok(0)
        }
    }

    fn null_factory() -> DriverFactory {
        Arc::new(|_ctx: &DriverContext<'_>| Ok(Box::new(NullDriver) as Box<dyn Driver>))
    }

    #[test]
    fn test_unknown_kind_is_not_found() {
        let registry = DriverRegistry::empty();
        let desc = PoolDescriptor::new("nosuch", "/srv/x");
        let opts = MosaicOptions::default();
        let ctx = DriverContext {
            descriptor: &desc,
            options: &opts,
            flags: 0,
        };

        let err = registry.open(&ctx).err().unwrap();
        assert!(matches!(err, MosaicError::NotFound(_)));
        assert!(err.to_string().contains("nosuch"));
    }

    #[test]
    fn test_register_and_open() {
        let registry = DriverRegistry::empty();
        registry.register("null", null_factory());
        assert!(registry.is_registered("null"));
        assert_eq!(registry.kinds(), vec!["null".to_string()]);

        let desc = PoolDescriptor::new("null", "/srv/x");
        let opts = MosaicOptions::default();
        let ctx = DriverContext {
            descriptor: &desc,
            options: &opts,
            flags: 0,
        };
        let driver = registry.open(&ctx).unwrap();
        assert_eq!(driver.kind(), "null");

        assert!(registry.unregister("null"));
        assert!(!registry.is_registered("null"));
        assert!(!registry.unregister("null"));
    }

    #[cfg(feature = "builtin-drivers")]
    #[test]
    fn test_builtin_drivers_registered() {
        let registry = DriverRegistry::builtin();
        for kind in ["plain", "fsimg", "btrfs", "qcow2"] {
            assert!(registry.is_registered(kind), "{} missing", kind);
        }
        assert!(DriverRegistry::global().is_registered("plain"));
    }

    #[test]
    fn test_default_fs_precedence() {
        let opts = MosaicOptions::default();
        let mut desc = PoolDescriptor::new("fsimg", "/srv/x");
        let ctx = DriverContext {
            descriptor: &desc,
            options: &opts,
            flags: 0,
        };
        assert_eq!(ctx.default_fs(), "ext4");

        desc.default_fs = Some("xfs".into());
        let ctx = DriverContext {
            descriptor: &desc,
            options: &opts,
            flags: 0,
        };
        assert_eq!(ctx.default_fs(), "xfs");
    }
}
