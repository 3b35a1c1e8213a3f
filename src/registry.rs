//! Component driver registry.
//!
//! A process-wide ordered set of drivers keyed by a 128-bit UUID. The
//! registry is dependency-injected into pipeline construction instead of
//! living in a global, so tests can provide fakes.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::component::ComponentId;
use crate::error::EngineError;
use crate::format::StreamFormat;
use crate::module::{ModuleAdapter, ProcessingDomain};
use crate::pipeline::Direction;

/// Construction parameters handed to a driver.
#[derive(Debug, Clone)]
pub struct ComponentSpec {
    /// Scheduler domain the component runs in.
    pub domain: ProcessingDomain,
    /// Stream direction, for endpoint components.
    pub direction: Option<Direction>,
    /// Offered format list (host) or fixed hardware format (dai).
    pub formats: Vec<StreamFormat>,
    /// Opaque initial module configuration.
    pub blob: Vec<u8>,
    /// Backing-ring capacity override for endpoints, in bytes (0 = default).
    pub capacity: usize,
}

impl Default for ComponentSpec {
    fn default() -> Self {
        Self {
            domain: ProcessingDomain::LowLatency,
            direction: None,
            formats: Vec::new(),
            blob: Vec::new(),
            capacity: 0,
        }
    }
}

impl ComponentSpec {
    /// A low-latency spec with everything else defaulted.
    pub fn low_latency() -> Self {
        Self::default()
    }

    /// A deferred-domain spec with everything else defaulted.
    pub fn deferred() -> Self {
        Self {
            domain: ProcessingDomain::Deferred,
            ..Self::default()
        }
    }

    /// Sets the stream direction.
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    /// Sets the offered format list.
    pub fn with_formats(mut self, formats: Vec<StreamFormat>) -> Self {
        self.formats = formats;
        self
    }

    /// Sets the initial module configuration blob.
    pub fn with_blob(mut self, blob: Vec<u8>) -> Self {
        self.blob = blob;
        self
    }
}

/// Constructor for a family of components.
///
/// Driver lifetime is independent of any component instances it created.
pub trait ComponentDriver: Send + Sync {
    /// Stable 128-bit key of the driver.
    fn uuid(&self) -> Uuid;

    /// Human-readable driver name.
    fn name(&self) -> &str;

    /// Builds a component instance.
    fn create(&self, id: ComponentId, spec: &ComponentSpec)
        -> Result<ModuleAdapter, EngineError>;
}

/// Ordered set of registered drivers.
pub struct ComponentRegistry {
    drivers: RwLock<Vec<Arc<dyn ComponentDriver>>>,
}

impl ComponentRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            drivers: RwLock::new(Vec::new()),
        }
    }

    /// Creates a registry with every built-in driver registered.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(crate::endpoint::host_driver());
        registry.register(crate::endpoint::dai_driver());
        registry.register(crate::modules::gain::driver());
        registry.register(crate::modules::mixer::driver());
        registry.register(crate::modules::tone::driver());
        registry.register(crate::modules::rate::driver());
        registry.register(crate::modules::eq::driver());
        registry
    }

    /// Registers a driver. Later registrations win on key collisions.
    pub fn register(&self, driver: Arc<dyn ComponentDriver>) {
        debug!(name = driver.name(), uuid = %driver.uuid(), "driver registered");
        self.drivers.write().push(driver);
    }

    /// Removes a driver by key.
    pub fn unregister(&self, uuid: Uuid) {
        self.drivers.write().retain(|d| d.uuid() != uuid);
    }

    /// Number of registered drivers.
    pub fn len(&self) -> usize {
        self.drivers.read().len()
    }

    /// Returns `true` when no drivers are registered.
    pub fn is_empty(&self) -> bool {
        self.drivers.read().is_empty()
    }

    /// Looks up a driver key by name, a convenience for topology loaders.
    pub fn uuid_of(&self, name: &str) -> Option<Uuid> {
        self.drivers
            .read()
            .iter()
            .rev()
            .find(|d| d.name() == name)
            .map(|d| d.uuid())
    }

    /// Dispatches construction to the driver registered under `uuid`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownDriver`] when no driver matches.
    pub fn new_component(
        &self,
        uuid: Uuid,
        id: ComponentId,
        spec: &ComponentSpec,
    ) -> Result<ModuleAdapter, EngineError> {
        let driver = self
            .drivers
            .read()
            .iter()
            .rev()
            .find(|d| d.uuid() == uuid)
            .cloned()
            .ok_or(EngineError::UnknownDriver { uuid })?;
        driver.create(id, spec)
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProcessError;
    use crate::module::{AudioStreamModule, ModuleKind, SinkView, SourceView};

    struct NullModule;
    impl AudioStreamModule for NullModule {
        fn process(
            &mut self,
            _sources: &mut [SourceView<'_>],
            _sinks: &mut [SinkView<'_>],
            _frames: usize,
        ) -> Result<(), ProcessError> {
            Ok(())
        }
    }

    struct NullDriver;
    impl ComponentDriver for NullDriver {
        fn uuid(&self) -> Uuid {
            Uuid::from_u128(0xdead_beef_0000_0000_0000_0000_0000_0001)
        }
        fn name(&self) -> &str {
            "null"
        }
        fn create(
            &self,
            id: ComponentId,
            spec: &ComponentSpec,
        ) -> Result<ModuleAdapter, EngineError> {
            Ok(ModuleAdapter::new(
                id,
                "null",
                spec.domain,
                ModuleKind::AudioStream(Box::new(NullModule)),
            ))
        }
    }

    #[test]
    fn test_register_and_dispatch() {
        let registry = ComponentRegistry::new();
        registry.register(Arc::new(NullDriver));
        assert_eq!(registry.len(), 1);

        let adapter = registry
            .new_component(
                NullDriver.uuid(),
                ComponentId(1),
                &ComponentSpec::default(),
            )
            .unwrap();
        assert_eq!(adapter.id(), ComponentId(1));
    }

    #[test]
    fn test_unknown_driver_rejected() {
        let registry = ComponentRegistry::new();
        let err = registry
            .new_component(
                Uuid::from_u128(42),
                ComponentId(1),
                &ComponentSpec::default(),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownDriver { .. }));
    }

    #[test]
    fn test_unregister() {
        let registry = ComponentRegistry::new();
        registry.register(Arc::new(NullDriver));
        registry.unregister(NullDriver.uuid());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_builtins_present() {
        let registry = ComponentRegistry::with_builtins();
        for name in ["host", "dai", "gain", "mixer", "tone", "src", "eq"] {
            assert!(registry.uuid_of(name).is_some(), "missing driver {name}");
        }
    }

    #[test]
    fn test_driver_outlives_instances() {
        let registry = ComponentRegistry::new();
        registry.register(Arc::new(NullDriver));
        let adapter = registry
            .new_component(
                NullDriver.uuid(),
                ComponentId(7),
                &ComponentSpec::default(),
            )
            .unwrap();
        registry.unregister(NullDriver.uuid());
        // The instance keeps working after its driver is gone.
        assert_eq!(adapter.state(), crate::component::ComponentState::Ready);
    }
}
