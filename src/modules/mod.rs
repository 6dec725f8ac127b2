//! Module system: the unit every device and experiment is built from.
//!
//! A module is a named object with a capability tag, an ordered
//! [`PropertySet`] and three lifecycle hooks:
//!
//! - **initialize**: called once per binding pass with a read-only
//!   [`BindingContext`]; devices use it to connect and derive their address,
//!   experiments use it to populate collaborator choice lists.
//! - **can_quit**: veto hook asked before the controller exits.
//! - **shutdown**: release hardware.
//!
//! # Capabilities
//!
//! The controller never probes a module for methods at runtime. Each module is
//! wrapped in a [`ModuleEntry`] whose [`Capability`] carries the typed handle
//! (`Arc<dyn Input>`, `Arc<dyn Axis>`, ...), resolved once when the entry is
//! built. Typed collections for experiments are derived from these tags.
//!
//! ```text
//! ModuleCatalog ──create──> ModuleEntry { module, capability } ──> ModuleRegistry
//!                                                                      │
//!                                          initialize(BindingContext) <┘
//! ```
//!
//! # Lifecycle
//!
//! ```text
//! Created ──initialize() ok──> Ready
//!    │
//!    └──initialize() err──> Failed   (omitted from every capability list)
//! ```

pub mod catalog;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{AppResult, DaqError};
use crate::experiment::Experiment;
use crate::hardware::capabilities::{Axis, Camera, Input, Output};
use crate::hardware::registry::BindingContext;
use crate::property::PropertySet;

pub use catalog::builtin_catalog;

/// Capability tag of a module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    /// Scalar input (lock-in, DAQ channel)
    Input,
    /// Frame-producing input (CCD)
    Camera,
    /// Digital or analog output (shutter)
    Output,
    /// Positioner (delay stage)
    Axis,
    /// Scan orchestration
    Experiment,
    /// Anything else
    Generic,
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModuleKind::Input => "input",
            ModuleKind::Camera => "camera",
            ModuleKind::Output => "output",
            ModuleKind::Axis => "axis",
            ModuleKind::Experiment => "experiment",
            ModuleKind::Generic => "generic",
        };
        f.write_str(name)
    }
}

/// Readiness of a module after the last binding pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModuleStatus {
    /// Instantiated, not yet initialized
    Created,
    /// Initialized and usable
    Ready,
    /// Initialization failed; the module is excluded from binding
    Failed(String),
}

impl ModuleStatus {
    /// Whether the module can be handed to experiments.
    pub fn is_ready(&self) -> bool {
        matches!(self, ModuleStatus::Ready)
    }
}

/// Base trait for all modules.
///
/// Implementations keep mutable state behind interior mutability; every hook
/// takes `&self` so the module can be shared as `Arc<dyn Module>` between the
/// controller and a running scan.
#[async_trait]
pub trait Module: Send + Sync {
    /// Display name; identical for every instance of the same driver.
    fn name(&self) -> &str;

    /// Configuration surface.
    fn properties(&self) -> &PropertySet;

    /// Connect and bind against the other modules.
    ///
    /// An error marks this module not-ready; other modules keep loading.
    async fn initialize(&self, _ctx: &BindingContext<'_>) -> AppResult<()> {
        Ok(())
    }

    /// Run the handler named by a property's `event` field.
    ///
    /// Called by the controller after the UI changed a property or pressed a
    /// button; unknown events are ignored.
    fn handle_event(&self, _event: &str) -> AppResult<()> {
        Ok(())
    }

    /// Whether the application may exit now.
    fn can_quit(&self) -> bool {
        true
    }

    /// Release hardware resources.
    async fn shutdown(&self) -> AppResult<()> {
        Ok(())
    }
}

/// Typed handle resolved when a module is registered.
#[derive(Clone)]
pub enum Capability {
    /// Scalar input
    Input(Arc<dyn Input>),
    /// Camera; also usable as a scalar input
    Camera {
        /// Camera view
        camera: Arc<dyn Camera>,
        /// Scalar view of the same device
        input: Arc<dyn Input>,
    },
    /// Output
    Output(Arc<dyn Output>),
    /// Axis
    Axis(Arc<dyn Axis>),
    /// Experiment
    Experiment(Arc<dyn Experiment>),
    /// No typed capability
    Generic,
}

impl Capability {
    /// Tag of this capability.
    pub fn kind(&self) -> ModuleKind {
        match self {
            Capability::Input(_) => ModuleKind::Input,
            Capability::Camera { .. } => ModuleKind::Camera,
            Capability::Output(_) => ModuleKind::Output,
            Capability::Axis(_) => ModuleKind::Axis,
            Capability::Experiment(_) => ModuleKind::Experiment,
            Capability::Generic => ModuleKind::Generic,
        }
    }
}

/// A module together with its resolved capability.
#[derive(Clone)]
pub struct ModuleEntry {
    module: Arc<dyn Module>,
    capability: Capability,
}

impl ModuleEntry {
    /// Wrap a scalar input device.
    pub fn input<T: Input + 'static>(device: Arc<T>) -> Self {
        Self {
            module: device.clone(),
            capability: Capability::Input(device),
        }
    }

    /// Wrap a camera.
    pub fn camera<T: Camera + 'static>(device: Arc<T>) -> Self {
        Self {
            module: device.clone(),
            capability: Capability::Camera {
                camera: device.clone(),
                input: device,
            },
        }
    }

    /// Wrap an output device.
    pub fn output<T: Output + 'static>(device: Arc<T>) -> Self {
        Self {
            module: device.clone(),
            capability: Capability::Output(device),
        }
    }

    /// Wrap an axis.
    pub fn axis<T: Axis + 'static>(device: Arc<T>) -> Self {
        Self {
            module: device.clone(),
            capability: Capability::Axis(device),
        }
    }

    /// Wrap an experiment.
    pub fn experiment<T: Experiment + 'static>(experiment: Arc<T>) -> Self {
        Self {
            module: experiment.clone(),
            capability: Capability::Experiment(experiment),
        }
    }

    /// Wrap a module without a typed capability.
    pub fn generic<T: Module + 'static>(module: Arc<T>) -> Self {
        Self {
            module,
            capability: Capability::Generic,
        }
    }

    /// The module.
    pub fn module(&self) -> &Arc<dyn Module> {
        &self.module
    }

    /// The typed capability.
    pub fn capability(&self) -> &Capability {
        &self.capability
    }

    /// Capability tag.
    pub fn kind(&self) -> ModuleKind {
        self.capability.kind()
    }
}

impl fmt::Debug for ModuleEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleEntry")
            .field("name", &self.module.name())
            .field("kind", &self.kind())
            .finish()
    }
}

/// Per-module settings block from configuration.
pub type ModuleSettings = toml::Value;

type HowMany = Box<dyn Fn(&ModuleSettings) -> usize + Send + Sync>;
type Factory = Box<dyn Fn(&ModuleSettings) -> AppResult<ModuleEntry> + Send + Sync>;

struct FactoryEntry {
    how_many: HowMany,
    create: Factory,
}

/// Registry of module factories keyed by type name.
///
/// Each factory declares how many instances to create, since the same
/// driver may drive zero, one or several identical devices on a bus.
///
/// ```rust
/// use fsrs_daq::modules::{ModuleCatalog, ModuleEntry};
/// use fsrs_daq::hardware::mock::DummySensor;
/// use std::sync::Arc;
///
/// let mut catalog = ModuleCatalog::new();
/// catalog.register("dummy_sensor", |_| 2, |_| Ok(ModuleEntry::input(Arc::new(DummySensor::new()?))));
///
/// let modules = catalog.instantiate("dummy_sensor", &toml::Value::Table(Default::default()))?;
/// assert_eq!(modules.len(), 2);
/// # Ok::<(), fsrs_daq::error::DaqError>(())
/// ```
#[derive(Default)]
pub struct ModuleCatalog {
    factories: HashMap<String, FactoryEntry>,
}

impl ModuleCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory together with its multiplicity function.
    pub fn register<H, F>(&mut self, module_type: &str, how_many: H, factory: F)
    where
        H: Fn(&ModuleSettings) -> usize + Send + Sync + 'static,
        F: Fn(&ModuleSettings) -> AppResult<ModuleEntry> + Send + Sync + 'static,
    {
        self.factories.insert(
            module_type.to_string(),
            FactoryEntry {
                how_many: Box::new(how_many),
                create: Box::new(factory),
            },
        );
    }

    /// Creates every instance of `module_type`.
    pub fn instantiate(
        &self,
        module_type: &str,
        settings: &ModuleSettings,
    ) -> AppResult<Vec<ModuleEntry>> {
        let entry = self
            .factories
            .get(module_type)
            .ok_or_else(|| DaqError::UnknownModuleType(module_type.to_string()))?;
        (0..(entry.how_many)(settings))
            .map(|_| (entry.create)(settings))
            .collect()
    }

    /// Whether a type is registered.
    pub fn contains(&self, module_type: &str) -> bool {
        self.factories.contains_key(module_type)
    }

    /// Lists all registered module types.
    pub fn list_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{DummyAxis, DummySensor};

    fn empty_settings() -> ModuleSettings {
        toml::Value::Table(Default::default())
    }

    #[test]
    fn test_entry_resolves_capability_once() {
        let entry = ModuleEntry::axis(Arc::new(DummyAxis::new().unwrap()));
        assert_eq!(entry.kind(), ModuleKind::Axis);
        assert!(matches!(entry.capability(), Capability::Axis(_)));
        assert_eq!(entry.module().name(), "Dummy Axis");
    }

    #[test]
    fn test_catalog_respects_how_many() {
        let mut catalog = ModuleCatalog::new();
        catalog.register(
            "sensor",
            |settings| {
                settings
                    .get("count")
                    .and_then(toml::Value::as_integer)
                    .unwrap_or(1) as usize
            },
            |_| Ok(ModuleEntry::input(Arc::new(DummySensor::new()?))),
        );

        let mut settings = toml::map::Map::new();
        settings.insert("count".into(), toml::Value::Integer(3));
        let created = catalog
            .instantiate("sensor", &toml::Value::Table(settings))
            .unwrap();
        assert_eq!(created.len(), 3);

        let none = catalog.instantiate("sensor", &{
            let mut s = toml::map::Map::new();
            s.insert("count".into(), toml::Value::Integer(0));
            toml::Value::Table(s)
        });
        assert!(none.unwrap().is_empty());
    }

    #[test]
    fn test_unknown_type_is_an_error() {
        let catalog = ModuleCatalog::new();
        assert!(matches!(
            catalog.instantiate("nope", &empty_settings()),
            Err(DaqError::UnknownModuleType(_))
        ));
    }
}
