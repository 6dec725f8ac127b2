//! Module Registry for Runtime Binding
//!
//! The registry holds the authoritative, ordered list of instantiated modules
//! for one controller lifetime:
//!
//! - **Labels**: each module gets a unique label, its name suffixed with an
//!   ordinal (`"Dummy Sensor #2"`) when several instances share a name
//! - **Lookup**: partial case-insensitive label match, first match wins,
//!   memoized
//! - **Capability views**: typed lists (`inputs()`, `cameras()`, `axes()`, ...)
//!   containing only modules whose initialization succeeded
//! - **Leases**: all-or-nothing device reservations taken by a running scan
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       ModuleRegistry                         │
//! │  ┌───────────────┐ ┌───────────────┐ ┌──────────────────┐    │
//! │  │ Dummy Camera  │ │ Dummy Axis    │ │ FSRS Scan        │ ...│
//! │  │ Camera, Ready │ │ Axis, Ready   │ │ Experiment, Ready│    │
//! │  └───────────────┘ └───────────────┘ └──────────────────┘    │
//! ├──────────────────────────────────────────────────────────────┤
//! │   BindingContext: read-only view handed to initialize()     │
//! ├──────────────────────────────────────────────────────────────┤
//! │   DeviceLeases: device label -> experiment holding it       │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{AppResult, DaqError};
use crate::experiment::Experiment;
use crate::hardware::capabilities::{Axis, Camera, Input, Output};
use crate::modules::{Capability, Module, ModuleEntry, ModuleKind, ModuleStatus};
use crate::property::label_matches;

// =============================================================================
// Typed handles
// =============================================================================

/// A capability handle together with the module that provides it.
pub struct Bound<T: ?Sized> {
    label: String,
    device: Arc<T>,
    module: Arc<dyn Module>,
}

impl<T: ?Sized> Bound<T> {
    /// Registry label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Capability view.
    pub fn device(&self) -> &Arc<T> {
        &self.device
    }

    /// Module view (properties, lifecycle).
    pub fn module(&self) -> &Arc<dyn Module> {
        &self.module
    }
}

impl<T: ?Sized> Clone for Bound<T> {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            device: self.device.clone(),
            module: self.module.clone(),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Bound<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bound").field("label", &self.label).finish()
    }
}

// =============================================================================
// Registered modules
// =============================================================================

/// A module as stored in the registry.
pub struct RegisteredModule {
    label: String,
    entry: ModuleEntry,
    status: RwLock<ModuleStatus>,
}

impl RegisteredModule {
    /// Unique label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Module with capability.
    pub fn entry(&self) -> &ModuleEntry {
        &self.entry
    }

    /// Module view.
    pub fn module(&self) -> &Arc<dyn Module> {
        self.entry.module()
    }

    /// Capability tag.
    pub fn kind(&self) -> ModuleKind {
        self.entry.kind()
    }

    /// Status after the last binding pass.
    pub fn status(&self) -> ModuleStatus {
        self.status.read().clone()
    }

    /// Whether the module initialized successfully.
    pub fn is_ready(&self) -> bool {
        self.status.read().is_ready()
    }

    pub(crate) fn set_status(&self, status: ModuleStatus) {
        *self.status.write() = status;
    }
}

impl fmt::Debug for RegisteredModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredModule")
            .field("label", &self.label)
            .field("kind", &self.kind())
            .field("status", &*self.status.read())
            .finish()
    }
}

// =============================================================================
// ModuleRegistry
// =============================================================================

/// Authoritative module list for one controller lifetime.
pub struct ModuleRegistry {
    modules: Vec<RegisteredModule>,
    index: Mutex<HashMap<String, usize>>,
    leases: DeviceLeases,
}

impl ModuleRegistry {
    /// Register modules in load order and assign unique labels.
    pub fn new(entries: Vec<ModuleEntry>) -> Self {
        let mut totals: HashMap<String, usize> = HashMap::new();
        for entry in &entries {
            *totals.entry(entry.module().name().to_string()).or_default() += 1;
        }

        let mut seen: HashMap<String, usize> = HashMap::new();
        let modules = entries
            .into_iter()
            .map(|entry| {
                let name = entry.module().name().to_string();
                let ordinal = {
                    let n = seen.entry(name.clone()).or_default();
                    *n += 1;
                    *n
                };
                let label = if totals.get(&name).copied().unwrap_or(0) > 1 {
                    format!("{name} #{ordinal}")
                } else {
                    name
                };
                RegisteredModule {
                    label,
                    entry,
                    status: RwLock::new(ModuleStatus::Created),
                }
            })
            .collect();

        Self {
            modules,
            index: Mutex::new(HashMap::new()),
            leases: DeviceLeases::default(),
        }
    }

    /// Number of modules.
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Modules in load order.
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredModule> {
        self.modules.iter()
    }

    /// Module at a load-order position.
    pub fn get(&self, position: usize) -> Option<&RegisteredModule> {
        self.modules.get(position)
    }

    fn position(&self, query: &str) -> AppResult<usize> {
        let key = query.to_lowercase();
        if let Some(pos) = self.index.lock().get(&key) {
            return Ok(*pos);
        }
        let pos = self
            .modules
            .iter()
            .position(|m| label_matches(&m.label, &key))
            .ok_or_else(|| DaqError::ModuleNotFound(query.to_string()))?;
        self.index.lock().insert(key, pos);
        Ok(pos)
    }

    /// First module whose label contains `query`, case-insensitively.
    pub fn find(&self, query: &str) -> AppResult<&RegisteredModule> {
        let pos = self.position(query)?;
        Ok(&self.modules[pos])
    }

    /// Load-order position of the module matching `query`.
    pub fn position_of(&self, query: &str) -> AppResult<usize> {
        self.position(query)
    }

    /// Read-only view handed to the module at `position` during binding.
    pub fn binding_context(&self, position: usize) -> BindingContext<'_> {
        BindingContext {
            registry: self,
            position,
        }
    }

    fn collect<T: ?Sized>(
        &self,
        skip: Option<usize>,
        pick: impl Fn(&Capability) -> Option<Arc<T>>,
    ) -> Vec<Bound<T>> {
        self.modules
            .iter()
            .enumerate()
            .filter(|(i, m)| Some(*i) != skip && m.is_ready())
            .filter_map(|(_, m)| {
                pick(m.entry.capability()).map(|device| Bound {
                    label: m.label.clone(),
                    device,
                    module: m.module().clone(),
                })
            })
            .collect()
    }

    /// Ready scalar inputs, cameras included.
    pub fn inputs(&self) -> Vec<Bound<dyn Input>> {
        self.collect(None, pick_input)
    }

    /// Ready cameras.
    pub fn cameras(&self) -> Vec<Bound<dyn Camera>> {
        self.collect(None, pick_camera)
    }

    /// Ready outputs.
    pub fn outputs(&self) -> Vec<Bound<dyn Output>> {
        self.collect(None, pick_output)
    }

    /// Ready axes.
    pub fn axes(&self) -> Vec<Bound<dyn Axis>> {
        self.collect(None, pick_axis)
    }

    /// Ready experiments.
    pub fn experiments(&self) -> Vec<Bound<dyn Experiment>> {
        self.collect(None, |c| match c {
            Capability::Experiment(e) => Some(e.clone()),
            _ => None,
        })
    }

    /// Disable (or re-enable) every module's controls.
    pub fn freeze_all(&self, frozen: bool) {
        for module in &self.modules {
            module.module().properties().freeze(frozen);
        }
    }

    /// Whether every module agrees to quit.
    pub fn can_quit(&self) -> bool {
        self.modules.iter().all(|m| m.module().can_quit())
    }

    /// Device lease table.
    pub fn leases(&self) -> &DeviceLeases {
        &self.leases
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.modules.iter()).finish()
    }
}

fn pick_input(c: &Capability) -> Option<Arc<dyn Input>> {
    match c {
        Capability::Input(i) => Some(i.clone()),
        Capability::Camera { input, .. } => Some(input.clone()),
        _ => None,
    }
}

fn pick_camera(c: &Capability) -> Option<Arc<dyn Camera>> {
    match c {
        Capability::Camera { camera, .. } => Some(camera.clone()),
        _ => None,
    }
}

fn pick_output(c: &Capability) -> Option<Arc<dyn Output>> {
    match c {
        Capability::Output(o) => Some(o.clone()),
        _ => None,
    }
}

fn pick_axis(c: &Capability) -> Option<Arc<dyn Axis>> {
    match c {
        Capability::Axis(a) => Some(a.clone()),
        _ => None,
    }
}

// =============================================================================
// BindingContext
// =============================================================================

/// Read-only registry view passed to `Module::initialize`.
///
/// Capability lists exclude the module being initialized and every module that
/// is not ready.
pub struct BindingContext<'a> {
    registry: &'a ModuleRegistry,
    position: usize,
}

impl<'a> BindingContext<'a> {
    /// Label of the module being initialized.
    pub fn label(&self) -> &str {
        self.registry
            .modules
            .get(self.position)
            .map_or("", |m| m.label.as_str())
    }

    /// Number of modules with the same name loaded before this one.
    ///
    /// Drivers of indistinguishable hardware use this to pick their address.
    pub fn peers_before(&self) -> usize {
        let Some(me) = self.registry.modules.get(self.position) else {
            return 0;
        };
        let name = me.module().name();
        self.registry.modules[..self.position]
            .iter()
            .filter(|m| m.module().name() == name)
            .count()
    }

    /// Ready scalar inputs other than this module.
    pub fn inputs(&self) -> Vec<Bound<dyn Input>> {
        self.registry.collect(Some(self.position), pick_input)
    }

    /// Ready cameras other than this module.
    pub fn cameras(&self) -> Vec<Bound<dyn Camera>> {
        self.registry.collect(Some(self.position), pick_camera)
    }

    /// Ready outputs other than this module.
    pub fn outputs(&self) -> Vec<Bound<dyn Output>> {
        self.registry.collect(Some(self.position), pick_output)
    }

    /// Ready axes other than this module.
    pub fn axes(&self) -> Vec<Bound<dyn Axis>> {
        self.registry.collect(Some(self.position), pick_axis)
    }
}

// =============================================================================
// Device leases
// =============================================================================

/// Per-device reservations held by running experiments.
#[derive(Clone, Default)]
pub struct DeviceLeases {
    held: Arc<Mutex<HashMap<String, String>>>,
}

impl DeviceLeases {
    /// Reserve every device in `devices` for `holder`, or none of them.
    pub fn acquire(&self, holder: &str, devices: &[String]) -> AppResult<LeaseGuard> {
        let mut wanted: Vec<String> = devices.to_vec();
        wanted.sort();
        wanted.dedup();

        let mut held = self.held.lock();
        if let Some((device, owner)) = wanted
            .iter()
            .find_map(|d| held.get(d).map(|owner| (d.clone(), owner.clone())))
        {
            return Err(DaqError::DeviceBusy {
                device,
                holder: owner,
            });
        }
        for device in &wanted {
            held.insert(device.clone(), holder.to_string());
        }

        Ok(LeaseGuard {
            held: self.held.clone(),
            devices: wanted,
        })
    }

    /// Experiment currently holding `device`.
    pub fn holder(&self, device: &str) -> Option<String> {
        self.held.lock().get(device).cloned()
    }
}

/// Releases its devices when dropped.
pub struct LeaseGuard {
    held: Arc<Mutex<HashMap<String, String>>>,
    devices: Vec<String>,
}

impl LeaseGuard {
    /// Devices covered by this lease.
    pub fn devices(&self) -> &[String] {
        &self.devices
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let mut held = self.held.lock();
        for device in &self.devices {
            held.remove(device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{DummyAxis, DummyCamera, DummySensor, DummyShutter};

    fn registry() -> ModuleRegistry {
        ModuleRegistry::new(vec![
            ModuleEntry::camera(Arc::new(DummyCamera::new().unwrap())),
            ModuleEntry::input(Arc::new(DummySensor::new().unwrap())),
            ModuleEntry::input(Arc::new(DummySensor::new().unwrap())),
            ModuleEntry::axis(Arc::new(DummyAxis::new().unwrap())),
            ModuleEntry::output(Arc::new(DummyShutter::new().unwrap())),
        ])
    }

    fn mark_all_ready(registry: &ModuleRegistry) {
        for module in registry.iter() {
            module.set_status(ModuleStatus::Ready);
        }
    }

    #[test]
    fn test_duplicate_names_get_ordinals() {
        let registry = registry();
        let labels: Vec<_> = registry.iter().map(|m| m.label().to_string()).collect();
        assert_eq!(
            labels,
            vec![
                "Dummy Camera",
                "Dummy Sensor #1",
                "Dummy Sensor #2",
                "Dummy Axis",
                "Dummy Shutter"
            ]
        );
    }

    #[test]
    fn test_find_partial_case_insensitive() {
        let registry = registry();
        assert_eq!(registry.find("sensor").unwrap().label(), "Dummy Sensor #1");
        assert_eq!(registry.find("SENSOR #2").unwrap().label(), "Dummy Sensor #2");
        assert!(matches!(
            registry.find("laser"),
            Err(DaqError::ModuleNotFound(_))
        ));
    }

    #[test]
    fn test_capability_views_only_list_ready_modules() {
        let registry = registry();
        assert!(registry.inputs().is_empty());

        mark_all_ready(&registry);
        registry
            .find("sensor #2")
            .unwrap()
            .set_status(ModuleStatus::Failed("no answer".into()));

        let inputs: Vec<_> = registry.inputs().iter().map(|b| b.label().to_string()).collect();
        assert_eq!(inputs, vec!["Dummy Camera", "Dummy Sensor #1"]);
        assert_eq!(registry.cameras().len(), 1);
        assert_eq!(registry.axes().len(), 1);
        assert_eq!(registry.outputs().len(), 1);
    }

    #[test]
    fn test_binding_context_counts_peers_and_excludes_self() {
        let registry = registry();
        mark_all_ready(&registry);

        let second_sensor = registry.binding_context(2);
        assert_eq!(second_sensor.label(), "Dummy Sensor #2");
        assert_eq!(second_sensor.peers_before(), 1);
        let labels: Vec<_> = second_sensor
            .inputs()
            .iter()
            .map(|b| b.label().to_string())
            .collect();
        assert!(!labels.contains(&"Dummy Sensor #2".to_string()));

        assert_eq!(registry.binding_context(1).peers_before(), 0);
    }

    #[test]
    fn test_leases_are_all_or_nothing() {
        let leases = DeviceLeases::default();
        let first = leases
            .acquire("FSRS Scan", &["Dummy Axis".into(), "Dummy Camera".into()])
            .unwrap();

        let err = leases
            .acquire("DAQ Scan", &["Dummy Sensor".into(), "Dummy Axis".into()])
            .err()
            .unwrap();
        assert!(matches!(err, DaqError::DeviceBusy { ref holder, .. } if holder == "FSRS Scan"));
        // nothing from the failed request was reserved
        assert_eq!(leases.holder("Dummy Sensor"), None);

        drop(first);
        assert_eq!(leases.holder("Dummy Axis"), None);
        assert!(leases.acquire("DAQ Scan", &["Dummy Axis".into()]).is_ok());
    }

    #[test]
    fn test_duplicate_devices_in_one_request() {
        let leases = DeviceLeases::default();
        let guard = leases
            .acquire("FSRS Scan", &["Dummy Camera".into(), "Dummy Camera".into()])
            .unwrap();
        assert_eq!(guard.devices().len(), 1);
    }
}
