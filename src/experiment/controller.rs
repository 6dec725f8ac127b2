//! Controller: owns the module registry and every experiment's scan runner.
//!
//! The controller is the single writer of controller-side state. Scan tasks
//! report through one shared event channel and the controller applies those
//! events in order, through [`Controller::process_pending`] or while waiting
//! in [`Controller::wait_finished`].
//!
//! # Loading
//!
//! Enabled module definitions are instantiated through the catalog, devices
//! before experiments, and initialized in that order. A module whose
//! `initialize` fails is marked [`ModuleStatus::Failed`] and left out of every
//! capability list; loading carries on with the rest.
//!
//! # Freezing
//!
//! While any scan is active, every control of every module is disabled except
//! the start control of each running experiment (captioned "STOP").

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, ModuleDefinition};
use crate::error::{AppResult, DaqError, DeviceError};
use crate::experiment::events::{ScanEvent, ScanMessage, ScanSummary};
use crate::experiment::runner::{ScanRunner, StartOutcome};
use crate::experiment::state::ScanState;
use crate::experiment::{Experiment, START_EVENT};
use crate::hardware::registry::ModuleRegistry;
use crate::modules::catalog::OUTPUT_DIR_KEY;
use crate::modules::{
    builtin_catalog, Capability, Module, ModuleCatalog, ModuleSettings, ModuleStatus,
};
use crate::property::{label_matches, PropertyValue};

/// Orchestrates modules and their scans.
pub struct Controller {
    config: AppConfig,
    catalog: ModuleCatalog,
    registry: ModuleRegistry,
    runners: HashMap<String, ScanRunner>,
    summaries: HashMap<String, ScanSummary>,
    events_tx: mpsc::Sender<ScanMessage>,
    events_rx: mpsc::Receiver<ScanMessage>,
}

impl Controller {
    /// Load `config` with the built-in catalog.
    pub async fn from_config(config: AppConfig) -> AppResult<Self> {
        Self::load(config, builtin_catalog()).await
    }

    /// Validate `config`, instantiate its modules from `catalog` and bind them.
    pub async fn load(config: AppConfig, catalog: ModuleCatalog) -> AppResult<Self> {
        config.validate().map_err(DaqError::Configuration)?;
        let registry = build_registry(&config, &catalog)?;
        bind(&registry).await;

        let (events_tx, events_rx) = mpsc::channel(config.timing.event_channel_capacity);
        info!(
            modules = registry.len(),
            ready = registry.iter().filter(|m| m.is_ready()).count(),
            "controller loaded"
        );
        Ok(Self {
            config,
            catalog,
            registry,
            runners: HashMap::new(),
            summaries: HashMap::new(),
            events_tx,
            events_rx,
        })
    }

    /// Stop everything, shut modules down and rebuild the registry from the
    /// same configuration.
    pub async fn reload(&mut self) -> AppResult<()> {
        self.shutdown().await?;
        let registry = build_registry(&self.config, &self.catalog)?;
        bind(&registry).await;
        self.registry = registry;
        self.runners.clear();
        self.summaries.clear();
        info!(modules = self.registry.len(), "controller reloaded");
        Ok(())
    }

    /// Active configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Loaded modules.
    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// Labels of ready experiments, in load order.
    pub fn experiment_labels(&self) -> Vec<String> {
        self.registry
            .experiments()
            .iter()
            .map(|e| e.label().to_string())
            .collect()
    }

    /// Resolve `query` to a ready experiment.
    fn experiment(&self, query: &str) -> AppResult<(String, Arc<dyn Experiment>)> {
        let module = self.registry.find(query)?;
        let Capability::Experiment(experiment) = module.entry().capability() else {
            return Err(DaqError::NotAnExperiment(module.label().to_string()));
        };
        if !module.is_ready() {
            return Err(DaqError::Device(DeviceError::NotReady {
                device: module.label().to_string(),
            }));
        }
        Ok((module.label().to_string(), experiment.clone()))
    }

    fn experiment_by_label(&self, label: &str) -> Option<Arc<dyn Experiment>> {
        self.registry
            .iter()
            .find(|m| m.label() == label)
            .and_then(|m| match m.entry().capability() {
                Capability::Experiment(experiment) => Some(experiment.clone()),
                _ => None,
            })
    }

    fn runner(&mut self, label: &str) -> &mut ScanRunner {
        let events = &self.events_tx;
        let config = &self.config;
        self.runners.entry(label.to_string()).or_insert_with(|| {
            ScanRunner::new(
                label,
                events.clone(),
                config.timing.clone(),
                config.stage.clone(),
            )
        })
    }

    fn is_active(&self, label: &str) -> bool {
        self.runners.get(label).is_some_and(ScanRunner::is_active)
    }

    /// Start the experiment matching `query`.
    pub fn start(&mut self, query: &str) -> AppResult<StartOutcome> {
        let (label, experiment) = self.experiment(query)?;
        let leases = self.registry.leases().clone();
        let outcome = self.runner(&label).start(&experiment, &leases);
        match &outcome {
            Ok(StartOutcome::Started(run_id)) => {
                info!(experiment = %label, %run_id, "scan started");
            }
            Ok(StartOutcome::AlreadyRunning) => {}
            Err(e) => warn!(experiment = %label, error = %e, "scan not started"),
        }
        self.reconcile_freeze();
        outcome
    }

    /// Request a stop; returns whether a running scan was signalled.
    pub fn stop(&mut self, query: &str) -> AppResult<bool> {
        let (label, _) = self.experiment(query)?;
        Ok(self.runners.get_mut(&label).is_some_and(ScanRunner::stop))
    }

    /// Start when idle, stop when running. Returns the start outcome, or
    /// `None` when a stop was requested.
    pub fn toggle(&mut self, query: &str) -> AppResult<Option<StartOutcome>> {
        let (label, _) = self.experiment(query)?;
        if self.is_active(&label) {
            self.stop(&label)?;
            Ok(None)
        } else {
            self.start(&label).map(Some)
        }
    }

    /// Scan state of the experiment matching `query`.
    pub fn state(&self, query: &str) -> AppResult<ScanState> {
        let (label, _) = self.experiment(query)?;
        Ok(self
            .runners
            .get(&label)
            .map_or(ScanState::Idle, ScanRunner::state))
    }

    /// Summary of the last finished scan of `query`.
    pub fn last_summary(&self, query: &str) -> AppResult<Option<ScanSummary>> {
        let (label, _) = self.experiment(query)?;
        Ok(self.summaries.get(&label).cloned())
    }

    /// Set a property on behalf of the UI and run its handler when the value
    /// changed. Returns whether it changed.
    pub fn set_property(
        &mut self,
        module_query: &str,
        property_query: &str,
        value: impl Into<PropertyValue>,
    ) -> AppResult<bool> {
        let (label, module) = {
            let registered = self.registry.find(module_query)?;
            (registered.label().to_string(), registered.module().clone())
        };
        let properties = module.properties();
        let changed = properties.set_from_ui(property_query, value)?;
        if changed {
            if let Some(event) = properties.event(property_query)? {
                self.dispatch(&label, module.as_ref(), &event)?;
            }
        }
        Ok(changed)
    }

    /// Press a button (or fire any control's handler) on behalf of the UI.
    pub fn trigger(&mut self, module_query: &str, property_query: &str) -> AppResult<()> {
        let (label, module) = {
            let registered = self.registry.find(module_query)?;
            (registered.label().to_string(), registered.module().clone())
        };
        let view = module
            .properties()
            .describe()
            .into_iter()
            .find(|v| label_matches(&v.label, property_query))
            .ok_or_else(|| DaqError::PropertyNotFound(property_query.to_string()))?;
        if !view.enabled {
            return Err(DaqError::invalid(
                &view.label,
                "control is disabled while a scan is running",
            ));
        }
        match module.properties().event(property_query)? {
            Some(event) => self.dispatch(&label, module.as_ref(), &event),
            None => Ok(()),
        }
    }

    fn dispatch(&mut self, label: &str, module: &dyn Module, event: &str) -> AppResult<()> {
        debug!(module = %label, event, "dispatching handler");
        if event == START_EVENT {
            self.toggle(label).map(|_| ())
        } else {
            module.handle_event(event)
        }
    }

    /// Apply every queued scan event; returns how many were applied.
    pub async fn process_pending(&mut self) -> AppResult<usize> {
        let mut applied = 0;
        while let Ok(message) = self.events_rx.try_recv() {
            self.apply(message).await?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Wait for the next scan event, apply it and hand it back.
    pub async fn next_event(&mut self) -> AppResult<ScanMessage> {
        let message = self
            .events_rx
            .recv()
            .await
            .ok_or_else(|| DaqError::ScanTask("controller event channel closed".to_string()))?;
        self.apply(message.clone()).await?;
        Ok(message)
    }

    /// Apply events until the scan of `query` has finished, then return its
    /// summary.
    pub async fn wait_finished(&mut self, query: &str) -> AppResult<ScanSummary> {
        let (label, _) = self.experiment(query)?;
        self.wait_label(&label).await
    }

    async fn wait_label(&mut self, label: &str) -> AppResult<ScanSummary> {
        while self.is_active(label) {
            let message = self
                .events_rx
                .recv()
                .await
                .ok_or_else(|| DaqError::ScanTask("controller event channel closed".to_string()))?;
            self.apply(message).await?;
        }
        self.summaries
            .get(label)
            .cloned()
            .ok_or_else(|| DaqError::ScanTask(format!("'{label}' has not run")))
    }

    async fn apply(&mut self, message: ScanMessage) -> AppResult<()> {
        let label = message.experiment;
        let Some(experiment) = self.experiment_by_label(&label) else {
            warn!(experiment = %label, "event for unknown experiment dropped");
            return Ok(());
        };

        match message.event {
            ScanEvent::Started { run_id } => {
                debug!(experiment = %label, %run_id, "scan task running");
            }
            ScanEvent::Update(update) => {
                if let Err(e) = experiment.on_update(&update) {
                    error!(
                        experiment = %label,
                        set = update.set,
                        point = ?update.point,
                        error = %e,
                        "update not applied"
                    );
                }
            }
            ScanEvent::Status { text } => {
                if let Err(e) = experiment.on_status(&text) {
                    warn!(experiment = %label, error = %e, "status not shown");
                }
            }
            ScanEvent::Finished(summary) => {
                if let Err(e) = experiment.on_finished(&summary) {
                    error!(experiment = %label, error = %e, "scan results not saved");
                }
                if let Some(runner) = self.runners.get_mut(&label) {
                    runner.finish(experiment.as_ref()).await?;
                }
                self.summaries.insert(label, summary);
                self.reconcile_freeze();
            }
        }
        Ok(())
    }

    /// Freeze every control while scans run, leaving each running
    /// experiment's start control usable.
    fn reconcile_freeze(&self) {
        let active: Vec<&str> = self
            .runners
            .iter()
            .filter(|(_, runner)| runner.is_active())
            .map(|(label, _)| label.as_str())
            .collect();
        if active.is_empty() {
            self.registry.freeze_all(false);
            return;
        }

        self.registry.freeze_all(true);
        for label in active {
            if let Some(experiment) = self.experiment_by_label(label) {
                let control = experiment.start_control();
                if let Err(e) = experiment.properties().set_enabled(control, true) {
                    warn!(experiment = %label, error = %e, "start control not found");
                }
            }
        }
    }

    /// Whether no scan is running and every module agrees to quit.
    pub fn can_quit(&self) -> bool {
        !self.runners.values().any(ScanRunner::is_active) && self.registry.can_quit()
    }

    /// Stop and join running scans, then shut every module down.
    ///
    /// Every module is asked even when an earlier one fails; the failures are
    /// returned together.
    pub async fn shutdown(&mut self) -> AppResult<()> {
        let active: Vec<String> = self
            .runners
            .iter()
            .filter(|(_, runner)| runner.is_active())
            .map(|(label, _)| label.clone())
            .collect();
        for label in &active {
            if let Some(runner) = self.runners.get_mut(label) {
                runner.stop();
            }
        }
        for label in &active {
            self.wait_label(label).await?;
        }

        let mut failures = Vec::new();
        for module in self.registry.iter() {
            if let Err(e) = module.module().shutdown().await {
                error!(module = module.label(), error = %e, "shutdown failed");
                failures.push(e);
            }
        }
        if failures.is_empty() {
            info!("controller shut down");
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(failures))
        }
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("registry", &self.registry)
            .field("runners", &self.runners)
            .finish_non_exhaustive()
    }
}

/// Definition settings with the controller-wide defaults filled in.
fn module_settings(config: &AppConfig, definition: &ModuleDefinition) -> ModuleSettings {
    let mut settings = definition.effective_settings();
    if let toml::Value::Table(table) = &mut settings {
        table
            .entry(OUTPUT_DIR_KEY)
            .or_insert_with(|| {
                toml::Value::String(config.storage.output_dir.to_string_lossy().into_owned())
            });
        table.entry("settle_frames").or_insert_with(|| {
            toml::Value::Integer(i64::try_from(config.timing.settle_frames).unwrap_or(i64::MAX))
        });
        table
            .entry("frame_retry_limit")
            .or_insert_with(|| toml::Value::Integer(i64::from(config.timing.frame_retry_limit)));
    }
    settings
}

fn build_registry(config: &AppConfig, catalog: &ModuleCatalog) -> AppResult<ModuleRegistry> {
    let mut entries = Vec::new();
    for definition in config.enabled_modules() {
        let settings = module_settings(config, definition);
        let created = catalog.instantiate(&definition.r#type, &settings)?;
        debug!(module_type = %definition.r#type, instances = created.len(), "modules created");
        entries.extend(created);
    }
    Ok(ModuleRegistry::new(entries))
}

/// Initialize every module in load order.
async fn bind(registry: &ModuleRegistry) {
    for position in 0..registry.len() {
        let Some(module) = registry.get(position) else {
            continue;
        };
        match module
            .module()
            .initialize(&registry.binding_context(position))
            .await
        {
            Ok(()) => {
                module.set_status(ModuleStatus::Ready);
                debug!(module = module.label(), kind = %module.kind(), "module ready");
            }
            Err(e) => {
                warn!(module = module.label(), error = %e, "module failed to initialize");
                module.set_status(ModuleStatus::Failed(e.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModuleCategory, ModuleDefinition, StorageConfig, TimingConfig};
    use crate::experiment::events::ScanOutcome;
    use std::path::Path;
    use tracing_test::traced_test;

    fn definition(category: ModuleCategory, module_type: &str, settings: &str) -> ModuleDefinition {
        let mut definition = ModuleDefinition::new(category, module_type);
        definition.settings = toml::from_str(settings).unwrap();
        definition
    }

    fn config(dir: &Path, extra: Vec<ModuleDefinition>) -> AppConfig {
        let mut modules = vec![
            definition(ModuleCategory::Device, "dummy_camera", "width = 8\nsettle_frames = 0"),
            definition(ModuleCategory::Device, "dummy_sensor", ""),
            definition(ModuleCategory::Device, "dummy_axis", ""),
            definition(ModuleCategory::Device, "dummy_shutter", ""),
            definition(ModuleCategory::Experiment, "daq_scan", ""),
            definition(ModuleCategory::Experiment, "fsrs_acquire", ""),
        ];
        modules.extend(extra);
        AppConfig {
            timing: TimingConfig::immediate(),
            storage: StorageConfig {
                output_dir: dir.to_path_buf(),
            },
            modules,
            ..AppConfig::default()
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_experiments_see_only_ready_devices() {
        let dir = tempfile::tempdir().unwrap();
        let extra = vec![definition(
            ModuleCategory::Device,
            "dummy_lock_in",
            "identity = \"Acme,LIA-9\"",
        )];
        let controller = Controller::from_config(config(dir.path(), extra)).await.unwrap();

        let lock_in = controller.registry().find("lock-in").unwrap();
        assert!(matches!(lock_in.status(), ModuleStatus::Failed(_)));
        assert!(logs_contain("module failed to initialize"));

        let choices = controller
            .registry()
            .find("daq scan")
            .unwrap()
            .module()
            .properties()
            .describe()
            .into_iter()
            .find(|v| v.label == "DAQ")
            .unwrap()
            .choices;
        assert_eq!(choices, vec!["Dummy Camera", "Dummy Sensor"]);
        assert_eq!(controller.experiment_labels(), vec!["DAQ Scan", "FSRS Acquire"]);
    }

    #[tokio::test]
    async fn test_scan_runs_to_completion_and_saves() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = Controller::from_config(config(dir.path(), vec![])).await.unwrap();
        controller.set_property("dummy sensor", "offset", "5").unwrap();
        controller.set_property("daq scan", "daq", 1i64).unwrap();
        controller.set_property("daq scan", "till", "3").unwrap();

        controller.trigger("daq scan", "start").unwrap();
        let summary = controller.wait_finished("daq scan").await.unwrap();
        assert_eq!(summary.outcome, ScanOutcome::Completed);
        assert_eq!(controller.state("daq scan").unwrap(), ScanState::Idle);

        controller.trigger("daq scan", "save scan").unwrap();
        let saved = std::fs::read_to_string(dir.path().join("daq_scan.dat")).unwrap();
        assert_eq!(saved.lines().count(), 4);
        assert!(controller.can_quit());
    }

    #[tokio::test]
    async fn test_running_scan_freezes_other_controls() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = Controller::from_config(config(dir.path(), vec![])).await.unwrap();
        controller.set_property("fsrs acquire", "frames", 4i64).unwrap();
        controller.set_property("fsrs acquire", "continuous", true).unwrap();

        assert!(matches!(
            controller.start("fsrs acquire").unwrap(),
            StartOutcome::Started(_)
        ));
        assert_eq!(
            controller.start("fsrs acquire").unwrap(),
            StartOutcome::AlreadyRunning
        );
        assert!(!controller.can_quit());

        let err = controller.set_property("dummy sensor", "offset", "1").unwrap_err();
        assert!(matches!(err, DaqError::InvalidValue { .. }));
        let busy = controller.start("daq scan").unwrap_err();
        assert!(matches!(busy, DaqError::DeviceBusy { .. }));

        let acquire = controller.registry().find("fsrs acquire").unwrap().module().clone();
        assert_eq!(acquire.properties().value("start").unwrap().as_text(), "STOP");

        // the start control stays live and now stops the scan
        controller.trigger("fsrs acquire", "start").unwrap();
        let summary = controller.wait_finished("fsrs acquire").await.unwrap();
        assert_eq!(summary.outcome, ScanOutcome::Cancelled);
        assert_eq!(acquire.properties().value("start").unwrap().as_text(), "Acquire");
        assert!(controller.set_property("dummy sensor", "offset", "1").unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_joins_running_scans() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = Controller::from_config(config(dir.path(), vec![])).await.unwrap();
        controller.set_property("fsrs acquire", "frames", 4i64).unwrap();
        controller.set_property("fsrs acquire", "continuous", true).unwrap();
        controller.start("fsrs acquire").unwrap();

        controller.shutdown().await.unwrap();
        assert_eq!(controller.state("fsrs acquire").unwrap(), ScanState::Idle);
        assert_eq!(
            controller.last_summary("fsrs acquire").unwrap().map(|s| s.outcome),
            Some(ScanOutcome::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        let unknown = config(
            dir.path(),
            vec![definition(ModuleCategory::Device, "flux_capacitor", "")],
        );
        assert!(matches!(
            Controller::from_config(unknown).await,
            Err(DaqError::UnknownModuleType(_))
        ));

        let mut invalid = config(dir.path(), vec![]);
        invalid.timing.event_channel_capacity = 0;
        assert!(matches!(
            Controller::from_config(invalid).await,
            Err(DaqError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_devices_are_not_experiments() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = Controller::from_config(config(dir.path(), vec![])).await.unwrap();
        assert!(matches!(
            controller.start("dummy axis"),
            Err(DaqError::NotAnExperiment(_))
        ));
        assert!(matches!(
            controller.start("nothing here"),
            Err(DaqError::ModuleNotFound(_))
        ));
    }
}
