//! Device-setting guards for scan tasks.
//!
//! A scan that speeds up a collaborator (a lock-in's per-read wait time, for
//! instance) must put the old setting back however the scan ends: normal
//! completion, cancellation, error or panic. [`SettingGuard`] records the
//! value on creation and writes it back on drop.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::AppResult;
use crate::modules::Module;
use crate::property::PropertyValue;

/// Label fragment of the per-read wait property on input devices.
pub const WAIT_PROPERTY: &str = "wait";

/// RAII guard that overrides one property and restores it on drop.
pub struct SettingGuard {
    module: Arc<dyn Module>,
    query: String,
    saved: Option<PropertyValue>,
}

impl SettingGuard {
    /// Override `query` on `module` with `value`.
    ///
    /// A module without a matching property yields a disarmed guard; the
    /// override is optional for collaborators that do not expose the setting.
    pub fn override_value(
        module: Arc<dyn Module>,
        query: &str,
        value: impl Into<PropertyValue>,
    ) -> AppResult<Self> {
        let properties = module.properties();
        let saved = if properties.has(query) {
            let previous = properties.value(query)?;
            properties.set_value(query, value)?;
            debug!(module = module.name(), query, %previous, "setting overridden for scan");
            Some(previous)
        } else {
            None
        };
        Ok(Self {
            module,
            query: query.to_string(),
            saved,
        })
    }

    /// Zero the per-read wait time of an input device for the duration of a scan.
    pub fn zero_wait_time(module: Arc<dyn Module>) -> AppResult<Self> {
        Self::override_value(module, WAIT_PROPERTY, "0")
    }

    /// Whether a value will be restored on drop.
    pub fn is_armed(&self) -> bool {
        self.saved.is_some()
    }
}

impl Drop for SettingGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.saved.take() {
            if let Err(e) = self.module.properties().set_value(&self.query, previous) {
                warn!(module = self.module.name(), query = %self.query, error = %e, "failed to restore setting");
            }
        }
    }
}

impl std::fmt::Debug for SettingGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingGuard")
            .field("module", &self.module.name())
            .field("query", &self.query)
            .field("saved", &self.saved)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{DummyAxis, DummySensor};

    #[test]
    fn test_wait_time_restored_on_drop() {
        let sensor = Arc::new(DummySensor::new().unwrap());
        sensor.properties().set_value("wait", "0.25").unwrap();

        {
            let guard = SettingGuard::zero_wait_time(sensor.clone()).unwrap();
            assert!(guard.is_armed());
            assert_eq!(sensor.properties().value("wait").unwrap().as_f64(), Some(0.0));
        }

        assert_eq!(
            sensor.properties().value("wait").unwrap(),
            PropertyValue::Text("0.25".into())
        );
    }

    #[test]
    fn test_wait_time_restored_on_panic() {
        let sensor = Arc::new(DummySensor::new().unwrap());
        sensor.properties().set_value("wait", "1.5").unwrap();

        let held = sensor.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = SettingGuard::zero_wait_time(held).unwrap();
            panic!("acquisition blew up");
        }));

        assert!(result.is_err());
        assert_eq!(sensor.properties().value("wait").unwrap().as_f64(), Some(1.5));
    }

    #[test]
    fn test_missing_property_is_disarmed() {
        let axis = Arc::new(DummyAxis::new().unwrap());
        let guard = SettingGuard::zero_wait_time(axis).unwrap();
        assert!(!guard.is_armed());
    }
}
