//! Built-in module factories.
//!
//! Settings are the `[modules.settings]` table of a definition after the
//! controller merged in its defaults:
//!
//! | Key | Used by | Meaning |
//! |---|---|---|
//! | `count` | every type | instances to create (default 1) |
//! | `width` | `dummy_camera` | pixel count |
//! | `settle_frames` | `dummy_camera` | leading frames discarded per burst |
//! | `frame_retry_limit` | `dummy_camera` | attempts before a placeholder frame |
//! | `phase_flip` | `dummy_camera` | swap chopping channels |
//! | `identity` | `dummy_lock_in` | identification reply |
//! | `output_dir` | experiments | default directory of saved files |

use std::sync::Arc;

use crate::error::AppResult;
use crate::experiment::protocols::{
    DaqMonitor, DaqScan, FsrsAcquire, FsrsScan, GridOptimize, XcScan,
};
use crate::hardware::chopper::ChopperSettings;
use crate::hardware::mock::{
    DummyAxis, DummyCamera, DummyLockIn, DummySensor, DummyShutter, DummyValve,
    DUMMY_CAMERA_WIDTH, LOCK_IN_MODEL,
};
use crate::modules::{ModuleCatalog, ModuleEntry, ModuleSettings};

/// Settings key holding the output directory of experiments.
pub const OUTPUT_DIR_KEY: &str = "output_dir";

fn integer(settings: &ModuleSettings, key: &str) -> Option<i64> {
    settings.get(key).and_then(toml::Value::as_integer)
}

fn text<'a>(settings: &'a ModuleSettings, key: &str) -> Option<&'a str> {
    settings.get(key).and_then(toml::Value::as_str)
}

fn count(settings: &ModuleSettings) -> usize {
    integer(settings, "count")
        .and_then(|n| usize::try_from(n).ok())
        .unwrap_or(1)
}

fn output_dir(settings: &ModuleSettings) -> &str {
    text(settings, OUTPUT_DIR_KEY).unwrap_or(".")
}

fn chopper(settings: &ModuleSettings) -> ChopperSettings {
    let defaults = ChopperSettings::default();
    ChopperSettings {
        settle_frames: integer(settings, "settle_frames")
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(defaults.settle_frames),
        max_attempts: integer(settings, "frame_retry_limit")
            .and_then(|n| u32::try_from(n).ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.max_attempts),
        phase_flip: settings
            .get("phase_flip")
            .and_then(toml::Value::as_bool)
            .unwrap_or(defaults.phase_flip),
    }
}

fn camera(settings: &ModuleSettings) -> AppResult<ModuleEntry> {
    let width = integer(settings, "width")
        .and_then(|n| usize::try_from(n).ok())
        .filter(|n| *n > 0)
        .unwrap_or(DUMMY_CAMERA_WIDTH);
    Ok(ModuleEntry::camera(Arc::new(DummyCamera::with_settings(
        width,
        chopper(settings),
    )?)))
}

/// Catalog of every module shipped with the crate.
pub fn builtin_catalog() -> ModuleCatalog {
    let mut catalog = ModuleCatalog::new();

    catalog.register("dummy_camera", count, camera);
    catalog.register("dummy_sensor", count, |_| {
        Ok(ModuleEntry::input(Arc::new(DummySensor::new()?)))
    });
    catalog.register("dummy_axis", count, |_| {
        Ok(ModuleEntry::axis(Arc::new(DummyAxis::new()?)))
    });
    catalog.register("dummy_valve", count, |_| {
        Ok(ModuleEntry::axis(Arc::new(DummyValve::new()?)))
    });
    catalog.register("dummy_shutter", count, |_| {
        Ok(ModuleEntry::output(Arc::new(DummyShutter::new()?)))
    });
    catalog.register("dummy_lock_in", count, |settings| {
        let identity = text(settings, "identity")
            .map(str::to_string)
            .unwrap_or_else(|| format!("Stanford_Research_Systems,{LOCK_IN_MODEL}"));
        Ok(ModuleEntry::input(Arc::new(DummyLockIn::new(identity)?)))
    });

    catalog.register("fsrs_scan", count, |settings| {
        let scan = FsrsScan::new()?.with_output_dir(output_dir(settings))?;
        Ok(ModuleEntry::experiment(Arc::new(scan)))
    });
    catalog.register("fsrs_acquire", count, |settings| {
        let acquire = FsrsAcquire::new()?.with_output_dir(output_dir(settings))?;
        Ok(ModuleEntry::experiment(Arc::new(acquire)))
    });
    catalog.register("xc_scan", count, |settings| {
        let scan = XcScan::new()?.with_output_dir(output_dir(settings))?;
        Ok(ModuleEntry::experiment(Arc::new(scan)))
    });
    catalog.register("daq_scan", count, |settings| {
        let scan = DaqScan::new()?.with_output_dir(output_dir(settings))?;
        Ok(ModuleEntry::experiment(Arc::new(scan)))
    });
    catalog.register("daq_monitor", count, |settings| {
        let monitor = DaqMonitor::new()?.with_output_dir(output_dir(settings))?;
        Ok(ModuleEntry::experiment(Arc::new(monitor)))
    });
    catalog.register("grid_optimize", count, |settings| {
        let optimize = GridOptimize::new()?.with_output_dir(output_dir(settings))?;
        Ok(ModuleEntry::experiment(Arc::new(optimize)))
    });

    catalog
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::ModuleKind;

    fn settings(text: &str) -> ModuleSettings {
        toml::from_str(text).unwrap()
    }

    #[test]
    fn test_every_builtin_type_is_listed() {
        let catalog = builtin_catalog();
        assert_eq!(
            catalog.list_types(),
            vec![
                "daq_monitor",
                "daq_scan",
                "dummy_axis",
                "dummy_camera",
                "dummy_lock_in",
                "dummy_sensor",
                "dummy_shutter",
                "dummy_valve",
                "fsrs_acquire",
                "fsrs_scan",
                "grid_optimize",
                "xc_scan",
            ]
        );
    }

    #[test]
    fn test_count_controls_multiplicity() {
        let catalog = builtin_catalog();
        let lock_ins = catalog
            .instantiate("dummy_lock_in", &settings("count = 3"))
            .unwrap();
        assert_eq!(lock_ins.len(), 3);
        assert!(lock_ins.iter().all(|e| e.kind() == ModuleKind::Input));

        let none = catalog.instantiate("dummy_axis", &settings("count = 0")).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_experiments_receive_output_dir() {
        let catalog = builtin_catalog();
        let entries = catalog
            .instantiate("daq_scan", &settings("output_dir = \"runs\""))
            .unwrap();
        let save_to = entries[0]
            .module()
            .properties()
            .value("save to")
            .unwrap()
            .as_text();
        assert_eq!(
            std::path::PathBuf::from(save_to),
            std::path::Path::new("runs").join("daq_scan.dat")
        );
    }

    #[test]
    fn test_camera_settings_are_applied() {
        let parsed = settings("width = 16\nsettle_frames = 2\nframe_retry_limit = 0\nphase_flip = true");
        let policy = chopper(&parsed);
        assert_eq!(policy.settle_frames, 2);
        assert_eq!(policy.max_attempts, ChopperSettings::default().max_attempts);
        assert!(policy.phase_flip);

        let entry = camera(&parsed).unwrap();
        assert_eq!(entry.kind(), ModuleKind::Camera);
        assert_eq!(
            entry.module().properties().value("phase").unwrap().as_index(),
            Some(1)
        );
    }
}
