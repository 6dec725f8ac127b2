//! Custom error types for the application.
//!
//! Two enums split the error surface along the hardware boundary:
//!
//! - **`DeviceError`** is what a driver returns from a capability call
//!   (`read`, `write`, `goto`, `read_n_frames`). Scan protocols decide whether a
//!   device error aborts the scan or is logged and skipped.
//! - **`DaqError`** is the application-level error: configuration, property
//!   validation, module lookup, scan lifecycle and persistence failures. Device
//!   errors convert into it with `?`.
//!
//! A driver that is not connected returns [`DeviceError::NotReady`] instead of a
//! placeholder value, so a genuine zero reading can never be confused with a
//! missing one.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Convenience alias for results returned by device capability calls.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Errors raised by device drivers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// The device has not been connected or initialized.
    #[error("Device '{device}' is not ready")]
    NotReady {
        /// Module label of the device
        device: String,
    },

    /// The wrong instrument answered an identification query.
    #[error("Identification mismatch: expected '{expected}', device answered '{found}'")]
    IdentificationMismatch {
        /// Model string the driver expects
        expected: String,
        /// Identification string actually returned
        found: String,
    },

    /// Transport-level failure (serial, GPIB, SDK call).
    #[error("Communication error: {0}")]
    Communication(String),

    /// The device rejected a command or value.
    #[error("Device rejected command: {0}")]
    Rejected(String),

    /// No complete acquisition within the retry limit.
    #[error("Device '{device}' gave no complete acquisition after {attempts} attempts")]
    AcquisitionFailed {
        /// Module label of the device
        device: String,
        /// Attempts made before giving up
        attempts: u32,
    },
}

/// Application error type.
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("Invalid value for '{label}': {reason}")]
    InvalidValue {
        /// Property label
        label: String,
        /// Why the value was rejected
        reason: String,
    },

    #[error("Property label not found: {0}")]
    PropertyNotFound(String),

    #[error("Malformed property definition: {0}")]
    PropertyDefinition(String),

    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Module '{0}' is not an experiment")]
    NotAnExperiment(String),

    #[error("Unknown module type '{0}'")]
    UnknownModuleType(String),

    #[error("No {capability} selected for '{experiment}'")]
    CollaboratorMissing {
        /// Experiment label
        experiment: String,
        /// Capability that could not be resolved
        capability: &'static str,
    },

    #[error("Scan point sequence is empty")]
    EmptyScan,

    #[error("Device '{device}' is in use by '{holder}'")]
    DeviceBusy {
        /// Device label
        device: String,
        /// Experiment currently holding the lease
        holder: String,
    },

    #[error("Scan task failed: {0}")]
    ScanTask(String),

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<DaqError>),
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

impl From<csv::Error> for DaqError {
    fn from(value: csv::Error) -> Self {
        DaqError::Storage(value.to_string())
    }
}

impl DaqError {
    /// Shorthand for an [`DaqError::InvalidValue`] error.
    pub fn invalid(label: impl Into<String>, reason: impl Into<String>) -> Self {
        DaqError::InvalidValue {
            label: label.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_error_converts_with_question_mark() {
        fn read() -> AppResult<f64> {
            let value: DeviceResult<f64> = Err(DeviceError::NotReady {
                device: "Dummy Sensor".into(),
            });
            Ok(value?)
        }

        match read() {
            Err(DaqError::Device(DeviceError::NotReady { device })) => {
                assert_eq!(device, "Dummy Sensor");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn invalid_value_message_names_the_property() {
        let err = DaqError::invalid("Progress", "must be within [0, 100]");
        assert_eq!(
            err.to_string(),
            "Invalid value for 'Progress': must be within [0, 100]"
        );
    }

    #[test]
    fn shutdown_failure_keeps_inner_errors() {
        let err = DaqError::ShutdownFailed(vec![
            DaqError::Storage("disk full".into()),
            DaqError::Device(DeviceError::Communication("timeout".into())),
        ]);
        match err {
            DaqError::ShutdownFailed(inner) => assert_eq!(inner.len(), 2),
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
