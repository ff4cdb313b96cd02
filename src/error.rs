//! Custom error types for the capture layer.
//!
//! `DeviceError` is the single error type surfaced to callers of a device
//! (`get_properties`, `get_property`, `set_property`, `capture`) and of a
//! hardware registry. Lower layers (property validation, the serial capture
//! protocol, the external capture process) return these variants directly so
//! the originating operation name and native status code survive all the way
//! up to field diagnostics.
//!
//! ## Error Hierarchy
//!
//! - **`ValidationFailed`**: client-correctable; the candidate value broke a
//!   property's type, bounds, increment or length rule. Never retried.
//! - **`NativeCallFailed`**: the vendor driver returned a non-zero status.
//!   Carries the operation name, the raw code, and the driver's description.
//! - **`ProtocolViolation`**: the driver call succeeded but the reply broke
//!   the wire contract (wrong ack size, empty queue, malformed identity).
//! - **`CaptureTimeout`**: the caller-side deadline derived from the scan
//!   average elapsed. In-flight native work is not cancelled.
//! - **`CaptureProcessFailed`**: the external capture executable failed on
//!   every allowed attempt.
//!
//! No variant is fatal to the process: devices and registries stay usable
//! after any of them.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the device error type.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Errors raised by SpectroScan devices, their registry and capture paths.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// A property value was rejected; holds the reason.
    #[error("{0}")]
    ValidationFailed(String),

    /// A vendor driver call returned a nonzero status.
    #[error("{operation} failed with status {code}: {message}")]
    NativeCallFailed {
        /// Name of the failing call
        operation: &'static str,
        /// Status code it returned
        code: i64,
        /// Readable meaning of the code
        message: String,
    },

    /// The unit replied with something the wire protocol does not allow.
    #[error("{operation}: {detail}")]
    ProtocolViolation {
        /// Call that saw the bad reply
        operation: &'static str,
        /// What was wrong with it
        detail: String,
    },

    /// A capture ran past its deadline.
    #[error("Capture timed out after {0:?}")]
    CaptureTimeout(Duration),

    /// The external capture executable failed on every allowed attempt.
    #[error("Capture process failed {attempts} times")]
    CaptureProcessFailed {
        /// Attempts made before giving up
        attempts: u32,
    },

    /// The capture result file could not be cleared, read or parsed.
    #[error("Capture result file error: {0}")]
    ResultFile(String),

    /// No device matches the given id.
    #[error("No device found with ID: {0}")]
    DeviceNotFound(String),

    /// The device has no property with this id.
    #[error("Property {0} does not exist")]
    PropertyNotFound(String),

    /// The unit reported a major version with no capture strategy.
    #[error("Unsupported driver version: {0:?}")]
    UnsupportedDriverVersion(Option<u32>),

    /// The requested backend was compiled out.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// Settings could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Settings loaded but hold invalid values.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem or process I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DeviceError {
    /// Shorthand for a validation failure with a fixed reason.
    pub fn validation(reason: impl Into<String>) -> Self {
        DeviceError::ValidationFailed(reason.into())
    }

    /// Shorthand for a reply that broke the wire contract.
    pub fn protocol(operation: &'static str, detail: impl Into<String>) -> Self {
        DeviceError::ProtocolViolation {
            operation,
            detail: detail.into(),
        }
    }

    /// Name of the native or protocol operation that produced this error, if any.
    pub fn operation(&self) -> Option<&'static str> {
        match self {
            DeviceError::NativeCallFailed { operation, .. }
            | DeviceError::ProtocolViolation { operation, .. } => Some(operation),
            _ => None,
        }
    }

    /// Whether a failed attempt may be repeated by the external-process strategy.
    ///
    /// Validation failures are client errors and are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeviceError::NativeCallFailed { .. }
                | DeviceError::ProtocolViolation { .. }
                | DeviceError::Io(_)
        )
    }
}
