//! Spectrum acquisition.
//!
//! - [`protocol`]: one timed serial acquisition against an open handle, plus
//!   link setup, identity query and auto-alignment
//! - [`averaging`]: repeats the protocol and reduces the scans to one spectrum
//! - [`external`]: hands acquisition to the vendor capture executable

pub mod averaging;
pub mod external;
pub mod protocol;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{DeviceError, DeviceResult};

pub use averaging::{boxcar_smooth, run as run_averaged};
pub use protocol::{CaptureProtocol, Identity, ScanState};

/// One point of a captured spectrum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpectralSample {
    /// Wavelength in nm
    pub wavelength: f64,
    /// Intensity at that wavelength, never negative
    pub measured_value: f64,
}

/// Anything that can produce a single scan.
#[async_trait]
pub trait ScanSource: Send + Sync {
    /// Acquire one spectrum, ordered ascending by wavelength.
    async fn scan(&self) -> DeviceResult<Vec<SpectralSample>>;
}

/// Run a blocking native call on the blocking pool.
///
/// A panic inside the call is reported as a failed native call of
/// `operation` instead of unwinding into the caller.
pub(crate) async fn run_blocking<T, F>(operation: &'static str, call: F) -> DeviceResult<T>
where
    F: FnOnce() -> DeviceResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|join_err| DeviceError::NativeCallFailed {
            operation,
            code: -1,
            message: format!("native call aborted: {}", join_err),
        })?
}
