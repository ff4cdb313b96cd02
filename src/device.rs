//! Logical instruments.
//!
//! A device owns one native handle, exposes its settings as validated
//! [`Property`] records and captures spectra. [`Instrument`] is the surface a
//! controller talks to; [`SpectroScanDevice`] is the SpectroScan FTIR
//! implementation.
//!
//! # Capture strategies
//!
//! The strategy is picked from the unit's reported major version:
//!
//! - `3`: direct serial, [`averaging::run`] over [`CaptureProtocol`]
//! - `4`: the vendor capture executable via [`ExternalCapture`]
//! - anything else: [`DeviceError::UnsupportedDriverVersion`]
//!
//! # Concurrency
//!
//! The native handle sits behind a per-device async mutex, so at most one
//! capture is in flight per handle. A capture runs as its own task; the
//! caller waits at most [`capture_timeout`] for it. On timeout the caller gets
//! [`DeviceError::CaptureTimeout`] while the task runs to completion in the
//! background and its result is dropped. The handle stays locked until then.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::capture::averaging;
use crate::capture::external::{ExternalCapture, UNKNOWN_COM_PORT};
use crate::capture::{CaptureProtocol, Identity, SpectralSample};
use crate::config::SpectroScanConfig;
use crate::error::{DeviceError, DeviceResult};
use crate::hardware::native::{NativeDriver, NativeHandle};
use crate::parameter::{validate, DataType, Property, PropertyBuilder};

/// Type tag reported by SpectroScan devices.
pub const SPECTROSCAN_TYPE: &str = "SpectroScan Spectrometer";

/// Largest accepted scan average.
pub const MAX_SCAN_AVERAGE: u32 = 10_000;
/// Largest accepted boxcar half-width.
pub const MAX_BOXCAR: u32 = 50;

/// Summary of a device for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Session-unique id
    pub id: Uuid,
    /// Serial number
    pub serial: String,
    /// Model name
    pub model_name: String,
    /// Device type tag
    #[serde(rename = "type")]
    pub type_tag: String,
}

/// Uniform surface of a laboratory instrument.
#[async_trait]
pub trait Instrument: Send + Sync {
    /// Session-unique id.
    fn id(&self) -> Uuid;
    /// Serial number.
    fn serial(&self) -> &str;
    /// Model name.
    fn model_name(&self) -> &str;
    /// Device type tag.
    fn type_tag(&self) -> &'static str;

    /// Current bound on a request, derived from the current settings.
    async fn timeout(&self) -> Duration;

    /// All properties with their current values.
    async fn get_properties(&self) -> DeviceResult<Vec<Property>>;
    /// One property by id.
    async fn get_property(&self, key: &str) -> DeviceResult<Property>;
    /// Validate and apply a new value, returning the updated property.
    async fn set_property(&self, id: &str, value: &str) -> DeviceResult<Property>;
    /// Acquire a spectrum.
    async fn capture(&self) -> DeviceResult<Vec<SpectralSample>>;

    /// Listing summary.
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.id(),
            serial: self.serial().to_string(),
            model_name: self.model_name().to_string(),
            type_tag: self.type_tag().to_string(),
        }
    }
}

/// Request bound: a fixed overhead plus a per-scan allowance.
///
/// Recomputed from the current scan average before every capture.
pub fn capture_timeout(overhead: Duration, per_scan: Duration, scan_average: u32) -> Duration {
    overhead + per_scan * scan_average
}

/// Settings exposed by a SpectroScan device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    /// Number of scans averaged per capture
    ScanAverage,
    /// Boxcar smoothing half-width
    Boxcar,
    /// Run auto-alignment before each direct capture
    Calibrate,
}

impl PropertyKind {
    /// Every property, in display order.
    pub const ALL: [PropertyKind; 3] = [
        PropertyKind::ScanAverage,
        PropertyKind::Boxcar,
        PropertyKind::Calibrate,
    ];

    /// Wire id.
    pub fn id(self) -> &'static str {
        match self {
            PropertyKind::ScanAverage => "scan_average",
            PropertyKind::Boxcar => "boxcar",
            PropertyKind::Calibrate => "calibrate",
        }
    }

    /// Look up by wire id.
    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.id() == id)
    }

    fn declare(self, settings: &DeviceSettings) -> Property {
        match self {
            PropertyKind::ScanAverage => PropertyBuilder::new(self.id(), DataType::Int)
                .display_name("Scan Averaging")
                .range(1.0, f64::from(MAX_SCAN_AVERAGE))
                .increment(1.0)
                .order(1)
                .value(settings.scan_average)
                .build(),
            PropertyKind::Boxcar => PropertyBuilder::new(self.id(), DataType::Int)
                .display_name("Boxcar Smoothing")
                .range(0.0, f64::from(MAX_BOXCAR))
                .increment(1.0)
                .order(2)
                .value(settings.boxcar)
                .build(),
            PropertyKind::Calibrate => PropertyBuilder::new(self.id(), DataType::Bool)
                .display_name("Auto Align")
                .choices(["true", "false"])
                .order(3)
                .value(settings.calibrate)
                .build(),
        }
    }

    /// Store an already validated value.
    fn apply(self, settings: &mut DeviceSettings, value: &str) -> DeviceResult<()> {
        match self {
            PropertyKind::ScanAverage => settings.scan_average = parse_whole(value)?,
            PropertyKind::Boxcar => settings.boxcar = parse_whole(value)?,
            PropertyKind::Calibrate => settings.calibrate = parse_bool(value)?,
        }
        Ok(())
    }
}

fn parse_whole(value: &str) -> DeviceResult<u32> {
    let number: f64 = value
        .trim()
        .parse()
        .map_err(|_| DeviceError::validation("expected int"))?;
    Ok(number.round() as u32)
}

fn parse_bool(value: &str) -> DeviceResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(DeviceError::validation("expected bool")),
    }
}

/// Mutable per-device state behind the settings lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DeviceSettings {
    scan_average: u32,
    boxcar: u32,
    calibrate: bool,
    com_port: i32,
}

#[derive(Debug, Clone, Copy)]
struct CaptureTiming {
    overhead: Duration,
    per_scan: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    DirectSerial,
    ExternalProcess,
}

/// A SpectroScan FTIR spectrometer.
pub struct SpectroScanDevice {
    id: Uuid,
    serial: String,
    model_name: String,
    index: u32,
    driver_major_version: Option<u32>,
    driver: NativeDriver,
    external: Arc<ExternalCapture>,
    timing: CaptureTiming,
    settings: Arc<RwLock<DeviceSettings>>,
    /// Exclusive access to the native handle; `None` once closed or for
    /// units driven by the external executable.
    port: Arc<Mutex<Option<NativeHandle>>>,
}

impl SpectroScanDevice {
    /// Build a device from an enumerated unit.
    pub fn new(
        identity: Identity,
        index: u32,
        handle: Option<NativeHandle>,
        driver: NativeDriver,
        external: Arc<ExternalCapture>,
        config: &SpectroScanConfig,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            serial: identity.serial,
            model_name: identity.model,
            index,
            driver_major_version: identity.major_version,
            driver,
            external,
            timing: CaptureTiming {
                overhead: Duration::from_millis(config.capture_overhead_ms),
                per_scan: Duration::from_millis(config.per_scan_ms),
            },
            settings: Arc::new(RwLock::new(DeviceSettings {
                scan_average: config.default_scan_average.clamp(1, MAX_SCAN_AVERAGE),
                boxcar: config.default_boxcar.min(MAX_BOXCAR),
                calibrate: false,
                com_port: UNKNOWN_COM_PORT,
            })),
            port: Arc::new(Mutex::new(handle)),
        }
    }

    /// Driver index the unit was found at.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Reported major version.
    pub fn driver_major_version(&self) -> Option<u32> {
        self.driver_major_version
    }

    /// COM port last reported by the external capture executable.
    pub async fn com_port(&self) -> i32 {
        self.settings.read().await.com_port
    }

    /// Open handle, if any. Waits for an in-flight capture.
    pub async fn handle(&self) -> Option<NativeHandle> {
        *self.port.lock().await
    }

    /// Whether the unit still answers.
    ///
    /// A device busy capturing counts as alive. A device without a handle
    /// (closed, or driven by the external executable) is not probed.
    pub async fn is_alive(&self) -> bool {
        let guard = match self.port.try_lock() {
            Ok(guard) => guard,
            Err(_) => return true,
        };
        let Some(handle) = *guard else {
            return self.strategy().ok() == Some(Strategy::ExternalProcess);
        };
        let serial = self.driver.serial.clone();
        let alive = crate::capture::run_blocking("FT_GetQueueStatus", move || {
            Ok(serial.is_alive(handle))
        })
        .await
        .unwrap_or(false);
        drop(guard);
        alive
    }

    /// Close the native handle. Waits for an in-flight capture to finish.
    pub async fn close(&self) -> DeviceResult<()> {
        let mut guard = self.port.lock().await;
        let Some(handle) = guard.take() else {
            return Ok(());
        };
        let serial = self.driver.serial.clone();
        let result = crate::capture::run_blocking("FT_Close", move || serial.close(handle)).await;
        match &result {
            Ok(()) => info!(device = %self.id, handle, "Device closed"),
            Err(err) => error!(device = %self.id, handle, operation = "FT_Close", error = %err, "Close failed"),
        }
        result
    }

    fn strategy(&self) -> DeviceResult<Strategy> {
        match self.driver_major_version {
            Some(3) => Ok(Strategy::DirectSerial),
            Some(4) => Ok(Strategy::ExternalProcess),
            other => Err(DeviceError::UnsupportedDriverVersion(other)),
        }
    }

    fn logged<T>(&self, operation: &'static str, result: DeviceResult<T>) -> DeviceResult<T> {
        if let Err(err) = &result {
            match err {
                DeviceError::ValidationFailed(_) | DeviceError::PropertyNotFound(_) => {
                    warn!(device = %self.id, operation, error = %err, "Request rejected")
                }
                _ => error!(
                    device = %self.id,
                    operation,
                    native_operation = err.operation().unwrap_or("-"),
                    error = %err,
                    "Request failed"
                ),
            }
        }
        result
    }

    async fn apply_property(&self, id: &str, value: &str) -> DeviceResult<Property> {
        let kind =
            PropertyKind::from_id(id).ok_or_else(|| DeviceError::PropertyNotFound(id.to_string()))?;
        let mut settings = self.settings.write().await;
        validate(&kind.declare(&settings), value)?;
        kind.apply(&mut settings, value)?;
        debug!(device = %self.id, property = id, value, "Property updated");
        Ok(kind.declare(&settings))
    }

    async fn capture_bounded(&self) -> DeviceResult<Vec<SpectralSample>> {
        let strategy = self.strategy()?;
        let settings = *self.settings.read().await;
        let timeout = capture_timeout(self.timing.overhead, self.timing.per_scan, settings.scan_average);

        info!(
            device = %self.id,
            ?strategy,
            scan_average = settings.scan_average,
            boxcar = settings.boxcar,
            ?timeout,
            "Capture requested"
        );

        let job = CaptureJob {
            strategy,
            settings,
            shared_settings: self.settings.clone(),
            driver: self.driver.clone(),
            external: self.external.clone(),
            port: self.port.clone(),
        };
        let task = tokio::spawn(job.run());

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(DeviceError::NativeCallFailed {
                operation: "capture",
                code: -1,
                message: format!("capture task aborted: {}", join_err),
            }),
            // dropping the JoinHandle detaches the task; it keeps the handle until done
            Err(_) => Err(DeviceError::CaptureTimeout(timeout)),
        }
    }
}

/// Everything a detached capture task needs.
struct CaptureJob {
    strategy: Strategy,
    settings: DeviceSettings,
    shared_settings: Arc<RwLock<DeviceSettings>>,
    driver: NativeDriver,
    external: Arc<ExternalCapture>,
    port: Arc<Mutex<Option<NativeHandle>>>,
}

impl CaptureJob {
    async fn run(self) -> DeviceResult<Vec<SpectralSample>> {
        let port = self.port.lock_owned().await;
        let started = tokio::time::Instant::now();

        let samples = match self.strategy {
            Strategy::DirectSerial => {
                let handle =
                    (*port).ok_or_else(|| DeviceError::protocol("capture", "device handle is closed"))?;
                let protocol = CaptureProtocol::new(self.driver.clone(), handle);
                if self.settings.calibrate {
                    protocol.auto_align().await?;
                }
                averaging::run(&protocol, self.settings.scan_average, self.settings.boxcar as usize)
                    .await?
            }
            Strategy::ExternalProcess => {
                let output = self
                    .external
                    .capture(self.settings.scan_average, self.settings.com_port)
                    .await?;
                self.shared_settings.write().await.com_port = output.com_port;
                averaging::boxcar_smooth(&output.scan_data, self.settings.boxcar as usize)
            }
        };

        drop(port);
        debug!(elapsed = ?started.elapsed(), points = samples.len(), "Capture task finished");
        Ok(samples)
    }
}

#[async_trait]
impl Instrument for SpectroScanDevice {
    fn id(&self) -> Uuid {
        self.id
    }

    fn serial(&self) -> &str {
        &self.serial
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn type_tag(&self) -> &'static str {
        SPECTROSCAN_TYPE
    }

    async fn timeout(&self) -> Duration {
        let scan_average = self.settings.read().await.scan_average;
        capture_timeout(self.timing.overhead, self.timing.per_scan, scan_average)
    }

    async fn get_properties(&self) -> DeviceResult<Vec<Property>> {
        let settings = self.settings.read().await;
        Ok(PropertyKind::ALL
            .iter()
            .map(|kind| kind.declare(&settings))
            .collect())
    }

    async fn get_property(&self, key: &str) -> DeviceResult<Property> {
        let result = match PropertyKind::from_id(key) {
            Some(kind) => Ok(kind.declare(&*self.settings.read().await)),
            None => Err(DeviceError::PropertyNotFound(key.to_string())),
        };
        self.logged("get_property", result)
    }

    async fn set_property(&self, id: &str, value: &str) -> DeviceResult<Property> {
        let result = self.apply_property(id, value).await;
        self.logged("set_property", result)
    }

    async fn capture(&self) -> DeviceResult<Vec<SpectralSample>> {
        let result = self.capture_bounded().await;
        self.logged("capture", result)
    }
}
