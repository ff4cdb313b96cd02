//! Hardware-type registries.
//!
//! A [`HardwareType`] enumerates and owns the devices of one physical kind.
//! [`HardwareTypes`] aggregates every registered kind: enumeration runs
//! concurrently across kinds (their native handles are disjoint), lookups
//! search all of them.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::capture::external::ExternalCapture;
use crate::capture::protocol::open_link;
use crate::capture::{run_blocking, CaptureProtocol};
use crate::config::SpectroScanConfig;
use crate::device::{Instrument, SpectroScanDevice};
use crate::error::{DeviceError, DeviceResult};
use crate::hardware::native::{NativeDriver, NativeHandle};

/// Enumerates and owns the devices of one hardware kind.
#[async_trait]
pub trait HardwareType: Send + Sync {
    /// Human readable name of the kind.
    fn name(&self) -> &'static str;

    /// Probe for attached hardware and return every live device.
    async fn enumerate(&self) -> DeviceResult<Vec<Arc<dyn Instrument>>>;

    /// Look up a device by its id string.
    async fn get_device_by_id(&self, id: &str) -> Option<Arc<dyn Instrument>>;

    /// Close every owned handle. `false` if any close failed; the rest are
    /// still closed.
    async fn close_devices(&self) -> bool;
}

/// Registry of SpectroScan spectrometers.
pub struct SpectroScanHardware {
    driver: NativeDriver,
    config: SpectroScanConfig,
    external: Arc<ExternalCapture>,
    devices: RwLock<Vec<Arc<SpectroScanDevice>>>,
}

impl SpectroScanHardware {
    /// Registry over `driver`, capturing major-version-4 units with the
    /// configured external executable.
    pub fn new(driver: NativeDriver, config: SpectroScanConfig) -> Self {
        let external = Arc::new(ExternalCapture::from_config(&config.external));
        Self::with_external(driver, config, external)
    }

    /// Registry with an explicit external capture strategy.
    pub fn with_external(
        driver: NativeDriver,
        config: SpectroScanConfig,
        external: Arc<ExternalCapture>,
    ) -> Self {
        Self {
            driver,
            config,
            external,
            devices: RwLock::new(Vec::new()),
        }
    }

    /// Currently owned devices, without probing.
    pub async fn devices(&self) -> Vec<Arc<SpectroScanDevice>> {
        self.devices.read().await.clone()
    }

    async fn revalidate(&self, devices: &mut Vec<Arc<SpectroScanDevice>>) {
        let mut alive = Vec::with_capacity(devices.len());
        for device in devices.drain(..) {
            if device.is_alive().await {
                alive.push(device);
                continue;
            }
            warn!(device = %device.id(), serial = device.serial(), "Device stopped responding; dropping it");
            if let Err(err) = device.close().await {
                warn!(device = %device.id(), error = %err, "Close of dead handle failed");
            }
        }
        *devices = alive;
    }

    /// Open, identify and wrap the unit at `index`.
    async fn probe(&self, index: u32) -> DeviceResult<Option<SpectroScanDevice>> {
        let Some(handle) = open_link(&self.driver, index, self.config.baud_rate).await? else {
            return Ok(None);
        };

        let protocol = CaptureProtocol::new(self.driver.clone(), handle);
        let identity = match protocol.identify().await {
            Ok(identity) => identity,
            Err(err) => {
                self.close_quietly(handle).await;
                return Err(err);
            }
        };

        let handle = match identity.major_version {
            Some(4) => {
                // the vendor executable needs the port to itself
                self.close_quietly(handle).await;
                None
            }
            Some(3) => {
                let alignment = self.config.alignment;
                if let Err(err) = protocol.update_alignment(alignment.x, alignment.y).await {
                    warn!(handle, error = %err, "Mirror alignment update failed");
                }
                Some(handle)
            }
            _ => Some(handle),
        };

        let device = SpectroScanDevice::new(
            identity,
            index,
            handle,
            self.driver.clone(),
            self.external.clone(),
            &self.config,
        );
        info!(
            device = %device.id(),
            index,
            serial = device.serial(),
            model = device.model_name(),
            major_version = ?device.driver_major_version(),
            "SpectroScan device found"
        );
        Ok(Some(device))
    }

    async fn close_quietly(&self, handle: NativeHandle) {
        let serial = self.driver.serial.clone();
        if let Err(err) = run_blocking("FT_Close", move || serial.close(handle)).await {
            warn!(handle, error = %err, "Failed to close handle");
        }
    }
}

#[async_trait]
impl HardwareType for SpectroScanHardware {
    fn name(&self) -> &'static str {
        "SpectroScan"
    }

    async fn enumerate(&self) -> DeviceResult<Vec<Arc<dyn Instrument>>> {
        // re-probing too soon after a replug makes the driver fail the open
        sleep(self.config.enumerate_settle()).await;

        let mut devices = self.devices.write().await;
        self.revalidate(&mut devices).await;

        let serial = self.driver.serial.clone();
        let count = match run_blocking("FT_CreateDeviceInfoList", move || serial.device_count()).await
        {
            Ok(count) => count,
            Err(err) => {
                error!(operation = "FT_CreateDeviceInfoList", error = %err, "Enumeration failed");
                return Err(err);
            }
        };
        debug!(count, known = devices.len(), "Probing SpectroScan driver");

        for index in 0..count {
            if devices.iter().any(|device| device.index() == index) {
                continue;
            }
            match self.probe(index).await {
                Ok(Some(device)) => devices.push(Arc::new(device)),
                Ok(None) => {}
                Err(err) => error!(
                    index,
                    operation = err.operation().unwrap_or("probe"),
                    error = %err,
                    "Failed to set up unit; skipping it"
                ),
            }
        }

        Ok(devices
            .iter()
            .map(|device| device.clone() as Arc<dyn Instrument>)
            .collect())
    }

    async fn get_device_by_id(&self, id: &str) -> Option<Arc<dyn Instrument>> {
        self.devices
            .read()
            .await
            .iter()
            .find(|device| device.id().to_string() == id)
            .map(|device| device.clone() as Arc<dyn Instrument>)
    }

    async fn close_devices(&self) -> bool {
        let devices = self.devices.read().await;
        let mut all_closed = true;
        for device in devices.iter() {
            if device.close().await.is_err() {
                all_closed = false;
            }
        }
        all_closed
    }
}

/// Every registered hardware kind.
#[derive(Default)]
pub struct HardwareTypes {
    types: Vec<Arc<dyn HardwareType>>,
}

impl HardwareTypes {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hardware kind.
    pub fn register(&mut self, hardware: Arc<dyn HardwareType>) {
        self.types.push(hardware);
    }

    /// Enumerate every kind concurrently.
    ///
    /// A kind that fails to enumerate is logged and contributes no devices.
    pub async fn enumerate_all(&self) -> Vec<Arc<dyn Instrument>> {
        let results = join_all(self.types.iter().map(|hardware| async move {
            (hardware.name(), hardware.enumerate().await)
        }))
        .await;

        let mut devices = Vec::new();
        for (name, result) in results {
            match result {
                Ok(found) => devices.extend(found),
                Err(err) => error!(hardware = name, error = %err, "Hardware enumeration failed"),
            }
        }
        devices
    }

    /// Find a device by id across every kind.
    pub async fn get_device_by_id(&self, id: &str) -> DeviceResult<Arc<dyn Instrument>> {
        for hardware in &self.types {
            if let Some(device) = hardware.get_device_by_id(id).await {
                return Ok(device);
            }
        }
        warn!(id, "Device lookup failed");
        Err(DeviceError::DeviceNotFound(id.to_string()))
    }

    /// Close every device of every kind.
    pub async fn close_all(&self) -> bool {
        let results = join_all(self.types.iter().map(|hardware| hardware.close_devices())).await;
        results.into_iter().all(|closed| closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_recovery::RetryPolicy;
    use crate::hardware::mock::{ScriptedCaptureProcess, SimulatedSpectroScan, SimulatedUnit};
    use tracing_test::traced_test;

    fn config() -> SpectroScanConfig {
        SpectroScanConfig {
            enumerate_settle_ms: 0,
            ..SpectroScanConfig::default()
        }
    }

    fn registry(sim: &SimulatedSpectroScan) -> SpectroScanHardware {
        SpectroScanHardware::new(NativeDriver::from_shared(Arc::new(sim.clone())), config())
    }

    #[tokio::test(start_paused = true)]
    async fn test_enumerate_empty() {
        let sim = SimulatedSpectroScan::new();
        let hardware = registry(&sim);
        assert!(hardware.enumerate().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_enumerate_opens_and_identifies() {
        let sim = SimulatedSpectroScan::new().with_unit(SimulatedUnit::v3("SN-1", "NIRONE"));
        let hardware = registry(&sim);

        let devices = hardware.enumerate().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].serial(), "SN-1");
        assert_eq!(devices[0].model_name(), "NIRONE");
        assert_eq!(devices[0].type_tag(), "SpectroScan Spectrometer");

        let handle = sim.open_handles()[0];
        assert_eq!(sim.alignments(), vec![(handle, 29.7, 24.6)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_known_device_not_reopened() {
        let sim = SimulatedSpectroScan::new().with_unit(SimulatedUnit::v3("SN-1", "NIRONE"));
        let hardware = registry(&sim);

        let first = hardware.enumerate().await.unwrap();
        let second = hardware.enumerate().await.unwrap();
        assert_eq!(first[0].id(), second[0].id());
        assert_eq!(sim.call_count("FT_Open"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_device_dropped() {
        let sim = SimulatedSpectroScan::new().with_unit(SimulatedUnit::v3("SN-1", "NIRONE"));
        let hardware = registry(&sim);

        let first = hardware.enumerate().await.unwrap();
        let id = first[0].id().to_string();
        sim.detach(0);

        assert!(hardware.enumerate().await.unwrap().is_empty());
        assert!(hardware.get_device_by_id(&id).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_skipped_unit_is_logged() {
        let sim = SimulatedSpectroScan::new().with_unit(SimulatedUnit::v3("SN-1", "A"));
        sim.fail_next("FT_SetBaudRate", 7);
        let hardware = registry(&sim);

        assert!(hardware.enumerate().await.unwrap().is_empty());
        assert!(logs_contain("Failed to set up unit; skipping it"));
        assert!(logs_contain("FT_SetBaudRate"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_v4_handle_closed_after_identity() {
        let sim = SimulatedSpectroScan::new().with_unit(SimulatedUnit::v4("SN-4", "NANO"));
        let hardware = registry(&sim);

        let devices = hardware.enumerate().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert!(sim.open_handles().is_empty());
        assert!(sim.alignments().is_empty());

        // no liveness probe, no reopen
        hardware.enumerate().await.unwrap();
        assert_eq!(sim.call_count("FT_Open"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_identity_still_registered() {
        let sim = SimulatedSpectroScan::new()
            .with_unit(SimulatedUnit::v3("x", "y").with_identity_frame(b"garbage"));
        let hardware = registry(&sim);

        let devices = hardware.enumerate().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].serial(), "");
        assert!(matches!(
            devices[0].capture().await,
            Err(DeviceError::UnsupportedDriverVersion(None))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_unit_skipped() {
        let sim = SimulatedSpectroScan::new()
            .with_unit(SimulatedUnit::v3("SN-1", "A"))
            .with_unit(SimulatedUnit::v3("SN-2", "B"));
        sim.fail_nth("FT_SetDataCharacteristics", 1, 4);
        let hardware = registry(&sim);

        let devices = hardware.enumerate().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].serial(), "SN-2");
        // the failed unit's handle was released
        assert_eq!(sim.open_handles().len(), 1);

        // next enumeration picks it up
        assert_eq!(hardware.enumerate().await.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_failure_surfaces() {
        let sim = SimulatedSpectroScan::new();
        sim.fail_next("FT_CreateDeviceInfoList", 18);
        let hardware = registry(&sim);
        assert!(hardware.enumerate().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_devices_continues_after_failure() {
        let sim = SimulatedSpectroScan::new()
            .with_unit(SimulatedUnit::v3("SN-1", "A"))
            .with_unit(SimulatedUnit::v3("SN-2", "B"));
        let hardware = registry(&sim);
        hardware.enumerate().await.unwrap();

        sim.fail_next("FT_Close", 4);
        assert!(!hardware.close_devices().await);
        // the second device was still closed
        assert_eq!(sim.open_handles().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_delay_before_probe() {
        let sim = SimulatedSpectroScan::new();
        let hardware = SpectroScanHardware::new(
            NativeDriver::from_shared(Arc::new(sim.clone())),
            SpectroScanConfig::default(),
        );
        let started = tokio::time::Instant::now();
        hardware.enumerate().await.unwrap();
        assert!(started.elapsed() >= std::time::Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_aggregate_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let result_file = dir.path().join("processed_spectrum.json");
        let external = Arc::new(ExternalCapture::new(
            Box::new(ScriptedCaptureProcess::new(&[], &result_file)),
            &result_file,
            RetryPolicy::default(),
        ));

        let first = SimulatedSpectroScan::new().with_unit(SimulatedUnit::v3("SN-1", "A"));
        let second = SimulatedSpectroScan::new().with_unit(SimulatedUnit::v4("SN-2", "B"));

        let mut types = HardwareTypes::new();
        types.register(Arc::new(registry(&first)));
        types.register(Arc::new(SpectroScanHardware::with_external(
            NativeDriver::from_shared(Arc::new(second.clone())),
            config(),
            external,
        )));

        let devices = types.enumerate_all().await;
        assert_eq!(devices.len(), 2);

        let id = devices[1].id().to_string();
        let found = types.get_device_by_id(&id).await.unwrap();
        assert_eq!(found.serial(), devices[1].serial());

        assert!(matches!(
            types.get_device_by_id("not-an-id").await,
            Err(DeviceError::DeviceNotFound(_))
        ));
        assert!(types.close_all().await);
    }
}
