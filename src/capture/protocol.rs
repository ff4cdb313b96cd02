//! SpectroScan serial acquisition protocol.
//!
//! A single scan walks a fixed sequence of native calls separated by the
//! dead-times the hardware needs:
//!
//! ```text
//! Idle --write BEGIN_SCAN--> WroteCommand
//!      --10ms, read 1 byte--> Acked
//!      --500ms, queue status--> QueueKnown
//!      --read pending bytes--> RawRead
//!      --500ms, decode frames--> Decoded
//!      --10ms, FFT--> SpectrumComputed
//!      --interpolate--> Interpolated
//! ```
//!
//! Any failed step ends the scan in `Failed`. There is no retry at this
//! level; a failed step fails the whole capture.
//!
//! Command bytes, dead-times and DSP parameters are part of the vendor wire
//! contract and are not configurable.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use async_trait::async_trait;

use super::{run_blocking, ScanSource, SpectralSample};
use crate::error::{DeviceError, DeviceResult};
use crate::hardware::native::{
    DataCharacteristics, Interpolation, NativeDriver, NativeHandle, SpectrumParams,
};

/// Begin a scan.
pub const BEGIN_SCAN: [u8; 3] = [0xAD, 0x00, 0x00];
/// Ask the unit for its identity frame.
pub const IDENTIFY: [u8; 3] = [0xAA, 0x00, 0x00];
/// Start mirror auto-alignment.
pub const AUTO_ALIGN: [u8; 3] = [0xAE, 0x00, 0x00];

/// Minimum gap between consecutive commands.
pub const COMMAND_SETTLE: Duration = Duration::from_millis(10);
/// Time for a full interferogram to land in the receive queue, and for the
/// read to drain before decoding.
pub const ACQUISITION_SETTLE: Duration = Duration::from_millis(500);
/// Time the unit needs to finish auto-alignment.
pub const AUTO_ALIGN_SETTLE: Duration = Duration::from_secs(15);

/// The unit acknowledges BEGIN_SCAN with exactly this many bytes.
pub const ACK_LEN: usize = 1;
/// Size of the identity reply.
pub const IDENTITY_FRAME_LEN: usize = 34;

/// FFT parameters used for every scan.
pub const SPECTRUM_PARAMS: SpectrumParams = SpectrumParams {
    zero_padding: 4096.0,
    band_mode: 0,
    apodization: 1000,
    peak: 0,
    calibration_factor: 0.05,
};

/// Interpolation grid, nm.
pub const INTERPOLATION_MIN: f64 = 900.0;
/// Interpolation grid upper bound (exclusive), nm.
pub const INTERPOLATION_MAX: f64 = 2600.0;

/// Calibrated wavelength window, nm (inclusive).
pub const MIN_WAVELENGTH: f64 = 950.0;
/// Calibrated wavelength window upper bound (exclusive), nm.
pub const MAX_WAVELENGTH: f64 = 2451.0;

/// Progress of one scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// Nothing sent yet
    Idle,
    /// BEGIN_SCAN accepted by the driver
    WroteCommand,
    /// Unit acknowledged the command
    Acked,
    /// Number of pending raw bytes known
    QueueKnown,
    /// Raw frames read
    RawRead,
    /// Frames decoded into an interferogram
    Decoded,
    /// Interferogram transformed into a spectrum
    SpectrumComputed,
    /// Spectrum interpolated onto the wavelength grid
    Interpolated,
    /// Terminal failure
    Failed,
}

/// Identity strings reported by a unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    /// Serial number
    pub serial: String,
    /// Model name
    pub model: String,
    /// Major hardware/driver revision; selects the capture strategy
    pub major_version: Option<u32>,
}

impl Identity {
    /// Parse a NUL-padded `tag,serial,model,major` frame.
    ///
    /// A frame with fewer than four populated fields yields an empty
    /// identity.
    pub fn parse(frame: &[u8]) -> Identity {
        let end = frame.iter().position(|&b| b == 0).unwrap_or(frame.len());
        let text = String::from_utf8_lossy(&frame[..end]);
        let fields: Vec<&str> = text.split(',').map(str::trim).collect();

        match fields.as_slice() {
            [_, serial, model, major, ..]
                if !serial.is_empty() && !model.is_empty() && !major.is_empty() =>
            {
                Identity {
                    serial: (*serial).to_string(),
                    model: (*model).to_string(),
                    major_version: major.parse().ok(),
                }
            }
            _ => {
                warn!(frame = %text, "Identity frame has too few fields");
                Identity::default()
            }
        }
    }
}

/// Open the unit at `index` and program its serial line.
///
/// Returns `Ok(None)` when nothing is attached at `index`. If configuring the
/// line fails the handle is closed again before the error is returned.
pub async fn open_link(
    driver: &NativeDriver,
    index: u32,
    baud_rate: u32,
) -> DeviceResult<Option<NativeHandle>> {
    let serial = driver.serial.clone();
    let opened = run_blocking("FT_Open", move || serial.open(index)).await?;
    let Some(handle) = opened else {
        debug!(index, "No SpectroScan unit at index");
        return Ok(None);
    };

    let serial = driver.serial.clone();
    let configured = async {
        sleep(COMMAND_SETTLE).await;
        let s = serial.clone();
        run_blocking("FT_SetBaudRate", move || s.set_baud_rate(handle, baud_rate)).await?;
        sleep(COMMAND_SETTLE).await;
        let s = serial.clone();
        run_blocking("FT_SetDataCharacteristics", move || {
            s.set_data_characteristics(handle, DataCharacteristics::EIGHT_N_ONE)
        })
        .await
    }
    .await;

    if let Err(err) = configured {
        error!(index, handle, error = %err, "Serial link setup failed");
        if let Err(close_err) = run_blocking("FT_Close", move || serial.close(handle)).await {
            warn!(handle, error = %close_err, "Failed to close handle after setup failure");
        }
        return Err(err);
    }

    info!(index, handle, baud_rate, "Serial link configured");
    Ok(Some(handle))
}

/// Protocol driver bound to one open handle.
///
/// Not internally synchronized: the owner must serialize use of a handle.
#[derive(Debug, Clone)]
pub struct CaptureProtocol {
    driver: NativeDriver,
    handle: NativeHandle,
}

impl CaptureProtocol {
    /// Bind to an open handle.
    pub fn new(driver: NativeDriver, handle: NativeHandle) -> Self {
        Self { driver, handle }
    }

    /// Handle this protocol drives.
    pub fn handle(&self) -> NativeHandle {
        self.handle
    }

    /// Acquire one spectrum.
    pub async fn scan(&self) -> DeviceResult<Vec<SpectralSample>> {
        let mut state = ScanState::Idle;
        let result = self.run_scan(&mut state).await;
        if let Err(err) = &result {
            error!(
                handle = self.handle,
                last_state = ?state,
                operation = err.operation().unwrap_or("scan"),
                error = %err,
                "Scan failed"
            );
            self.enter(&mut state, ScanState::Failed);
        }
        result
    }

    async fn run_scan(&self, state: &mut ScanState) -> DeviceResult<Vec<SpectralSample>> {
        self.write_command("FT_Write", BEGIN_SCAN).await?;
        self.enter(state, ScanState::WroteCommand);

        sleep(COMMAND_SETTLE).await;
        let ack = self.read(ACK_LEN).await?;
        if ack.len() != ACK_LEN {
            return Err(DeviceError::protocol(
                "FT_Read",
                format!("expected {} ack byte, got {}", ACK_LEN, ack.len()),
            ));
        }
        self.enter(state, ScanState::Acked);

        sleep(ACQUISITION_SETTLE).await;
        let serial = self.driver.serial.clone();
        let handle = self.handle;
        let pending = run_blocking("FT_GetQueueStatus", move || serial.queue_status(handle)).await?;
        if pending == 0 {
            return Err(DeviceError::protocol(
                "FT_GetQueueStatus",
                "no scan data queued",
            ));
        }
        self.enter(state, ScanState::QueueKnown);

        let raw = self.read(pending).await?;
        if raw.is_empty() {
            return Err(DeviceError::protocol("FT_Read", "no scan data returned"));
        }
        debug!(handle = self.handle, bytes = raw.len(), "Raw scan data read");
        self.enter(state, ScanState::RawRead);

        sleep(ACQUISITION_SETTLE).await;
        let dsp = self.driver.dsp.clone();
        let interferogram =
            run_blocking("FTIR_UartConversion", move || dsp.decode_frames(&raw)).await?;
        self.enter(state, ScanState::Decoded);

        sleep(COMMAND_SETTLE).await;
        let dsp = self.driver.dsp.clone();
        let spectrum = run_blocking("FTIR_InterferogramToSpectrum", move || {
            dsp.interferogram_to_spectrum(&interferogram, &SPECTRUM_PARAMS)
        })
        .await?;
        self.enter(state, ScanState::SpectrumComputed);

        let dsp = self.driver.dsp.clone();
        let interpolation = run_blocking("FTIR_Spectrum_Interpo", move || {
            dsp.interpolate(&spectrum, INTERPOLATION_MIN, INTERPOLATION_MAX)
        })
        .await?;
        let samples = samples_in_window(&interpolation)?;
        self.enter(state, ScanState::Interpolated);

        Ok(samples)
    }

    /// Read the unit's identity strings.
    pub async fn identify(&self) -> DeviceResult<Identity> {
        self.write_command("FT_Write", IDENTIFY).await?;
        sleep(COMMAND_SETTLE).await;
        let frame = self.read(IDENTITY_FRAME_LEN).await?;
        if frame.is_empty() {
            return Err(DeviceError::protocol("FT_Read", "empty identity frame"));
        }
        Ok(Identity::parse(&frame))
    }

    /// Run mirror auto-alignment and wait for it to finish.
    pub async fn auto_align(&self) -> DeviceResult<()> {
        info!(handle = self.handle, "Starting auto-alignment");
        self.write_command("FT_Write", AUTO_ALIGN).await?;
        sleep(AUTO_ALIGN_SETTLE).await;
        Ok(())
    }

    /// Push the configured mirror alignment.
    pub async fn update_alignment(&self, x: f64, y: f64) -> DeviceResult<()> {
        let dsp = self.driver.dsp.clone();
        let handle = self.handle;
        run_blocking("FTIR_UpdateAlignment", move || {
            dsp.update_alignment(handle, x, y)
        })
        .await
    }

    async fn write_command(&self, operation: &'static str, command: [u8; 3]) -> DeviceResult<()> {
        let serial = self.driver.serial.clone();
        let handle = self.handle;
        let written = run_blocking(operation, move || serial.write(handle, &command)).await?;
        if written != command.len() {
            return Err(DeviceError::protocol(
                operation,
                format!("short write: {} of {} bytes", written, command.len()),
            ));
        }
        Ok(())
    }

    async fn read(&self, max_len: usize) -> DeviceResult<Vec<u8>> {
        let serial = self.driver.serial.clone();
        let handle = self.handle;
        run_blocking("FT_Read", move || serial.read(handle, max_len)).await
    }

    fn enter(&self, state: &mut ScanState, next: ScanState) {
        debug!(handle = self.handle, from = ?*state, to = ?next, "Scan state");
        *state = next;
    }
}

#[async_trait]
impl ScanSource for CaptureProtocol {
    async fn scan(&self) -> DeviceResult<Vec<SpectralSample>> {
        CaptureProtocol::scan(self).await
    }
}

/// Keep interpolated points inside the calibrated window, clamping negative
/// intensities to zero. Output is ascending by wavelength.
pub fn samples_in_window(interpolation: &Interpolation) -> DeviceResult<Vec<SpectralSample>> {
    if interpolation.raw.len() != interpolation.wavelength.len() {
        return Err(DeviceError::protocol(
            "FTIR_Spectrum_Interpo",
            format!(
                "{} values for {} wavelengths",
                interpolation.raw.len(),
                interpolation.wavelength.len()
            ),
        ));
    }

    let mut samples: Vec<SpectralSample> = interpolation
        .wavelength
        .iter()
        .zip(&interpolation.raw)
        .filter(|(wavelength, _)| (MIN_WAVELENGTH..MAX_WAVELENGTH).contains(*wavelength))
        .map(|(&wavelength, &value)| SpectralSample {
            wavelength,
            measured_value: value.max(0.0),
        })
        .collect();

    samples.sort_by(|a, b| a.wavelength.total_cmp(&b.wavelength));
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{SimulatedSpectroScan, SimulatedUnit};
    use std::sync::Arc;

    fn simulated() -> (SimulatedSpectroScan, NativeDriver) {
        let sim = SimulatedSpectroScan::new().with_unit(SimulatedUnit::v3("SN-0042", "NIRONE"));
        let driver = NativeDriver::from_shared(Arc::new(sim.clone()));
        (sim, driver)
    }

    async fn open(driver: &NativeDriver) -> CaptureProtocol {
        let handle = open_link(driver, 0, 2_000_000).await.unwrap().unwrap();
        CaptureProtocol::new(driver.clone(), handle)
    }

    #[test]
    fn test_identity_parse() {
        let mut frame = b"SpectroScan,SN-7,NIRONE-2.2,3".to_vec();
        frame.resize(IDENTITY_FRAME_LEN, 0);
        let identity = Identity::parse(&frame);
        assert_eq!(identity.serial, "SN-7");
        assert_eq!(identity.model, "NIRONE-2.2");
        assert_eq!(identity.major_version, Some(3));
    }

    #[test]
    fn test_identity_parse_short_frame_is_empty() {
        assert_eq!(Identity::parse(b"SpectroScan,SN-7\0\0"), Identity::default());
        assert_eq!(Identity::parse(b""), Identity::default());
    }

    #[test]
    fn test_identity_parse_bad_version() {
        let identity = Identity::parse(b"SpectroScan,SN-7,NIR,x4");
        assert_eq!(identity.serial, "SN-7");
        assert_eq!(identity.major_version, None);
    }

    #[test]
    fn test_window_filter_and_clamp() {
        let interpolation = Interpolation {
            absorption: vec![],
            raw: vec![1.0, 2.0, -3.2, 4.0, 5.0, 6.0],
            wavelength: vec![949.0, 950.0, 1200.0, 2450.0, 2451.0, 2599.0],
        };
        let samples = samples_in_window(&interpolation).unwrap();
        let wavelengths: Vec<f64> = samples.iter().map(|s| s.wavelength).collect();
        assert_eq!(wavelengths, vec![950.0, 1200.0, 2450.0]);
        assert_eq!(samples[1].measured_value, 0.0);
    }

    #[test]
    fn test_window_filter_any_grid() {
        let wavelength: Vec<f64> = (0..400).map(|i| 700.0 + i as f64 * 7.3).rev().collect();
        let interpolation = Interpolation {
            absorption: vec![],
            raw: vec![1.0; wavelength.len()],
            wavelength,
        };
        let samples = samples_in_window(&interpolation).unwrap();
        assert!(!samples.is_empty());
        assert!(samples
            .iter()
            .all(|s| s.wavelength >= MIN_WAVELENGTH && s.wavelength < MAX_WAVELENGTH));
        assert!(samples.windows(2).all(|w| w[0].wavelength < w[1].wavelength));
    }

    #[test]
    fn test_window_rejects_mismatched_lengths() {
        let interpolation = Interpolation {
            absorption: vec![],
            raw: vec![1.0],
            wavelength: vec![1000.0, 1001.0],
        };
        assert!(matches!(
            samples_in_window(&interpolation),
            Err(DeviceError::ProtocolViolation { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_link_programs_line() {
        let (sim, driver) = simulated();
        let handle = open_link(&driver, 0, 2_000_000).await.unwrap().unwrap();
        let (baud, chars) = sim.line_settings(handle).unwrap();
        assert_eq!(baud, 2_000_000);
        assert_eq!(chars, DataCharacteristics::EIGHT_N_ONE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_link_nothing_attached() {
        let (_sim, driver) = simulated();
        assert_eq!(open_link(&driver, 5, 2_000_000).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_link_closes_on_setup_failure() {
        let (sim, driver) = simulated();
        sim.fail_next("FT_SetBaudRate", 7);
        let err = open_link(&driver, 0, 2_000_000).await.unwrap_err();
        assert_eq!(err.operation(), Some("FT_SetBaudRate"));
        assert!(sim.open_handles().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_happy_path() {
        let (sim, driver) = simulated();
        let protocol = open(&driver).await;

        let started = tokio::time::Instant::now();
        let samples = protocol.scan().await.unwrap();

        assert_eq!(samples.len(), 1501);
        assert_eq!(samples[0].wavelength, 950.0);
        assert_eq!(samples[1500].wavelength, 2450.0);
        assert!(samples.iter().all(|s| s.measured_value >= 0.0));
        assert!(started.elapsed() >= Duration::from_millis(1020));

        let writes = sim.writes();
        assert_eq!(writes.last().unwrap().1, BEGIN_SCAN.to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_call_order() {
        let (sim, driver) = simulated();
        let protocol = open(&driver).await;
        let before = sim.calls().len();
        protocol.scan().await.unwrap();

        let calls = sim.calls()[before..].to_vec();
        assert_eq!(
            calls,
            vec![
                "FT_Write",
                "FT_Read",
                "FT_GetQueueStatus",
                "FT_Read",
                "FTIR_UartConversion",
                "FTIR_InterferogramToSpectrum",
                "FTIR_Spectrum_Interpo",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_clamps_negative_reading() {
        let (sim, driver) = simulated();
        sim.set_value_at(1200.0, -3.2);
        let protocol = open(&driver).await;
        let samples = protocol.scan().await.unwrap();
        let at = samples.iter().find(|s| s.wavelength == 1200.0).unwrap();
        assert_eq!(at.measured_value, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_write_failure() {
        let (sim, driver) = simulated();
        let protocol = open(&driver).await;
        sim.fail_next("FT_Write", 4);
        let err = protocol.scan().await.unwrap_err();
        assert!(matches!(
            err,
            DeviceError::NativeCallFailed {
                operation: "FT_Write",
                code: 4,
                ..
            }
        ));
        assert_eq!(sim.call_count("FT_Read"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_missing_ack() {
        let (sim, driver) = simulated();
        sim.set_ack_len(0);
        let protocol = open(&driver).await;
        let err = protocol.scan().await.unwrap_err();
        assert!(matches!(
            err,
            DeviceError::ProtocolViolation {
                operation: "FT_Read",
                ..
            }
        ));
        assert_eq!(sim.call_count("FT_GetQueueStatus"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_empty_queue() {
        let (sim, driver) = simulated();
        sim.set_frame_bytes(0);
        let protocol = open(&driver).await;
        let err = protocol.scan().await.unwrap_err();
        assert_eq!(err.operation(), Some("FT_GetQueueStatus"));
        assert_eq!(sim.call_count("FTIR_UartConversion"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_raw_read_failure() {
        let (sim, driver) = simulated();
        let protocol = open(&driver).await;
        // first FT_Read (ack) succeeds, second (raw data) fails
        sim.fail_nth("FT_Read", 2, 4);
        let err = protocol.scan().await.unwrap_err();
        assert!(matches!(
            err,
            DeviceError::NativeCallFailed {
                operation: "FT_Read",
                code: 4,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_identify() {
        let (_sim, driver) = simulated();
        let protocol = open(&driver).await;
        let identity = protocol.identify().await.unwrap();
        assert_eq!(identity.serial, "SN-0042");
        assert_eq!(identity.model, "NIRONE");
        assert_eq!(identity.major_version, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_align_waits() {
        let (sim, driver) = simulated();
        let protocol = open(&driver).await;
        let started = tokio::time::Instant::now();
        protocol.auto_align().await.unwrap();
        assert!(started.elapsed() >= AUTO_ALIGN_SETTLE);
        assert_eq!(sim.writes().last().unwrap().1, AUTO_ALIGN.to_vec());
    }
}
