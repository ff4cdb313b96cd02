//! Simulated SpectroScan hardware.
//!
//! [`SimulatedSpectroScan`] implements both [`SerialDriver`] and [`DspDriver`]
//! in-process, so the capture protocol, device and registry can be exercised
//! without the vendor libraries or a physical unit. Driver calls return
//! instantly; protocol timing comes entirely from the capture layer's own
//! waits, so tests run under `tokio::time::pause` stay fast.
//!
//! # Behaviour
//!
//! - Each attached unit answers the identify command with
//!   `SpectroScan,<serial>,<model>,<major>` padded with NULs to 34 bytes.
//! - The begin-scan command queues a 1-byte ack, followed by `frame_bytes`
//!   of raw data once the ack has been read.
//! - Interpolation yields one point per integer wavelength in
//!   `[range_min, range_max)`, valued by the spectrum profile.
//!
//! # Fault injection
//!
//! - [`SimulatedSpectroScan::fail_next`] / [`SimulatedSpectroScan::fail_nth`]:
//!   an upcoming call of a named operation returns the given status
//! - [`SimulatedSpectroScan::set_ack_len`] / [`SimulatedSpectroScan::set_frame_bytes`]:
//!   break the wire contract
//! - [`SimulatedSpectroScan::detach`]: unplug a unit; its handle stops
//!   answering liveness probes
//! - [`SimulatedSpectroScan::set_profile`]: shape the spectrum per scan
//!
//! [`ScriptedCaptureProcess`] stands in for the vendor capture executable
//! used by major-version-4 units.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use crate::capture::external::{CaptureOutput, CaptureProcess};
use crate::capture::protocol::IDENTITY_FRAME_LEN;
use crate::capture::SpectralSample;
use crate::error::{DeviceError, DeviceResult};
use crate::hardware::native::{
    check_status, DataCharacteristics, DspDriver, Interpolation, NativeHandle, NativeStatus,
    SerialDriver, Spectrum, SpectrumParams,
};

const FIRST_HANDLE: NativeHandle = 0x5C_0001;

/// Spectrum shape: `(scan_index, wavelength) -> intensity`.
pub type SpectrumProfile = Arc<dyn Fn(u32, f64) -> f64 + Send + Sync>;

/// One simulated physical unit.
#[derive(Debug, Clone)]
pub struct SimulatedUnit {
    serial: String,
    model: String,
    major_version: u32,
    identity_override: Option<Vec<u8>>,
    attached: bool,
}

impl SimulatedUnit {
    /// A direct-serial (major version 3) unit.
    pub fn v3(serial: impl Into<String>, model: impl Into<String>) -> Self {
        Self::with_version(serial, model, 3)
    }

    /// An external-capture (major version 4) unit.
    pub fn v4(serial: impl Into<String>, model: impl Into<String>) -> Self {
        Self::with_version(serial, model, 4)
    }

    /// A unit reporting an arbitrary major version.
    pub fn with_version(serial: impl Into<String>, model: impl Into<String>, major: u32) -> Self {
        Self {
            serial: serial.into(),
            model: model.into(),
            major_version: major,
            identity_override: None,
            attached: true,
        }
    }

    /// Answer the identify command with these exact bytes instead.
    pub fn with_identity_frame(mut self, frame: &[u8]) -> Self {
        self.identity_override = Some(frame.to_vec());
        self
    }

    fn identity_frame(&self) -> Vec<u8> {
        let mut frame = match &self.identity_override {
            Some(frame) => frame.clone(),
            None => format!(
                "SpectroScan,{},{},{}",
                self.serial, self.model, self.major_version
            )
            .into_bytes(),
        };
        frame.resize(IDENTITY_FRAME_LEN, 0);
        frame
    }
}

#[derive(Debug, Default)]
struct OpenLink {
    unit: usize,
    rx: VecDeque<u8>,
    pending_frame: usize,
    scan_in_flight: bool,
    baud_rate: Option<u32>,
    characteristics: Option<DataCharacteristics>,
}

struct SimState {
    units: Vec<SimulatedUnit>,
    links: HashMap<NativeHandle, OpenLink>,
    next_handle: NativeHandle,
    faults: HashMap<&'static str, (u32, u32)>,
    ack_len: usize,
    frame_bytes: usize,
    forced_value: Option<(f64, f64)>,
    profile: SpectrumProfile,
    scans_interpolated: u32,
    calls: Vec<&'static str>,
    writes: Vec<(NativeHandle, Vec<u8>)>,
    alignments: Vec<(NativeHandle, f64, f64)>,
    overlapping_scans: u32,
}

impl SimState {
    fn record(&mut self, operation: &'static str) -> DeviceResult<()> {
        self.calls.push(operation);
        let Some((skip, code)) = self.faults.get_mut(operation) else {
            return Ok(());
        };
        if *skip > 0 {
            *skip -= 1;
            return Ok(());
        }
        let status = NativeStatus(*code);
        self.faults.remove(operation);
        check_status(operation, status)
    }

    fn link(&mut self, operation: &'static str, handle: NativeHandle) -> DeviceResult<&mut OpenLink> {
        let units = &self.units;
        match self.links.get_mut(&handle) {
            Some(link) if units[link.unit].attached => Ok(link),
            _ => Err(invalid_handle(operation)),
        }
    }
}

fn invalid_handle(operation: &'static str) -> DeviceError {
    let status = NativeStatus(1);
    DeviceError::NativeCallFailed {
        operation,
        code: i64::from(status.0),
        message: status.message().to_string(),
    }
}

/// In-process stand-in for the SpectroScan vendor libraries.
#[derive(Clone)]
pub struct SimulatedSpectroScan {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedSpectroScan {
    /// A driver with no units attached.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                units: Vec::new(),
                links: HashMap::new(),
                next_handle: FIRST_HANDLE,
                faults: HashMap::new(),
                ack_len: 1,
                frame_bytes: 8192,
                forced_value: None,
                profile: Arc::new(default_profile),
                scans_interpolated: 0,
                calls: Vec::new(),
                writes: Vec::new(),
                alignments: Vec::new(),
                overlapping_scans: 0,
            })),
        }
    }

    /// Attach a unit at the next index.
    pub fn with_unit(self, unit: SimulatedUnit) -> Self {
        self.state.lock().units.push(unit);
        self
    }

    /// Attach a unit at the next index after construction.
    pub fn attach(&self, unit: SimulatedUnit) {
        self.state.lock().units.push(unit);
    }

    /// Unplug the unit at `index`.
    pub fn detach(&self, index: usize) {
        if let Some(unit) = self.state.lock().units.get_mut(index) {
            unit.attached = false;
        }
    }

    /// Make the next call of `operation` (e.g. `"FT_Read"`) fail with `status`.
    pub fn fail_next(&self, operation: &'static str, status: u32) {
        self.fail_nth(operation, 1, status);
    }

    /// Make the `nth` upcoming call of `operation` fail with `status` (1-based).
    pub fn fail_nth(&self, operation: &'static str, nth: u32, status: u32) {
        self.state
            .lock()
            .faults
            .insert(operation, (nth.saturating_sub(1), status));
    }

    /// Number of ack bytes queued after the begin-scan command.
    pub fn set_ack_len(&self, ack_len: usize) {
        self.state.lock().ack_len = ack_len;
    }

    /// Number of raw data bytes queued per scan.
    pub fn set_frame_bytes(&self, frame_bytes: usize) {
        self.state.lock().frame_bytes = frame_bytes;
    }

    /// Replace the spectrum profile.
    pub fn set_profile<F>(&self, profile: F)
    where
        F: Fn(u32, f64) -> f64 + Send + Sync + 'static,
    {
        self.state.lock().profile = Arc::new(profile);
    }

    /// Force a raw interpolated value at one wavelength.
    pub fn set_value_at(&self, wavelength: f64, value: f64) {
        self.state.lock().forced_value = Some((wavelength, value));
    }

    /// Operation names in call order.
    pub fn calls(&self) -> Vec<&'static str> {
        self.state.lock().calls.clone()
    }

    /// Number of calls of one operation.
    pub fn call_count(&self, operation: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| **call == operation)
            .count()
    }

    /// Every write so far, with its handle.
    pub fn writes(&self) -> Vec<(NativeHandle, Vec<u8>)> {
        self.state.lock().writes.clone()
    }

    /// Every alignment pushed so far.
    pub fn alignments(&self) -> Vec<(NativeHandle, f64, f64)> {
        self.state.lock().alignments.clone()
    }

    /// Handles currently open.
    pub fn open_handles(&self) -> Vec<NativeHandle> {
        let mut handles: Vec<_> = self.state.lock().links.keys().copied().collect();
        handles.sort_unstable();
        handles
    }

    /// Line settings programmed on a handle.
    pub fn line_settings(&self, handle: NativeHandle) -> Option<(u32, DataCharacteristics)> {
        let state = self.state.lock();
        let link = state.links.get(&handle)?;
        Some((link.baud_rate?, link.characteristics?))
    }

    /// Times a scan was started on a handle that already had one in flight.
    pub fn overlapping_scans(&self) -> u32 {
        self.state.lock().overlapping_scans
    }
}

impl Default for SimulatedSpectroScan {
    fn default() -> Self {
        Self::new()
    }
}

fn default_profile(_scan: u32, wavelength: f64) -> f64 {
    let x = (wavelength - 1700.0) / 350.0;
    1000.0 * (-x * x).exp()
}

impl SerialDriver for SimulatedSpectroScan {
    fn device_count(&self) -> DeviceResult<u32> {
        let mut state = self.state.lock();
        state.record("FT_CreateDeviceInfoList")?;
        // slots stay numbered when a unit is unplugged
        Ok(state.units.len() as u32)
    }

    fn open(&self, index: u32) -> DeviceResult<Option<NativeHandle>> {
        let mut state = self.state.lock();
        state.record("FT_Open")?;

        let index = index as usize;
        match state.units.get(index) {
            Some(unit) if unit.attached => {}
            _ => return Ok(None),
        }
        if state.links.values().any(|link| link.unit == index) {
            check_status("FT_Open", NativeStatus(3))?;
        }

        let handle = state.next_handle;
        state.next_handle += 1;
        state.links.insert(
            handle,
            OpenLink {
                unit: index,
                ..OpenLink::default()
            },
        );
        Ok(Some(handle))
    }

    fn close(&self, handle: NativeHandle) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.record("FT_Close")?;
        match state.links.remove(&handle) {
            Some(_) => Ok(()),
            None => Err(invalid_handle("FT_Close")),
        }
    }

    fn set_baud_rate(&self, handle: NativeHandle, baud_rate: u32) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.record("FT_SetBaudRate")?;
        state.link("FT_SetBaudRate", handle)?.baud_rate = Some(baud_rate);
        Ok(())
    }

    fn set_data_characteristics(
        &self,
        handle: NativeHandle,
        characteristics: DataCharacteristics,
    ) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.record("FT_SetDataCharacteristics")?;
        state.link("FT_SetDataCharacteristics", handle)?.characteristics = Some(characteristics);
        Ok(())
    }

    fn write(&self, handle: NativeHandle, bytes: &[u8]) -> DeviceResult<usize> {
        let mut state = self.state.lock();
        state.record("FT_Write")?;
        state.writes.push((handle, bytes.to_vec()));

        let ack_len = state.ack_len;
        let frame_bytes = state.frame_bytes;
        let identity = {
            let unit = state.link("FT_Write", handle)?.unit;
            state.units[unit].identity_frame()
        };

        let mut overlapped = false;
        let link = state.link("FT_Write", handle)?;
        match bytes.first() {
            Some(0xAD) => {
                overlapped = link.scan_in_flight;
                link.scan_in_flight = true;
                link.rx.clear();
                link.rx.extend(std::iter::repeat(0x01).take(ack_len));
                link.pending_frame = frame_bytes;
            }
            Some(0xAA) => link.rx.extend(identity),
            _ => {}
        }
        if overlapped {
            state.overlapping_scans += 1;
        }
        Ok(bytes.len())
    }

    fn read(&self, handle: NativeHandle, max_len: usize) -> DeviceResult<Vec<u8>> {
        let mut state = self.state.lock();
        state.record("FT_Read")?;
        let link = state.link("FT_Read", handle)?;

        let take = max_len.min(link.rx.len());
        let bytes: Vec<u8> = link.rx.drain(..take).collect();

        if link.rx.is_empty() && link.pending_frame > 0 {
            // ack consumed; the raw frame becomes visible
            let frame = link.pending_frame;
            link.pending_frame = 0;
            link.rx.extend((0..frame).map(|i| (i % 251) as u8));
        } else if link.scan_in_flight && bytes.len() > 1 {
            link.scan_in_flight = false;
        }
        Ok(bytes)
    }

    fn queue_status(&self, handle: NativeHandle) -> DeviceResult<usize> {
        let mut state = self.state.lock();
        state.record("FT_GetQueueStatus")?;
        Ok(state.link("FT_GetQueueStatus", handle)?.rx.len())
    }

    fn is_alive(&self, handle: NativeHandle) -> bool {
        let mut state = self.state.lock();
        if state.record("FT_GetQueueStatus").is_err() {
            return false;
        }
        state.link("FT_GetQueueStatus", handle).is_ok()
    }
}

impl DspDriver for SimulatedSpectroScan {
    fn decode_frames(&self, raw: &[u8]) -> DeviceResult<Vec<i32>> {
        self.state.lock().record("FTIR_UartConversion")?;
        Ok(raw
            .chunks_exact(2)
            .map(|pair| i32::from(i16::from_le_bytes([pair[0], pair[1]])))
            .collect())
    }

    fn interferogram_to_spectrum(
        &self,
        interferogram: &[i32],
        _params: &SpectrumParams,
    ) -> DeviceResult<Spectrum> {
        self.state.lock().record("FTIR_InterferogramToSpectrum")?;
        let len = interferogram.len();
        Ok(Spectrum {
            magnitude: interferogram.iter().map(|&v| f64::from(v).abs()).collect(),
            wavenumber: (0..len).map(|i| i as f64).collect(),
            interferogram_ac: vec![0.0; len],
        })
    }

    fn interpolate(
        &self,
        _spectrum: &Spectrum,
        range_min: f64,
        range_max: f64,
    ) -> DeviceResult<Interpolation> {
        let mut state = self.state.lock();
        state.record("FTIR_Spectrum_Interpo")?;

        let scan = state.scans_interpolated;
        state.scans_interpolated += 1;

        let points = (range_max - range_min).max(0.0) as usize;
        let wavelength: Vec<f64> = (0..points).map(|i| range_min + i as f64).collect();
        let raw: Vec<f64> = wavelength
            .iter()
            .map(|&wl| match state.forced_value {
                Some((at, value)) if at == wl => value,
                _ => (state.profile)(scan, wl),
            })
            .collect();

        Ok(Interpolation {
            absorption: raw.clone(),
            raw,
            wavelength,
        })
    }

    fn update_alignment(&self, handle: NativeHandle, x: f64, y: f64) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.record("FTIR_UpdateAlignment")?;
        state.alignments.push((handle, x, y));
        Ok(())
    }
}

// =============================================================================
// ScriptedCaptureProcess - Simulated vendor capture executable
// =============================================================================

/// Arguments of every run, in order.
pub type ProcessCalls = Arc<Mutex<Vec<(u32, i32)>>>;

/// Exits with scripted codes and writes the result file on exit 0.
///
/// Once the script is exhausted every further run succeeds.
pub struct ScriptedCaptureProcess {
    codes: Mutex<VecDeque<i32>>,
    calls: ProcessCalls,
    result_file: PathBuf,
    output: CaptureOutput,
}

impl ScriptedCaptureProcess {
    /// Exit with `codes` in order, writing results to `result_file`.
    pub fn new(codes: &[i32], result_file: impl Into<PathBuf>) -> Self {
        let scan_data = (950..2451)
            .map(|wl| SpectralSample {
                wavelength: f64::from(wl),
                measured_value: default_profile(0, f64::from(wl)),
            })
            .collect();
        Self {
            codes: Mutex::new(codes.iter().copied().collect()),
            calls: Arc::new(Mutex::new(Vec::new())),
            result_file: result_file.into(),
            output: CaptureOutput {
                com_port: 3,
                scan_data,
            },
        }
    }

    /// Write this output on success instead.
    pub fn with_output(mut self, output: CaptureOutput) -> Self {
        self.output = output;
        self
    }

    /// Shared log of `(scan_average, com_port)` per run.
    pub fn call_log(&self) -> ProcessCalls {
        self.calls.clone()
    }
}

#[async_trait]
impl CaptureProcess for ScriptedCaptureProcess {
    async fn run(&self, scan_average: u32, com_port: i32) -> DeviceResult<i32> {
        self.calls.lock().push((scan_average, com_port));
        let code = self.codes.lock().pop_front().unwrap_or(0);
        if code == 0 {
            tokio::fs::write(&self.result_file, serde_json::to_vec(&self.output)?).await?;
        }
        Ok(code)
    }
}
