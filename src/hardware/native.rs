//! NativeDriver boundary.
//!
//! The vendor libraries beneath a SpectroScan unit are consumed through two
//! narrow, synchronous capability traits:
//!
//! - [`SerialDriver`]: the USB-serial bridge (open, configure, byte I/O,
//!   queue status, liveness)
//! - [`DspDriver`]: the signal-processing library (frame decoding, FFT,
//!   wavelength interpolation, mirror alignment)
//!
//! Every call is blocking. The capture layer moves them onto the blocking
//! thread pool, so implementations must be `Send + Sync` and must not assume
//! any particular calling thread.
//!
//! A non-zero vendor status is mapped to [`DeviceError::NativeCallFailed`] via
//! [`check_status`], which keeps both the operation name and the raw code.

use std::fmt;
use std::sync::Arc;

use crate::error::{DeviceError, DeviceResult};

/// Opaque handle of an open serial link.
pub type NativeHandle = u64;

/// Raw status code returned by the serial driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeStatus(pub u32);

impl NativeStatus {
    /// Success.
    pub const OK: NativeStatus = NativeStatus(0);
    /// No device at the requested index.
    pub const DEVICE_NOT_FOUND: NativeStatus = NativeStatus(2);

    /// D2XX name of the status code.
    pub fn message(self) -> &'static str {
        match self.0 {
            0 => "FT_OK",
            1 => "FT_INVALID_HANDLE",
            2 => "FT_DEVICE_NOT_FOUND",
            3 => "FT_DEVICE_NOT_OPENED",
            4 => "FT_IO_ERROR",
            5 => "FT_INSUFFICIENT_RESOURCES",
            6 => "FT_INVALID_PARAMETER",
            7 => "FT_INVALID_BAUD_RATE",
            8 => "FT_DEVICE_NOT_OPENED_FOR_ERASE",
            9 => "FT_DEVICE_NOT_OPENED_FOR_WRITE",
            10 => "FT_FAILED_TO_WRITE_DEVICE",
            11 => "FT_EEPROM_READ_FAILED",
            12 => "FT_EEPROM_WRITE_FAILED",
            13 => "FT_EEPROM_ERASE_FAILED",
            14 => "FT_EEPROM_NOT_PRESENT",
            15 => "FT_EEPROM_NOT_PROGRAMMED",
            16 => "FT_INVALID_ARGS",
            17 => "FT_NOT_SUPPORTED",
            18 => "FT_OTHER_ERROR",
            _ => "unknown driver status",
        }
    }

    /// Whether the call succeeded.
    pub fn is_ok(self) -> bool {
        self == Self::OK
    }
}

impl fmt::Display for NativeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message(), self.0)
    }
}

/// Map a vendor status into the crate error type.
pub fn check_status(operation: &'static str, status: NativeStatus) -> DeviceResult<()> {
    if status.is_ok() {
        Ok(())
    } else {
        Err(DeviceError::NativeCallFailed {
            operation,
            code: i64::from(status.0),
            message: status.message().to_string(),
        })
    }
}

/// Serial line framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataCharacteristics {
    /// Bits per word
    pub word_length: u8,
    /// Stop bits (driver encoding, 0 = one stop bit)
    pub stop_bits: u8,
    /// Parity (driver encoding, 0 = none)
    pub parity: u8,
}

impl DataCharacteristics {
    /// 8 data bits, one stop bit, no parity.
    pub const EIGHT_N_ONE: DataCharacteristics = DataCharacteristics {
        word_length: 8,
        stop_bits: 0,
        parity: 0,
    };
}

/// Byte-oriented serial capability of the vendor USB bridge.
pub trait SerialDriver: Send + Sync {
    /// Number of attached units the driver can see.
    fn device_count(&self) -> DeviceResult<u32>;

    /// Open the unit at `index`. `Ok(None)` means nothing is attached there.
    fn open(&self, index: u32) -> DeviceResult<Option<NativeHandle>>;

    /// Release a handle.
    fn close(&self, handle: NativeHandle) -> DeviceResult<()>;

    /// Program the line speed.
    fn set_baud_rate(&self, handle: NativeHandle, baud_rate: u32) -> DeviceResult<()>;

    /// Program the line framing.
    fn set_data_characteristics(
        &self,
        handle: NativeHandle,
        characteristics: DataCharacteristics,
    ) -> DeviceResult<()>;

    /// Write bytes, returning how many the driver accepted.
    fn write(&self, handle: NativeHandle, bytes: &[u8]) -> DeviceResult<usize>;

    /// Read at most `max_len` bytes.
    fn read(&self, handle: NativeHandle, max_len: usize) -> DeviceResult<Vec<u8>>;

    /// Number of bytes buffered and ready to read.
    fn queue_status(&self, handle: NativeHandle) -> DeviceResult<usize>;

    /// Cheap check that a previously opened handle still refers to a live unit.
    ///
    /// Never fails; any driver error means "not alive".
    fn is_alive(&self, handle: NativeHandle) -> bool;
}

/// Parameters of the interferogram FFT.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpectrumParams {
    /// Zero-padded FFT length
    pub zero_padding: f64,
    /// Band mode (0 = broadband off)
    pub band_mode: i32,
    /// Mertz phase correction window
    pub apodization: i32,
    /// Peak search mode
    pub peak: i32,
    /// Wavenumber calibration factor
    pub calibration_factor: f64,
}

/// Frequency-domain result of one interferogram.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Spectrum {
    /// Magnitude per bin
    pub magnitude: Vec<f64>,
    /// Wavenumber per bin
    pub wavenumber: Vec<f64>,
    /// AC component of the interferogram
    pub interferogram_ac: Vec<f64>,
}

/// Spectrum resampled onto an integer wavelength grid.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Interpolation {
    /// Absorption per grid point
    pub absorption: Vec<f64>,
    /// Raw intensity per grid point
    pub raw: Vec<f64>,
    /// Wavelength of each grid point (nm)
    pub wavelength: Vec<f64>,
}

/// Signal-processing capability of the vendor DSP library.
pub trait DspDriver: Send + Sync {
    /// Decode raw UART frames into interferogram samples.
    fn decode_frames(&self, raw: &[u8]) -> DeviceResult<Vec<i32>>;

    /// FFT an interferogram.
    fn interferogram_to_spectrum(
        &self,
        interferogram: &[i32],
        params: &SpectrumParams,
    ) -> DeviceResult<Spectrum>;

    /// Interpolate a spectrum onto the grid `[range_min, range_max)`.
    fn interpolate(
        &self,
        spectrum: &Spectrum,
        range_min: f64,
        range_max: f64,
    ) -> DeviceResult<Interpolation>;

    /// Push the mirror alignment for an open handle.
    fn update_alignment(&self, handle: NativeHandle, x: f64, y: f64) -> DeviceResult<()>;
}

/// The two capability groups, passed explicitly to whoever needs them.
#[derive(Clone)]
pub struct NativeDriver {
    /// Serial capability
    pub serial: Arc<dyn SerialDriver>,
    /// DSP capability
    pub dsp: Arc<dyn DspDriver>,
}

impl NativeDriver {
    /// Bundle a serial and a DSP implementation.
    pub fn new(serial: Arc<dyn SerialDriver>, dsp: Arc<dyn DspDriver>) -> Self {
        Self { serial, dsp }
    }

    /// Use one object for both capabilities.
    pub fn from_shared<D>(driver: Arc<D>) -> Self
    where
        D: SerialDriver + DspDriver + 'static,
    {
        Self {
            serial: driver.clone(),
            dsp: driver,
        }
    }
}

impl fmt::Debug for NativeDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeDriver").finish_non_exhaustive()
    }
}
