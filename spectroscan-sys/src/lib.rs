//! Raw FFI declarations for the SpectroScan vendor libraries.
//!
//! Two native libraries sit underneath a SpectroScan spectrometer:
//!
//! - the FTDI D2XX driver (`ftd2xx`), which owns the USB-serial link, and
//! - the SpectroScan DSP library, which turns raw UART frames into an
//!   interferogram, the interferogram into a spectrum, and interpolates the
//!   spectrum onto a wavelength grid.
//!
//! The signatures below mirror the vendor ABI exactly. They are only
//! available with the `vendor-sdk` feature; without it this crate exports the
//! status constants alone so callers can still name them.

#![allow(non_camel_case_types, non_snake_case)]

use std::os::raw::c_void;
#[cfg(feature = "vendor-sdk")]
use std::os::raw::{c_int, c_short};

/// D2XX `ULONG`/`DWORD` width differs between the Windows and Linux builds.
#[cfg(target_os = "windows")]
pub type DWORD = std::os::raw::c_ulong;
/// D2XX `ULONG`/`DWORD` width differs between the Windows and Linux builds.
#[cfg(not(target_os = "windows"))]
pub type DWORD = std::os::raw::c_uint;

/// Status code returned by every D2XX call.
pub type FT_STATUS = DWORD;
/// Opaque device handle.
pub type FT_HANDLE = *mut c_void;

pub const FT_OK: FT_STATUS = 0;
pub const FT_INVALID_HANDLE: FT_STATUS = 1;
pub const FT_DEVICE_NOT_FOUND: FT_STATUS = 2;
pub const FT_DEVICE_NOT_OPENED: FT_STATUS = 3;
pub const FT_IO_ERROR: FT_STATUS = 4;
pub const FT_INSUFFICIENT_RESOURCES: FT_STATUS = 5;
pub const FT_INVALID_PARAMETER: FT_STATUS = 6;
pub const FT_INVALID_BAUD_RATE: FT_STATUS = 7;
pub const FT_DEVICE_NOT_OPENED_FOR_ERASE: FT_STATUS = 8;
pub const FT_DEVICE_NOT_OPENED_FOR_WRITE: FT_STATUS = 9;
pub const FT_FAILED_TO_WRITE_DEVICE: FT_STATUS = 10;
pub const FT_OTHER_ERROR: FT_STATUS = 18;

pub const FT_BITS_8: u8 = 8;
pub const FT_STOP_BITS_1: u8 = 0;
pub const FT_PARITY_NONE: u8 = 0;

#[cfg(feature = "vendor-sdk")]
extern "system" {
    pub fn FT_CreateDeviceInfoList(lpdwNumDevs: *mut DWORD) -> FT_STATUS;
    pub fn FT_Open(deviceNumber: c_int, pHandle: *mut FT_HANDLE) -> FT_STATUS;
    pub fn FT_Close(ftHandle: FT_HANDLE) -> FT_STATUS;
    pub fn FT_SetBaudRate(ftHandle: FT_HANDLE, BaudRate: DWORD) -> FT_STATUS;
    pub fn FT_SetDataCharacteristics(
        ftHandle: FT_HANDLE,
        WordLength: u8,
        StopBits: u8,
        Parity: u8,
    ) -> FT_STATUS;
    pub fn FT_Write(
        ftHandle: FT_HANDLE,
        lpBuffer: *mut c_void,
        dwBytesToWrite: DWORD,
        lpdwBytesWritten: *mut DWORD,
    ) -> FT_STATUS;
    pub fn FT_Read(
        ftHandle: FT_HANDLE,
        lpBuffer: *mut c_void,
        dwBytesToRead: DWORD,
        lpdwBytesReturned: *mut DWORD,
    ) -> FT_STATUS;
    pub fn FT_GetQueueStatus(ftHandle: FT_HANDLE, dwRxBytes: *mut DWORD) -> FT_STATUS;
}

#[cfg(feature = "vendor-sdk")]
extern "C" {
    /// Decode raw UART frames into interferogram samples (`rx_len / 2` of them).
    pub fn FTIR_UartConversion(
        raw: *mut u8,
        mode: c_short,
        interferogram: *mut c_int,
        raw_len: c_int,
        raw_capacity: c_int,
    );

    /// FFT the interferogram into magnitude / wavenumber / AC component arrays.
    pub fn FTIR_InterferogramToSpectrum(
        interferogram: *mut c_int,
        zero_padding: f64,
        broadband: c_int,
        mertz: c_int,
        peak: c_int,
        calibration_factor: f64,
        magnitude: *mut f64,
        wavenumber: *mut f64,
        interferogram_ac: *mut f64,
        interferogram_len: c_int,
        magnitude_len: c_int,
        wavenumber_len: c_int,
    );

    /// Interpolate a spectrum onto an integer wavelength grid `[min_wave, max_wave)`.
    pub fn FTIR_Spectrum_Interpo(
        magnitude: *mut f64,
        wavenumber: *mut f64,
        reference_magnitude: *mut f64,
        reference_wavenumber: *mut f64,
        scan: c_int,
        absorbance_units: c_int,
        min_wave: f64,
        max_wave: f64,
        absorption: *mut f64,
        raw: *mut f64,
        wavelength: *mut f64,
        absorption_len: c_int,
        raw_len: c_int,
        wavelength_len: c_int,
    );

    /// Push the interferometer mirror alignment for an open handle.
    pub fn FTIR_UpdateAlignment(handle: u64, x: f64, y: f64);
}
