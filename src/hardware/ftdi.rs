//! Vendor-library implementation of the native capability traits.
//!
//! Wraps the raw `spectroscan-sys` declarations. Handles cross the trait
//! boundary as plain integers and are turned back into `FT_HANDLE` pointers
//! only at the call site.
#![allow(unsafe_code)]

use std::os::raw::{c_int, c_short, c_void};

use spectroscan_sys as sys;

use super::native::{
    check_status, DataCharacteristics, DspDriver, Interpolation, NativeHandle, NativeStatus,
    SerialDriver, Spectrum, SpectrumParams,
};
use crate::error::{DeviceError, DeviceResult};

/// Frame layout selector for UART decoding.
const UART_MODE: c_short = 1;
/// Interpolation scan mode.
const INTERPOLATION_SCAN: c_int = 2;
/// Report raw intensity, not absorbance units.
const ABSORBANCE_UNITS: c_int = 0;

/// The installed FTDI driver and SpectroScan DSP library.
#[derive(Debug, Default, Clone, Copy)]
pub struct VendorSpectroScan;

impl VendorSpectroScan {
    /// Bind to the installed vendor libraries.
    pub fn new() -> Self {
        Self
    }
}

fn raw_handle(handle: NativeHandle) -> sys::FT_HANDLE {
    handle as usize as sys::FT_HANDLE
}

fn status(operation: &'static str, code: sys::FT_STATUS) -> DeviceResult<()> {
    check_status(operation, NativeStatus(code as u32))
}

fn c_len(operation: &'static str, len: usize) -> DeviceResult<c_int> {
    c_int::try_from(len).map_err(|_| DeviceError::protocol(operation, format!("buffer of {} too large", len)))
}

impl SerialDriver for VendorSpectroScan {
    fn device_count(&self) -> DeviceResult<u32> {
        let mut count: sys::DWORD = 0;
        // SAFETY: `count` is a valid out-pointer for the duration of the call.
        status("FT_CreateDeviceInfoList", unsafe {
            sys::FT_CreateDeviceInfoList(&mut count)
        })?;
        Ok(count as u32)
    }

    fn open(&self, index: u32) -> DeviceResult<Option<NativeHandle>> {
        let mut handle: sys::FT_HANDLE = std::ptr::null_mut();
        let index = c_len("FT_Open", index as usize)?;
        // SAFETY: `handle` is a valid out-pointer for the duration of the call.
        let code = unsafe { sys::FT_Open(index, &mut handle) };
        if code == sys::FT_DEVICE_NOT_FOUND {
            return Ok(None);
        }
        status("FT_Open", code)?;
        Ok(Some(handle as usize as NativeHandle))
    }

    fn close(&self, handle: NativeHandle) -> DeviceResult<()> {
        // SAFETY: the driver validates the handle and reports FT_INVALID_HANDLE.
        status("FT_Close", unsafe { sys::FT_Close(raw_handle(handle)) })
    }

    fn set_baud_rate(&self, handle: NativeHandle, baud_rate: u32) -> DeviceResult<()> {
        // SAFETY: plain value arguments on a driver-validated handle.
        status("FT_SetBaudRate", unsafe {
            sys::FT_SetBaudRate(raw_handle(handle), baud_rate as sys::DWORD)
        })
    }

    fn set_data_characteristics(
        &self,
        handle: NativeHandle,
        characteristics: DataCharacteristics,
    ) -> DeviceResult<()> {
        // SAFETY: plain value arguments on a driver-validated handle.
        status("FT_SetDataCharacteristics", unsafe {
            sys::FT_SetDataCharacteristics(
                raw_handle(handle),
                characteristics.word_length,
                characteristics.stop_bits,
                characteristics.parity,
            )
        })
    }

    fn write(&self, handle: NativeHandle, bytes: &[u8]) -> DeviceResult<usize> {
        let mut buffer = bytes.to_vec();
        let mut written: sys::DWORD = 0;
        // SAFETY: the driver reads at most `buffer.len()` bytes from `buffer`.
        status("FT_Write", unsafe {
            sys::FT_Write(
                raw_handle(handle),
                buffer.as_mut_ptr() as *mut c_void,
                buffer.len() as sys::DWORD,
                &mut written,
            )
        })?;
        Ok(written as usize)
    }

    fn read(&self, handle: NativeHandle, max_len: usize) -> DeviceResult<Vec<u8>> {
        let mut buffer = vec![0u8; max_len];
        let mut returned: sys::DWORD = 0;
        // SAFETY: the driver writes at most `max_len` bytes into `buffer`.
        status("FT_Read", unsafe {
            sys::FT_Read(
                raw_handle(handle),
                buffer.as_mut_ptr() as *mut c_void,
                max_len as sys::DWORD,
                &mut returned,
            )
        })?;
        buffer.truncate((returned as usize).min(max_len));
        Ok(buffer)
    }

    fn queue_status(&self, handle: NativeHandle) -> DeviceResult<usize> {
        let mut pending: sys::DWORD = 0;
        // SAFETY: `pending` is a valid out-pointer for the duration of the call.
        status("FT_GetQueueStatus", unsafe {
            sys::FT_GetQueueStatus(raw_handle(handle), &mut pending)
        })?;
        Ok(pending as usize)
    }

    fn is_alive(&self, handle: NativeHandle) -> bool {
        self.queue_status(handle).is_ok()
    }
}

impl DspDriver for VendorSpectroScan {
    fn decode_frames(&self, raw: &[u8]) -> DeviceResult<Vec<i32>> {
        let mut buffer = raw.to_vec();
        let mut interferogram = vec![0 as c_int; raw.len() / 2];
        let raw_len = c_len("FTIR_UartConversion", buffer.len())?;
        // SAFETY: the library reads `raw_len` bytes and writes `raw_len / 2`
        // samples, which is exactly what both buffers hold.
        unsafe {
            sys::FTIR_UartConversion(
                buffer.as_mut_ptr(),
                UART_MODE,
                interferogram.as_mut_ptr(),
                raw_len,
                raw_len,
            );
        }
        Ok(interferogram)
    }

    fn interferogram_to_spectrum(
        &self,
        interferogram: &[i32],
        params: &SpectrumParams,
    ) -> DeviceResult<Spectrum> {
        let len = interferogram.len();
        let count = c_len("FTIR_InterferogramToSpectrum", len)?;
        let mut samples = interferogram.to_vec();
        let mut spectrum = Spectrum {
            magnitude: vec![0.0; len],
            wavenumber: vec![0.0; len],
            interferogram_ac: vec![0.0; len],
        };
        // SAFETY: every output buffer holds `len` elements, the length passed
        // for each of them.
        unsafe {
            sys::FTIR_InterferogramToSpectrum(
                samples.as_mut_ptr(),
                params.zero_padding,
                params.band_mode,
                params.apodization,
                params.peak,
                params.calibration_factor,
                spectrum.magnitude.as_mut_ptr(),
                spectrum.wavenumber.as_mut_ptr(),
                spectrum.interferogram_ac.as_mut_ptr(),
                count,
                count,
                count,
            );
        }
        Ok(spectrum)
    }

    fn interpolate(
        &self,
        spectrum: &Spectrum,
        range_min: f64,
        range_max: f64,
    ) -> DeviceResult<Interpolation> {
        if range_max <= range_min {
            return Err(DeviceError::validation(format!(
                "empty interpolation range {}..{}",
                range_min, range_max
            )));
        }
        let points = (range_max - range_min) as usize;
        let c_points = c_len("FTIR_Spectrum_Interpo", points)?;

        // the spectrum doubles as its own reference
        let mut magnitude = spectrum.magnitude.clone();
        let mut wavenumber = spectrum.wavenumber.clone();
        let mut reference_magnitude = spectrum.magnitude.clone();
        let mut reference_wavenumber = spectrum.wavenumber.clone();
        let mut result = Interpolation {
            absorption: vec![0.0; points],
            raw: vec![0.0; points],
            wavelength: vec![0.0; points],
        };
        // SAFETY: each output buffer holds `points` elements, the length
        // passed for each of them; inputs are owned copies.
        unsafe {
            sys::FTIR_Spectrum_Interpo(
                magnitude.as_mut_ptr(),
                wavenumber.as_mut_ptr(),
                reference_magnitude.as_mut_ptr(),
                reference_wavenumber.as_mut_ptr(),
                INTERPOLATION_SCAN,
                ABSORBANCE_UNITS,
                range_min,
                range_max,
                result.absorption.as_mut_ptr(),
                result.raw.as_mut_ptr(),
                result.wavelength.as_mut_ptr(),
                c_points,
                c_points,
                c_points,
            );
        }
        Ok(result)
    }

    fn update_alignment(&self, handle: NativeHandle, x: f64, y: f64) -> DeviceResult<()> {
        // SAFETY: plain value arguments.
        unsafe { sys::FTIR_UpdateAlignment(handle, x, y) };
        Ok(())
    }
}
