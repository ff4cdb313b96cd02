//! Device layer for laboratory capture hardware.
//!
//! This library discovers SpectroScan FTIR spectrometers attached through the
//! vendor USB-serial bridge, exposes each unit's settings as validated
//! properties, and captures averaged, smoothed spectra. It is used by the
//! `lab_capture` command-line tool and by any controller that speaks the
//! [`Instrument`] trait.
//!
//! - [`registry`]: per-hardware-type enumeration and device lookup
//! - [`device`]: the [`Instrument`] surface and the SpectroScan device
//! - [`capture`]: serial acquisition protocol, averaging, external capture
//! - [`parameter`]: property declarations and value validation
//! - [`hardware`]: native driver traits, the simulation, vendor bindings

pub mod capture;
pub mod config;
pub mod device;
pub mod error;
pub mod error_recovery;
pub mod hardware;
pub mod parameter;
pub mod registry;

pub use capture::SpectralSample;
pub use device::{DeviceInfo, Instrument, SpectroScanDevice};
pub use error::{DeviceError, DeviceResult};
pub use parameter::{DataType, Property};
pub use registry::{HardwareType, HardwareTypes, SpectroScanHardware};
