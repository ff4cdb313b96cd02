//! Configuration loading using Figment.
//!
//! Settings are layered, lowest precedence first:
//! 1. built-in defaults ([`Settings::default`])
//! 2. a TOML file (default: `config/lab_capture.toml`, optional)
//! 3. environment variables prefixed with `LABCAPTURE_`, nested keys
//!    separated by a double underscore
//!
//! ```text
//! LABCAPTURE_APPLICATION__LOG_LEVEL=debug
//! LABCAPTURE_SPECTROSCAN__ENUMERATE_SETTLE_MS=0
//! LABCAPTURE_SPECTROSCAN__EXTERNAL__MAX_ATTEMPTS=3
//! ```
//!
//! Wire-level constants of the SpectroScan protocol (command bytes, settle
//! times, DSP parameters) are deliberately absent here; they live next to the
//! protocol as named constants.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{DeviceError, DeviceResult};

/// Default location of the settings file.
pub const DEFAULT_CONFIG_PATH: &str = "config/lab_capture.toml";

/// Top-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// SpectroScan driver settings
    pub spectroscan: SpectroScanConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "lab_capture".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// SpectroScan hardware-type configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectroScanConfig {
    /// Delay before probing the driver during enumeration.
    ///
    /// Re-enumerating too soon after the unit was unplugged and replugged
    /// makes the vendor driver fail the open.
    pub enumerate_settle_ms: u64,
    /// Baud rate programmed into the USB-serial bridge
    pub baud_rate: u32,
    /// Fixed per-capture allowance added to the scan-dependent timeout
    pub capture_overhead_ms: u64,
    /// Timeout allowance per scan.
    ///
    /// A direct-serial scan sleeps a little over a second between commands
    /// on its own, so values below that time out on large scan averages.
    pub per_scan_ms: u64,
    /// Scan average a freshly enumerated device starts with
    pub default_scan_average: u32,
    /// Boxcar half-width a freshly enumerated device starts with
    pub default_boxcar: u32,
    /// Interferometer mirror alignment pushed after opening a direct-serial unit
    pub alignment: AlignmentConfig,
    /// External capture executable used by major-version-4 hardware
    pub external: ExternalCaptureConfig,
}

impl Default for SpectroScanConfig {
    fn default() -> Self {
        Self {
            enumerate_settle_ms: 4000,
            baud_rate: 2_000_000,
            capture_overhead_ms: 2 * 60 * 1000,
            per_scan_ms: 1100,
            default_scan_average: 1,
            default_boxcar: 0,
            alignment: AlignmentConfig::default(),
            external: ExternalCaptureConfig::default(),
        }
    }
}

impl SpectroScanConfig {
    /// Settle delay as a [`Duration`].
    pub fn enumerate_settle(&self) -> Duration {
        Duration::from_millis(self.enumerate_settle_ms)
    }
}

/// Mirror alignment values handed to `FTIR_UpdateAlignment`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentConfig {
    /// X axis alignment
    pub x: f64,
    /// Y axis alignment
    pub y: f64,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self { x: 29.7, y: 24.6 }
    }
}

/// External capture process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalCaptureConfig {
    /// Path of the vendor capture executable
    pub executable: PathBuf,
    /// JSON file the executable writes before exiting 0
    pub result_file: PathBuf,
    /// Attempts before the capture is reported as failed
    pub max_attempts: u32,
    /// Pause between attempts
    pub retry_delay_ms: u64,
}

impl Default for ExternalCaptureConfig {
    fn default() -> Self {
        let base = PathBuf::from("resources").join("FTIRCapture");
        Self {
            executable: base.join("NanoFTIRCaptureCPP.exe"),
            result_file: base.join("processed_spectrum.json"),
            max_attempts: 5,
            retry_delay_ms: 0,
        }
    }
}

impl Settings {
    /// Load settings from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> DeviceResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load settings from a specific file path and the environment.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> DeviceResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LABCAPTURE_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings after loading.
    pub fn validate(&self) -> DeviceResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DeviceError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let spectroscan = &self.spectroscan;
        if spectroscan.baud_rate == 0 {
            return Err(DeviceError::Configuration(
                "spectroscan.baud_rate must be > 0".to_string(),
            ));
        }
        if spectroscan.default_scan_average == 0 {
            return Err(DeviceError::Configuration(
                "spectroscan.default_scan_average must be >= 1".to_string(),
            ));
        }
        if spectroscan.external.max_attempts == 0 {
            return Err(DeviceError::Configuration(
                "spectroscan.external.max_attempts must be >= 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.spectroscan.baud_rate, 2_000_000);
        assert_eq!(settings.spectroscan.external.max_attempts, 5);
        assert_eq!(settings.spectroscan.capture_overhead_ms, 120_000);
    }

    #[test]
    fn test_default_per_scan_allowance_exceeds_settle_delays() {
        use crate::capture::protocol::{ACQUISITION_SETTLE, COMMAND_SETTLE};

        let per_scan = Duration::from_millis(SpectroScanConfig::default().per_scan_ms);
        assert!(per_scan > ACQUISITION_SETTLE * 2 + COMMAND_SETTLE * 2);
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"

[spectroscan]
enumerate_settle_ms = 0
default_boxcar = 2

[spectroscan.external]
max_attempts = 3
"#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.application.log_level, "debug");
        assert_eq!(settings.spectroscan.enumerate_settle_ms, 0);
        assert_eq!(settings.spectroscan.default_boxcar, 2);
        assert_eq!(settings.spectroscan.external.max_attempts, 3);
        // untouched keys keep their defaults
        assert_eq!(settings.spectroscan.per_scan_ms, 1100);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings.application.name, "lab_capture");
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut settings = Settings::default();
        settings.application.log_level = "loud".to_string();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut settings = Settings::default();
        settings.spectroscan.external.max_attempts = 0;
        assert!(settings.validate().is_err());
    }
}
