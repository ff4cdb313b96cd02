//! External-process capture strategy.
//!
//! Major-version-4 units speak a proprietary protocol that only the vendor's
//! capture executable implements. Each attempt runs the executable with the
//! scan average and the last known COM port as arguments and waits for it to
//! exit. Exit code 0 means the executable wrote its result file:
//!
//! ```json
//! {"comPort": 7, "scanData": [{"wavelength": 950.0, "measuredValue": 12.5}]}
//! ```
//!
//! A nonzero exit (or a failure to start the process) is retried according
//! to the [`RetryPolicy`]; a result file that cannot be read after a clean
//! exit is reported immediately.
//!
//! The result file is removed before every run, so a clean exit that leaves
//! no file behind is an error rather than a repeat of the previous spectrum.
//! All units sharing one [`ExternalCapture`] share its result file, so only
//! one capture runs at a time.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::SpectralSample;
use crate::config::ExternalCaptureConfig;
use crate::error::{DeviceError, DeviceResult};
use crate::error_recovery::{retry_with_policy, RetryPolicy};

/// COM port passed before any result file has reported one.
pub const UNKNOWN_COM_PORT: i32 = -1;

/// Contents of the result file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureOutput {
    /// Port the executable found the unit on
    pub com_port: i32,
    /// Captured spectrum
    pub scan_data: Vec<SpectralSample>,
}

/// Human-readable meaning of a capture executable exit code.
pub fn describe_exit_code(code: i32) -> &'static str {
    match code {
        0 => "success",
        9 => "detector saturation",
        11 => "no light",
        13 => "failed to load DLL",
        14 => "failed to connect to device",
        _ => "unknown error",
    }
}

/// One run of the capture executable.
#[async_trait]
pub trait CaptureProcess: Send + Sync {
    /// Run to completion and return the exit code.
    async fn run(&self, scan_average: u32, com_port: i32) -> DeviceResult<i32>;
}

/// The vendor executable, started as a child process.
#[derive(Debug, Clone)]
pub struct VendorCaptureProcess {
    executable: PathBuf,
}

impl VendorCaptureProcess {
    /// Use the executable at `executable`.
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }
}

#[async_trait]
impl CaptureProcess for VendorCaptureProcess {
    async fn run(&self, scan_average: u32, com_port: i32) -> DeviceResult<i32> {
        let mut command = Command::new(&self.executable);
        command.arg(scan_average.to_string()).arg(com_port.to_string());

        debug!(executable = %self.executable.display(), scan_average, com_port, "Starting capture process");
        let status = command.status().await?;
        // terminated by a signal: no code
        Ok(status.code().unwrap_or(-1))
    }
}

/// Retrying driver around a [`CaptureProcess`].
pub struct ExternalCapture {
    process: Box<dyn CaptureProcess>,
    result_file: PathBuf,
    policy: RetryPolicy,
    // held for a whole capture, retries included
    run_lock: Mutex<()>,
}

impl ExternalCapture {
    /// Wrap a process, reading results from `result_file`.
    pub fn new(
        process: Box<dyn CaptureProcess>,
        result_file: impl Into<PathBuf>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            process,
            result_file: result_file.into(),
            policy,
            run_lock: Mutex::new(()),
        }
    }

    /// The vendor executable as configured.
    pub fn from_config(config: &ExternalCaptureConfig) -> Self {
        Self::new(
            Box::new(VendorCaptureProcess::new(&config.executable)),
            &config.result_file,
            RetryPolicy::from(config),
        )
    }

    /// Capture one averaged spectrum.
    pub async fn capture(&self, scan_average: u32, com_port: i32) -> DeviceResult<CaptureOutput> {
        let _running = self.run_lock.lock().await;
        let result = retry_with_policy(
            &self.policy,
            "capture process",
            |attempt| self.attempt(attempt, scan_average, com_port),
            |attempts, last| {
                error!(attempts, last_error = %last, "Capture process failed on every attempt");
                DeviceError::CaptureProcessFailed { attempts }
            },
        )
        .await?;

        info!(
            com_port = result.com_port,
            points = result.scan_data.len(),
            "External capture complete"
        );
        Ok(result)
    }

    async fn attempt(&self, attempt: u32, scan_average: u32, com_port: i32) -> DeviceResult<CaptureOutput> {
        clear_output(&self.result_file).await?;
        let code = self.process.run(scan_average, com_port).await?;
        if code != 0 {
            let message = describe_exit_code(code);
            warn!(attempt, code, message, "Capture process exited with failure");
            return Err(DeviceError::NativeCallFailed {
                operation: "capture process",
                code: i64::from(code),
                message: message.to_string(),
            });
        }
        read_output(&self.result_file).await
    }
}

async fn clear_output(path: &Path) -> DeviceResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "Removed previous result file");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(DeviceError::ResultFile(format!(
            "cannot remove {}: {}",
            path.display(),
            err
        ))),
    }
}

async fn read_output(path: &Path) -> DeviceResult<CaptureOutput> {
    let text = tokio::fs::read_to_string(path).await.map_err(|err| {
        DeviceError::ResultFile(format!("cannot read {}: {}", path.display(), err))
    })?;
    serde_json::from_str(&text).map_err(|err| {
        DeviceError::ResultFile(format!("cannot parse {}: {}", path.display(), err))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{ProcessCalls, ScriptedCaptureProcess};

    fn sample_output() -> CaptureOutput {
        CaptureOutput {
            com_port: 7,
            scan_data: vec![
                SpectralSample {
                    wavelength: 950.0,
                    measured_value: 1.5,
                },
                SpectralSample {
                    wavelength: 951.0,
                    measured_value: 2.5,
                },
            ],
        }
    }

    fn capture_with(codes: &[i32], dir: &tempfile::TempDir) -> (ExternalCapture, ProcessCalls) {
        let result_file = dir.path().join("processed_spectrum.json");
        let process = ScriptedCaptureProcess::new(codes, &result_file).with_output(sample_output());
        let calls = process.call_log();
        let capture = ExternalCapture::new(Box::new(process), result_file, RetryPolicy::default());
        (capture, calls)
    }

    #[test]
    fn test_exit_code_descriptions() {
        assert_eq!(describe_exit_code(9), "detector saturation");
        assert_eq!(describe_exit_code(11), "no light");
        assert_eq!(describe_exit_code(13), "failed to load DLL");
        assert_eq!(describe_exit_code(14), "failed to connect to device");
        assert_eq!(describe_exit_code(1), "unknown error");
    }

    #[tokio::test]
    async fn test_succeeds_on_fifth_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let (capture, calls) = capture_with(&[1, 1, 1, 1, 0], &dir);

        let output = capture.capture(10, UNKNOWN_COM_PORT).await.unwrap();
        assert_eq!(output.com_port, 7);
        assert_eq!(output.scan_data.len(), 2);
        assert_eq!(calls.lock().len(), 5);
        assert!(calls.lock().iter().all(|&(avg, port)| avg == 10 && port == -1));
    }

    #[tokio::test]
    async fn test_fails_after_five_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let (capture, calls) = capture_with(&[1, 1, 1, 1, 1, 0], &dir);

        let err = capture.capture(1, 3).await.unwrap_err();
        assert!(matches!(err, DeviceError::CaptureProcessFailed { attempts: 5 }));
        assert_eq!(err.to_string(), "Capture process failed 5 times");
        assert_eq!(calls.lock().len(), 5);
    }

    #[tokio::test]
    async fn test_unparsable_result_file_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let result_file = dir.path().join("processed_spectrum.json");

        struct GarbledOutput(PathBuf);
        #[async_trait]
        impl CaptureProcess for GarbledOutput {
            async fn run(&self, _: u32, _: i32) -> DeviceResult<i32> {
                tokio::fs::write(&self.0, "not json").await?;
                Ok(0)
            }
        }

        let capture = ExternalCapture::new(
            Box::new(GarbledOutput(result_file.clone())),
            result_file,
            RetryPolicy::default(),
        );
        let err = capture.capture(1, -1).await.unwrap_err();
        assert!(matches!(err, DeviceError::ResultFile(ref reason) if reason.starts_with("cannot parse")));
    }

    #[tokio::test]
    async fn test_clean_exit_without_new_result_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result_file = dir.path().join("processed_spectrum.json");
        // left over from an earlier run
        std::fs::write(
            &result_file,
            r#"{"comPort": 9, "scanData": [{"wavelength": 1000.0, "measuredValue": 42.0}]}"#,
        )
        .unwrap();

        struct SilentExit;
        #[async_trait]
        impl CaptureProcess for SilentExit {
            async fn run(&self, _: u32, _: i32) -> DeviceResult<i32> {
                Ok(0)
            }
        }

        let capture = ExternalCapture::new(Box::new(SilentExit), &result_file, RetryPolicy::default());
        let err = capture.capture(1, -1).await.unwrap_err();
        assert!(matches!(err, DeviceError::ResultFile(ref reason) if reason.starts_with("cannot read")));
        assert!(!result_file.exists());
    }

    #[tokio::test]
    async fn test_failed_attempt_leaves_no_result_behind() {
        let dir = tempfile::tempdir().unwrap();
        let (capture, _calls) = capture_with(&[0, 14, 14, 14, 14, 14], &dir);

        capture.capture(1, -1).await.unwrap();
        assert!(dir.path().join("processed_spectrum.json").exists());

        let err = capture.capture(1, 7).await.unwrap_err();
        assert!(matches!(err, DeviceError::CaptureProcessFailed { attempts: 5 }));
        assert!(!dir.path().join("processed_spectrum.json").exists());
    }

    #[tokio::test]
    async fn test_shared_capture_runs_one_process_at_a_time() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        struct Overlap {
            result_file: PathBuf,
            running: AtomicUsize,
            peak: Arc<AtomicUsize>,
        }
        #[async_trait]
        impl CaptureProcess for Overlap {
            async fn run(&self, scan_average: u32, com_port: i32) -> DeviceResult<i32> {
                let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                let output = CaptureOutput {
                    com_port,
                    scan_data: vec![SpectralSample {
                        wavelength: 1000.0,
                        measured_value: f64::from(scan_average),
                    }],
                };
                tokio::fs::write(&self.result_file, serde_json::to_vec(&output)?).await?;
                self.running.fetch_sub(1, Ordering::SeqCst);
                Ok(0)
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let result_file = dir.path().join("processed_spectrum.json");
        let peak = Arc::new(AtomicUsize::new(0));
        let process = Overlap {
            result_file: result_file.clone(),
            running: AtomicUsize::new(0),
            peak: peak.clone(),
        };
        let capture = Arc::new(ExternalCapture::new(
            Box::new(process),
            result_file,
            RetryPolicy::default(),
        ));

        let first = tokio::spawn({
            let capture = capture.clone();
            async move { capture.capture(3, 1).await }
        });
        let second = tokio::spawn({
            let capture = capture.clone();
            async move { capture.capture(5, 2).await }
        });
        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        // each caller gets its own run's result
        assert_eq!((first.com_port, first.scan_data[0].measured_value), (1, 3.0));
        assert_eq!((second.com_port, second.scan_data[0].measured_value), (2, 5.0));
    }

    #[tokio::test]
    async fn test_missing_executable_counts_as_failed_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let capture = ExternalCapture::new(
            Box::new(VendorCaptureProcess::new(dir.path().join("missing-capture.exe"))),
            dir.path().join("processed_spectrum.json"),
            RetryPolicy {
                max_attempts: 2,
                ..RetryPolicy::default()
            },
        );
        let err = capture.capture(1, -1).await.unwrap_err();
        assert!(matches!(err, DeviceError::CaptureProcessFailed { attempts: 2 }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_vendor_process_receives_arguments() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("capture.sh");
        let result_file = dir.path().join("processed_spectrum.json");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\nprintf '{{\"comPort\": %s, \"scanData\": [{{\"wavelength\": 1000.0, \"measuredValue\": %s}}]}}' \"$2\" \"$1\" > '{}'\n",
                result_file.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let capture = ExternalCapture::new(
            Box::new(VendorCaptureProcess::new(&script)),
            &result_file,
            RetryPolicy::default(),
        );
        let output = capture.capture(25, 4).await.unwrap();
        assert_eq!(output.com_port, 4);
        assert_eq!(output.scan_data[0].measured_value, 25.0);
    }
}
