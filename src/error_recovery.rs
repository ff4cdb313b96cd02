//! Retry policies for recoverable operations.
//
// Only the external capture strategy retries. The direct-serial protocol
// fails fast and never goes through here.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::ExternalCaptureConfig;
use crate::error::{DeviceError, DeviceResult};

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_delay: Duration::ZERO,
        }
    }
}

impl From<&ExternalCaptureConfig> for RetryPolicy {
    fn from(config: &ExternalCaptureConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }
}

/// Run `attempt` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts run out.
///
/// `attempt` receives the 1-based attempt number. When every attempt failed
/// with a retryable error, `exhausted` turns the attempt count and the last
/// error into the error that is returned.
pub async fn retry_with_policy<T, F, Fut, E>(
    policy: &RetryPolicy,
    label: &'static str,
    mut attempt: F,
    exhausted: E,
) -> DeviceResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = DeviceResult<T>>,
    E: FnOnce(u32, DeviceError) -> DeviceError,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for number in 1..=max_attempts {
        match attempt(number).await {
            Ok(value) => {
                if number > 1 {
                    debug!(label, attempt = number, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() => {
                warn!(label, attempt = number, max_attempts, error = %err, "Attempt failed");
                last_error = Some(err);
                if number < max_attempts && !policy.backoff_delay.is_zero() {
                    sleep(policy.backoff_delay).await;
                }
            }
            Err(err) => return Err(err),
        }
    }

    let last = last_error.unwrap_or_else(|| DeviceError::protocol(label, "no attempt was made"));
    Err(exhausted(max_attempts, last))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn io_failure() -> DeviceError {
        DeviceError::Io(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
    }

    fn gave_up(attempts: u32, _last: DeviceError) -> DeviceError {
        DeviceError::CaptureProcessFailed { attempts }
    }

    #[tokio::test]
    async fn test_retry_logic_succeeds() {
        let calls = Cell::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(10),
        };
        let result = retry_with_policy(
            &policy,
            "test",
            |number| {
                calls.set(calls.get() + 1);
                async move {
                    if number >= 2 {
                        Ok(number)
                    } else {
                        Err(io_failure())
                    }
                }
            },
            gave_up,
        )
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn test_retry_logic_fails() {
        let calls = Cell::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::ZERO,
        };
        let result: DeviceResult<()> = retry_with_policy(
            &policy,
            "test",
            |_| {
                calls.set(calls.get() + 1);
                async { Err(io_failure()) }
            },
            gave_up,
        )
        .await;
        assert!(matches!(
            result,
            Err(DeviceError::CaptureProcessFailed { attempts: 3 })
        ));
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let calls = Cell::new(0);
        let result: DeviceResult<()> = retry_with_policy(
            &RetryPolicy::default(),
            "test",
            |_| {
                calls.set(calls.get() + 1);
                async { Err(DeviceError::ResultFile("bad json".to_string())) }
            },
            gave_up,
        )
        .await;
        assert!(matches!(result, Err(DeviceError::ResultFile(_))));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_policy_from_config() {
        let config = ExternalCaptureConfig {
            max_attempts: 2,
            retry_delay_ms: 250,
            ..ExternalCaptureConfig::default()
        };
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.backoff_delay, Duration::from_millis(250));
    }
}
