//! Connector (§4.4): dial with retries, exponential backoff, optional TLS.
//!
//! Grounded on `vector`'s `sinks::util::tcp::TcpConnector` (`other_examples`
//! pack): a `fresh_backoff()` constructor feeding a `connect_backoff` retry
//! loop. `RetryPolicy` here plays the role of vector's hardcoded backoff
//! constants, made caller-configurable per §3.

use std::time::Duration;

use rand::Rng;

use crate::error::GocatError;
use crate::fields;
use crate::log::Log;
use crate::metrics::MetricsSink;
use crate::signal::CancelToken;
use crate::transport::{self, Connection, Endpoint};

/// Retry policy for [`connect`] (§3). `max_attempts == 0` means retry
/// indefinitely until cancellation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// `backoff_n = min(initial_backoff * multiplier^n, max_backoff)`,
    /// with +/-25% jitter applied when `jitter` is set (§4.4).
    fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff.as_secs_f64());
        let secs = if self.jitter {
            let jitter_factor = rand::thread_rng().gen_range(0.75..1.25);
            capped * jitter_factor
        } else {
            capped
        };
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// `connect(endpoint, retry_policy, cancel) -> Connection | Error` (§4.4).
///
/// `per_attempt_timeout` bounds each individual dial; it is distinct from
/// the backoff sleep between attempts (§5: timeouts are not cumulative).
pub async fn connect(
    endpoint: &Endpoint,
    retry_policy: &RetryPolicy,
    per_attempt_timeout: Duration,
    cancel: &CancelToken,
    log: &dyn Log,
    metrics: &dyn MetricsSink,
) -> Result<Connection, GocatError> {
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(GocatError::Cancelled);
        }

        match transport::dial(endpoint, per_attempt_timeout).await {
            Ok(conn) => {
                if attempt > 0 {
                    metrics.increment_counter("connector_successful_retry", &[]);
                    log.info(
                        "connected after retry",
                        &fields![("attempt", attempt as i64)],
                    );
                }
                return Ok(conn);
            }
            Err(err) => {
                let non_transient = matches!(
                    err,
                    GocatError::ResolutionFailure(_) | GocatError::TlsHandshakeFailure(_)
                );
                if non_transient {
                    log.warn(
                        "dial failed with a non-transient error; aborting without retry",
                        &fields![("error", err.to_string())],
                    );
                    return Err(err);
                }

                let exhausted =
                    retry_policy.max_attempts != 0 && attempt + 1 >= retry_policy.max_attempts;
                if exhausted {
                    metrics.increment_counter("connector_failed_retry", &[]);
                    return Err(err);
                }

                metrics.increment_counter("connector_retry_attempt", &[]);
                let backoff = retry_policy.backoff_for_attempt(attempt);
                log.warn(
                    "dial failed; retrying after backoff",
                    &fields![
                        ("error", err.to_string()),
                        ("attempt", attempt as i64),
                        ("backoff_ms", backoff.as_millis() as i64)
                    ],
                );

                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => return Err(GocatError::Cancelled),
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::NullLog;
    use crate::metrics::{CountingMetrics, NullMetrics};
    use crate::transport::Family;

    #[test]
    fn backoff_respects_max_backoff_cap() {
        let policy = RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        };
        let large_attempt = policy.backoff_for_attempt(20);
        assert!(large_attempt <= policy.max_backoff);
    }

    #[test]
    fn backoff_grows_with_multiplier() {
        let policy = RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        };
        let first = policy.backoff_for_attempt(0);
        let second = policy.backoff_for_attempt(1);
        assert!(second > first);
    }

    #[tokio::test]
    async fn aborts_without_retry_on_resolution_failure() {
        let endpoint = Endpoint::Tcp {
            host: "this-host-does-not-resolve.invalid".to_string(),
            port: 80,
            family: Family::Any,
        };
        let cancel = CancelToken::new();
        let metrics = CountingMetrics::new();
        let result = connect(
            &endpoint,
            &RetryPolicy::default(),
            Duration::from_millis(500),
            &cancel,
            &NullLog,
            &metrics,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(metrics.get("connector_retry_attempt"), 0);
    }

    #[tokio::test]
    async fn cancellation_during_backoff_sleep_aborts() {
        let endpoint = Endpoint::Tcp {
            host: "127.0.0.1".to_string(),
            port: 1, // refused
            family: Family::V4,
        };
        let cancel = CancelToken::new();
        let policy = RetryPolicy {
            max_attempts: 0,
            initial_backoff: Duration::from_secs(5),
            ..RetryPolicy::default()
        };
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel_clone.cancel();
        });
        let result = connect(
            &endpoint,
            &policy,
            Duration::from_millis(200),
            &cancel,
            &NullLog,
            &NullMetrics,
        )
        .await;
        assert!(matches!(result, Err(GocatError::Cancelled)));
    }
}
