//! Bounded readiness polling.
//!
//! Probes a dependency until it answers, sleeping with exponential backoff
//! between attempts, and gives up once the total budget is spent.
//!
//! ```text
//! probe ─✗─ sleep 50ms ─ probe ─✗─ sleep 100ms ─ probe ─✓─► Ready
//!                                     ...
//! elapsed >= timeout ─────────────────────────────────────► NotReady
//! ```

use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(50);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessPolicy {
    /// Sleep after the first failed probe.
    pub initial_delay: Duration,
    /// Upper bound for a single sleep.
    pub max_delay: Duration,
    /// Total budget across all probes and sleeps.
    pub timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ReadinessPolicy {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_delay)
    }
}

/// How long it took to become ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessReport {
    pub attempts: u32,
    pub waited: Duration,
}

#[derive(Debug, Clone, Error)]
#[error("not ready after {attempts} attempts over {waited:?}")]
pub struct NotReady {
    pub attempts: u32,
    pub waited: Duration,
    /// Message of the last failed probe.
    pub last_error: Option<String>,
}

/// Calls `probe` until it succeeds or `policy.timeout` elapses.
///
/// The first probe runs immediately. A probe is always attempted at the
/// deadline before giving up.
pub async fn wait_until_ready<F, Fut, E>(
    policy: &ReadinessPolicy,
    mut probe: F,
) -> Result<ReadinessReport, NotReady>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    let start = Instant::now();
    let mut delay = policy.initial_delay;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let error = match probe().await {
            Ok(()) => {
                let report = ReadinessReport {
                    attempts,
                    waited: start.elapsed(),
                };
                info!(attempts, waited_ms = report.waited.as_millis() as u64, "dependency ready");
                return Ok(report);
            }
            Err(e) => {
                debug!(attempt = attempts, error = %e, "not ready yet");
                e.to_string()
            }
        };

        let elapsed = start.elapsed();
        if elapsed >= policy.timeout {
            return Err(NotReady {
                attempts,
                waited: elapsed,
                last_error: Some(error),
            });
        }

        tokio::time::sleep(delay.min(policy.timeout - elapsed)).await;
        delay = policy.next_delay(delay);
    }
}
