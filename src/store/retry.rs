//! Optimistic-concurrency retry
//!
//! Writes that race another writer fail with [`StoreError::Conflict`]. Callers
//! wrap their read-modify-write in [`retry_on_conflict`] so conflicts are
//! retried transparently; only exhaustion is ever surfaced.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use super::{StoreError, StoreResult};

/// Bounded retry policy for conflicting writes.
///
/// Constant depth: every retry waits roughly `delay`, with jitter to keep
/// competing writers from re-colliding.
#[derive(Clone, Debug)]
pub struct ConflictRetry {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Base delay between attempts
    pub delay: Duration,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for ConflictRetry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_millis(10),
            jitter: 0.1,
        }
    }
}

impl ConflictRetry {
    pub fn delay_for_attempt(&self) -> Duration {
        let base = self.delay.as_secs_f64();
        let jitter_range = base * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        Duration::from_secs_f64((base + jitter).max(0.0))
    }
}

/// Run `operation` until it succeeds, fails with a non-conflict error, or the
/// attempts are exhausted.
///
/// The operation must re-read the object on every attempt so it writes with a
/// fresh resource version.
pub async fn retry_on_conflict<F, Fut, T>(
    config: &ConflictRetry,
    operation_name: &str,
    mut operation: F,
) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation().await {
            Err(e) if e.is_conflict() && attempt < config.max_attempts => {
                let delay = config.delay_for_attempt();
                debug!(
                    operation = %operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Write conflict, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if matches!(e, StoreError::Conflict { .. }) {
                    warn!(
                        operation = %operation_name,
                        attempts = attempt,
                        "Giving up after repeated write conflicts"
                    );
                }
                return Err(e);
            }
            Ok(value) => return Ok(value),
        }
    }
}
