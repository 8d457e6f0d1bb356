//! Bounded retry with capped exponential backoff for backing-node calls.

use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry policy applied to every backing-node call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub attempts: usize,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
    /// Deadline for a single attempt.
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Build the policy from cluster settings.
    pub fn from_config(config: &ClusterConfig) -> Self {
        Self {
            attempts: config.retry_attempts.max(1),
            initial_delay: config.initial_backoff,
            max_delay: config.max_backoff,
            timeout: config.op_timeout,
        }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: usize) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(31) as u32);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `operation`, retrying transient failures.
    ///
    /// Each attempt is bounded by `timeout`; an attempt that overruns fails
    /// with [`Error::Timeout`]. Non-transient errors are returned at once.
    pub async fn run<F, Fut, T>(&self, operation_name: &str, node_id: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry = 0;

        loop {
            let result = match tokio::time::timeout(self.timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout),
            };

            match result {
                Ok(value) => {
                    if retry > 0 {
                        debug!(node_id, operation = operation_name, retries = retry, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && retry + 1 < self.attempts => {
                    let delay = self.delay_for(retry);
                    retry += 1;
                    warn!(
                        node_id,
                        operation = operation_name,
                        attempt = retry,
                        max_attempts = self.attempts,
                        error = %e,
                        ?delay,
                        "Backing-node call failed, retrying"
                    );
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ClusterConfig::default())
    }
}
