//! Retry logic with exponential backoff and jitter for key requests

use crate::Result;
use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Add up to 25% random delay so clients do not retry in lockstep
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based), without jitter
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.saturating_sub(1) as i32);
        let secs = self.initial_backoff.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(secs)
    }

    /// Execute operation, retrying errors that report themselves retryable
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!("Key request succeeded after {} attempts", attempt);
                    }
                    return Ok(result);
                }
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let mut backoff = self.backoff_for(attempt);
                    if self.jitter {
                        backoff = add_jitter(backoff);
                    }

                    warn!(
                        "Key request failed (attempt {}/{}): {}. Retrying after {:?}",
                        attempt, self.max_attempts, e, backoff
                    );
                    sleep(backoff).await;
                }
                Err(e) => {
                    if attempt > 1 {
                        warn!("Key request failed after {} attempts: {}", attempt, e);
                    }
                    return Err(e);
                }
            }
        }
    }
}

fn add_jitter(duration: Duration) -> Duration {
    let jitter_ms = rand::thread_rng().gen_range(0..=duration.as_millis() / 4);
    duration + Duration::from_millis(jitter_ms as u64)
}
