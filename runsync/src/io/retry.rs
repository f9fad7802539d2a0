//! Exponential backoff with jitter for remote store calls.

use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::StoreError;
use crate::io::config::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `retry` (0 for the first retry): `base * 2^retry`, capped,
    /// plus up to 25% jitter.
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.min(16)).unwrap_or(u32::MAX);
        let raw = self.base.saturating_mul(factor).min(self.max);
        let jitter = rand::thread_rng().gen_range(0.0..0.25);
        raw + raw.mul_f64(jitter)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or attempts run out.
    pub fn retry<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < self.max_attempts => {
                    let delay = self.delay(attempt);
                    warn!(what, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, err = %err, "retrying");
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl From<RetryConfig> for Backoff {
    fn from(cfg: RetryConfig) -> Self {
        Backoff::new(
            Duration::from_millis(cfg.base_delay_ms),
            Duration::from_millis(cfg.max_delay_ms),
            cfg.max_attempts,
        )
    }
}
