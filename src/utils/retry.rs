// src/utils/retry.rs
//! Exponential backoff for calls to upstream collaborators
//! (key store, schema loader, state anchor).

use log::warn;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Errors that may succeed on a later attempt.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Attempt budget and base delay; the delay doubles after every failure.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self { max_attempts: max_attempts.max(1), base_delay }
    }

    /// Single attempt, no sleeping. Used by tests and stubs.
    pub fn immediate() -> Self {
        Self { max_attempts: 1, base_delay: Duration::ZERO }
    }

    /// Delay before attempt `attempt + 1`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Runs `op` until it succeeds, fails permanently, or the attempt budget is spent.
pub async fn retry_with_backoff<T, E, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + Display,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!("{} failed (attempt {}/{}): {}; retrying in {:?}", what, attempt + 1, policy.max_attempts, e, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
