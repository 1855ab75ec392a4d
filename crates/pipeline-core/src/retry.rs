use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Fixed,
    Linear,
    Exponential,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Fixed
    }
}

/// Retry policy for a stage. `max_attempts = 1` means no retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
    /// Milliseconds.
    #[serde(default = "default_initial_delay")]
    pub initial_delay: u64,
    /// Milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay: u64,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_initial_delay() -> u64 {
    1_000
}

fn default_max_delay() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::Fixed,
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
        }
    }
}

impl RetryPolicy {
    /// Delay between attempt `n` (1-indexed) and the next one:
    /// `min(initial_delay * f(n), max_delay)`.
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let factor: u64 = match self.backoff {
            Backoff::Fixed => 1,
            Backoff::Linear => u64::from(attempt),
            Backoff::Exponential => 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX),
        };
        let ms = self
            .initial_delay
            .saturating_mul(factor)
            .min(self.max_delay);
        Duration::from_millis(ms)
    }
}

/// Passed to the retry hook before each delay.
pub struct RetryEvent<'a> {
    /// Attempt that just failed, 1-indexed.
    pub attempt_number: u32,
    pub max_attempts: u32,
    /// Delays taken so far, including the upcoming one.
    pub delays: &'a [Duration],
    pub last_error: &'a anyhow::Error,
}

/// Run `thunk` up to `policy.max_attempts` times, sleeping per the backoff
/// policy between attempts. The hook fires before each retry; the final
/// error propagates once attempts are exhausted.
pub async fn run_with_retry<T, F, Fut, H>(
    policy: &RetryPolicy,
    mut on_retry: H,
    mut thunk: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    H: FnMut(&RetryEvent<'_>),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut delays: Vec<Duration> = Vec::new();

    for attempt in 1..=max_attempts {
        match thunk(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt == max_attempts {
                    return Err(err);
                }
                let delay = policy.delay_after_attempt(attempt);
                delays.push(delay);
                on_retry(&RetryEvent {
                    attempt_number: attempt,
                    max_attempts,
                    delays: &delays,
                    last_error: &err,
                });
                tokio::time::sleep(delay).await;
            }
        }
    }

    unreachable!("loop returns on the final attempt")
}
