//! Exponential backoff with jitter, and server-specified retry delays.

use rand::Rng;
use reqwest::header::HeaderMap;
use std::time::Duration;

/// Bounded exponential backoff.
///
/// The delay before retry `n` (zero-based) is `base_delay * 2^n`, capped at
/// `max_delay`, then scaled by a random factor in `[0.5, 1.5)` when jitter is
/// enabled so that many clients do not retry in lockstep.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first. Zero means unbounded.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: true,
        }
    }

    /// Same policy without jitter, for deterministic tests.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// An unbounded policy, for loops meant to run forever.
    pub fn unbounded(base_delay: Duration, max_delay: Duration) -> Self {
        Self::new(0, base_delay, max_delay)
    }

    /// Delay to wait after failed attempt number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        let delay = self
            .base_delay
            .saturating_mul(factor)
            .min(self.max_delay);

        if self.jitter {
            delay.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
        } else {
            delay
        }
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts == 0 || attempts < self.max_attempts
    }
}

/// Delay requested by a rate-limited response.
///
/// Reads `Retry-After` as delta seconds, falling back to `ratelimit-reset`
/// as a Unix timestamp. HTTP-date forms of `Retry-After` are not honoured.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
    };

    if let Some(secs) = header("retry-after") {
        return Some(Duration::from_secs(secs));
    }

    let reset = header("ratelimit-reset")?;
    let now = chrono::Utc::now().timestamp();
    let wait = u64::try_from(reset as i64 - now).unwrap_or(0);
    Some(Duration::from_secs(wait))
}
