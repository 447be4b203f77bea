//! Per-host politeness limits.
//!
//! [`HostLimiter`] tracks in-flight fetches per host and hosts that asked us
//! to back off. The scheduler asks it before dequeuing a job for a host:
//!
//! - In-flight counts are lock-free: a permit is taken with a compare-and-swap
//!   that never lets the count exceed the cap, and returned when the
//!   [`HostPermit`] is dropped.
//! - Throttles are deadlines. A rate-limited response pushes the host's
//!   deadline out; deadlines never move backwards.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

#[derive(Default)]
struct HostState {
    in_flight: AtomicUsize,
    throttled_until: Mutex<Option<Instant>>,
}

/// Per-host in-flight caps and throttle deadlines.
///
/// Thread-safe: share via `Arc<HostLimiter>`.
pub struct HostLimiter {
    per_host: usize,
    hosts: Mutex<HashMap<String, Arc<HostState>>>,
}

/// A claimed in-flight slot for one host. Released on drop.
pub struct HostPermit {
    host: String,
    state: Arc<HostState>,
}

impl HostPermit {
    pub fn host(&self) -> &str {
        &self.host
    }
}

impl Drop for HostPermit {
    fn drop(&mut self) {
        self.state.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for HostPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostPermit").field("host", &self.host).finish()
    }
}

impl HostLimiter {
    /// Allow at most `per_host` concurrent fetches per host (minimum 1).
    pub fn new(per_host: usize) -> Self {
        Self {
            per_host: per_host.max(1),
            hosts: Mutex::new(HashMap::new()),
        }
    }

    pub fn per_host(&self) -> usize {
        self.per_host
    }

    fn state(&self, host: &str) -> Arc<HostState> {
        self.hosts
            .lock()
            .entry(host.to_string())
            .or_default()
            .clone()
    }

    /// Claim a slot for `host`, unless it is at its cap or throttled.
    pub fn try_acquire(&self, host: &str) -> Option<HostPermit> {
        let state = self.state(host);

        if state
            .throttled_until
            .lock()
            .is_some_and(|until| until > Instant::now())
        {
            return None;
        }

        let cap = self.per_host;
        state
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < cap).then_some(n + 1))
            .ok()?;

        Some(HostPermit {
            host: host.to_string(),
            state,
        })
    }

    /// Current in-flight count for `host`.
    pub fn in_flight(&self, host: &str) -> usize {
        self.hosts
            .lock()
            .get(host)
            .map_or(0, |s| s.in_flight.load(Ordering::Acquire))
    }

    /// Hold off new fetches to `host` for `delay`.
    pub fn throttle(&self, host: &str, delay: Duration) {
        let until = Instant::now() + delay;
        let state = self.state(host);
        let mut current = state.throttled_until.lock();
        if current.is_none_or(|c| c < until) {
            debug!("Throttling {} for {:?}", host, delay);
            *current = Some(until);
        }
    }

    /// Deadline before which `host` must not be fetched from, if in the future.
    pub fn throttled_until(&self, host: &str) -> Option<Instant> {
        let state = self.hosts.lock().get(host).cloned()?;
        let until = (*state.throttled_until.lock())?;
        (until > Instant::now()).then_some(until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cap_is_enforced_and_released() {
        let limiter = HostLimiter::new(2);

        let a = limiter.try_acquire("pds.example.com").unwrap();
        let _b = limiter.try_acquire("pds.example.com").unwrap();
        assert!(limiter.try_acquire("pds.example.com").is_none());
        assert_eq!(limiter.in_flight("pds.example.com"), 2);

        // Other hosts are independent.
        assert!(limiter.try_acquire("other.example.com").is_some());

        drop(a);
        assert_eq!(limiter.in_flight("pds.example.com"), 1);
        assert!(limiter.try_acquire("pds.example.com").is_some());
    }

    #[test]
    fn test_concurrent_acquire_never_exceeds_cap() {
        let limiter = Arc::new(HostLimiter::new(3));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                let peak = peak.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        if let Some(permit) = limiter.try_acquire("h") {
                            peak.fetch_max(limiter.in_flight("h"), Ordering::SeqCst);
                            drop(permit);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(limiter.in_flight("h"), 0);
    }

    #[tokio::test]
    async fn test_throttle_blocks_until_deadline() {
        let limiter = HostLimiter::new(4);
        limiter.throttle("h", Duration::from_millis(300));
        assert!(limiter.try_acquire("h").is_none());
        assert!(limiter.throttled_until("h").is_some());

        // A shorter throttle does not shorten the existing one.
        limiter.throttle("h", Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(limiter.try_acquire("h").is_none());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(limiter.throttled_until("h").is_none());
        assert!(limiter.try_acquire("h").is_some());
    }
}
