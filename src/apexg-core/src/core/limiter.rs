use crate::models::{RateLimitPolicy, WindowStrategy};
use chrono::Utc;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// 0 when rate limiting is disabled for the endpoint.
    pub limit: u64,
    pub remaining: u64,
    /// Time until the current window resets.
    pub reset_after: Duration,
}

impl RateLimitDecision {
    pub fn unlimited() -> Self {
        Self { allowed: true, limit: 0, remaining: 0, reset_after: Duration::ZERO }
    }

    /// Reset instant as unix seconds, rounded up.
    pub fn reset_at_unix(&self) -> i64 {
        let mut secs = self.reset_after.as_secs() as i64;
        if self.reset_after.subsec_nanos() > 0 {
            secs += 1;
        }
        Utc::now().timestamp() + secs
    }
}

#[derive(Debug)]
enum Window {
    Fixed { count: u64, expires_at: Instant },
    Sliding { hits: VecDeque<Instant> },
}

impl Window {
    fn for_strategy(strategy: WindowStrategy, now: Instant) -> Self {
        match strategy {
            WindowStrategy::Fixed => Window::Fixed { count: 0, expires_at: now },
            WindowStrategy::Sliding => Window::Sliding { hits: VecDeque::new() },
        }
    }

    fn matches(&self, strategy: WindowStrategy) -> bool {
        matches!(
            (self, strategy),
            (Window::Fixed { .. }, WindowStrategy::Fixed)
                | (Window::Sliding { .. }, WindowStrategy::Sliding)
        )
    }

    fn is_stale(&mut self, now: Instant, window: Duration) -> bool {
        match self {
            Window::Fixed { expires_at, .. } => now >= *expires_at,
            Window::Sliding { hits } => {
                prune(hits, now, window);
                hits.is_empty()
            }
        }
    }
}

fn prune(hits: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = hits.front() {
        if now.saturating_duration_since(*front) >= window {
            hits.pop_front();
        } else {
            break;
        }
    }
}

/// Per (endpoint, client) request counters.
///
/// The counter for a key is read and incremented while holding its map
/// shard's write lock, so concurrent requests from one client never race.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: DashMap<(String, String), Window>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self { windows: DashMap::new() }
    }

    pub fn allow(&self, endpoint_id: &str, client_id: &str, policy: &RateLimitPolicy) -> RateLimitDecision {
        if !policy.enabled {
            return RateLimitDecision::unlimited();
        }
        let now = Instant::now();
        let window = Duration::from_secs(policy.window_secs.max(1));
        let limit = policy.requests;

        let mut entry = self
            .windows
            .entry((endpoint_id.to_string(), client_id.to_string()))
            .or_insert_with(|| Window::for_strategy(policy.strategy, now));
        if !entry.matches(policy.strategy) {
            *entry = Window::for_strategy(policy.strategy, now);
        }

        match &mut *entry {
            Window::Fixed { count, expires_at } => {
                if *count == 0 || now >= *expires_at {
                    *count = 0;
                    *expires_at = now + window;
                }
                *count += 1;
                RateLimitDecision {
                    allowed: *count <= limit,
                    limit,
                    remaining: limit.saturating_sub(*count),
                    reset_after: expires_at.saturating_duration_since(now),
                }
            }
            Window::Sliding { hits } => {
                prune(hits, now, window);
                // denied requests are not recorded, the log never exceeds the ceiling
                let allowed = (hits.len() as u64) < limit;
                if allowed {
                    hits.push_back(now);
                }
                let reset_after = hits
                    .front()
                    .map(|first| (*first + window).saturating_duration_since(now))
                    .unwrap_or(window);
                RateLimitDecision {
                    allowed,
                    limit,
                    remaining: limit.saturating_sub(hits.len() as u64),
                    reset_after,
                }
            }
        }
    }

    /// Drops windows that have fully elapsed. `window_of` gives the window
    /// length currently configured for an endpoint.
    pub fn sweep<F>(&self, window_of: F) -> usize
    where
        F: Fn(&str) -> Option<Duration>,
    {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|(endpoint_id, _), w| match window_of(endpoint_id) {
            Some(window) => !w.is_stale(now, window),
            None => false,
        });
        before.saturating_sub(self.windows.len())
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn fixed_window_ceiling() {
        let rl = RateLimiter::new();
        let policy = RateLimitPolicy::fixed(100, 60);
        for n in 1..=100u64 {
            let d = rl.allow("ep_001", "10.0.0.1", &policy);
            assert!(d.allowed, "request {n} should pass");
            assert_eq!(d.remaining, 100 - n);
            assert_eq!(d.limit, 100);
        }
        let d = rl.allow("ep_001", "10.0.0.1", &policy);
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
        // other clients are counted separately
        assert!(rl.allow("ep_001", "10.0.0.2", &policy).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_window_resets_after_elapsing() {
        let rl = RateLimiter::new();
        let policy = RateLimitPolicy::fixed(2, 60);
        rl.allow("ep", "c", &policy);
        rl.allow("ep", "c", &policy);
        let denied = rl.allow("ep", "c", &policy);
        assert!(!denied.allowed);
        assert_eq!(denied.reset_after, Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(60)).await;
        let d = rl.allow("ep", "c", &policy);
        assert!(d.allowed);
        assert_eq!(d.remaining, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sliding_window_frees_slots_gradually() {
        let rl = RateLimiter::new();
        let policy = RateLimitPolicy::sliding(2, 10);
        assert!(rl.allow("ep", "c", &policy).allowed);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(rl.allow("ep", "c", &policy).allowed);
        let d = rl.allow("ep", "c", &policy);
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
        assert_eq!(d.reset_after, Duration::from_secs(5));

        tokio::time::advance(Duration::from_secs(5)).await;
        let d = rl.allow("ep", "c", &policy);
        assert!(d.allowed);
        assert_eq!(d.remaining, 0);
    }

    #[test]
    fn disabled_policy_always_allows() {
        let rl = RateLimiter::new();
        let d = rl.allow("ep", "c", &RateLimitPolicy::default());
        assert!(d.allowed);
        assert_eq!(d.limit, 0);
        assert!(rl.is_empty());
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let rl = Arc::new(RateLimiter::new());
        let policy = RateLimitPolicy::fixed(50, 3600);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let rl = rl.clone();
                let policy = policy.clone();
                std::thread::spawn(move || {
                    (0..25).filter(|_| rl.allow("ep", "same-client", &policy).allowed).count()
                })
            })
            .collect();
        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_elapsed_windows() {
        let rl = RateLimiter::new();
        let policy = RateLimitPolicy::fixed(5, 10);
        rl.allow("ep", "a", &policy);
        rl.allow("gone", "a", &policy);
        tokio::time::advance(Duration::from_secs(11)).await;
        rl.allow("ep", "b", &policy);
        let removed = rl.sweep(|id| (id == "ep").then(|| Duration::from_secs(10)));
        assert_eq!(removed, 2);
        assert_eq!(rl.len(), 1);
    }
}
