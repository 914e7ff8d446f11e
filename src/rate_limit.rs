//! Per-identity rate limiting.
//!
//! Grounded in the teacher's `api::rate_limit::RateLimiter` (a `Mutex<HashMap>`
//! of per-key buckets plus a periodic cleanup task), generalized from a single
//! token bucket to the spec's fixed-window count/window contract and sharded
//! across several locks (§5: "sharded by a hash of the identity to reduce
//! contention") instead of one global mutex.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const SHARD_COUNT: usize = 16;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub max_requests: u32,
    pub window: Duration,
}

impl RateLimitPolicy {
    pub const fn general() -> Self {
        Self { max_requests: 100, window: Duration::from_secs(15 * 60) }
    }

    pub const fn auth_endpoints() -> Self {
        Self { max_requests: 5, window: Duration::from_secs(15 * 60) }
    }
}

struct Bucket {
    count: u32,
    window_start: Instant,
}

struct Shard {
    buckets: Mutex<HashMap<String, Bucket>>,
}

/// Outcome of an admission check.
pub enum Admission {
    Allowed,
    Exceeded { retry_after_secs: u64 },
}

/// Sharded fixed-window limiter. Each shard owns its own mutex so identities
/// hashing to different shards never contend with each other.
pub struct RateLimiter {
    policy: RateLimitPolicy,
    shards: Vec<Shard>,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        let shards = (0..SHARD_COUNT).map(|_| Shard { buckets: Mutex::new(HashMap::new()) }).collect();
        Self { policy, shards }
    }

    fn shard_for(&self, key: &str) -> &Shard {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Check and, if allowed, count this request against `key`'s window.
    /// `count_only_failures` supports the auth-endpoint policy, where only
    /// failed attempts consume the budget — the caller records a success by
    /// calling `release` instead of letting the count stick.
    pub fn check(&self, key: &str) -> Admission {
        let shard = self.shard_for(key);
        let mut buckets = shard.buckets.lock().unwrap();
        let now = Instant::now();

        let bucket = buckets.entry(key.to_string()).or_insert_with(|| Bucket { count: 0, window_start: now });

        if now.duration_since(bucket.window_start) >= self.policy.window {
            bucket.count = 0;
            bucket.window_start = now;
        }

        if bucket.count >= self.policy.max_requests {
            let elapsed = now.duration_since(bucket.window_start);
            let remaining = self.policy.window.saturating_sub(elapsed);
            return Admission::Exceeded { retry_after_secs: remaining.as_secs().max(1) };
        }

        bucket.count += 1;
        Admission::Allowed
    }

    /// Undo the increment `check` applied — used by the auth-endpoint policy
    /// after a successful login, since successes are not counted.
    pub fn release(&self, key: &str) {
        let shard = self.shard_for(key);
        let mut buckets = shard.buckets.lock().unwrap();
        if let Some(bucket) = buckets.get_mut(key) {
            bucket.count = bucket.count.saturating_sub(1);
        }
    }

    /// Evict buckets whose window rolled past long enough ago that they are
    /// unambiguously stale, freeing memory for identities that stopped sending
    /// traffic. Run by a background GC tick, never on the hot path.
    pub fn garbage_collect(&self, idle_after: Duration) {
        let now = Instant::now();
        for shard in &self.shards {
            let mut buckets = shard.buckets.lock().unwrap();
            buckets.retain(|_, bucket| now.duration_since(bucket.window_start) < idle_after);
        }
    }
}

/// The two policies offered per route group (§4.6): a route attribute, not a
/// per-client attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    General,
    AuthEndpoint,
}

/// Holds one limiter per policy kind so each route group's budget is tracked
/// independently.
pub struct RateLimiters {
    pub general: RateLimiter,
    pub auth_endpoints: RateLimiter,
}

impl RateLimiters {
    pub fn new() -> Self {
        Self {
            general: RateLimiter::new(RateLimitPolicy::general()),
            auth_endpoints: RateLimiter::new(RateLimitPolicy::auth_endpoints()),
        }
    }

    pub fn for_kind(&self, kind: PolicyKind) -> &RateLimiter {
        match kind {
            PolicyKind::General => &self.general,
            PolicyKind::AuthEndpoint => &self.auth_endpoints,
        }
    }

    pub fn garbage_collect(&self, idle_after: Duration) {
        self.general.garbage_collect(idle_after);
        self.auth_endpoints.garbage_collect(idle_after);
    }
}

impl Default for RateLimiters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_the_configured_maximum() {
        let policy = RateLimitPolicy { max_requests: 3, window: Duration::from_secs(60) };
        let limiter = RateLimiter::new(policy);
        for _ in 0..3 {
            assert!(matches!(limiter.check("1.2.3.4"), Admission::Allowed));
        }
        match limiter.check("1.2.3.4") {
            Admission::Exceeded { retry_after_secs } => {
                assert!(retry_after_secs >= 1 && retry_after_secs <= 60);
            }
            Admission::Allowed => panic!("expected rate limit to trigger"),
        }
    }

    #[test]
    fn window_resets_after_expiry() {
        let policy = RateLimitPolicy { max_requests: 1, window: Duration::from_millis(20) };
        let limiter = RateLimiter::new(policy);
        assert!(matches!(limiter.check("a"), Admission::Allowed));
        assert!(matches!(limiter.check("a"), Admission::Exceeded { .. }));

        std::thread::sleep(Duration::from_millis(30));
        assert!(matches!(limiter.check("a"), Admission::Allowed));
    }

    #[test]
    fn distinct_identities_have_independent_buckets() {
        let policy = RateLimitPolicy { max_requests: 1, window: Duration::from_secs(60) };
        let limiter = RateLimiter::new(policy);
        assert!(matches!(limiter.check("a"), Admission::Allowed));
        assert!(matches!(limiter.check("b"), Admission::Allowed));
    }

    #[test]
    fn release_gives_back_a_slot_for_successful_auth() {
        let policy = RateLimitPolicy { max_requests: 1, window: Duration::from_secs(60) };
        let limiter = RateLimiter::new(policy);
        assert!(matches!(limiter.check("a"), Admission::Allowed));
        limiter.release("a");
        assert!(matches!(limiter.check("a"), Admission::Allowed));
    }

    #[test]
    fn garbage_collect_evicts_idle_buckets() {
        let limiter = RateLimiter::new(RateLimitPolicy { max_requests: 5, window: Duration::from_secs(60) });
        limiter.check("a");
        limiter.garbage_collect(Duration::from_millis(0));
        // After GC with a zero idle threshold, the bucket is gone and a fresh
        // window starts — the immediate next check still succeeds.
        assert!(matches!(limiter.check("a"), Admission::Allowed));
    }
}
