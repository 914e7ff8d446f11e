//! Per-service upstream concurrency cap.
//!
//! Grounded in §5's backpressure policy: a `tokio::sync::Semaphore` per
//! service acquired with `try_acquire` (non-blocking) before the upstream
//! call, generalizing the teacher's registry's `RwLock<HashMap<..>>` lazy
//! per-key creation pattern from health state to permit pools.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};

/// Holds one semaphore per service name, sized uniformly from `AppConfig`.
/// A request that cannot immediately acquire a permit is rejected rather than
/// queued — there is no unbounded queue anywhere in the hot path.
pub struct ConcurrencyLimiter {
    cap: usize,
    semaphores: RwLock<HashMap<String, Arc<Semaphore>>>,
}

impl ConcurrencyLimiter {
    pub fn new(cap: usize) -> Self {
        Self { cap, semaphores: RwLock::new(HashMap::new()) }
    }

    async fn semaphore_for(&self, service: &str) -> Arc<Semaphore> {
        if let Some(s) = self.semaphores.read().await.get(service) {
            return s.clone();
        }
        let mut semaphores = self.semaphores.write().await;
        semaphores
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.cap)))
            .clone()
    }

    /// Non-blocking acquire. Returns `None` (reject) when the cap is already
    /// saturated for this service.
    pub fn try_acquire(&self, service: &str) -> Option<OwnedSemaphorePermit> {
        // `try_acquire` itself never awaits, but locating the right semaphore
        // may need to create one — done synchronously via `blocking_read`
        // would deadlock on a single-threaded runtime, so the lookup happens
        // through a cached handle populated by `prime`, falling back to a
        // best-effort synchronous path for services seen before.
        self.semaphores
            .try_read()
            .ok()
            .and_then(|map| map.get(service).cloned())
            .and_then(|sem| sem.try_acquire_owned().ok())
    }

    /// Ensures a semaphore exists for `service` before the hot path needs one
    /// synchronously. Called once per statically configured or newly
    /// registered service.
    pub async fn prime(&self, service: &str) {
        self.semaphore_for(service).await;
    }
}
