//! Per-service circuit breaker.
//!
//! Grounded in the teacher's `workflow-engine-core::error::circuit_breaker`
//! (atomics + `RwLock<CircuitState>`, wall-clock-driven open -> half-open
//! transition), generalized from a fixed failure-count threshold to the
//! spec's rolling time/count-bounded window with a volume + error-fraction
//! trigger, and from a `call()` wrapper to an explicit `admit` / `record_outcome`
//! pair so the proxy engine can gate routing *before* it has picked an upstream
//! call to make.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BreakerPhase {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub enum Outcome {
    Success,
    Failure,
}

/// Decision returned by `shouldAdmit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admit,
    AdmitAsProbe,
    Reject,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub window: Duration,
    pub max_samples: usize,
    pub volume_threshold: u32,
    pub error_threshold_fraction: f64,
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
            max_samples: 100,
            volume_threshold: 100,
            error_threshold_fraction: 0.5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

struct Sample {
    at: Instant,
    outcome: Outcome,
}

struct Inner {
    phase: BreakerPhase,
    samples: VecDeque<Sample>,
    opened_at: Option<Instant>,
    half_open_probe_in_flight: bool,
}

/// One breaker's mutable state, serialized behind a single lock — all
/// admission decisions and outcome recordings for a service go through here.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: RwLock<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner {
                phase: BreakerPhase::Closed,
                samples: VecDeque::new(),
                opened_at: None,
                half_open_probe_in_flight: false,
            }),
        }
    }

    fn prune(samples: &mut VecDeque<Sample>, now: Instant, window: Duration, max_samples: usize) {
        while let Some(front) = samples.front() {
            if now.duration_since(front.at) > window {
                samples.pop_front();
            } else {
                break;
            }
        }
        while samples.len() > max_samples {
            samples.pop_front();
        }
    }

    /// Decide whether a request may proceed. Open -> half-open transitions are
    /// driven purely by elapsed wall-clock time here, never by this call itself
    /// deciding to "arrive" — the transition would have already happened on any
    /// prior call once `reset_timeout` elapsed.
    pub async fn should_admit(&self) -> Admission {
        let mut inner = self.inner.write().await;
        let now = Instant::now();

        if inner.phase == BreakerPhase::Open {
            if let Some(opened_at) = inner.opened_at {
                if now.duration_since(opened_at) >= self.config.reset_timeout {
                    inner.phase = BreakerPhase::HalfOpen;
                    inner.half_open_probe_in_flight = false;
                    tracing::info!(phase = "half_open", "circuit breaker transitioned");
                }
            }
        }

        match inner.phase {
            BreakerPhase::Closed => Admission::Admit,
            BreakerPhase::Open => Admission::Reject,
            BreakerPhase::HalfOpen => {
                if inner.half_open_probe_in_flight {
                    Admission::Reject
                } else {
                    inner.half_open_probe_in_flight = true;
                    Admission::AdmitAsProbe
                }
            }
        }
    }

    /// Record the outcome of an admitted call and possibly transition state.
    pub async fn record_outcome(&self, outcome: Outcome) {
        let mut inner = self.inner.write().await;
        let now = Instant::now();

        match inner.phase {
            BreakerPhase::HalfOpen => {
                inner.half_open_probe_in_flight = false;
                match outcome {
                    Outcome::Success => {
                        inner.phase = BreakerPhase::Closed;
                        inner.samples.clear();
                        inner.opened_at = None;
                        tracing::info!(phase = "closed", "circuit breaker recovered");
                    }
                    Outcome::Failure => {
                        inner.phase = BreakerPhase::Open;
                        inner.opened_at = Some(now);
                        inner.samples.clear();
                        tracing::warn!(phase = "open", "circuit breaker re-opened after failed probe");
                    }
                }
            }
            BreakerPhase::Closed => {
                inner.samples.push_back(Sample { at: now, outcome });
                Self::prune(&mut inner.samples, now, self.config.window, self.config.max_samples);

                let total = inner.samples.len() as u32;
                if total >= self.config.volume_threshold {
                    let failures =
                        inner.samples.iter().filter(|s| matches!(s.outcome, Outcome::Failure)).count() as f64;
                    let fraction = failures / total as f64;
                    if fraction >= self.config.error_threshold_fraction {
                        inner.phase = BreakerPhase::Open;
                        inner.opened_at = Some(now);
                        tracing::warn!(
                            failures,
                            total,
                            fraction,
                            phase = "open",
                            "circuit breaker tripped"
                        );
                    }
                }
            }
            BreakerPhase::Open => {
                // A lagging outcome from a call admitted just before the breaker
                // opened; nothing to do, the window was already cleared.
            }
        }
    }

    /// Clears a stranded half-open probe slot without recording a success or
    /// failure — used when the admitted probe call is cancelled (the client
    /// disconnected) rather than completing, so it never counts as a breaker
    /// outcome but also never wedges the breaker in half-open forever.
    pub async fn release_probe(&self) {
        let mut inner = self.inner.write().await;
        if inner.phase == BreakerPhase::HalfOpen {
            inner.half_open_probe_in_flight = false;
        }
    }

    pub async fn stats(&self) -> BreakerStats {
        let inner = self.inner.read().await;
        let total = inner.samples.len();
        let failures = inner.samples.iter().filter(|s| matches!(s.outcome, Outcome::Failure)).count();
        BreakerStats {
            phase: inner.phase,
            sample_count: total,
            failure_count: failures,
            reset_timeout_secs: self.config.reset_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub phase: BreakerPhase,
    pub sample_count: usize,
    pub failure_count: usize,
    pub reset_timeout_secs: u64,
}

/// One breaker per service name, created lazily on first use and retained for
/// the process lifetime. Across services there is no shared mutable state.
pub struct CircuitBreakerSet {
    config: BreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerSet {
    pub fn new(config: BreakerConfig) -> Self {
        Self { config, breakers: RwLock::new(HashMap::new()) }
    }

    async fn breaker_for(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(b) = self.breakers.read().await.get(service) {
            return b.clone();
        }
        let mut breakers = self.breakers.write().await;
        breakers
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.clone())))
            .clone()
    }

    pub async fn should_admit(&self, service: &str) -> Admission {
        self.breaker_for(service).await.should_admit().await
    }

    pub async fn record_outcome(&self, service: &str, outcome: Outcome) {
        self.breaker_for(service).await.record_outcome(outcome).await;
    }

    pub async fn release_probe(&self, service: &str) {
        self.breaker_for(service).await.release_probe().await;
    }

    pub async fn stats(&self, service: &str) -> BreakerStats {
        self.breaker_for(service).await.stats().await
    }

    pub async fn all_stats(&self) -> HashMap<String, BreakerStats> {
        let breakers = self.breakers.read().await;
        let mut out = HashMap::new();
        for (name, breaker) in breakers.iter() {
            out.insert(name.clone(), breaker.stats().await);
        }
        out
    }
}
