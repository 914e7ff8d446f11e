//! Background health prober.
//!
//! Grounded in the teacher's `bootstrap::health::HealthMonitor` (periodic
//! `start_monitoring(interval)` task, a pluggable check strategy, and a
//! recovery hook fired after repeated failures), generalized from a
//! federation-subgraph `{ __typename }` probe to an HTTP GET against each
//! instance's configured `health_check_path`.

use crate::registry::{HealthState, HealthStatus, ServiceInstance, ServiceRegistry};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Fired when an instance's reported status changes. The default handler just
/// logs; a caller that wants paging or metrics can observe the same events by
/// watching the registry instead.
#[cfg_attr(test, mockall::automock)]
pub trait RecoveryHandler: Send + Sync {
    fn on_repeated_failure(&self, instance: &ServiceInstance, consecutive_failures: u32);
}

/// Logs a warning once an instance has failed its probe `threshold` times in a
/// row, matching the teacher's `DefaultRecoveryHandler`.
pub struct LoggingRecoveryHandler {
    pub threshold: u32,
}

impl RecoveryHandler for LoggingRecoveryHandler {
    fn on_repeated_failure(&self, instance: &ServiceInstance, consecutive_failures: u32) {
        if consecutive_failures == self.threshold {
            tracing::warn!(
                service = instance.name(),
                instance_id = %instance.id,
                consecutive_failures,
                "instance has failed health checks repeatedly"
            );
        }
    }
}

/// Periodically probes every registered instance and writes the outcome back
/// into the registry. One prober per process; the registry is the only shared
/// state, so overlapping ticks on different instances never contend beyond the
/// registry's own lock discipline.
pub struct HealthProber {
    registry: Arc<ServiceRegistry>,
    http: reqwest::Client,
    interval: Duration,
    timeout: Duration,
    recovery: Arc<dyn RecoveryHandler>,
    /// Guards against a slow probe round still running when the next tick
    /// fires — the tick is skipped rather than stacked.
    in_flight: Mutex<()>,
}

impl HealthProber {
    pub fn new(registry: Arc<ServiceRegistry>, interval: Duration, timeout: Duration) -> Self {
        Self {
            registry,
            http: reqwest::Client::new(),
            interval,
            timeout,
            recovery: Arc::new(LoggingRecoveryHandler { threshold: 3 }),
            in_flight: Mutex::new(()),
        }
    }

    pub fn with_recovery_handler(mut self, handler: Arc<dyn RecoveryHandler>) -> Self {
        self.recovery = handler;
        self
    }

    /// Spawn the periodic probing task. Returns its `JoinHandle` so the caller
    /// can abort it during shutdown.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                self.run_round().await;
            }
        })
    }

    async fn run_round(&self) {
        let Ok(_guard) = self.in_flight.try_lock() else {
            tracing::warn!("skipping health probe round, previous round still running");
            return;
        };

        let instances = self.registry.snapshot().await;
        futures_util::future::join_all(instances.into_iter().map(|instance| self.probe_one(instance))).await;
    }

    async fn probe_one(&self, instance: ServiceInstance) {
        let url = format!(
            "{}{}",
            instance.target_url.trim_end_matches('/'),
            instance.descriptor.health_check_path
        );
        let start = Instant::now();

        let outcome = tokio::time::timeout(self.timeout, self.http.get(&url).send()).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let (status, failed) = match outcome {
            Ok(Ok(response)) if response.status().is_success() => (HealthStatus::Healthy, false),
            Ok(Ok(response)) => {
                tracing::debug!(url, status = %response.status(), "health probe returned non-2xx");
                (HealthStatus::Unhealthy, true)
            }
            Ok(Err(e)) => {
                tracing::debug!(url, error = %e, "health probe request failed");
                (HealthStatus::Unhealthy, true)
            }
            Err(_) => {
                tracing::debug!(url, "health probe timed out");
                (HealthStatus::Unhealthy, true)
            }
        };

        let consecutive_failures = if failed { instance.health.consecutive_failures + 1 } else { 0 };

        if instance.health.status != status {
            tracing::info!(
                service = instance.name(),
                instance_id = %instance.id,
                from = ?instance.health.status,
                to = ?status,
                "instance health transitioned"
            );
        }

        self.registry
            .update_health(
                instance.id,
                HealthState {
                    status,
                    last_probe_at: Some(chrono::Utc::now()),
                    last_latency_ms: Some(latency_ms),
                    consecutive_failures,
                },
            )
            .await;

        if failed {
            self.recovery.on_repeated_failure(&instance, consecutive_failures);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServiceDescriptor;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingRecovery {
        calls: AtomicU32,
    }

    impl RecoveryHandler for CountingRecovery {
        fn on_repeated_failure(&self, _instance: &ServiceInstance, _consecutive_failures: u32) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn descriptor(name: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            name: name.to_string(),
            health_check_path: "/healthz".to_string(),
            default_timeout_ms: 1000,
            version: None,
            path_rewrite: None,
        }
    }

    #[tokio::test]
    async fn unreachable_instance_is_marked_unhealthy_and_triggers_recovery() {
        let registry = Arc::new(ServiceRegistry::new());
        // Port 1 is reserved and never accepts connections.
        let id = registry
            .register(descriptor("user"), "http://127.0.0.1:1".to_string())
            .await
            .unwrap();

        let recovery = Arc::new(CountingRecovery { calls: AtomicU32::new(0) });
        let prober = HealthProber::new(registry.clone(), Duration::from_secs(60), Duration::from_millis(200))
            .with_recovery_handler(recovery.clone());

        for _ in 0..3 {
            prober.run_round().await;
        }

        let instance = registry.get_instance(id).await.unwrap();
        assert_eq!(instance.health.status, HealthStatus::Unhealthy);
        assert_eq!(instance.health.consecutive_failures, 3);
        assert_eq!(recovery.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn overlapping_round_is_skipped_not_queued() {
        let registry = Arc::new(ServiceRegistry::new());
        let prober = Arc::new(HealthProber::new(registry, Duration::from_secs(60), Duration::from_millis(50)));

        let guard = prober.in_flight.lock().await;
        // A second round while the lock is held should return immediately
        // rather than block, proving the skip path is taken.
        prober.run_round().await;
        drop(guard);
    }

    #[tokio::test]
    async fn recovery_handler_fires_on_every_failed_probe() {
        let registry = Arc::new(ServiceRegistry::new());
        let id = registry
            .register(descriptor("user"), "http://127.0.0.1:1".to_string())
            .await
            .unwrap();

        let mut mock = MockRecoveryHandler::new();
        mock.expect_on_repeated_failure()
            .withf(|_instance, failures| *failures == 1)
            .times(1)
            .return_const(());
        mock.expect_on_repeated_failure()
            .withf(|_instance, failures| *failures == 2)
            .times(1)
            .return_const(());

        let prober = HealthProber::new(registry.clone(), Duration::from_secs(60), Duration::from_millis(200))
            .with_recovery_handler(Arc::new(mock));

        prober.probe_one(registry.get_instance(id).await.unwrap()).await;
        prober.probe_one(registry.get_instance(id).await.unwrap()).await;
    }
}
