//! Service registry: name -> instances mapping, health state, round-robin selection.
//!
//! Instances are stored behind an `RwLock<HashMap<..>>`, same discipline as the
//! teacher's `ServiceRegistry` (bootstrap/registry.rs): many concurrent readers,
//! infrequent writers, and every write replaces a whole `ServiceInstance` value
//! so a reader never observes a torn record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{GatewayError, Result};

/// Health status of one instance. `Unknown` is the initial state before the
/// first probe completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

/// Health detail attached to an instance, updated only by the health prober
/// (or by an explicit client heartbeat, which follows the same write path).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthState {
    pub status: HealthStatus,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub last_latency_ms: Option<u64>,
    pub consecutive_failures: u32,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            last_probe_at: None,
            last_latency_ms: None,
            consecutive_failures: 0,
        }
    }
}

/// Static description of a service: its name, health-probe path, default
/// timeout, and routing metadata. Rarely mutated once registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub health_check_path: String,
    pub default_timeout_ms: u64,
    pub version: Option<String>,
    pub path_rewrite: Option<PathRewrite>,
}

/// Single-pass prefix replacement applied to the forwarded path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathRewrite {
    pub match_prefix: String,
    pub replace_with: String,
}

impl PathRewrite {
    pub fn apply(&self, path: &str) -> String {
        match path.strip_prefix(self.match_prefix.as_str()) {
            Some(rest) => format!("{}{}", self.replace_with, rest),
            None => path.to_string(),
        }
    }
}

/// A single addressable backend process registered under a service name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: Uuid,
    pub descriptor: ServiceDescriptor,
    pub target_url: String,
    pub registered_at: DateTime<Utc>,
    pub health: HealthState,
}

impl ServiceInstance {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

/// Aggregate counters for the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub service_name: String,
    pub total_instances: usize,
    pub healthy_instances: usize,
}

fn validate_descriptor(name: &str, target_url: &str, health_check_path: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(GatewayError::InvalidDescriptor("service name must not be empty".into()));
    }
    if health_check_path.trim().is_empty() {
        return Err(GatewayError::InvalidDescriptor("health check path is required".into()));
    }
    match reqwest::Url::parse(target_url) {
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => Ok(()),
        _ => Err(GatewayError::InvalidDescriptor(format!("malformed target url: {}", target_url))),
    }
}

/// In-memory name -> instances registry. Reads copy a small value out from
/// behind the lock and return; writes swap in a whole new `ServiceInstance`.
pub struct ServiceRegistry {
    instances: RwLock<HashMap<String, Vec<ServiceInstance>>>,
    round_robin: RwLock<HashMap<String, Arc<AtomicUsize>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            round_robin: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new instance, returning its generated id.
    pub async fn register(&self, descriptor: ServiceDescriptor, target_url: String) -> Result<Uuid> {
        validate_descriptor(&descriptor.name, &target_url, &descriptor.health_check_path)?;

        let instance = ServiceInstance {
            id: Uuid::new_v4(),
            descriptor: descriptor.clone(),
            target_url,
            registered_at: Utc::now(),
            health: HealthState::default(),
        };
        let id = instance.id;

        let mut instances = self.instances.write().await;
        instances.entry(descriptor.name).or_default().push(instance);
        Ok(id)
    }

    /// Deregister an instance. Idempotent: absent id is not an error.
    pub async fn deregister(&self, instance_id: Uuid) {
        let mut instances = self.instances.write().await;
        for bucket in instances.values_mut() {
            bucket.retain(|i| i.id != instance_id);
        }
        instances.retain(|_, bucket| !bucket.is_empty());
    }

    /// Record a client-reported liveness signal.
    pub async fn heartbeat(&self, instance_id: Uuid, status: HealthStatus, at: DateTime<Utc>) -> Result<()> {
        let mut instances = self.instances.write().await;
        for bucket in instances.values_mut() {
            if let Some(instance) = bucket.iter_mut().find(|i| i.id == instance_id) {
                instance.health.status = status;
                instance.health.last_probe_at = Some(at);
                return Ok(());
            }
        }
        Err(GatewayError::UnknownInstance)
    }

    /// Called only by the health prober: replace an instance's full health state.
    pub async fn update_health(&self, instance_id: Uuid, health: HealthState) {
        let mut instances = self.instances.write().await;
        for bucket in instances.values_mut() {
            if let Some(instance) = bucket.iter_mut().find(|i| i.id == instance_id) {
                instance.health = health;
                return;
            }
        }
    }

    /// All healthy instances for a service, optionally filtered by version tag.
    /// Empty is a valid result, not an error.
    pub async fn discover(&self, name: &str, version: Option<&str>) -> Vec<ServiceInstance> {
        let instances = self.instances.read().await;
        instances
            .get(name)
            .map(|bucket| {
                bucket
                    .iter()
                    .filter(|i| i.health.status == HealthStatus::Healthy)
                    .filter(|i| version.map_or(true, |v| i.descriptor.version.as_deref() == Some(v)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Pick the next healthy instance for `name` by round-robin, ties broken by
    /// instance id lexicographic order (stable sort before indexing).
    pub async fn select_instance(&self, name: &str) -> Result<ServiceInstance> {
        let mut healthy = self.discover(name, None).await;
        if healthy.is_empty() {
            return Err(GatewayError::ServiceUnavailable { service: name.to_string() });
        }
        healthy.sort_by(|a, b| a.registered_at.cmp(&b.registered_at).then(a.id.cmp(&b.id)));

        let counter = {
            let counters = self.round_robin.read().await;
            if let Some(c) = counters.get(name) {
                c.clone()
            } else {
                drop(counters);
                let mut counters = self.round_robin.write().await;
                counters
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
                    .clone()
            }
        };

        let idx = counter.fetch_add(1, Ordering::SeqCst) % healthy.len();
        Ok(healthy.swap_remove(idx))
    }

    /// Consistent snapshot of every instance, for the admin API.
    pub async fn snapshot(&self) -> Vec<ServiceInstance> {
        let instances = self.instances.read().await;
        instances.values().flatten().cloned().collect()
    }

    pub async fn get_instance(&self, instance_id: Uuid) -> Option<ServiceInstance> {
        let instances = self.instances.read().await;
        instances.values().flatten().find(|i| i.id == instance_id).cloned()
    }

    pub async fn list_services(&self) -> Vec<String> {
        let instances = self.instances.read().await;
        instances.keys().cloned().collect()
    }

    pub async fn all_instances_of(&self, name: &str) -> Vec<ServiceInstance> {
        let instances = self.instances.read().await;
        instances.get(name).cloned().unwrap_or_default()
    }

    pub async fn stats(&self, name: &str) -> ServiceStats {
        let bucket = self.all_instances_of(name).await;
        let healthy = bucket.iter().filter(|i| i.health.status == HealthStatus::Healthy).count();
        ServiceStats {
            service_name: name.to_string(),
            total_instances: bucket.len(),
            healthy_instances: healthy,
        }
    }

    /// Whether every name in `critical` has at least one healthy instance.
    pub async fn is_ready(&self, critical: &[String]) -> bool {
        for name in critical {
            if self.discover(name, None).await.is_empty() {
                return false;
            }
        }
        true
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn descriptor(name: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            name: name.to_string(),
            health_check_path: "/health".to_string(),
            default_timeout_ms: 5000,
            version: None,
            path_rewrite: None,
        }
    }

    #[tokio::test]
    async fn register_rejects_empty_name() {
        let registry = ServiceRegistry::new();
        let err = registry
            .register(descriptor(""), "http://u1:7001".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidDescriptor(_)));
    }

    #[tokio::test]
    async fn register_rejects_malformed_url() {
        let registry = ServiceRegistry::new();
        let err = registry
            .register(descriptor("user"), "not-a-url".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidDescriptor(_)));
    }

    #[tokio::test]
    async fn deregister_is_idempotent() {
        let registry = ServiceRegistry::new();
        registry.deregister(Uuid::new_v4()).await;
    }

    #[tokio::test]
    async fn heartbeat_unknown_instance_fails() {
        let registry = ServiceRegistry::new();
        let err = registry
            .heartbeat(Uuid::new_v4(), HealthStatus::Healthy, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UnknownInstance));
    }

    #[tokio::test]
    async fn discover_empty_is_not_an_error() {
        let registry = ServiceRegistry::new();
        let found = registry.discover("nope", None).await;
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn select_instance_errors_with_no_healthy_instance() {
        let registry = ServiceRegistry::new();
        let id = registry
            .register(descriptor("user"), "http://u1:7001".to_string())
            .await
            .unwrap();
        // Freshly registered instances start Unknown, not Healthy.
        let err = registry.select_instance("user").await.unwrap_err();
        assert!(matches!(err, GatewayError::ServiceUnavailable { .. }));

        registry
            .update_health(
                id,
                HealthState { status: HealthStatus::Healthy, ..Default::default() },
            )
            .await;
        let selected = registry.select_instance("user").await.unwrap();
        assert_eq!(selected.id, id);
    }

    #[tokio::test]
    async fn round_robin_distributes_across_healthy_instances() {
        let registry = ServiceRegistry::new();
        let mut ids = Vec::new();
        for i in 0..3 {
            let id = registry
                .register(descriptor("user"), format!("http://u{i}:7001"))
                .await
                .unwrap();
            registry
                .update_health(id, HealthState { status: HealthStatus::Healthy, ..Default::default() })
                .await;
            ids.push(id);
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(registry.select_instance("user").await.unwrap().id);
        }
        seen.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(seen, expected);

        // Fourth pick wraps back to the first instance in round-robin order.
        let fourth = registry.select_instance("user").await.unwrap().id;
        assert!(ids.contains(&fourth));
    }

    #[tokio::test]
    async fn path_rewrite_replaces_prefix_once() {
        let rewrite = PathRewrite { match_prefix: "/api/users".into(), replace_with: "/users".into() };
        assert_eq!(rewrite.apply("/api/users/42"), "/users/42");
        assert_eq!(rewrite.apply("/other"), "/other");
    }

    #[tokio::test]
    async fn readiness_requires_every_critical_service_healthy() {
        let registry = ServiceRegistry::new();
        let id = registry
            .register(descriptor("user"), "http://u1:7001".to_string())
            .await
            .unwrap();
        assert!(!registry.is_ready(&["user".to_string()]).await);

        registry
            .update_health(id, HealthState { status: HealthStatus::Healthy, ..Default::default() })
            .await;
        assert!(registry.is_ready(&["user".to_string()]).await);
        assert!(!registry.is_ready(&["user".to_string(), "crm".to_string()]).await);
    }

    proptest! {
        /// Deterministic routing (SPEC_FULL.md §8, property 8): for any number
        /// of healthy instances, `instance_count` round-robin passes each
        /// visit every instance exactly once.
        #[test]
        fn round_robin_visits_every_instance_once_per_pass(instance_count in 1usize..20) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let registry = ServiceRegistry::new();
                let mut ids = Vec::new();
                for i in 0..instance_count {
                    let id = registry
                        .register(descriptor("svc"), format!("http://h{i}:7001"))
                        .await
                        .unwrap();
                    registry
                        .update_health(id, HealthState { status: HealthStatus::Healthy, ..Default::default() })
                        .await;
                    ids.push(id);
                }

                let mut seen = Vec::new();
                for _ in 0..instance_count {
                    seen.push(registry.select_instance("svc").await.unwrap().id);
                }
                seen.sort();
                let mut expected = ids.clone();
                expected.sort();
                prop_assert_eq!(seen, expected);
            });
        }
    }
}
