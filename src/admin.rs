//! Admin API: registration, discovery, health and metrics introspection.
//!
//! Grounded in the teacher's `bootstrap::registry` admin-facing accessors and
//! its `GatewayConfig`-driven `/health` handler, generalized to the full set
//! of operations §4.7/§6 name. Admin requests are authenticated separately
//! from the proxy engine's per-route policy — every handler here requires an
//! `operator` role token, checked by `require_operator` before the handler
//! runs, and never touches the route table or the proxy pipeline.

use crate::auth::TokenVerifier;
use crate::breaker::BreakerStats;
use crate::error::{GatewayError, Result};
use crate::gateway::AppState;
use crate::registry::{HealthState, HealthStatus, ServiceDescriptor, ServiceInstance};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

fn require_operator(verifier: &TokenVerifier, headers: &HeaderMap) -> Result<()> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(GatewayError::Unauthenticated)?;
    let token = TokenVerifier::extract_bearer(header).ok_or(GatewayError::Unauthenticated)?;
    let principal = verifier.verify(token).map_err(|_| GatewayError::Unauthenticated)?;
    if principal.role != "operator" {
        return Err(GatewayError::Forbidden);
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub url: String,
    #[serde(rename = "healthCheckPath")]
    pub health_check_path: String,
    pub version: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InstanceRecord {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "targetUrl")]
    pub target_url: String,
    pub status: &'static str,
    #[serde(rename = "registeredAt")]
    pub registered_at: DateTime<Utc>,
}

impl From<ServiceInstance> for InstanceRecord {
    fn from(instance: ServiceInstance) -> Self {
        Self {
            id: instance.id,
            name: instance.descriptor.name.clone(),
            target_url: instance.target_url.clone(),
            status: status_label(instance.health.status),
            registered_at: instance.registered_at,
        }
    }
}

fn status_label(status: HealthStatus) -> &'static str {
    match status {
        HealthStatus::Healthy => "UP",
        HealthStatus::Unhealthy => "DOWN",
        HealthStatus::Unknown => "UNKNOWN",
    }
}

pub async fn register(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<RegisterRequest>,
) -> Result<Response> {
    require_operator(&state.token_verifier, &headers)?;

    let descriptor = ServiceDescriptor {
        name: body.name.clone(),
        health_check_path: body.health_check_path,
        default_timeout_ms: state.config.default_upstream_timeout.as_millis() as u64,
        version: body.version,
        path_rewrite: None,
    };
    let id = state.registry.register(descriptor, body.url.clone()).await?;
    state.concurrency.prime(&body.name).await;

    let instance = state.registry.get_instance(id).await.ok_or(GatewayError::UnknownInstance)?;
    Ok((StatusCode::CREATED, Json(InstanceRecord::from(instance))).into_response())
}

#[derive(Debug, Deserialize)]
pub struct DeregisterRequest {
    pub id: Uuid,
}

pub async fn deregister(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<DeregisterRequest>,
) -> Result<StatusCode> {
    require_operator(&state.token_verifier, &headers)?;
    state.registry.deregister(body.id).await;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct DiscoverQuery {
    pub name: String,
    pub version: Option<String>,
}

pub async fn discover(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<DiscoverQuery>,
) -> Result<Json<Vec<InstanceRecord>>> {
    require_operator(&state.token_verifier, &headers)?;
    let instances = state.registry.discover(&query.name, query.version.as_deref()).await;
    Ok(Json(instances.into_iter().map(InstanceRecord::from).collect()))
}

#[derive(Debug, Serialize)]
pub struct InstanceHealthResponse {
    pub status: &'static str,
    #[serde(rename = "lastCheck")]
    pub last_check: Option<DateTime<Utc>>,
    #[serde(rename = "latencyMs")]
    pub latency_ms: Option<u64>,
}

pub async fn instance_health(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response> {
    require_operator(&state.token_verifier, &headers)?;
    let instance = state.registry.get_instance(id).await.ok_or(GatewayError::UnknownInstance)?;
    let body = InstanceHealthResponse {
        status: status_label(instance.health.status),
        last_check: instance.health.last_probe_at,
        latency_ms: instance.health.last_latency_ms,
    };
    let status = if instance.health.status == HealthStatus::Healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok((status, Json(body)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
}

pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<HeartbeatRequest>,
) -> Result<StatusCode> {
    require_operator(&state.token_verifier, &headers)?;
    state.registry.heartbeat(id, body.status, body.timestamp).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Serialize)]
pub struct HealthSummary {
    pub status: &'static str,
    pub uptime: u64,
    pub env: String,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthSummary> {
    Json(HealthSummary {
        status: "healthy",
        uptime: state.started_at.elapsed().as_secs(),
        env: std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
    })
}

#[derive(Debug, Serialize)]
pub struct ServiceHealthDetail {
    pub name: String,
    pub healthy_instances: usize,
    pub total_instances: usize,
    pub breaker: BreakerStats,
}

#[derive(Debug, Serialize)]
pub struct DetailedHealthResponse {
    pub status: &'static str,
    pub services: Vec<ServiceHealthDetail>,
}

pub async fn health_detailed(State(state): State<Arc<AppState>>) -> Response {
    let names = state.registry.list_services().await;
    let mut services = Vec::with_capacity(names.len());
    let mut all_healthy = true;

    for name in names {
        let stats = state.registry.stats(&name).await;
        if stats.healthy_instances == 0 {
            all_healthy = false;
        }
        let breaker = state.breakers.stats(&name).await;
        services.push(ServiceHealthDetail {
            name,
            healthy_instances: stats.healthy_instances,
            total_instances: stats.total_instances,
            breaker,
        });
    }

    let status_code = if all_healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    let body = DetailedHealthResponse { status: if all_healthy { "healthy" } else { "degraded" }, services };
    (status_code, Json(body)).into_response()
}

pub async fn health_ready(State(state): State<Arc<AppState>>) -> Response {
    if state.registry.is_ready(&state.config.critical_services).await {
        (StatusCode::OK, Json(serde_json::json!({ "status": "ready" }))).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({ "status": "not-ready" }))).into_response()
    }
}

pub async fn health_live() -> Response {
    (StatusCode::OK, Json(serde_json::json!({ "status": "alive" }))).into_response()
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub uptime_secs: u64,
    pub process_memory_kb: Option<u64>,
    pub system_load: Option<f32>,
    pub breakers: HashMap<String, BreakerStats>,
}

pub async fn health_metrics(State(state): State<Arc<AppState>>) -> Response {
    let breakers = state.breakers.all_stats().await;
    let process_memory_kb = process_memory_kb();
    let system_load = system_load_percent();

    let body = MetricsResponse {
        uptime_secs: state.started_at.elapsed().as_secs(),
        process_memory_kb,
        system_load,
        breakers,
    };

    #[cfg(feature = "monitoring")]
    {
        let rendered = crate::observability::metrics::render();
        return Response::builder()
            .header("content-type", "text/plain; version=0.0.4")
            .body(axum::body::Body::from(format!(
                "{rendered}\n# gateway_uptime_secs {}\n",
                body.uptime_secs
            )))
            .unwrap_or_else(|_| (StatusCode::OK, Json(body)).into_response());
    }

    #[cfg(not(feature = "monitoring"))]
    {
        (StatusCode::OK, Json(body)).into_response()
    }
}

fn process_memory_kb() -> Option<u64> {
    let mut system = sysinfo::System::new();
    let pid = sysinfo::Pid::from_u32(std::process::id());
    system.refresh_process(pid);
    system.process(pid).map(|p| p.memory())
}

fn system_load_percent() -> Option<f32> {
    let mut system = sysinfo::System::new();
    system.refresh_cpu_usage();
    let cpus = system.cpus();
    if cpus.is_empty() {
        return None;
    }
    Some(cpus.iter().map(|c| c.cpu_usage()).sum::<f32>() / cpus.len() as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_label_maps_health_status() {
        assert_eq!(status_label(HealthStatus::Healthy), "UP");
        assert_eq!(status_label(HealthStatus::Unhealthy), "DOWN");
        assert_eq!(status_label(HealthStatus::Unknown), "UNKNOWN");
    }

    #[test]
    fn require_operator_rejects_missing_header() {
        let verifier = TokenVerifier::new("s".into(), jsonwebtoken::Algorithm::HS256);
        let headers = HeaderMap::new();
        let err = require_operator(&verifier, &headers).unwrap_err();
        assert!(matches!(err, GatewayError::Unauthenticated));
    }

    #[test]
    fn require_operator_rejects_non_operator_role() {
        let verifier = TokenVerifier::new("s".into(), jsonwebtoken::Algorithm::HS256);
        let claims = crate::auth::Claims::new("u".into(), "viewer".into());
        let token = verifier.issue(&claims).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            axum::http::HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        let err = require_operator(&verifier, &headers).unwrap_err();
        assert!(matches!(err, GatewayError::Forbidden));
    }
}
