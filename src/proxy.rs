//! The per-request proxy pipeline.
//!
//! Grounded in the arkCyber FlowEx `proxy_request` handler (axum extractor
//! pulling state + incoming request, hop-by-hop header stripping, manual
//! upstream dispatch via an HTTP client) and in the teacher's
//! `workflow-engine-core::error::circuit_breaker` admission discipline,
//! generalized into the full ordered pipeline of stages the spec's proxy
//! engine names: id/arrival, body cap, CORS preflight, rate limit, auth,
//! route match, registry resolution, breaker gate, forward, observe.

use crate::auth::{AuthPolicy, TokenVerifier, VerifyError};
use crate::breaker::{Admission as BreakerAdmission, Outcome};
use crate::error::{GatewayError, Result};
use crate::gateway::AppState;
use crate::rate_limit::{Admission as RateAdmission, PolicyKind};
use crate::routes::MatchedRoute;
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderName, Method, Request, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Per-request bookkeeping threaded through the pipeline. Dropped once the
/// response is written; nothing about it survives the request.
pub struct RequestContext {
    pub request_id: Uuid,
    pub arrived_at: Instant,
    pub method: Method,
    pub path: String,
    pub client_ip: String,
    pub service_name: Option<String>,
    pub instance_id: Option<Uuid>,
}

/// Headers the gateway injects from the verified principal; any client-sent
/// header with the same name is stripped before these are added, so a client
/// can never spoof an identity header.
const TRUSTED_HEADER_NAMES: &[&str] =
    &["x-request-id", "x-user-id", "x-user-email", "x-user-role", "x-tenant-id"];

/// Axum handler entry point: fronts every proxied route.
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response {
    let request_id = Uuid::new_v4();
    let arrived_at = Instant::now();

    match handle(state, addr, req, request_id, arrived_at).await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(request_id = %request_id, error = %err, kind = err.kind(), "request failed");
            err.into_response_with_id(request_id)
        }
    }
}

async fn handle(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Body>,
    request_id: Uuid,
    arrived_at: Instant,
) -> Result<Response> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let path = uri.path().to_string();

    // Step 2: body-size cap. Content-Length is a declared bound; a chunked
    // body that lies about its length is still caught by the body reader
    // downstream, but the common case is rejected here without reading it.
    if let Some(len) = content_length(req.headers()) {
        if len > state.config.max_body_bytes {
            return Err(GatewayError::PayloadTooLarge);
        }
    }

    // Step 3: CORS preflight short-circuits the rest of the pipeline.
    if method == Method::OPTIONS {
        return Ok(cors_preflight_response(&state, req.headers()));
    }

    // Step 4: rate limit, keyed by client IP resolved through the trusted
    // proxy-hop chain.
    let client_ip = resolve_client_ip(&state, &addr, req.headers());
    let policy_kind = if path.starts_with("/auth") { PolicyKind::AuthEndpoint } else { PolicyKind::General };
    match state.rate_limiters.for_kind(policy_kind).check(&client_ip) {
        RateAdmission::Allowed => {}
        RateAdmission::Exceeded { retry_after_secs } => {
            return Err(GatewayError::RateLimited { retry_after_secs });
        }
    }

    // Step 6: route match (longest prefix).
    let matched = state.routes.match_path(&path).ok_or(GatewayError::NotFound)?;
    let MatchedRoute { service_name, auth_policy, path_rewrite } = matched;
    let service_name = service_name.to_string();
    let rewritten_path = path_rewrite.map(|r| r.apply(&path)).unwrap_or_else(|| path.clone());

    // Step 5: authentication, governed by the matched route's policy.
    let principal = authenticate(&state.token_verifier, auth_policy, req.headers())?;

    // Step 7: service resolution.
    let instance = state.registry.select_instance(&service_name).await?;

    // Per-service concurrency cap, enforced before the breaker gate so a
    // saturated service never leaves a half-open probe slot stranded: the
    // cap is independent of the breaker and hitting it never touches breaker
    // state either way.
    let permit = state.concurrency.try_acquire(&service_name).ok_or_else(|| {
        GatewayError::ServiceUnavailable { service: service_name.clone() }
    })?;

    // Step 8: breaker gate.
    let admission = state.breakers.should_admit(&service_name).await;
    let is_probe = match admission {
        BreakerAdmission::Admit => false,
        BreakerAdmission::AdmitAsProbe => true,
        BreakerAdmission::Reject => {
            drop(permit);
            let stats = state.breakers.stats(&service_name).await;
            return Err(GatewayError::BreakerOpen {
                service: service_name,
                retry_after_secs: stats.reset_timeout_secs,
            });
        }
    };

    let (parts, body) = req.into_parts();
    let body_bytes = axum::body::to_bytes(body, state.config.max_body_bytes)
        .await
        .map_err(|e| GatewayError::InternalError(e.to_string()))?;

    let upstream_url = format!("{}{}", instance.target_url.trim_end_matches('/'), rewritten_path);
    let upstream_url = match parts.uri.query() {
        Some(q) => format!("{upstream_url}?{q}"),
        None => upstream_url,
    };

    let mut upstream_headers = parts.headers.clone();
    strip_trusted_headers(&mut upstream_headers);
    inject_trusted_headers(&mut upstream_headers, request_id, principal.as_ref());

    let timeout = instance_timeout(&instance);
    let client = state.http_client.clone();
    let reqwest_method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
        .map_err(|e| GatewayError::InternalError(e.to_string()))?;

    // Step 9: armed for the duration of the upstream call. If the client
    // disconnects and axum drops this request's future before the call
    // resolves, the guard's `Drop` fires instead of the code below —
    // recording a distinct cancellation, never a breaker failure, and
    // freeing a stranded half-open probe slot within `cancellation_grace`.
    let cancellation_guard = CancellationGuard::arm(&state, &service_name, is_probe);

    let upstream_result = tokio::time::timeout(
        timeout,
        client
            .request(reqwest_method, &upstream_url)
            .headers(convert_headers(&upstream_headers))
            .body(body_bytes.to_vec())
            .send(),
    )
    .await;

    cancellation_guard.disarm();
    drop(permit);

    let outcome_result = match upstream_result {
        Err(_) => {
            record_outcome(&state, &service_name, is_probe, Outcome::Failure).await;
            Err(GatewayError::UpstreamTimeout)
        }
        Ok(Err(e)) => {
            record_outcome(&state, &service_name, is_probe, Outcome::Failure).await;
            Err(GatewayError::from(e))
        }
        Ok(Ok(response)) => {
            let status = response.status();
            let is_failure = status.as_u16() >= 500;
            record_outcome(
                &state,
                &service_name,
                is_probe,
                if is_failure { Outcome::Failure } else { Outcome::Success },
            )
            .await;
            // Auth-endpoint policy only counts failed attempts; a successful
            // login gives its slot back so repeated good logins never trip it.
            if policy_kind == PolicyKind::AuthEndpoint && status.is_success() {
                state.rate_limiters.auth_endpoints.release(&client_ip);
            }
            Ok(response)
        }
    };

    let latency_ms = arrived_at.elapsed().as_millis() as u64;

    match outcome_result {
        Ok(upstream_response) => {
            let status = upstream_response.status();
            tracing::info!(
                request_id = %request_id,
                method = %parts.method,
                path = %path,
                service = %service_name,
                instance_id = %instance.id,
                status = status.as_u16(),
                latency_ms,
                "request forwarded"
            );
            Ok(build_client_response(request_id, latency_ms, upstream_response).await?)
        }
        Err(err) => {
            tracing::warn!(
                request_id = %request_id,
                method = %parts.method,
                path = %path,
                service = %service_name,
                instance_id = %instance.id,
                error = %err,
                latency_ms,
                "upstream call failed"
            );
            Err(err)
        }
    }
}

async fn record_outcome(state: &AppState, service_name: &str, is_probe: bool, outcome: Outcome) {
    let _ = is_probe;
    state.breakers.record_outcome(service_name, outcome).await;
}

/// Armed across the upstream call; if this request's future is dropped
/// before the call resolves — the client disconnected and axum gave up on
/// the request — `Drop` records a distinct cancellation outcome rather than
/// letting the call's eventual (never-observed) result silently vanish.
/// `disarm` is called once the call genuinely completes and its real
/// outcome has already been recorded, so the normal paths never double-fire.
struct CancellationGuard {
    breakers: Arc<crate::breaker::CircuitBreakerSet>,
    service_name: String,
    is_probe: bool,
    grace: std::time::Duration,
    armed: bool,
}

impl CancellationGuard {
    fn arm(state: &AppState, service_name: &str, is_probe: bool) -> Self {
        Self {
            breakers: state.breakers.clone(),
            service_name: service_name.to_string(),
            is_probe,
            grace: state.config.cancellation_grace,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancellationGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::warn!(
            service = %self.service_name,
            is_probe = self.is_probe,
            "client disconnected before the upstream call completed, not recorded as a breaker failure"
        );
        if self.is_probe {
            let breakers = self.breakers.clone();
            let service_name = std::mem::take(&mut self.service_name);
            let grace = self.grace;
            tokio::spawn(async move {
                let _ = tokio::time::timeout(grace, breakers.release_probe(&service_name)).await;
            });
        }
    }
}

fn instance_timeout(instance: &crate::registry::ServiceInstance) -> std::time::Duration {
    std::time::Duration::from_millis(instance.descriptor.default_timeout_ms)
}

fn authenticate(
    verifier: &TokenVerifier,
    policy: AuthPolicy,
    headers: &HeaderMap,
) -> Result<Option<crate::auth::Principal>> {
    let auth_header = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok());

    match policy {
        AuthPolicy::Public => Ok(None),
        AuthPolicy::Optional => {
            let Some(header) = auth_header else { return Ok(None) };
            let Some(token) = TokenVerifier::extract_bearer(header) else { return Ok(None) };
            // Any verification failure — malformed, bad signature, expired —
            // is silently ignored on optional routes; see DESIGN.md.
            Ok(verifier.verify(token).ok())
        }
        AuthPolicy::Required => {
            let header = auth_header.ok_or(GatewayError::Unauthenticated)?;
            let token = TokenVerifier::extract_bearer(header).ok_or(GatewayError::Unauthenticated)?;
            match verifier.verify(token) {
                Ok(principal) => Ok(Some(principal)),
                Err(VerifyError::Expired) => Err(GatewayError::TokenExpired),
                Err(_) => Err(GatewayError::Unauthenticated),
            }
        }
    }
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers.get(axum::http::header::CONTENT_LENGTH)?.to_str().ok()?.parse().ok()
}

/// Walks the `X-Forwarded-For` chain back `trusted_proxy_hops` entries to find
/// the real client address; falls back to the socket peer address when the
/// gateway is not configured to trust any hops or the header is absent.
fn resolve_client_ip(state: &AppState, addr: &SocketAddr, headers: &HeaderMap) -> String {
    if state.config.trusted_proxy_hops == 0 {
        return addr.ip().to_string();
    }
    let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) else {
        return addr.ip().to_string();
    };
    let hops: Vec<&str> = forwarded.split(',').map(|s| s.trim()).collect();
    let hop_count = state.config.trusted_proxy_hops as usize;
    if hop_count <= hops.len() {
        hops[hops.len() - hop_count].to_string()
    } else {
        hops.first().map(|s| s.to_string()).unwrap_or_else(|| addr.ip().to_string())
    }
}

fn strip_trusted_headers(headers: &mut HeaderMap) {
    for name in TRUSTED_HEADER_NAMES {
        headers.remove(*name);
    }
}

fn inject_trusted_headers(headers: &mut HeaderMap, request_id: Uuid, principal: Option<&crate::auth::Principal>) {
    headers.insert("x-request-id", header_value(&request_id.to_string()));
    if let Some(principal) = principal {
        headers.insert("x-user-id", header_value(&principal.id));
        if let Some(email) = &principal.email {
            headers.insert("x-user-email", header_value(email));
        }
        headers.insert("x-user-role", header_value(&principal.role));
        if let Some(tenant) = &principal.tenant_id {
            headers.insert("x-tenant-id", header_value(tenant));
        }
    }
}

fn header_value(s: &str) -> axum::http::HeaderValue {
    axum::http::HeaderValue::from_str(s).unwrap_or_else(|_| axum::http::HeaderValue::from_static(""))
}

/// axum's `HeaderMap` and reqwest's `HeaderMap` are distinct crates' types;
/// convert explicitly rather than pull in a shim dependency.
fn convert_headers(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::new();
    for (name, value) in headers.iter() {
        if is_hop_by_hop(name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.insert(name, value);
        }
    }
    out
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
    )
}

async fn build_client_response(request_id: Uuid, latency_ms: u64, upstream: reqwest::Response) -> Result<Response> {
    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);

    for (name, value) in upstream.headers().iter() {
        if let Ok(name) = HeaderName::from_str(name.as_str()) {
            if is_hop_by_hop(&name) {
                continue;
            }
            if let Ok(value) = axum::http::HeaderValue::from_bytes(value.as_bytes()) {
                builder = builder.header(name, value);
            }
        }
    }

    builder = builder.header("x-request-id", request_id.to_string());
    builder = builder.header("x-response-time", latency_ms.to_string());

    let bytes = upstream.bytes().await.map_err(GatewayError::from)?;
    builder.body(Body::from(bytes)).map_err(|e| GatewayError::InternalError(e.to_string()))
}

fn cors_preflight_response(state: &AppState, headers: &HeaderMap) -> Response {
    let origin = headers
        .get(axum::http::header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("*");

    let allowed = state.config.cors_origins.iter().any(|o| o == "*" || o == origin);
    let allow_origin = if allowed { origin } else { "" };

    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("access-control-allow-origin", allow_origin)
        .header("access-control-allow-methods", "GET, POST, PUT, DELETE, PATCH, OPTIONS")
        .header("access-control-allow-headers", "authorization, content-type, x-request-id")
        .header("access-control-max-age", "600")
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::NO_CONTENT.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Principal;
    use axum::http::HeaderValue;

    #[test]
    fn trusted_headers_are_stripped_then_reinjected() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", HeaderValue::from_static("attacker"));
        strip_trusted_headers(&mut headers);
        assert!(headers.get("x-user-id").is_none());

        let principal =
            Principal { id: "u-9".into(), email: Some("a@b".into()), role: "admin".into(), tenant_id: None };
        inject_trusted_headers(&mut headers, Uuid::nil(), Some(&principal));
        assert_eq!(headers.get("x-user-id").unwrap(), "u-9");
    }

    #[test]
    fn hop_by_hop_headers_are_identified() {
        assert!(is_hop_by_hop(&HeaderName::from_static("connection")));
        assert!(is_hop_by_hop(&HeaderName::from_static("host")));
        assert!(!is_hop_by_hop(&HeaderName::from_static("content-type")));
    }

    #[test]
    fn optional_auth_ignores_expired_token_silently() {
        let verifier = TokenVerifier::new("s".into(), jsonwebtoken::Algorithm::HS256);
        let mut claims = crate::auth::Claims::new("u".into(), "user".into());
        claims.exp = 0;
        let token = verifier.issue(&claims).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        let result = authenticate(&verifier, AuthPolicy::Optional, &headers).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn required_auth_distinguishes_expired_from_missing() {
        let verifier = TokenVerifier::new("s".into(), jsonwebtoken::Algorithm::HS256);
        let headers = HeaderMap::new();
        let err = authenticate(&verifier, AuthPolicy::Required, &headers).unwrap_err();
        assert!(matches!(err, GatewayError::Unauthenticated));
    }

    #[tokio::test]
    async fn dropping_an_armed_probe_guard_frees_the_stranded_half_open_slot() {
        let mut config = crate::config::AppConfig::default_for_dev();
        config.breaker = crate::breaker::BreakerConfig {
            volume_threshold: 2,
            reset_timeout: std::time::Duration::from_millis(10),
            ..config.breaker
        };
        let state = Arc::new(AppState::new(Arc::new(config)));

        for _ in 0..2 {
            state.breakers.record_outcome("crm", Outcome::Failure).await;
        }
        assert_eq!(state.breakers.should_admit("crm").await, BreakerAdmission::Reject);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(state.breakers.should_admit("crm").await, BreakerAdmission::AdmitAsProbe);
        // A second concurrent arrival is rejected while the probe is in flight.
        assert_eq!(state.breakers.should_admit("crm").await, BreakerAdmission::Reject);

        {
            let guard = CancellationGuard::arm(&state, "crm", true);
            drop(guard);
        }
        // The cleanup runs on a spawned task; give the runtime a turn.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(state.breakers.should_admit("crm").await, BreakerAdmission::AdmitAsProbe);
    }

    #[tokio::test]
    async fn disarmed_guard_does_not_touch_the_breaker() {
        let config = crate::config::AppConfig::default_for_dev();
        let state = Arc::new(AppState::new(Arc::new(config)));
        let guard = CancellationGuard::arm(&state, "crm", false);
        guard.disarm();
        // No panic, no breaker interaction: Drop is a no-op once disarmed.
    }
}
