//! `AppState` and axum `Router` assembly.
//!
//! Grounded in the teacher's `GraphQLGateway::into_router` (a struct bundling
//! every shared component behind `Arc`, with a `tower::ServiceBuilder`
//! middleware stack), generalized from a single GraphQL schema endpoint to
//! the full proxy + admin surface, enriched with the `tower-http` layer stack
//! (`TraceLayer`, `CorsLayer`, `TimeoutLayer`) from the arkCyber FlowEx
//! `create_app` example, since that repo's gateway is axum-native the way
//! this one now is.

use crate::admin;
use crate::auth::TokenVerifier;
use crate::breaker::CircuitBreakerSet;
use crate::concurrency::ConcurrencyLimiter;
use crate::config::AppConfig;
use crate::proxy::proxy_handler;
use crate::rate_limit::RateLimiters;
use crate::registry::ServiceRegistry;
use crate::routes::RouteTable;
use axum::{
    http::{HeaderValue, Method},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Everything a request handler needs, bundled once at startup and shared
/// via axum's `State` extractor. Every field is itself internally
/// synchronized; `AppState` holds no lock of its own.
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<ServiceRegistry>,
    pub breakers: Arc<CircuitBreakerSet>,
    pub rate_limiters: Arc<RateLimiters>,
    pub token_verifier: Arc<TokenVerifier>,
    pub routes: Arc<RouteTable>,
    pub concurrency: Arc<ConcurrencyLimiter>,
    pub http_client: reqwest::Client,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>) -> Self {
        let routes = Arc::new(RouteTable::from_config(&config));
        let token_verifier = Arc::new(TokenVerifier::new(config.jwt_secret.clone(), config.jwt_algorithm));
        let breakers = Arc::new(CircuitBreakerSet::new(config.breaker.clone()));
        let concurrency = Arc::new(ConcurrencyLimiter::new(config.per_service_concurrency_cap));
        let http_client = reqwest::Client::builder()
            .timeout(config.default_upstream_timeout)
            .build()
            .expect("http client configuration is valid");

        Self {
            config,
            registry: Arc::new(ServiceRegistry::new()),
            breakers,
            rate_limiters: Arc::new(RateLimiters::new()),
            token_verifier,
            routes,
            concurrency,
            http_client,
            started_at: Instant::now(),
        }
    }

    /// Seed the registry from `AppConfig::static_services` and pre-create a
    /// concurrency semaphore for each — called once at startup, before the
    /// listener binds.
    pub async fn seed_static_services(&self) {
        for service in &self.config.static_services {
            let descriptor = service.to_descriptor(self.config.default_upstream_timeout);
            match self.registry.register(descriptor, service.target_url.clone()).await {
                Ok(_) => self.concurrency.prime(&service.name).await,
                Err(e) => tracing::error!(service = %service.name, error = %e, "failed to seed static service"),
            }
        }
    }
}

/// Build the full router: proxy engine as the catch-all, admin API under
/// `/services` and `/health*`, wrapped in the standard middleware stack.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = build_cors_layer(&state.config);

    let admin_routes = Router::new()
        .route("/services/register", post(admin::register))
        .route("/services/deregister", post(admin::deregister))
        .route("/services/discover", get(admin::discover))
        .route("/services/:id/health", get(admin::instance_health))
        .route("/services/:id/heartbeat", post(admin::heartbeat))
        .route("/health", get(admin::health))
        .route("/health/detailed", get(admin::health_detailed))
        .route("/health/ready", get(admin::health_ready))
        .route("/health/live", get(admin::health_live))
        .route("/health/metrics", get(admin::health_metrics));

    let proxy_routes = Router::new().fallback(proxy_handler);

    Router::new()
        .merge(admin_routes)
        .merge(proxy_routes)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(CatchPanicLayer::new())
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(Duration::from_secs(60)))
                .layer(cors),
        )
}

fn build_cors_layer(config: &AppConfig) -> CorsLayer {
    if config.cors_origins.iter().any(|o| o == "*") {
        return CorsLayer::new().allow_origin(tower_http::cors::Any).allow_methods(tower_http::cors::Any);
    }

    let origins: Vec<HeaderValue> =
        config.cors_origins.iter().filter_map(|o| HeaderValue::from_str(o).ok()).collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::PATCH])
}
