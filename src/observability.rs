//! Observability sink: `tracing` subscriber setup, plus an optional
//! `prometheus` registry gated behind the `monitoring` feature.
//!
//! Grounded in the teacher's `main.rs` (`tracing_subscriber::fmt::init()`) and
//! generalized per §4.9 to a JSON formatter for production and a compact one
//! for local development, matching the teacher's `tracing-subscriber`
//! feature set (`json`, `env-filter`).

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global `tracing` subscriber. `json` selects the production
/// formatter; otherwise a human-readable compact one is used, matching local
/// development ergonomics.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.compact().init();
    }
}

#[cfg(feature = "monitoring")]
pub mod metrics {
    //! Request counters, latency histograms, and per-breaker state gauges,
    //! mirroring the teacher's `monitoring` feature and its `prometheus` +
    //! `lazy_static` pairing.

    use lazy_static::lazy_static;
    use prometheus::{HistogramVec, IntCounterVec, IntGaugeVec, Registry};

    lazy_static! {
        pub static ref REGISTRY: Registry = Registry::new();
        pub static ref REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
            prometheus::Opts::new("gateway_requests_total", "Total proxied requests"),
            &["service", "status"]
        )
        .expect("metric can be created");
        pub static ref REQUEST_LATENCY_MS: HistogramVec = HistogramVec::new(
            prometheus::HistogramOpts::new("gateway_request_latency_ms", "Upstream request latency in ms"),
            &["service"]
        )
        .expect("metric can be created");
        pub static ref BREAKER_STATE: IntGaugeVec = IntGaugeVec::new(
            prometheus::Opts::new("gateway_breaker_state", "0=closed 1=half_open 2=open"),
            &["service"]
        )
        .expect("metric can be created");
    }

    /// Registers every collector exactly once. Safe to call repeatedly; only
    /// the first call has an effect, subsequent registration errors (already
    /// registered) are swallowed.
    pub fn register_metrics() {
        let _ = REGISTRY.register(Box::new(REQUESTS_TOTAL.clone()));
        let _ = REGISTRY.register(Box::new(REQUEST_LATENCY_MS.clone()));
        let _ = REGISTRY.register(Box::new(BREAKER_STATE.clone()));
    }

    pub fn observe_request(service: &str, status: u16, latency_ms: f64) {
        REQUESTS_TOTAL.with_label_values(&[service, &status.to_string()]).inc();
        REQUEST_LATENCY_MS.with_label_values(&[service]).observe(latency_ms);
    }

    pub fn set_breaker_state(service: &str, phase: crate::breaker::BreakerPhase) {
        let value = match phase {
            crate::breaker::BreakerPhase::Closed => 0,
            crate::breaker::BreakerPhase::HalfOpen => 1,
            crate::breaker::BreakerPhase::Open => 2,
        };
        BREAKER_STATE.with_label_values(&[service]).set(value);
    }

    /// Render the current registry in the Prometheus text exposition format.
    pub fn render() -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = REGISTRY.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).expect("encoding cannot fail for text format");
        String::from_utf8(buffer).unwrap_or_default()
    }
}
