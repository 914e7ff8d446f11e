use gateway_core::gateway::AppState;
use gateway_core::health::HealthProber;
use gateway_core::observability;
use gateway_core::{build_router, AppConfig};
use std::net::SocketAddr;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let config = AppConfig::from_env();
    observability::init_tracing(std::env::var("APP_ENV").map(|v| v == "production").unwrap_or(false));

    #[cfg(feature = "monitoring")]
    observability::metrics::register_metrics();

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse().unwrap_or_else(|e| {
        tracing::error!(error = %e, "invalid listener address, exiting");
        std::process::exit(1);
    });

    let state = Arc::new(AppState::new(Arc::new(config)));
    state.seed_static_services().await;

    let prober = Arc::new(HealthProber::new(
        state.registry.clone(),
        state.config.probe_interval,
        state.config.probe_timeout,
    ));
    let prober_handle = prober.spawn();

    let rate_limiters = state.rate_limiters.clone();
    let gc_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            ticker.tick().await;
            rate_limiters.garbage_collect(std::time::Duration::from_secs(3600));
        }
    });

    let app = build_router(state.clone());

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, %addr, "failed to bind listener, exiting");
            std::process::exit(1);
        }
    };

    tracing::info!(%addr, "gateway listening");

    let shutdown_grace = state.config.shutdown_grace;
    let server = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal());

    if let Err(e) = server.await {
        tracing::error!(error = %e, "server error");
    }

    prober_handle.abort();
    gc_handle.abort();
    tokio::time::sleep(shutdown_grace.min(std::time::Duration::from_secs(5))).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
