pub mod admin;
pub mod auth;
pub mod breaker;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod gateway;
pub mod health;
pub mod observability;
pub mod proxy;
pub mod rate_limit;
pub mod registry;
pub mod routes;

pub use config::AppConfig;
pub use error::{GatewayError, Result};
pub use gateway::{build_router, AppState};
