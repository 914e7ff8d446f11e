//! Process-wide configuration.
//!
//! Grounded in the teacher's `GatewayConfig::from_env` (env-var overrides atop
//! a hardcoded default, `dotenvy`-style), generalized to the full surface
//! SPEC_FULL.md §6 calls for: listener, CORS, JWT, rate limits, breaker
//! thresholds, trusted-proxy hops, static service list and critical-services.
//! Built once at startup into an immutable `AppConfig`; never mutated in
//! place — a reload constructs a new value and the caller swaps the `Arc`.

use crate::auth::AuthPolicy;
use crate::breaker::BreakerConfig;
use crate::registry::{PathRewrite, ServiceDescriptor};
use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One entry in the static route table: a (method-agnostic) path prefix
/// mapped to a service name, an auth policy, and an optional rewrite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    pub path_prefix: String,
    pub service_name: String,
    pub auth_policy: RoutePolicy,
    pub path_rewrite: Option<PathRewrite>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RoutePolicy {
    Public,
    Optional,
    Required,
}

impl From<RoutePolicy> for AuthPolicy {
    fn from(p: RoutePolicy) -> Self {
        match p {
            RoutePolicy::Public => AuthPolicy::Public,
            RoutePolicy::Optional => AuthPolicy::Optional,
            RoutePolicy::Required => AuthPolicy::Required,
        }
    }
}

/// A statically registered backend, loaded at startup and re-seeded into the
/// registry on every process start (dynamic registrations are not persisted;
/// see DESIGN.md's Open Question resolution).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticService {
    pub name: String,
    pub target_url: String,
    pub health_check_path: String,
    pub version: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub jwt_secret: String,
    pub jwt_algorithm: Algorithm,
    pub trusted_proxy_hops: u8,
    pub max_body_bytes: usize,
    pub default_upstream_timeout: Duration,
    pub per_service_concurrency_cap: usize,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub shutdown_grace: Duration,
    pub cancellation_grace: Duration,
    pub breaker: BreakerConfig,
    pub static_services: Vec<StaticService>,
    pub routes: Vec<RouteRule>,
    pub critical_services: Vec<String>,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_string_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl AppConfig {
    /// Default configuration mirroring the scenarios in SPEC_FULL.md §8.
    pub fn default_for_dev() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
            cors_origins: vec!["*".to_string()],
            jwt_secret: "dev_secret_change_in_production".to_string(),
            jwt_algorithm: Algorithm::HS256,
            trusted_proxy_hops: 0,
            max_body_bytes: 10 * 1024 * 1024,
            default_upstream_timeout: Duration::from_secs(5),
            per_service_concurrency_cap: 64,
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
            cancellation_grace: Duration::from_millis(100),
            breaker: BreakerConfig::default(),
            static_services: Vec::new(),
            routes: Vec::new(),
            critical_services: Vec::new(),
        }
    }

    /// Build configuration from environment variables, loading `.env` first
    /// (matching the teacher's `dotenvy` use), falling back to
    /// `default_for_dev()` values where a variable is absent.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut config = Self::default_for_dev();

        config.host = env_string_or("GATEWAY_HOST", &config.host);
        config.port = env_or("GATEWAY_PORT", config.port);

        if let Ok(origins) = std::env::var("CORS_ORIGINS") {
            config.cors_origins = origins.split(',').map(|s| s.trim().to_string()).collect();
        }

        if let Ok(secret) = std::env::var("JWT_SECRET") {
            config.jwt_secret = secret;
        }
        if let Ok(alg) = std::env::var("JWT_ALGORITHM") {
            config.jwt_algorithm = parse_algorithm(&alg).unwrap_or(config.jwt_algorithm);
        }

        config.trusted_proxy_hops = env_or("TRUSTED_PROXY_HOPS", config.trusted_proxy_hops);
        config.max_body_bytes = env_or("MAX_BODY_BYTES", config.max_body_bytes);
        config.per_service_concurrency_cap =
            env_or("PER_SERVICE_CONCURRENCY_CAP", config.per_service_concurrency_cap);

        if let Ok(secs) = std::env::var("UPSTREAM_TIMEOUT_SECS") {
            if let Ok(n) = secs.parse::<u64>() {
                config.default_upstream_timeout = Duration::from_secs(n);
            }
        }
        if let Ok(secs) = std::env::var("BREAKER_RESET_TIMEOUT_SECS") {
            if let Ok(n) = secs.parse::<u64>() {
                config.breaker.reset_timeout = Duration::from_secs(n);
            }
        }
        if let Ok(n) = std::env::var("BREAKER_VOLUME_THRESHOLD") {
            if let Ok(n) = n.parse::<u32>() {
                config.breaker.volume_threshold = n;
            }
        }
        if let Ok(n) = std::env::var("BREAKER_ERROR_FRACTION") {
            if let Ok(n) = n.parse::<f64>() {
                config.breaker.error_threshold_fraction = n;
            }
        }

        if let Ok(names) = std::env::var("CRITICAL_SERVICES") {
            config.critical_services = names.split(',').map(|s| s.trim().to_string()).collect();
        }

        if let Ok(path) = std::env::var("GATEWAY_CONFIG_FILE") {
            if let Ok(contents) = std::fs::read_to_string(&path) {
                if let Ok(overrides) = serde_yaml::from_str::<ConfigFileOverrides>(&contents) {
                    overrides.apply(&mut config);
                }
            }
        }

        config
    }
}

fn parse_algorithm(s: &str) -> Option<Algorithm> {
    match s.to_uppercase().as_str() {
        "HS256" => Some(Algorithm::HS256),
        "HS384" => Some(Algorithm::HS384),
        "HS512" => Some(Algorithm::HS512),
        _ => None,
    }
}

/// Subset of `AppConfig` that may come from an optional YAML file. Env
/// variables, handled above, always take precedence over this file.
#[derive(Debug, Deserialize)]
struct ConfigFileOverrides {
    static_services: Option<Vec<StaticService>>,
    routes: Option<Vec<RouteRuleFile>>,
}

#[derive(Debug, Deserialize)]
struct RouteRuleFile {
    path_prefix: String,
    service_name: String,
    auth_policy: RoutePolicy,
    rewrite_match: Option<String>,
    rewrite_replace: Option<String>,
}

impl ConfigFileOverrides {
    fn apply(self, config: &mut AppConfig) {
        if let Some(services) = self.static_services {
            config.static_services = services;
        }
        if let Some(routes) = self.routes {
            config.routes = routes
                .into_iter()
                .map(|r| RouteRule {
                    path_prefix: r.path_prefix,
                    service_name: r.service_name,
                    auth_policy: r.auth_policy,
                    path_rewrite: match (r.rewrite_match, r.rewrite_replace) {
                        (Some(m), Some(rep)) => Some(PathRewrite { match_prefix: m, replace_with: rep }),
                        _ => None,
                    },
                })
                .collect();
        }
    }
}

impl StaticService {
    pub fn to_descriptor(&self, default_timeout: Duration) -> ServiceDescriptor {
        ServiceDescriptor {
            name: self.name.clone(),
            health_check_path: self.health_check_path.clone(),
            default_timeout_ms: default_timeout.as_millis() as u64,
            version: self.version.clone(),
            path_rewrite: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_for_dev_has_sane_values() {
        let config = AppConfig::default_for_dev();
        assert_eq!(config.port, 4000);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.max_body_bytes, 10 * 1024 * 1024);
        assert_eq!(config.breaker.error_threshold_fraction, 0.5);
    }

    #[test]
    #[serial_test::serial]
    fn env_vars_override_defaults() {
        std::env::set_var("GATEWAY_PORT", "5000");
        std::env::set_var("CORS_ORIGINS", "https://a.example, https://b.example");

        let config = AppConfig::from_env();
        assert_eq!(config.port, 5000);
        assert_eq!(config.cors_origins, vec!["https://a.example", "https://b.example"]);

        std::env::remove_var("GATEWAY_PORT");
        std::env::remove_var("CORS_ORIGINS");
    }

    #[test]
    fn algorithm_parsing_falls_back_gracefully() {
        assert!(matches!(parse_algorithm("hs256"), Some(Algorithm::HS256)));
        assert!(parse_algorithm("bogus").is_none());
    }
}
