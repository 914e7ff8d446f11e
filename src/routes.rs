//! Static route table: longest-prefix match from an incoming path to a
//! service name, auth policy, and optional path rewrite.
//!
//! Grounded in the teacher's subgraph routing table shape (a small `Vec` of
//! rules scanned linearly at gateway construction time — request volume here
//! is low enough that a trie is not warranted), generalized from GraphQL
//! subgraph dispatch to the spec's (path-prefix -> service) routing rule.

use crate::auth::AuthPolicy;
use crate::config::{AppConfig, RouteRule};
use crate::registry::PathRewrite;

/// A route matched against an incoming request path.
pub struct MatchedRoute<'a> {
    pub service_name: &'a str,
    pub auth_policy: AuthPolicy,
    pub path_rewrite: Option<&'a PathRewrite>,
}

/// Immutable route table built once from `AppConfig` at startup.
pub struct RouteTable {
    rules: Vec<RouteRule>,
}

impl RouteTable {
    pub fn from_config(config: &AppConfig) -> Self {
        Self { rules: config.routes.clone() }
    }

    /// Longest matching `path_prefix` wins; ties broken by the earliest rule
    /// in declaration order. Returns `None` when no rule's prefix matches.
    pub fn match_path(&self, path: &str) -> Option<MatchedRoute<'_>> {
        let mut best: Option<&RouteRule> = None;
        for rule in &self.rules {
            if !path.starts_with(rule.path_prefix.as_str()) {
                continue;
            }
            // Strictly greater only: the first rule reaching a given prefix
            // length keeps the slot, so an equal-length rule declared later
            // never displaces it.
            let displaces = match best {
                Some(b) => rule.path_prefix.len() > b.path_prefix.len(),
                None => true,
            };
            if displaces {
                best = Some(rule);
            }
        }
        best.map(|r| MatchedRoute {
            service_name: &r.service_name,
            auth_policy: r.auth_policy.into(),
            path_rewrite: r.path_rewrite.as_ref(),
        })
    }
}
