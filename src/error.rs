use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Stable, client-facing error taxonomy. Internal error text (upstream bodies,
/// transport errors) is never forwarded verbatim — it is logged and mapped here.
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    #[error("missing or invalid bearer token")]
    Unauthenticated,

    #[error("token expired")]
    TokenExpired,

    #[error("principal lacks required role")]
    Forbidden,

    #[error("no route matches this path")]
    NotFound,

    #[error("request body exceeds the configured size cap")]
    PayloadTooLarge,

    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    #[error("circuit open for service '{service}'")]
    BreakerOpen { service: String, retry_after_secs: u64 },

    #[error("no healthy instance for service '{service}'")]
    ServiceUnavailable { service: String },

    #[error("upstream timed out")]
    UpstreamTimeout,

    #[error("upstream returned a malformed response or a transport error")]
    BadGateway,

    #[error("internal gateway error: {0}")]
    InternalError(String),

    #[error("invalid service descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("unknown service instance")]
    UnknownInstance,
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(rename = "requestId")]
    request_id: String,
    #[serde(rename = "retryAfter", skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

impl GatewayError {
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Unauthenticated => "Unauthenticated",
            GatewayError::TokenExpired => "TokenExpired",
            GatewayError::Forbidden => "Forbidden",
            GatewayError::NotFound => "NotFound",
            GatewayError::PayloadTooLarge => "PayloadTooLarge",
            GatewayError::RateLimited { .. } => "RateLimited",
            GatewayError::BreakerOpen { .. } => "BreakerOpen",
            GatewayError::ServiceUnavailable { .. } => "ServiceUnavailable",
            GatewayError::UpstreamTimeout => "UpstreamTimeout",
            GatewayError::BadGateway => "BadGateway",
            GatewayError::InternalError(_) => "InternalError",
            GatewayError::InvalidDescriptor(_) => "InvalidDescriptor",
            GatewayError::UnknownInstance => "UnknownInstance",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Unauthenticated | GatewayError::TokenExpired => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden => StatusCode::FORBIDDEN,
            GatewayError::NotFound => StatusCode::NOT_FOUND,
            GatewayError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::BreakerOpen { .. } | GatewayError::ServiceUnavailable { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::BadGateway => StatusCode::BAD_GATEWAY,
            GatewayError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::InvalidDescriptor(_) => StatusCode::BAD_REQUEST,
            GatewayError::UnknownInstance => StatusCode::NOT_FOUND,
        }
    }

    fn retry_after(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            GatewayError::BreakerOpen { retry_after_secs, .. } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Does this outcome count as a breaker failure when it originates from forwarding?
    pub fn is_breaker_failure(&self) -> bool {
        matches!(self, GatewayError::UpstreamTimeout | GatewayError::BadGateway)
    }

    pub fn into_response_with_id(self, request_id: Uuid) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.kind(),
            message: self.to_string(),
            request_id: request_id.to_string(),
            retry_after: self.retry_after(),
        };
        (status, Json(body)).into_response()
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.into_response_with_id(Uuid::new_v4())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::UpstreamTimeout
        } else {
            GatewayError::BadGateway
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::InternalError(err.to_string())
    }
}
