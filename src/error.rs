//! Error types for llmgate.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::json;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable-store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("LibSQL error: {0}")]
    LibSql(#[from] libsql::Error),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Uniform error classification for the relay pipeline. Every terminal
/// failure a client can observe is one of these kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthorized,
    Forbidden,
    NotFound,
    QuotaExhausted,
    RateLimited,
    NoChannel,
    UpstreamTimeout,
    UpstreamBadResponse,
    UpstreamRefused,
    UnsafeContent,
    Validation,
    InternalBackend,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::QuotaExhausted => "quota_exhausted",
            Self::RateLimited => "rate_limited",
            Self::NoChannel => "no_channel",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::UpstreamBadResponse => "upstream_bad_response",
            Self::UpstreamRefused => "upstream_refused",
            Self::UnsafeContent => "unsafe_content",
            Self::Validation => "validation",
            Self::InternalBackend => "internal_backend",
        }
    }

    /// Default HTTP status when the upstream did not supply a better one.
    pub fn http_status(self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::QuotaExhausted => StatusCode::PAYMENT_REQUIRED,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::NoChannel | Self::UpstreamRefused => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamBadResponse => StatusCode::BAD_GATEWAY,
            Self::UnsafeContent | Self::Validation => StatusCode::BAD_REQUEST,
            Self::InternalBackend => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// OpenAI wire `error.type` value.
    pub fn openai_type(self) -> &'static str {
        match self {
            Self::Unauthorized => "authentication_error",
            Self::Forbidden => "permission_error",
            Self::NotFound => "not_found_error",
            Self::QuotaExhausted => "insufficient_quota",
            Self::RateLimited => "rate_limit_error",
            Self::UnsafeContent => "unsafe_request",
            Self::Validation => "invalid_request_error",
            Self::NoChannel
            | Self::UpstreamTimeout
            | Self::UpstreamBadResponse
            | Self::UpstreamRefused => "upstream_error",
            Self::InternalBackend => "api_error",
        }
    }

    /// Whether the pipeline may retry the request on another channel.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimited
                | Self::UpstreamTimeout
                | Self::UpstreamBadResponse
                | Self::UpstreamRefused
        )
    }
}

/// Uniform error envelope for the relay pipeline: kind, message, optional
/// upstream detail, and an HTTP status that overrides the kind's default
/// when the upstream supplied a meaningful one.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{}: {message}", kind.as_str())]
pub struct RelayError {
    pub kind: ErrorKind,
    pub message: String,
    pub param: Option<String>,
    /// Raw upstream payload, kept for logs. Never forwarded verbatim unless
    /// it is already an OpenAI-shaped error.
    pub upstream_body: Option<String>,
    /// Upstream-reported `error.type`; wins over the kind's default in the
    /// OpenAI envelope so provider errors surface verbatim.
    pub wire_type: Option<String>,
    status: Option<u16>,
}

impl RelayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            param: None,
            upstream_body: None,
            wire_type: None,
            status: None,
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalBackend, message)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }

    pub fn with_upstream_body(mut self, body: impl Into<String>) -> Self {
        self.upstream_body = Some(body.into());
        self
    }

    pub fn with_wire_type(mut self, wire_type: impl Into<String>) -> Self {
        self.wire_type = Some(wire_type.into());
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
            .and_then(|s| StatusCode::from_u16(s).ok())
            .unwrap_or_else(|| self.kind.http_status())
    }

    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }

    /// OpenAI-compatible wire body:
    /// `{"error":{"message","type","param","code"}}`.
    pub fn to_openai_body(&self) -> serde_json::Value {
        json!({
            "error": {
                "message": self.message,
                "type": self.wire_type.as_deref().unwrap_or(self.kind.openai_type()),
                "param": self.param,
                "code": self.kind.as_str(),
            }
        })
    }

    /// Anthropic-native wire body.
    pub fn to_anthropic_body(&self) -> serde_json::Value {
        let kind = match self.kind {
            ErrorKind::Unauthorized => "authentication_error",
            ErrorKind::Forbidden => "permission_error",
            ErrorKind::NotFound => "not_found_error",
            ErrorKind::RateLimited => "rate_limit_error",
            ErrorKind::Validation | ErrorKind::UnsafeContent | ErrorKind::QuotaExhausted => {
                "invalid_request_error"
            }
            ErrorKind::UpstreamRefused
            | ErrorKind::UpstreamTimeout
            | ErrorKind::NoChannel => "overloaded_error",
            _ => "api_error",
        };
        json!({
            "type": "error",
            "error": { "type": kind, "message": self.message }
        })
    }

    /// Gemini-native wire body.
    pub fn to_gemini_body(&self) -> serde_json::Value {
        let status = match self.kind {
            ErrorKind::Unauthorized => "UNAUTHENTICATED",
            ErrorKind::Forbidden => "PERMISSION_DENIED",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::RateLimited | ErrorKind::QuotaExhausted => "RESOURCE_EXHAUSTED",
            ErrorKind::Validation | ErrorKind::UnsafeContent => "INVALID_ARGUMENT",
            ErrorKind::NoChannel | ErrorKind::UpstreamRefused => "UNAVAILABLE",
            ErrorKind::UpstreamTimeout => "DEADLINE_EXCEEDED",
            _ => "INTERNAL",
        };
        json!({
            "error": {
                "code": self.status().as_u16(),
                "message": self.message,
                "status": status,
            }
        })
    }
}

impl From<StoreError> for RelayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => Self::new(
                ErrorKind::NotFound,
                format!("{entity} {id} not found"),
            ),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        Self::validation(format!("invalid request body: {err}"))
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, axum::Json(self.to_openai_body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_statuses() {
        assert_eq!(ErrorKind::Unauthorized.http_status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorKind::QuotaExhausted.http_status(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(ErrorKind::NoChannel.http_status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ErrorKind::UpstreamTimeout.http_status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ErrorKind::UnsafeContent.http_status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn retryable_classification() {
        assert!(ErrorKind::RateLimited.retryable());
        assert!(ErrorKind::UpstreamTimeout.retryable());
        assert!(ErrorKind::UpstreamBadResponse.retryable());
        assert!(ErrorKind::UpstreamRefused.retryable());

        assert!(!ErrorKind::Unauthorized.retryable());
        assert!(!ErrorKind::Validation.retryable());
        assert!(!ErrorKind::QuotaExhausted.retryable());
        assert!(!ErrorKind::InternalBackend.retryable());
        assert!(!ErrorKind::NoChannel.retryable());
    }

    #[test]
    fn status_override_wins() {
        let err = RelayError::new(ErrorKind::UpstreamBadResponse, "boom").with_status(418);
        assert_eq!(err.status().as_u16(), 418);

        let err = RelayError::new(ErrorKind::UpstreamBadResponse, "boom");
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn openai_envelope_shape() {
        let err = RelayError::validation("model is required").with_param("model");
        let body = err.to_openai_body();
        assert_eq!(body["error"]["message"], "model is required");
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert_eq!(body["error"]["param"], "model");
        assert_eq!(body["error"]["code"], "validation");
    }

    #[test]
    fn anthropic_envelope_shape() {
        let err = RelayError::unauthorized("bad key");
        let body = err.to_anthropic_body();
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "authentication_error");
    }

    #[test]
    fn gemini_envelope_shape() {
        let err = RelayError::new(ErrorKind::RateLimited, "slow down");
        let body = err.to_gemini_body();
        assert_eq!(body["error"]["status"], "RESOURCE_EXHAUSTED");
        assert_eq!(body["error"]["code"], 429);
    }

    #[test]
    fn store_not_found_maps_to_not_found_kind() {
        let err: RelayError = StoreError::not_found("token", "k").into();
        assert_eq!(err.kind, ErrorKind::NotFound);

        let err: RelayError = StoreError::Migration("bad".into()).into();
        assert_eq!(err.kind, ErrorKind::InternalBackend);
    }
}
