use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Client-visible failure taxonomy for the proxy path.
///
/// Upstream-reported errors are not represented here: they pass through with
/// the provider's own status and body. Governance write failures never reach
/// this type either; they are absorbed behind the response boundary.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Missing, malformed, revoked, or unknown credential. Always generic;
    /// the reason is never disclosed to the caller.
    #[error("authentication failed")]
    Authentication,
    #[error("invalid request: {reason}")]
    Validation { reason: String },
    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },
    /// Upstream secret missing or undecryptable. The message never carries
    /// ciphertext or key material.
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("upstream request timed out after {secs}s")]
    Timeout { secs: u64 },
    /// Transport-level failure before any upstream HTTP response existed.
    #[error("upstream transport error: {0}")]
    UpstreamTransport(String),
    #[error("internal error")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    message: String,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

fn error_body(
    status: StatusCode,
    kind: &'static str,
    code: Option<&'static str>,
    message: impl std::fmt::Display,
) -> (StatusCode, Json<ErrorBody>) {
    (
        status,
        Json(ErrorBody {
            error: ErrorDetail {
                message: message.to_string(),
                kind,
                code,
            },
        }),
    )
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match self {
            ProxyError::Authentication => error_body(
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                None,
                "invalid proxy credential",
            )
            .into_response(),
            ProxyError::Validation { reason } => error_body(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                None,
                reason,
            )
            .into_response(),
            ProxyError::RateLimited { retry_after_secs } => {
                let mut response = error_body(
                    StatusCode::TOO_MANY_REQUESTS,
                    "rate_limit_error",
                    None,
                    format!("rate limit exceeded, retry after {retry_after_secs}s"),
                )
                .into_response();
                if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                response
            }
            ProxyError::Configuration(message) => error_body(
                StatusCode::INTERNAL_SERVER_ERROR,
                "api_error",
                Some("configuration_error"),
                message,
            )
            .into_response(),
            ProxyError::Timeout { secs } => error_body(
                StatusCode::GATEWAY_TIMEOUT,
                "api_error",
                Some("upstream_timeout"),
                format!("upstream request timed out after {secs}s"),
            )
            .into_response(),
            ProxyError::UpstreamTransport(message) => error_body(
                StatusCode::BAD_GATEWAY,
                "api_error",
                Some("upstream_unreachable"),
                message,
            )
            .into_response(),
            ProxyError::Internal(message) => {
                tracing::error!(error = %message, "internal error on request path");
                error_body(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "api_error",
                    None,
                    "internal error",
                )
                .into_response()
            }
        }
    }
}
