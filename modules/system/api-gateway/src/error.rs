//! Gateway error taxonomy and its mapping to HTTP responses.
//!
//! Every failure fails closed: there is no path on which an error lets a
//! request through.

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::problem::Problem;
use crate::proxy::RelayedResponse;

/// Bearer-token authentication failures. All map to a uniform 401.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No `Authorization: Bearer ...` header on a protected route.
    #[error("missing bearer token")]
    Missing,

    /// Bad signature, unparseable token, unknown key id, issuer/audience mismatch.
    #[error("malformed token: {0}")]
    Malformed(String),

    /// Signature valid but the token is past its expiry.
    #[error("token has expired")]
    Expired,

    /// The signing-key endpoint could not be reached.
    #[error("signing-key source unavailable: {0}")]
    KeySourceUnavailable(String),
}

impl AuthError {
    #[must_use]
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed(reason.into())
    }
}

#[derive(Debug, Error)]
pub enum AuthzError {
    #[error("forbidden: {0}")]
    Forbidden(String),
}

impl AuthzError {
    #[must_use]
    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self::Forbidden(detail.into())
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Network failure or timeout talking to the upstream.
    #[error("upstream '{service}' unavailable: {reason}")]
    UpstreamUnavailable { service: String, reason: String },

    /// The upstream answered with a non-success status; relayed verbatim.
    #[error("upstream responded with status {}", .0.status)]
    UpstreamError(RelayedResponse),

    #[error("unknown upstream service '{0}'")]
    UnknownService(String),
}

impl ProxyError {
    #[must_use]
    pub fn unavailable(service: impl Into<String>, reason: impl ToString) -> Self {
        Self::UpstreamUnavailable {
            service: service.into(),
            reason: reason.to_string(),
        }
    }
}

/// Startup failures. Never recovered: the process exits.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("fatal configuration error: {0}")]
    Fatal(String),
}

impl ConfigError {
    #[must_use]
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal(reason.into())
    }
}

/// Umbrella error returned by pipeline stages and handlers.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Authz(#[from] AuthzError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    #[must_use]
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::BadRequest(detail.into())
    }

    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::Internal(detail.into())
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        log_auth_error(&self);
        let detail = match self {
            Self::Missing => "Authorization header required",
            Self::Malformed(_) | Self::Expired | Self::KeySourceUnavailable(_) => {
                "Invalid or expired token"
            }
        };
        (
            [(header::WWW_AUTHENTICATE, "Bearer")],
            Problem::new(StatusCode::UNAUTHORIZED, "Unauthorized", detail),
        )
            .into_response()
    }
}

/// Log authentication errors at appropriate levels.
///
/// Cognitive complexity is inflated by tracing macro expansion.
#[allow(clippy::cognitive_complexity)]
fn log_auth_error(err: &AuthError) {
    match err {
        AuthError::Missing => tracing::debug!("AuthN rejected: no bearer token"),
        AuthError::Malformed(reason) => tracing::debug!("AuthN rejected: {reason}"),
        AuthError::Expired => tracing::debug!("AuthN rejected: token expired"),
        AuthError::KeySourceUnavailable(reason) => {
            tracing::error!("Signing-key source unavailable: {reason}");
        }
    }
}

impl IntoResponse for AuthzError {
    fn into_response(self) -> Response {
        let Self::Forbidden(detail) = self;
        tracing::info!(detail = %detail, "AuthZ denied");
        Problem::new(StatusCode::FORBIDDEN, "Forbidden", detail).into_response()
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match self {
            Self::UpstreamUnavailable { service, reason } => {
                tracing::error!(service = %service, reason = %reason, "Upstream request failed");
                Problem::new(
                    StatusCode::BAD_GATEWAY,
                    "Bad Gateway",
                    format!("{service} service unavailable"),
                )
                .into_response()
            }
            Self::UpstreamError(relayed) => {
                tracing::warn!(status = %relayed.status, "Relaying upstream error status");
                relayed.into_response()
            }
            Self::UnknownService(service) => Problem::new(
                StatusCode::NOT_FOUND,
                "Not Found",
                format!("Unknown upstream service: {service}"),
            )
            .into_response(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match self {
            Self::Auth(e) => e.into_response(),
            Self::Authz(e) => e.into_response(),
            Self::Proxy(e) => e.into_response(),
            Self::BadRequest(detail) => {
                Problem::new(StatusCode::BAD_REQUEST, "Bad Request", detail).into_response()
            }
            Self::Internal(detail) => {
                tracing::error!("Internal gateway error: {detail}");
                Problem::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error",
                    "Internal gateway error",
                )
                .into_response()
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn every_auth_error_is_401() {
        for err in [
            AuthError::Missing,
            AuthError::malformed("bad signature"),
            AuthError::Expired,
            AuthError::KeySourceUnavailable("connect refused".to_owned()),
        ] {
            let response = err.into_response();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(
                response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
                "Bearer"
            );
        }
    }

    #[test]
    fn upstream_unavailable_is_502() {
        let response = ProxyError::unavailable("mlflow", "timed out").into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn internal_error_hides_detail() {
        let err = GatewayError::internal("stack trace here");
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
