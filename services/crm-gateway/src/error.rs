//! Service-specific error types
//!
//! Per-request proxy errors (unauthenticated, upstream timeout, upstream
//! failure) are rendered directly by the proxy handler. Install callback
//! failures go through [`InstallError`] so every outcome maps to one status.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Failures of the `/oauth/callback` handshake.
#[derive(Error, Debug)]
pub enum InstallError {
    /// The provider redirected back with `error=...` (e.g. user denied access)
    #[error("authorization was not granted: {0}")]
    Denied(String),

    #[error("missing authorization code")]
    MissingCode,

    /// Client id/secret or redirect URI not configured on this gateway
    #[error("OAuth client is not configured: {0}")]
    NotConfigured(String),

    #[error("installation failed: {0}")]
    Handshake(String),
}

impl InstallError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Denied(_) | Self::MissingCode => StatusCode::BAD_REQUEST,
            Self::NotConfigured(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Handshake(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<crm_auth::Error> for InstallError {
    fn from(err: crm_auth::Error) -> Self {
        match err {
            crm_auth::Error::Configuration(msg) => Self::NotConfigured(msg),
            other => Self::Handshake(other.to_string()),
        }
    }
}

impl IntoResponse for InstallError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "type": "install_error",
                "message": self.to_string(),
            }
        });
        (
            self.status(),
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}
