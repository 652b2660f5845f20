//! Error types for credential resolution

/// Errors surfaced to callers of the resolver.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing client credentials or another deployment problem. Not retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Provider rejected the refresh or could not be reached.
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("no usable CRM credential for this request")]
    Unauthenticated,
}

impl From<crm_auth::Error> for Error {
    fn from(err: crm_auth::Error) -> Self {
        match err {
            crm_auth::Error::Configuration(msg) => Self::Configuration(msg),
            other => Self::RefreshFailed(other.to_string()),
        }
    }
}

/// Result alias for resolver operations.
pub type Result<T> = std::result::Result<T, Error>;
