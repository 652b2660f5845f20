//! Error types for assertion verification, installation storage and token exchange

/// Errors from the credential/installation layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("invalid assertion: {0}")]
    InvalidAssertion(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid installation: {0}")]
    InvalidInstallation(String),

    #[error("installation store persistence failed: {0}")]
    Persistence(String),

    #[error("identity lookup failed: {0}")]
    Identity(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
