//! OAuth token endpoint client
//!
//! Two interactions with the provider's token endpoint, both form-encoded
//! POSTs authenticated with the client id/secret over HTTP basic auth:
//!
//! 1. `grant_type=authorization_code` when a company installs the app
//! 2. `grant_type=refresh_token` when a stored access token has expired
//!
//! Every call carries a bounded timeout and is attempted exactly once.
//! Refresh tokens are single-use, so a transient failure is reported rather
//! than retried with the same token.

use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{
    DEFAULT_AUTHORIZE_ENDPOINT, DEFAULT_HTTP_TIMEOUT_SECS, DEFAULT_TOKEN_ENDPOINT,
};
use crate::error::{Error, Result};

/// Response from the token endpoint for both exchange and refresh.
///
/// `expires_in` is a delta in seconds from the response time.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: u64,
    #[serde(default)]
    pub api_domain: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// OAuth client registration and provider endpoints.
#[derive(Debug, Clone)]
pub struct OAuthClientConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<Secret<String>>,
    pub redirect_uri: Option<String>,
    pub token_endpoint: String,
    pub authorize_endpoint: String,
    pub timeout: Duration,
}

impl Default for OAuthClientConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            redirect_uri: None,
            token_endpoint: DEFAULT_TOKEN_ENDPOINT.into(),
            authorize_endpoint: DEFAULT_AUTHORIZE_ENDPOINT.into(),
            timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
        }
    }
}

impl OAuthClientConfig {
    /// Whether both halves of the client credentials are present.
    pub fn has_client_credentials(&self) -> bool {
        self.credentials().is_ok()
    }

    fn credentials(&self) -> Result<(&str, &Secret<String>)> {
        match (&self.client_id, &self.client_secret) {
            (Some(id), Some(secret)) if !id.trim().is_empty() && !secret.is_blank() => {
                Ok((id.as_str(), secret))
            }
            _ => Err(Error::Configuration(
                "missing OAuth client credentials (client_id / client secret)".into(),
            )),
        }
    }
}

/// Cheap-to-clone token endpoint client.
#[derive(Debug, Clone)]
pub struct TokenClient {
    http: reqwest::Client,
    config: Arc<OAuthClientConfig>,
}

impl TokenClient {
    pub fn new(http: reqwest::Client, config: OAuthClientConfig) -> Self {
        Self {
            http,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &OAuthClientConfig {
        &self.config
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Exchange an authorization code for tokens (app install).
    pub async fn exchange_code(&self, code: &str) -> Result<TokenResponse> {
        let redirect_uri = self
            .config
            .redirect_uri
            .as_deref()
            .ok_or_else(|| Error::Configuration("missing OAuth redirect_uri".into()))?;

        self.post_token(
            &[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
            ],
            "token exchange",
        )
        .await
    }

    /// Exchange a refresh token for a new token pair.
    pub async fn refresh_token(&self, refresh: &str) -> Result<TokenResponse> {
        self.post_token(
            &[("grant_type", "refresh_token"), ("refresh_token", refresh)],
            "token refresh",
        )
        .await
    }

    async fn post_token(&self, form: &[(&str, &str)], operation: &str) -> Result<TokenResponse> {
        let (client_id, client_secret) = self.config.credentials()?;

        debug!(endpoint = %self.config.token_endpoint, operation, "calling token endpoint");
        let response = self
            .http
            .post(&self.config.token_endpoint)
            .basic_auth(client_id, Some(client_secret.expose()))
            .timeout(self.config.timeout)
            .form(form)
            .send()
            .await
            .map_err(|e| Error::Http(format!("{operation} request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));

            // 400 invalid_grant / 401 / 403: the grant itself was rejected
            if matches!(status.as_u16(), 400 | 401 | 403) {
                return Err(Error::InvalidCredentials(format!(
                    "{operation} rejected ({status}): {body}"
                )));
            }

            return Err(Error::TokenExchange(format!(
                "{operation} returned {status}: {body}"
            )));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::TokenExchange(format!("invalid {operation} response: {e}")))
    }

    /// Provider authorization URL an admin opens to install the app.
    ///
    /// `state` is echoed back on the callback.
    pub fn authorization_url(&self, state: &str) -> Result<String> {
        let client_id = self
            .config
            .client_id
            .as_deref()
            .ok_or_else(|| Error::Configuration("missing OAuth client_id".into()))?;
        let redirect_uri = self
            .config
            .redirect_uri
            .as_deref()
            .ok_or_else(|| Error::Configuration("missing OAuth redirect_uri".into()))?;

        let url = reqwest::Url::parse_with_params(
            &self.config.authorize_endpoint,
            &[
                ("client_id", client_id),
                ("redirect_uri", redirect_uri),
                ("state", state),
            ],
        )
        .map_err(|e| Error::Configuration(format!("invalid authorize endpoint: {e}")))?;
        Ok(url.to_string())
    }
}
