//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Secrets (OAuth client secret, assertion secret, shared API token) are
//! loaded from env vars or `*_file` paths, never stored in the TOML directly.

use common::Secret;
use crm_auth::{
    AssertionTransport, AssertionVerifier, DEFAULT_AUTHORIZE_ENDPOINT,
    DEFAULT_EXPIRY_MARGIN_SECS, DEFAULT_HTTP_TIMEOUT_SECS, DEFAULT_TOKEN_ENDPOINT,
    OAuthClientConfig,
};
use crm_resolver::SharedCredential;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CLIENT_SECRET_ENV: &str = "CRM_CLIENT_SECRET";
const JWT_SECRET_ENV: &str = "CRM_JWT_SECRET";
const API_TOKEN_ENV: &str = "CRM_API_TOKEN";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub assertion: AssertionConfig,
    #[serde(default)]
    pub shared: Option<SharedConfig>,
}

/// Listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_admin_addr")]
    pub admin_addr: SocketAddr,
    /// Bound on calls to the CRM and the token endpoint
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Installation snapshot settings
#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    pub path: PathBuf,
    #[serde(default = "default_expiry_margin")]
    pub expiry_margin_secs: u64,
}

/// OAuth app registration
#[derive(Debug, Deserialize)]
pub struct OAuthConfig {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default = "default_token_endpoint")]
    pub token_endpoint: String,
    #[serde(default = "default_authorize_endpoint")]
    pub authorize_endpoint: String,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    /// Path to a file containing the client secret (alternative to CRM_CLIENT_SECRET)
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            redirect_uri: None,
            token_endpoint: default_token_endpoint(),
            authorize_endpoint: default_authorize_endpoint(),
            client_secret: None,
            client_secret_file: None,
        }
    }
}

/// Where embedded surfaces put the signed assertion, and how it is verified
#[derive(Debug, Deserialize)]
pub struct AssertionConfig {
    #[serde(default = "default_query_param")]
    pub query_param: String,
    #[serde(default = "default_assertion_header")]
    pub header: String,
    #[serde(default = "default_body_field")]
    pub body_field: String,
    /// Clock skew tolerated on `exp`
    #[serde(default)]
    pub leeway_secs: u64,
    #[serde(skip)]
    pub secret: Option<Secret<String>>,
    /// Path to a file containing the verification secret (alternative to CRM_JWT_SECRET)
    #[serde(default)]
    pub secret_file: Option<PathBuf>,
}

impl Default for AssertionConfig {
    fn default() -> Self {
        Self {
            query_param: default_query_param(),
            header: default_assertion_header(),
            body_field: default_body_field(),
            leeway_secs: 0,
            secret: None,
            secret_file: None,
        }
    }
}

/// Deployment-wide fallback credential
#[derive(Debug, Deserialize)]
pub struct SharedConfig {
    pub domain: String,
    #[serde(skip)]
    pub api_token: Option<Secret<String>>,
    /// Path to a file containing the API token (alternative to CRM_API_TOKEN)
    #[serde(default)]
    pub api_token_file: Option<PathBuf>,
}

fn default_admin_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_timeout() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}

fn default_max_connections() -> usize {
    1000
}

fn default_expiry_margin() -> u64 {
    DEFAULT_EXPIRY_MARGIN_SECS
}

fn default_token_endpoint() -> String {
    DEFAULT_TOKEN_ENDPOINT.into()
}

fn default_authorize_endpoint() -> String {
    DEFAULT_AUTHORIZE_ENDPOINT.into()
}

fn default_query_param() -> String {
    AssertionTransport::default().query_param
}

fn default_assertion_header() -> String {
    AssertionTransport::default().header
}

fn default_body_field() -> String {
    AssertionTransport::default().body_field
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Each secret resolves from its env var first, then its `*_file` path.
    /// The assertion secret falls back to the OAuth client secret.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        config.oauth.client_secret =
            read_secret(CLIENT_SECRET_ENV, config.oauth.client_secret_file.as_deref())?;
        config.assertion.secret =
            read_secret(JWT_SECRET_ENV, config.assertion.secret_file.as_deref())?
                .or_else(|| config.oauth.client_secret.clone());
        if let Some(shared) = config.shared.as_mut() {
            shared.api_token = read_secret(API_TOKEN_ENV, shared.api_token_file.as_deref())?;
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        for (name, url) in [
            ("token_endpoint", Some(&self.oauth.token_endpoint)),
            ("authorize_endpoint", Some(&self.oauth.authorize_endpoint)),
            ("redirect_uri", self.oauth.redirect_uri.as_ref()),
        ] {
            let Some(url) = url else { continue };
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(common::Error::Config(format!(
                    "{name} must start with http:// or https://, got: {url}"
                )));
            }
        }

        if self.server.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if self
            .shared
            .as_ref()
            .is_some_and(|shared| shared.domain.trim().is_empty())
        {
            return Err(common::Error::Config("shared.domain must not be empty".into()));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("crm-auth-gateway.toml")
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.server.timeout_secs)
    }

    pub fn expiry_margin(&self) -> Duration {
        Duration::from_secs(self.store.expiry_margin_secs)
    }

    pub fn oauth_client(&self) -> OAuthClientConfig {
        OAuthClientConfig {
            client_id: self.oauth.client_id.clone(),
            client_secret: self.oauth.client_secret.clone(),
            redirect_uri: self.oauth.redirect_uri.clone(),
            token_endpoint: self.oauth.token_endpoint.clone(),
            authorize_endpoint: self.oauth.authorize_endpoint.clone(),
            timeout: self.timeout(),
        }
    }

    pub fn assertion_transport(&self) -> AssertionTransport {
        AssertionTransport {
            query_param: self.assertion.query_param.clone(),
            header: self.assertion.header.to_ascii_lowercase(),
            body_field: self.assertion.body_field.clone(),
        }
    }

    pub fn assertion_verifier(&self) -> AssertionVerifier {
        AssertionVerifier::new(self.assertion.secret.clone()).with_leeway(self.assertion.leeway_secs)
    }

    /// Shared credential, when both a domain and a token are configured.
    pub fn shared_credential(&self) -> Option<SharedCredential> {
        let shared = self.shared.as_ref()?;
        let token = shared.api_token.clone()?;
        Some(SharedCredential::new(shared.domain.clone(), token))
    }
}

/// Env var wins over file; empty values count as unset.
fn read_secret(env_var: &str, file: Option<&Path>) -> common::Result<Option<Secret<String>>> {
    if let Ok(value) = std::env::var(env_var) {
        let value = value.trim().to_owned();
        if !value.is_empty() {
            return Ok(Some(Secret::new(value)));
        }
    }

    let Some(path) = file else {
        return Ok(None);
    };
    let value = std::fs::read_to_string(path).map_err(|source| common::Error::SecretFile {
        path: path.to_path_buf(),
        source,
    })?;
    let value = value.trim().to_owned();
    Ok((!value.is_empty()).then(|| Secret::new(value)))
}
