//! Provider defaults for the downstream CRM (Pipedrive)
//!
//! Endpoints are overridable from configuration; these are the values used
//! when the operator does not set them. None of these are secrets.

/// Token endpoint for authorization code exchange and token refresh
pub const DEFAULT_TOKEN_ENDPOINT: &str = "https://oauth.pipedrive.com/oauth/token";

/// Authorization endpoint an admin visits to install the app for a company
pub const DEFAULT_AUTHORIZE_ENDPOINT: &str = "https://oauth.pipedrive.com/oauth/authorize";

/// Path prefix appended to a company's `api_domain` (and to the shared domain)
pub const API_PATH_PREFIX: &str = "/api/v1";

/// Identity lookup used during the authorization handshake
pub const IDENTITY_PATH: &str = "/users/me";

/// Seconds subtracted from the provider-declared `expires_in`.
pub const DEFAULT_EXPIRY_MARGIN_SECS: u64 = 60;

/// Bound on every call to the token endpoint and identity lookup.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;

/// Query parameter carrying the static token in shared mode
pub const SHARED_TOKEN_QUERY_PARAM: &str = "api_token";
