//! Outbound request preparation
//!
//! Pairs a resolved [`AuthContext`] with an API path: a bearer header for
//! delegated credentials, an `api_token` query parameter for the shared one.
//! Callers never branch on the credential mode themselves.

use std::fmt;

use crm_auth::SHARED_TOKEN_QUERY_PARAM;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};

use crate::error::{Error, Result};
use crate::resolver::AuthContext;

/// URL and credential headers for one downstream CRM call.
///
/// The URL may carry the shared token, so `Debug` prints neither it nor the
/// headers.
#[derive(Clone)]
pub struct PreparedRequest {
    pub url: reqwest::Url,
    pub headers: HeaderMap,
}

impl PreparedRequest {
    /// Start a reqwest builder for `method` with the URL and credentials set.
    pub fn into_builder(
        self,
        client: &reqwest::Client,
        method: reqwest::Method,
    ) -> reqwest::RequestBuilder {
        client.request(method, self.url).headers(self.headers)
    }

    /// URL with the query string removed, safe to log.
    pub fn redacted_url(&self) -> String {
        let mut url = self.url.clone();
        url.set_query(None);
        url.to_string()
    }
}

impl fmt::Debug for PreparedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedRequest")
            .field("url", &self.redacted_url())
            .field("headers", &"[REDACTED]")
            .finish()
    }
}

/// Build the downstream URL and credentials for `path` under `context`.
///
/// `path` is relative to the API base (`deals/42`, `/deals?limit=5`); an
/// existing query string is preserved.
pub fn build_request(context: &AuthContext, path: &str) -> Result<PreparedRequest> {
    let raw = format!(
        "{}/{}",
        context.base_url().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    let mut url = reqwest::Url::parse(&raw)
        .map_err(|e| Error::Configuration(format!("invalid CRM URL {raw}: {e}")))?;

    let mut headers = HeaderMap::new();
    match context {
        AuthContext::Delegated { bearer_token, .. } => {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", bearer_token.expose()))
                .map_err(|_| Error::Configuration("access token is not a valid header value".into()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        AuthContext::Shared { api_token, .. } => {
            url.query_pairs_mut()
                .append_pair(SHARED_TOKEN_QUERY_PARAM, api_token.expose());
        }
    }

    Ok(PreparedRequest { url, headers })
}
