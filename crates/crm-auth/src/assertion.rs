//! Signed assertion extraction and verification
//!
//! Embedded CRM surfaces (panels, custom UI extensions, iframes) identify the
//! calling company and user with an HS256-signed JWT. Each surface transports
//! it differently, so extraction checks a fixed precedence:
//!
//! 1. `Authorization: Bearer <jwt>`
//! 2. query parameter (default `token`)
//! 3. custom header (default `x-pipedrive-token`)
//! 4. JSON body field (default `pipedrive_jwt`)
//!
//! The first non-empty value wins. Verification has no side effects.

use std::collections::HashMap;

use common::Secret;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use reqwest::header::{AUTHORIZATION, HeaderMap};
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::identifiers::{optional_string_or_number, string_or_number};

/// Names under which an assertion may arrive, besides the bearer header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertionTransport {
    pub query_param: String,
    pub header: String,
    pub body_field: String,
}

impl Default for AssertionTransport {
    fn default() -> Self {
        Self {
            query_param: "token".into(),
            header: "x-pipedrive-token".into(),
            body_field: "pipedrive_jwt".into(),
        }
    }
}

/// The parts of an inbound request an assertion can be carried in.
///
/// Built by the HTTP layer from whatever framework it runs on; the core only
/// needs headers, the decoded query string and an optional JSON body.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    pub headers: HeaderMap,
    pub query: HashMap<String, String>,
    pub body: Option<serde_json::Value>,
}

impl InboundRequest {
    pub fn new(
        headers: HeaderMap,
        query: HashMap<String, String>,
        body: Option<serde_json::Value>,
    ) -> Self {
        Self {
            headers,
            query,
            body,
        }
    }

    /// Add a header, ignoring names or values that are not valid HTTP.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_bytes()),
            reqwest::header::HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn with_query(mut self, name: &str, value: &str) -> Self {
        self.query.insert(name.to_owned(), value.to_owned());
        self
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Pull the raw assertion out of a request using the fixed precedence.
pub fn extract_assertion(request: &InboundRequest, transport: &AssertionTransport) -> Option<String> {
    let non_empty = |s: &str| {
        let s = s.trim();
        (!s.is_empty()).then(|| s.to_owned())
    };

    if let Some(token) = request
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .and_then(non_empty)
    {
        return Some(token);
    }

    if let Some(token) = request
        .query
        .get(&transport.query_param)
        .and_then(|v| non_empty(v))
    {
        return Some(token);
    }

    if let Some(token) = request
        .headers
        .get(transport.header.as_str())
        .and_then(|v| v.to_str().ok())
        .and_then(non_empty)
    {
        return Some(token);
    }

    request
        .body
        .as_ref()
        .and_then(|body| body.get(&transport.body_field))
        .and_then(|v| v.as_str())
        .and_then(non_empty)
}

fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, rest) = header.split_at_checked(7)?;
    scheme.eq_ignore_ascii_case("bearer ").then_some(rest)
}

/// Identity of the inbound caller.
///
/// `iat`/`exp` describe the assertion itself, not the downstream credential.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Claims {
    #[serde(
        rename = "company_id",
        alias = "tenant_id",
        deserialize_with = "string_or_number"
    )]
    pub tenant_id: String,
    #[serde(
        rename = "user_id",
        default,
        deserialize_with = "optional_string_or_number"
    )]
    pub user_id: Option<String>,
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default)]
    pub exp: Option<i64>,
}

/// HS256 verifier for inbound assertions.
#[derive(Debug, Clone)]
pub struct AssertionVerifier {
    secret: Option<Secret<String>>,
    leeway_secs: u64,
}

impl AssertionVerifier {
    /// A verifier with no secret rejects every assertion with `Configuration`.
    pub fn new(secret: Option<Secret<String>>) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_blank()),
            leeway_secs: 0,
        }
    }

    /// Clock skew tolerated on `exp`.
    pub fn with_leeway(mut self, leeway_secs: u64) -> Self {
        self.leeway_secs = leeway_secs;
        self
    }

    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }

    /// Verify the signature and expiry of `raw` and return its claims.
    ///
    /// `exp` is enforced when present; assertions without one are accepted.
    pub fn verify(&self, raw: &str) -> Result<Claims> {
        let secret = self.secret.as_ref().ok_or_else(|| {
            Error::Configuration("no assertion verification secret configured".into())
        })?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = self.leeway_secs;
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let key = DecodingKey::from_secret(secret.expose().as_bytes());
        let data = decode::<Claims>(raw, &key, &validation)
            .map_err(|e| Error::InvalidAssertion(e.to_string()))?;

        debug!(tenant_id = %data.claims.tenant_id, "assertion verified");
        Ok(data.claims)
    }
}
