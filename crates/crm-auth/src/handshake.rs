//! Authorization handshake: turn an install callback code into an Installation
//!
//! 1. Exchange the code at the token endpoint
//! 2. Ask the CRM who the new token belongs to (`/users/me`)
//! 3. Store the margin-adjusted Installation under the company id
//!
//! This is the only place Installations are created. A later handshake for
//! the same company replaces the earlier record.

use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::constants::{API_PATH_PREFIX, IDENTITY_PATH};
use crate::error::{Error, Result};
use crate::identifiers::{optional_string_or_number, string_or_number};
use crate::installations::{Installation, InstallationStore, now_millis};
use crate::token::TokenClient;

/// Company and user behind a freshly issued access token.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Identity {
    #[serde(rename = "company_id", deserialize_with = "string_or_number")]
    pub tenant_id: String,
    #[serde(rename = "id", default, deserialize_with = "optional_string_or_number")]
    pub user_id: Option<String>,
}

#[derive(Deserialize)]
struct IdentityEnvelope {
    data: Option<Identity>,
}

/// Look up the identity behind `access_token` on the tenant's API domain.
pub async fn fetch_identity(
    client: &TokenClient,
    api_domain: &str,
    access_token: &str,
) -> Result<Identity> {
    let url = format!(
        "{}{API_PATH_PREFIX}{IDENTITY_PATH}",
        api_domain.trim_end_matches('/')
    );
    let response = client
        .http()
        .get(&url)
        .bearer_auth(access_token)
        .timeout(client.config().timeout)
        .send()
        .await
        .map_err(|e| Error::Http(format!("identity request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::Identity(format!("identity lookup returned {status}")));
    }

    let envelope = response
        .json::<IdentityEnvelope>()
        .await
        .map_err(|e| Error::Identity(format!("invalid identity response: {e}")))?;

    envelope
        .data
        .ok_or_else(|| Error::Identity("unable to determine company_id from identity response".into()))
}

/// Run the full handshake for an authorization `code` and store the result.
pub async fn complete_installation(
    client: &TokenClient,
    store: &InstallationStore,
    code: &str,
    margin: Duration,
) -> Result<Installation> {
    let tokens = client.exchange_code(code).await?;
    let api_domain = tokens.api_domain.clone().ok_or_else(|| {
        Error::InvalidInstallation("token response did not include api_domain".into())
    })?;

    let identity = fetch_identity(client, &api_domain, &tokens.access_token).await?;
    let installation = Installation::from_token_response(
        identity.tenant_id,
        identity.user_id,
        &tokens,
        margin,
        now_millis(),
    )?;

    store.put(installation.clone()).await?;
    metrics::counter!("crm_auth_installs_total").increment(1);
    info!(
        tenant_id = %installation.tenant_id,
        api_domain = %installation.api_domain,
        "installation completed"
    );
    Ok(installation)
}
