//! App install endpoints
//!
//! - GET /oauth/install  - redirect an admin to the provider's consent page
//! - GET /oauth/callback - provider redirect target; completes the handshake

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::response::{Html, Redirect};
use axum::routing::get;
use crm_auth::{InstallationStore, TokenClient, complete_installation};
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::InstallError;

#[derive(Clone)]
pub struct OAuthState {
    pub client: TokenClient,
    pub store: Arc<InstallationStore>,
    pub margin: Duration,
}

pub fn build_oauth_router(state: OAuthState) -> Router {
    Router::new()
        .route("/oauth/install", get(install))
        .route("/oauth/callback", get(callback))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    error: Option<String>,
}

/// GET /oauth/install - 303 to the authorization URL with a fresh `state`.
async fn install(State(state): State<OAuthState>) -> Result<Redirect, InstallError> {
    let nonce = uuid::Uuid::new_v4().as_simple().to_string();
    let url = state.client.authorization_url(&nonce)?;
    Ok(Redirect::to(&url))
}

/// GET /oauth/callback - exchange the code and store the Installation.
async fn callback(
    State(state): State<OAuthState>,
    Query(params): Query<CallbackParams>,
) -> Result<Html<String>, InstallError> {
    if let Some(error) = params.error {
        warn!(error = %error, "provider returned an authorization error");
        return Err(InstallError::Denied(error));
    }

    let code = params
        .code
        .filter(|c| !c.trim().is_empty())
        .ok_or(InstallError::MissingCode)?;

    if !state.client.config().has_client_credentials() {
        return Err(InstallError::NotConfigured(
            "client_id and client secret are required to complete installs".into(),
        ));
    }

    let installation = complete_installation(&state.client, &state.store, &code, state.margin)
        .await
        .inspect_err(|e| warn!(error = %e, "installation handshake failed"))?;

    info!(tenant_id = %installation.tenant_id, "app installed");
    Ok(Html(success_page(&installation.api_domain)))
}

fn success_page(api_domain: &str) -> String {
    let domain = html_escape(api_domain);
    format!(
        "<!DOCTYPE html>\n<html>\n<head><title>Installation complete</title></head>\n\
         <body>\n<h1>Installation complete</h1>\n\
         <p>The app is now connected to your CRM account.</p>\n\
         <a href=\"{domain}\">Return to the CRM</a>\n</body>\n</html>\n"
    )
}

fn html_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
