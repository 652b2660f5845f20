//! In-process stand-in for the provider's token endpoint and identity API.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use common::Secret;

use crate::token::OAuthClientConfig;

/// One captured token endpoint call.
#[derive(Debug, Clone)]
pub struct TokenCall {
    pub authorization: Option<String>,
    pub form: HashMap<String, String>,
}

pub struct MockProvider {
    /// Base URL of the server (`http://127.0.0.1:port`)
    pub base: String,
    /// Token endpoint URL
    pub url: String,
    token_calls: Arc<Mutex<Vec<TokenCall>>>,
    identity_calls: Arc<Mutex<Vec<Option<String>>>>,
}

impl MockProvider {
    pub fn calls(&self) -> Vec<TokenCall> {
        self.token_calls.lock().unwrap().clone()
    }

    pub fn identity_calls(&self) -> Vec<Option<String>> {
        self.identity_calls.lock().unwrap().clone()
    }
}

/// Token endpoint only; the identity API answers with company 123 / user 456.
pub async fn start_token_server(status: StatusCode, body: serde_json::Value) -> MockProvider {
    start_provider(
        status,
        body,
        StatusCode::OK,
        serde_json::json!({"success": true, "data": {"id": 456, "company_id": 123}}),
    )
    .await
}

/// Placeholder `api_domain` in a token body, replaced by the mock's own base
/// URL so identity lookups land on the same server.
pub const SELF_DOMAIN: &str = "{self}";

pub async fn start_provider(
    token_status: StatusCode,
    mut token_body: serde_json::Value,
    identity_status: StatusCode,
    identity_body: serde_json::Value,
) -> MockProvider {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());

    if token_body.get("api_domain").and_then(|v| v.as_str()) == Some(SELF_DOMAIN) {
        token_body["api_domain"] = serde_json::Value::String(base.clone());
    }

    let token_calls = Arc::new(Mutex::new(Vec::new()));
    let identity_calls = Arc::new(Mutex::new(Vec::new()));

    let seen_tokens = token_calls.clone();
    let seen_identity = identity_calls.clone();
    let app = Router::new()
        .route(
            "/oauth/token",
            post(
                move |headers: HeaderMap, axum::Form(form): axum::Form<HashMap<String, String>>| {
                    let seen = seen_tokens.clone();
                    let body = token_body.clone();
                    async move {
                        seen.lock().unwrap().push(TokenCall {
                            authorization: header_value(&headers),
                            form,
                        });
                        (token_status, axum::Json(body))
                    }
                },
            ),
        )
        .route(
            "/api/v1/users/me",
            get(move |headers: HeaderMap| {
                let seen = seen_identity.clone();
                let body = identity_body.clone();
                async move {
                    seen.lock().unwrap().push(header_value(&headers));
                    (identity_status, axum::Json(body))
                }
            }),
        );

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockProvider {
        url: format!("{base}/oauth/token"),
        base,
        token_calls,
        identity_calls,
    }
}

fn header_value(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

pub fn test_oauth_config(token_endpoint: &str) -> OAuthClientConfig {
    OAuthClientConfig {
        client_id: Some("test-client".into()),
        client_secret: Some(Secret::from("test-secret")),
        redirect_uri: Some("https://gateway.example.com/oauth/callback".into()),
        token_endpoint: token_endpoint.into(),
        timeout: Duration::from_secs(5),
        ..OAuthClientConfig::default()
    }
}
