//! Shared fixtures: a counting token endpoint and pre-populated stores.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::post;
use common::Secret;
use crm_auth::{Installation, InstallationStore, OAuthClientConfig, TokenClient};

pub const TEST_SECRET: &str = "test-client-secret";

/// Token endpoint that counts calls and answers after `delay`.
pub struct CountingProvider {
    pub url: String,
    calls: Arc<AtomicUsize>,
    refresh_tokens: Arc<std::sync::Mutex<Vec<String>>>,
}

impl CountingProvider {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn refresh_tokens(&self) -> Vec<String> {
        self.refresh_tokens.lock().unwrap().clone()
    }
}

pub async fn start_provider(
    status: StatusCode,
    body: serde_json::Value,
    delay: Duration,
) -> CountingProvider {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/oauth/token", listener.local_addr().unwrap());

    let calls = Arc::new(AtomicUsize::new(0));
    let refresh_tokens = Arc::new(std::sync::Mutex::new(Vec::new()));

    let seen_calls = calls.clone();
    let seen_tokens = refresh_tokens.clone();
    let app = Router::new().route(
        "/oauth/token",
        post(
            move |axum::Form(form): axum::Form<HashMap<String, String>>| {
                let calls = seen_calls.clone();
                let tokens = seen_tokens.clone();
                let body = body.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if let Some(token) = form.get("refresh_token") {
                        tokens.lock().unwrap().push(token.clone());
                    }
                    tokio::time::sleep(delay).await;
                    (status, axum::Json(body))
                }
            },
        ),
    );

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    CountingProvider {
        url,
        calls,
        refresh_tokens,
    }
}

pub fn refreshed_body() -> serde_json::Value {
    serde_json::json!({
        "access_token": "a2",
        "refresh_token": "r2",
        "expires_in": 3600,
        "api_domain": "https://acme.pipedrive.com",
        "scope": "base"
    })
}

pub fn token_client(token_endpoint: &str) -> TokenClient {
    TokenClient::new(
        reqwest::Client::new(),
        OAuthClientConfig {
            client_id: Some("test-client".into()),
            client_secret: Some(Secret::from("test-secret")),
            redirect_uri: Some("https://gateway.example.com/oauth/callback".into()),
            token_endpoint: token_endpoint.into(),
            timeout: Duration::from_secs(5),
            ..OAuthClientConfig::default()
        },
    )
}

pub fn installation(tenant_id: &str, expires_at: u64) -> Installation {
    Installation {
        tenant_id: tenant_id.into(),
        user_id: Some("456".into()),
        access_token: Secret::from("a1"),
        refresh_token: Secret::from("r1"),
        expires_at,
        api_domain: "https://acme.pipedrive.com".into(),
        scope: "base".into(),
    }
}

pub async fn store_with(
    dir: &tempfile::TempDir,
    installations: &[Installation],
) -> Arc<InstallationStore> {
    let store = InstallationStore::load(dir.path().join("installations.json")).await;
    for installation in installations {
        store.put(installation.clone()).await.unwrap();
    }
    Arc::new(store)
}

/// HS256 assertion for `company_id`, valid for five minutes.
pub fn sign_assertion(company_id: &str) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &serde_json::json!({
            "company_id": company_id,
            "user_id": 456,
            "iat": now,
            "exp": now + 300
        }),
        &jsonwebtoken::EncodingKey::from_secret(TEST_SECRET.as_bytes()),
    )
    .unwrap()
}
