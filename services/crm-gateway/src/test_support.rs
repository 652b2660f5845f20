//! One in-process server playing the OAuth provider, the identity API and
//! the CRM itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::{get, post};
use common::Secret;
use crm_auth::{InstallationStore, OAuthClientConfig, TokenClient};
use tokio::net::TcpListener;

pub const JWT_SECRET: &str = "test-client-secret";

pub struct MockCrm {
    /// `http://127.0.0.1:port`, also the `api_domain` handed out on token calls
    pub base: String,
    token_calls: Arc<AtomicUsize>,
}

impl MockCrm {
    pub fn token_endpoint(&self) -> String {
        format!("{}/oauth/token", self.base)
    }

    pub fn token_calls(&self) -> usize {
        self.token_calls.load(Ordering::SeqCst)
    }
}

/// Token endpoint issuing `a1`/`r1` for codes and `a2`/`r2` for refreshes,
/// an identity API naming company 123 / user 456, and a CRM fallback that
/// echoes method, path, query, authorization and body as JSON.
pub async fn start_mock_crm(token_status: StatusCode) -> MockCrm {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let token_calls = Arc::new(AtomicUsize::new(0));

    let domain = base.clone();
    let calls = token_calls.clone();
    let app = Router::new()
        .route(
            "/oauth/token",
            post(
                move |axum::Form(form): axum::Form<HashMap<String, String>>| {
                    let domain = domain.clone();
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        let (access, refresh) = match form.get("grant_type").map(String::as_str) {
                            Some("refresh_token") => ("a2", "r2"),
                            _ => ("a1", "r1"),
                        };
                        let body = if token_status.is_success() {
                            serde_json::json!({
                                "access_token": access,
                                "refresh_token": refresh,
                                "expires_in": 3600,
                                "api_domain": domain,
                                "scope": "base"
                            })
                        } else {
                            serde_json::json!({"error": "invalid_grant"})
                        };
                        (token_status, axum::Json(body))
                    }
                },
            ),
        )
        .route(
            "/api/v1/users/me",
            get(|| async {
                axum::Json(serde_json::json!({
                    "success": true,
                    "data": {"id": 456, "company_id": 123, "name": "Test User"}
                }))
            }),
        )
        .fallback(|request: Request<Body>| async move {
            let method = request.method().to_string();
            let path = request.uri().path().to_string();
            let query = request.uri().query().unwrap_or("").to_string();
            let (authorization, content_type, custom_token) = {
                let header = |name: &str| {
                    request
                        .headers()
                        .get(name)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string()
                };
                (
                    header("authorization"),
                    header("content-type"),
                    header("x-pipedrive-token"),
                )
            };
            let body = axum::body::to_bytes(request.into_body(), 1024 * 1024)
                .await
                .unwrap();
            axum::Json(serde_json::json!({
                "method": method,
                "path": path,
                "query": query,
                "authorization": authorization,
                "content_type": content_type,
                "x_pipedrive_token": custom_token,
                "body": String::from_utf8_lossy(&body),
            }))
        });

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockCrm { base, token_calls }
}

pub fn token_client(token_endpoint: &str) -> TokenClient {
    TokenClient::new(
        reqwest::Client::new(),
        OAuthClientConfig {
            client_id: Some("test-client".into()),
            client_secret: Some(Secret::from(JWT_SECRET)),
            redirect_uri: Some("https://gateway.example.com/oauth/callback".into()),
            token_endpoint: token_endpoint.into(),
            timeout: Duration::from_secs(5),
            ..OAuthClientConfig::default()
        },
    )
}

pub async fn empty_store(dir: &tempfile::TempDir) -> Arc<InstallationStore> {
    Arc::new(InstallationStore::load(dir.path().join("installations.json")).await)
}

/// HS256 assertion for `company_id`, valid for five minutes.
pub fn sign_assertion(company_id: &str) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &serde_json::json!({"company_id": company_id, "user_id": 456, "exp": now + 300}),
        &jsonwebtoken::EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap()
}

pub async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}
