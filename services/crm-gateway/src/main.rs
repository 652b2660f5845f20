//! CRM auth gateway
//!
//! Single-binary Rust service that:
//! 1. Completes app installs and stores per-company CRM credentials
//! 2. Resolves a credential for every inbound request (delegated or shared)
//! 3. Proxies `/crm/*` calls to the CRM API with that credential
//! 4. Serves health, Prometheus metrics and a separate admin API

mod admin;
mod config;
mod error;
mod metrics;
mod oauth;
mod proxy;
#[cfg(test)]
mod test_support;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use crm_auth::{InstallationStore, TokenClient};
use crm_resolver::{AuthResolver, TokenRefresher};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::{AdminState, build_admin_router};
use crate::config::Config;
use crate::oauth::{OAuthState, build_oauth_router};
use crate::proxy::ProxyState;

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
    store: Arc<InstallationStore>,
    started_at: Instant,
    shared_configured: bool,
    oauth_configured: bool,
    prometheus: PrometheusHandle,
}

/// Build the public router: health, metrics, install endpoints and the CRM proxy.
///
/// A concurrency limit layer caps in-flight requests at `max_connections`.
fn build_router(state: AppState, oauth: OAuthState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/crm/{*path}", any(crm_handler))
        .with_state(state)
        .merge(build_oauth_router(oauth))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting crm-auth-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let oauth_client = config.oauth_client();
    let verifier = config.assertion_verifier();
    let shared = config.shared_credential();

    info!(
        listen_addr = %config.server.listen_addr,
        admin_addr = %config.server.admin_addr,
        store = %config.store.path.display(),
        oauth_configured = oauth_client.has_client_credentials(),
        assertion_verification = verifier.is_configured(),
        shared_mode = shared.is_some(),
        "configuration loaded"
    );
    if !verifier.is_configured() {
        warn!("no assertion secret configured, delegated mode is disabled");
    }
    if !oauth_client.has_client_credentials() {
        warn!("no OAuth client credentials configured, installs and refreshes will fail");
    }

    let store = Arc::new(InstallationStore::load(config.store.path.clone()).await);
    info!(installations = store.len().await, "installation store loaded");

    let http = reqwest::Client::new();
    let oauth_configured = oauth_client.has_client_credentials();
    let token_client = TokenClient::new(http.clone(), oauth_client);
    let refresher = TokenRefresher::new(store.clone(), token_client.clone(), config.expiry_margin());
    let shared_configured = shared.is_some();
    let resolver = AuthResolver::new(verifier, refresher)
        .with_transport(config.assertion_transport())
        .with_shared(shared);

    let app_state = AppState {
        proxy: ProxyState {
            client: http,
            resolver,
            transport: config.assertion_transport(),
            timeout: config.timeout(),
        },
        store: store.clone(),
        started_at: Instant::now(),
        shared_configured,
        oauth_configured,
        prometheus: prometheus_handle,
    };
    let oauth_state = OAuthState {
        client: token_client,
        store: store.clone(),
        margin: config.expiry_margin(),
    };

    let app = build_router(app_state, oauth_state, config.server.max_connections);
    let admin_app = build_admin_router(AdminState::new(store));

    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.listen_addr))?;
    let admin_listener = TcpListener::bind(config.server.admin_addr)
        .await
        .with_context(|| format!("failed to bind admin listener to {}", config.server.admin_addr))?;

    info!(addr = %config.server.listen_addr, "accepting requests");
    info!(addr = %config.server.admin_addr, "admin API listening");

    // Graceful shutdown: the drain timeout starts when the signal fires, so a
    // slow client cannot block process exit.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = spawn_server(listener, app, shutdown_rx.clone());
    let admin_server = spawn_server(admin_listener, admin_app, shutdown_rx);

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(DRAIN_TIMEOUT, async { tokio::join!(server, admin_server) }).await {
        Ok((server, admin)) => {
            for (name, result) in [("public", server), ("admin", admin)] {
                match result {
                    Ok(Ok(())) => info!(listener = name, "drained"),
                    Ok(Err(e)) => error!(listener = name, error = %e, "server error during shutdown"),
                    Err(e) => error!(listener = name, error = %e, "server task panicked"),
                }
            }
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

fn spawn_server(
    listener: TcpListener,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<std::io::Result<()>> {
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
    })
}

/// Health endpoint: status, uptime, installation count and persistence failures.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = serde_json::json!({
        "status": "healthy",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "installations": state.store.len().await,
        "persist_failures": state.store.persist_failures(),
        "shared_mode": state.shared_configured,
        "oauth_configured": state.oauth_configured,
    });

    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint, text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Proxy `/crm/{*path}` to the CRM API with a resolved credential.
async fn crm_handler(
    State(state): State<AppState>,
    Path(path): Path<String>,
    request: Request<Body>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::proxy_request(&state.proxy, &path, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        JWT_SECRET, MockCrm, body_json, empty_store, sign_assertion, start_mock_crm, token_client,
    };
    use axum::http::StatusCode;
    use common::Secret;
    use crm_auth::{AssertionTransport, AssertionVerifier, Installation, now_millis};
    use crm_resolver::SharedCredential;
    use tower::ServiceExt;

    const FAR_FUTURE: u64 = 4_102_444_800_000;

    /// PrometheusHandle without installing a global recorder.
    fn test_prometheus_handle() -> PrometheusHandle {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        recorder.handle()
    }

    fn installation(api_domain: &str, expires_at: u64) -> Installation {
        Installation {
            tenant_id: "123".into(),
            user_id: Some("456".into()),
            access_token: Secret::from("a1"),
            refresh_token: Secret::from("r1"),
            expires_at,
            api_domain: api_domain.into(),
            scope: "base".into(),
        }
    }

    fn test_app(
        store: Arc<InstallationStore>,
        client: TokenClient,
        shared: Option<SharedCredential>,
    ) -> Router {
        let margin = Duration::from_secs(60);
        let refresher = TokenRefresher::new(store.clone(), client.clone(), margin);
        let resolver = AuthResolver::new(
            AssertionVerifier::new(Some(Secret::from(JWT_SECRET))),
            refresher,
        )
        .with_shared(shared.clone());

        let state = AppState {
            proxy: ProxyState {
                client: reqwest::Client::new(),
                resolver,
                transport: AssertionTransport::default(),
                timeout: Duration::from_secs(5),
            },
            store: store.clone(),
            started_at: Instant::now(),
            shared_configured: shared.is_some(),
            oauth_configured: client.config().has_client_credentials(),
            prometheus: test_prometheus_handle(),
        };
        let oauth = OAuthState {
            client,
            store,
            margin,
        };
        build_router(state, oauth, 1000)
    }

    async fn app_with_installation(crm: &MockCrm, expires_at: u64) -> (Router, Arc<InstallationStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = empty_store(&dir).await;
        store.put(installation(&crm.base, expires_at)).await.unwrap();
        let app = test_app(store.clone(), token_client(&crm.token_endpoint()), None);
        (app, store, dir)
    }

    #[tokio::test]
    async fn health_endpoint_returns_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = empty_store(&dir).await;
        store
            .put(installation("https://acme.pipedrive.com", FAR_FUTURE))
            .await
            .unwrap();
        let app = test_app(
            store,
            token_client("http://127.0.0.1:1/oauth/token"),
            Some(SharedCredential::new("acme.pipedrive.com", Secret::from("tok"))),
        );

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["installations"], 1);
        assert_eq!(json["persist_failures"], 0);
        assert_eq!(json["shared_mode"], true);
        assert_eq!(json["oauth_configured"], true);
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_text() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(
            empty_store(&dir).await,
            token_client("http://127.0.0.1:1/oauth/token"),
            None,
        );

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()["content-type"].to_str().unwrap();
        assert!(content_type.starts_with("text/plain"));
    }

    #[tokio::test]
    async fn delegated_request_carries_bearer_and_strips_assertion() {
        let crm = start_mock_crm(StatusCode::OK).await;
        let (app, _store, _dir) = app_with_installation(&crm, FAR_FUTURE).await;

        let uri = format!("/crm/deals/42?limit=5&token={}", sign_assertion("123"));
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["method"], "GET");
        assert_eq!(json["path"], "/api/v1/deals/42");
        assert_eq!(json["query"], "limit=5");
        assert_eq!(json["authorization"], "Bearer a1");
        assert_eq!(crm.token_calls(), 0);
    }

    #[tokio::test]
    async fn expired_installation_is_refreshed_before_forwarding() {
        let crm = start_mock_crm(StatusCode::OK).await;
        let (app, store, _dir) = app_with_installation(&crm, now_millis() - 10_000).await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/crm/deals")
                    .header("authorization", format!("Bearer {}", sign_assertion("123")))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["authorization"], "Bearer a2");
        assert_eq!(crm.token_calls(), 1);

        let stored = store.get("123").await.unwrap();
        assert_eq!(stored.access_token.expose(), "a2");
        assert!(stored.expires_at > now_millis() + 3_500_000);
    }

    #[tokio::test]
    async fn body_assertion_is_removed_before_forwarding() {
        let crm = start_mock_crm(StatusCode::OK).await;
        let (app, _store, _dir) = app_with_installation(&crm, FAR_FUTURE).await;

        let body = serde_json::json!({"title": "New deal", "pipedrive_jwt": sign_assertion("123")});
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/crm/deals")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["method"], "POST");
        assert_eq!(json["authorization"], "Bearer a1");
        assert_eq!(json["content_type"], "application/json");
        let forwarded: serde_json::Value =
            serde_json::from_str(json["body"].as_str().unwrap()).unwrap();
        assert_eq!(forwarded, serde_json::json!({"title": "New deal"}));
    }

    #[tokio::test]
    async fn custom_header_assertion_is_not_forwarded() {
        let crm = start_mock_crm(StatusCode::OK).await;
        let (app, _store, _dir) = app_with_installation(&crm, FAR_FUTURE).await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/crm/deals")
                    .header("x-pipedrive-token", sign_assertion("123"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let json = body_json(response).await;
        assert_eq!(json["authorization"], "Bearer a1");
        assert_eq!(json["x_pipedrive_token"], "");
    }

    #[tokio::test]
    async fn shared_mode_appends_api_token() {
        let crm = start_mock_crm(StatusCode::OK).await;
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(
            empty_store(&dir).await,
            token_client(&crm.token_endpoint()),
            Some(SharedCredential::new(crm.base.clone(), Secret::from("shared-tok"))),
        );

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/crm/deals?status=open")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["path"], "/api/v1/deals");
        assert_eq!(json["query"], "api_token=shared-tok&status=open");
        assert_eq!(json["authorization"], "");
    }

    #[tokio::test]
    async fn caller_api_token_is_not_forwarded() {
        let crm = start_mock_crm(StatusCode::OK).await;
        let dir = tempfile::tempdir().unwrap();
        let store = empty_store(&dir).await;
        store.put(installation(&crm.base, FAR_FUTURE)).await.unwrap();
        let app = test_app(
            store,
            token_client(&crm.token_endpoint()),
            Some(SharedCredential::new(crm.base.clone(), Secret::from("shared-tok"))),
        );

        let shared = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/crm/deals?api_token=evil&status=open")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(shared).await;
        assert_eq!(json["query"], "api_token=shared-tok&status=open");

        let delegated = app
            .oneshot(
                Request::builder()
                    .uri(format!("/crm/deals?api_token=evil&token={}", sign_assertion("123")))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(delegated).await;
        assert_eq!(json["authorization"], "Bearer a1");
        assert_eq!(json["query"], "");
    }

    #[tokio::test]
    async fn no_credential_is_401() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(
            empty_store(&dir).await,
            token_client("http://127.0.0.1:1/oauth/token"),
            None,
        );

        let response = app
            .oneshot(Request::builder().uri("/crm/deals").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "authentication_error");
        assert!(json["error"]["request_id"].as_str().unwrap().starts_with("req_"));
    }

    #[tokio::test]
    async fn refresh_without_client_credentials_is_500() {
        let crm = start_mock_crm(StatusCode::OK).await;
        let dir = tempfile::tempdir().unwrap();
        let store = empty_store(&dir).await;
        store
            .put(installation(&crm.base, now_millis() - 10_000))
            .await
            .unwrap();
        let client = TokenClient::new(
            reqwest::Client::new(),
            crm_auth::OAuthClientConfig {
                token_endpoint: crm.token_endpoint(),
                ..crm_auth::OAuthClientConfig::default()
            },
        );
        let app = test_app(store, client, None);

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/crm/deals?token={}", sign_assertion("123")))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(crm.token_calls(), 0);
    }

    #[tokio::test]
    async fn rejected_refresh_without_shared_is_401() {
        let crm = start_mock_crm(StatusCode::BAD_REQUEST).await;
        let (app, store, _dir) = app_with_installation(&crm, now_millis() - 10_000).await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/crm/deals?token={}", sign_assertion("123")))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(crm.token_calls(), 1);
        assert_eq!(store.get("123").await.unwrap().access_token.expose(), "a1");
    }

    #[tokio::test]
    async fn unreachable_crm_is_502() {
        let dir = tempfile::tempdir().unwrap();
        let store = empty_store(&dir).await;
        store
            .put(installation("http://127.0.0.1:1", FAR_FUTURE))
            .await
            .unwrap();
        let app = test_app(store, token_client("http://127.0.0.1:1/oauth/token"), None);

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/crm/deals?token={}", sign_assertion("123")))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json = body_json(response).await;
        assert_eq!(json["error"]["type"], "proxy_error");
    }

    #[tokio::test]
    async fn oauth_routes_are_mounted() {
        let crm = start_mock_crm(StatusCode::OK).await;
        let dir = tempfile::tempdir().unwrap();
        let store = empty_store(&dir).await;
        let app = test_app(store.clone(), token_client(&crm.token_endpoint()), None);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/oauth/callback?code=abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(store.get("123").await.is_some());
    }
}
