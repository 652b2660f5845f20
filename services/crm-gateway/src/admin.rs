//! Admin API for installation management
//!
//! Runs on a separate listener (default 127.0.0.1:9090) and is not meant to
//! be exposed publicly.
//!
//! Endpoints:
//! - GET    /admin/installations              - list installed companies
//! - DELETE /admin/installations/{tenant_id}  - remove an installation
//!
//! Deletion here is the only way an installation ever leaves the store.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use crm_auth::{InstallationStore, now_millis};
use tracing::info;

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    store: Arc<InstallationStore>,
}

impl AdminState {
    pub fn new(store: Arc<InstallationStore>) -> Self {
        Self { store }
    }
}

/// Build the admin axum router.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/installations", get(list_installations))
        .route(
            "/admin/installations/{tenant_id}",
            axum::routing::delete(delete_installation),
        )
        .with_state(state)
}

/// GET /admin/installations - list installations with token state.
///
/// Never exposes tokens.
async fn list_installations(State(state): State<AdminState>) -> impl IntoResponse {
    let now = now_millis();
    let installations: Vec<serde_json::Value> = state
        .store
        .list()
        .await
        .into_iter()
        .map(|installation| {
            serde_json::json!({
                "tenant_id": installation.tenant_id,
                "user_id": installation.user_id,
                "api_domain": installation.api_domain,
                "scope": installation.scope,
                "expires_at": installation.expires_at,
                "state": if installation.needs_refresh(now) { "expired" } else { "valid" },
            })
        })
        .collect();

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        serde_json::json!({
            "installations": installations,
            "persist_failures": state.store.persist_failures(),
        })
        .to_string(),
    )
}

/// DELETE /admin/installations/{tenant_id} - remove one installation.
async fn delete_installation(
    State(state): State<AdminState>,
    Path(tenant_id): Path<String>,
) -> impl IntoResponse {
    match state.store.remove(&tenant_id).await {
        Some(_) => {
            info!(tenant_id = %tenant_id, "installation removed by admin");
            (
                StatusCode::OK,
                [(axum::http::header::CONTENT_TYPE, "application/json")],
                serde_json::json!({
                    "tenant_id": tenant_id,
                    "status": "removed"
                })
                .to_string(),
            )
        }
        None => (
            StatusCode::NOT_FOUND,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            serde_json::json!({
                "error": format!("no installation for tenant {tenant_id}")
            })
            .to_string(),
        ),
    }
}
