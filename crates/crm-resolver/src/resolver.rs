//! Per-request credential resolution
//!
//! Every outbound CRM call passes through [`AuthResolver::resolve`]. Delegated
//! credentials (per-company OAuth tokens) are preferred; a configured shared
//! API token is the fallback; otherwise the request is unauthenticated.

use std::sync::Arc;

use common::Secret;
use crm_auth::{
    API_PATH_PREFIX, AssertionTransport, AssertionVerifier, InboundRequest, Installation,
    InstallationStore, extract_assertion, now_millis,
};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::refresher::TokenRefresher;

/// Which kind of credential an [`AuthContext`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Delegated,
    Shared,
}

impl AuthMode {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Delegated => "delegated",
            Self::Shared => "shared",
        }
    }
}

/// Credential for one outbound call. Built per request and never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthContext {
    /// Company-specific OAuth bearer token.
    Delegated {
        base_url: String,
        bearer_token: Secret<String>,
        tenant_id: String,
        user_id: Option<String>,
    },
    /// Deployment-wide static API token.
    Shared {
        base_url: String,
        api_token: Secret<String>,
    },
}

impl AuthContext {
    fn delegated(installation: Installation) -> Self {
        Self::Delegated {
            base_url: installation.api_base_url(),
            bearer_token: installation.access_token,
            tenant_id: installation.tenant_id,
            user_id: installation.user_id,
        }
    }

    pub fn mode(&self) -> AuthMode {
        match self {
            Self::Delegated { .. } => AuthMode::Delegated,
            Self::Shared { .. } => AuthMode::Shared,
        }
    }

    pub fn base_url(&self) -> &str {
        match self {
            Self::Delegated { base_url, .. } | Self::Shared { base_url, .. } => base_url,
        }
    }

    pub fn tenant_id(&self) -> Option<&str> {
        match self {
            Self::Delegated { tenant_id, .. } => Some(tenant_id),
            Self::Shared { .. } => None,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::Delegated { user_id, .. } => user_id.as_deref(),
            Self::Shared { .. } => None,
        }
    }
}

/// Static API token for a single CRM company domain.
#[derive(Debug, Clone)]
pub struct SharedCredential {
    /// Company host, e.g. `acme.pipedrive.com`.
    pub domain: String,
    pub api_token: Secret<String>,
}

impl SharedCredential {
    pub fn new(domain: impl Into<String>, api_token: Secret<String>) -> Self {
        Self {
            domain: domain.into(),
            api_token,
        }
    }

    /// `https://{domain}/api/v1`. An explicit scheme in `domain` is kept.
    pub fn base_url(&self) -> String {
        let domain = self.domain.trim().trim_end_matches('/');
        if domain.starts_with("https://") || domain.starts_with("http://") {
            format!("{domain}{API_PATH_PREFIX}")
        } else {
            format!("https://{domain}{API_PATH_PREFIX}")
        }
    }

    fn is_usable(&self) -> bool {
        !self.domain.trim().is_empty() && !self.api_token.is_blank()
    }
}

/// Chooses the credential for each inbound request.
#[derive(Clone)]
pub struct AuthResolver {
    verifier: AssertionVerifier,
    transport: AssertionTransport,
    store: Arc<InstallationStore>,
    refresher: TokenRefresher,
    shared: Option<SharedCredential>,
}

impl AuthResolver {
    pub fn new(verifier: AssertionVerifier, refresher: TokenRefresher) -> Self {
        Self {
            verifier,
            transport: AssertionTransport::default(),
            store: refresher.store().clone(),
            refresher,
            shared: None,
        }
    }

    pub fn with_transport(mut self, transport: AssertionTransport) -> Self {
        self.transport = transport;
        self
    }

    /// Fallback credential. Blank domains or tokens are treated as absent.
    pub fn with_shared(mut self, shared: Option<SharedCredential>) -> Self {
        self.shared = shared.filter(SharedCredential::is_usable);
        self
    }

    /// Resolve the credential for `request`.
    ///
    /// Invalid assertions and failed refreshes fall through to the shared
    /// credential. Missing OAuth client credentials during a refresh are
    /// surfaced as `Configuration`.
    pub async fn resolve(&self, request: &InboundRequest) -> Result<AuthContext> {
        let context = match self.resolve_delegated(request).await? {
            Some(context) => context,
            None => match &self.shared {
                Some(shared) => AuthContext::Shared {
                    base_url: shared.base_url(),
                    api_token: shared.api_token.clone(),
                },
                None => {
                    metrics::counter!("crm_auth_resolve_total", "mode" => "unauthenticated")
                        .increment(1);
                    return Err(Error::Unauthenticated);
                }
            },
        };

        metrics::counter!("crm_auth_resolve_total", "mode" => context.mode().label()).increment(1);
        Ok(context)
    }

    async fn resolve_delegated(&self, request: &InboundRequest) -> Result<Option<AuthContext>> {
        let Some(raw) = extract_assertion(request, &self.transport) else {
            return Ok(None);
        };

        let claims = match self.verifier.verify(&raw) {
            Ok(claims) => claims,
            Err(crm_auth::Error::Configuration(msg)) => {
                warn!(error = %msg, "assertion present but no verification secret configured");
                return Ok(None);
            }
            Err(e) => {
                debug!(error = %e, "assertion rejected");
                return Ok(None);
            }
        };

        let Some(installation) = self.store.get(&claims.tenant_id).await else {
            debug!(tenant_id = %claims.tenant_id, "no installation for tenant");
            return Ok(None);
        };

        if !installation.needs_refresh(now_millis()) {
            return Ok(Some(AuthContext::delegated(installation)));
        }

        match self.refresher.refresh(&installation).await {
            Ok(refreshed) => Ok(Some(AuthContext::delegated(refreshed))),
            Err(Error::RefreshFailed(reason)) => {
                warn!(
                    tenant_id = %claims.tenant_id,
                    error = %reason,
                    "delegated credential unavailable after failed refresh"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
