//! Single-flight token refresh
//!
//! Refresh tokens are single-use: if two requests for the same tenant both
//! send the stale token, the second is rejected and may invalidate the first.
//! Each tenant therefore gets its own async guard. The holder re-reads the
//! stored record after acquiring it, so waiters that queued behind a
//! successful refresh return the new record without calling the provider.
//! Waiters that queued behind a failed refresh with the same refresh token get
//! the same failure instead of replaying the token.
//!
//! The exchange and the store write run on a spawned task. A caller that is
//! dropped mid-refresh does not cancel them.
//!
//! Admin deletes and re-installs don't take the tenant guard, so the result is
//! written with a compare-and-swap on the refresh token that was exchanged. A
//! record removed or replaced during the provider call is left as it is.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use common::Secret;
use crm_auth::{CompareAndSwapOutcome, Installation, InstallationStore, TokenClient, now_millis};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Outcome of the last refresh attempt for a tenant.
#[derive(Default)]
struct Flight {
    last_failure: Option<FailedRefresh>,
}

struct FailedRefresh {
    refresh_token: Secret<String>,
    finished_at: Instant,
    reason: String,
}

/// Exchanges stored refresh tokens for new credentials, one flight per tenant.
#[derive(Clone)]
pub struct TokenRefresher {
    store: Arc<InstallationStore>,
    client: TokenClient,
    margin: Duration,
    flights: Arc<Mutex<HashMap<String, Arc<AsyncMutex<Flight>>>>>,
}

impl TokenRefresher {
    pub fn new(store: Arc<InstallationStore>, client: TokenClient, margin: Duration) -> Self {
        Self {
            store,
            client,
            margin,
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &Arc<InstallationStore> {
        &self.store
    }

    /// Refresh `installation` and return the replacement record.
    ///
    /// The replacement is written through the store before it is returned.
    /// Fails with `RefreshFailed` on network errors or provider rejection and
    /// with `Configuration` when client credentials are missing. Never retries.
    pub async fn refresh(&self, installation: &Installation) -> Result<Installation> {
        let requested_at = Instant::now();
        let refresher = self.clone();
        let tenant_id = installation.tenant_id.clone();

        let task =
            tokio::spawn(async move { refresher.refresh_single_flight(&tenant_id, requested_at).await });

        task.await
            .map_err(|e| Error::RefreshFailed(format!("refresh task did not complete: {e}")))?
    }

    fn flight(&self, tenant_id: &str) -> Arc<AsyncMutex<Flight>> {
        let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
        flights.entry(tenant_id.to_owned()).or_default().clone()
    }

    /// Drop the tenant's entry once nobody else holds or waits on it.
    ///
    /// Handles are only cloned under the map lock, so the count is stable here:
    /// one reference for the map, one for `flight`.
    fn release(&self, tenant_id: &str, flight: &Arc<AsyncMutex<Flight>>) {
        let mut flights = self.flights.lock().unwrap_or_else(PoisonError::into_inner);
        let idle = flights
            .get(tenant_id)
            .is_some_and(|entry| Arc::ptr_eq(entry, flight) && Arc::strong_count(flight) == 2);
        if idle {
            flights.remove(tenant_id);
        }
    }

    async fn refresh_single_flight(
        &self,
        tenant_id: &str,
        requested_at: Instant,
    ) -> Result<Installation> {
        let flight = self.flight(tenant_id);
        let result = {
            let mut guard = flight.lock().await;
            self.run_flight(&mut guard, tenant_id, requested_at).await
        };
        self.release(tenant_id, &flight);
        result
    }

    async fn run_flight(
        &self,
        flight: &mut Flight,
        tenant_id: &str,
        requested_at: Instant,
    ) -> Result<Installation> {
        // Admin removal wins over an in-flight refresh; never resurrect a record.
        let current = self.store.get(tenant_id).await.ok_or_else(|| {
            Error::RefreshFailed(format!("no installation stored for tenant {tenant_id}"))
        })?;

        if !current.needs_refresh(now_millis()) {
            debug!(tenant_id, "credential already refreshed by a concurrent request");
            metrics::counter!("crm_auth_refresh_total", "outcome" => "coalesced").increment(1);
            return Ok(current);
        }

        if let Some(failure) = flight.last_failure.as_ref().filter(|f| {
            f.finished_at >= requested_at && f.refresh_token == current.refresh_token
        }) {
            debug!(tenant_id, "sharing result of a refresh that failed while waiting");
            metrics::counter!("crm_auth_refresh_total", "outcome" => "coalesced").increment(1);
            return Err(Error::RefreshFailed(failure.reason.clone()));
        }

        match self.exchange(&current).await {
            Ok(next) => {
                flight.last_failure = None;
                metrics::counter!("crm_auth_refresh_total", "outcome" => "success").increment(1);
                info!(tenant_id, expires_at = next.expires_at, "token refresh succeeded");
                Ok(next)
            }
            Err(err) => {
                if let Error::RefreshFailed(reason) = &err {
                    flight.last_failure = Some(FailedRefresh {
                        refresh_token: current.refresh_token.clone(),
                        finished_at: Instant::now(),
                        reason: reason.clone(),
                    });
                }
                metrics::counter!("crm_auth_refresh_total", "outcome" => "failure").increment(1);
                warn!(tenant_id, error = %err, "token refresh failed");
                Err(err)
            }
        }
    }

    async fn exchange(&self, current: &Installation) -> Result<Installation> {
        let response = self
            .client
            .refresh_token(current.refresh_token.expose())
            .await?;
        let next = current.refreshed(&response, self.margin, now_millis())?;
        match self
            .store
            .compare_and_swap_refresh(&current.refresh_token, next.clone())
            .await?
        {
            CompareAndSwapOutcome::Updated => Ok(next),
            CompareAndSwapOutcome::Missing => Err(Error::RefreshFailed(format!(
                "installation for tenant {} was removed during refresh",
                current.tenant_id
            ))),
            CompareAndSwapOutcome::Superseded(newer) => {
                info!(
                    tenant_id = %current.tenant_id,
                    "installation replaced during refresh, keeping the newer record"
                );
                Ok(newer)
            }
        }
    }
}
