//! Durable per-tenant installation storage
//!
//! Holds one `Installation` per company in memory, backed by a JSON snapshot
//! keyed by tenant id. The snapshot is loaded once at startup and rewritten
//! in full on every mutation using temp-file + rename, so a crash mid-write
//! leaves the previous snapshot intact. A tokio Mutex serializes all writers,
//! which also keeps two refreshes for the same tenant from interleaving.
//!
//! Persistence failures never fail the caller: the in-memory map is updated,
//! the failure is logged and counted, and the next successful write catches
//! the file up.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use common::Secret;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::identifiers::{optional_string_or_number, string_or_number};
use crate::token::TokenResponse;

/// Current time as unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A company's delegated OAuth credentials.
///
/// `expires_at` is unix milliseconds and already has the safety margin
/// subtracted; it is never the raw provider expiry. Records are replaced
/// wholesale on refresh, never patched in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Installation {
    #[serde(alias = "companyId", deserialize_with = "string_or_number")]
    pub tenant_id: String,
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub user_id: Option<String>,
    pub access_token: Secret<String>,
    pub refresh_token: Secret<String>,
    pub expires_at: u64,
    pub api_domain: String,
    #[serde(default)]
    pub scope: String,
}

impl Installation {
    /// Build a fresh record from a token endpoint response.
    pub fn from_token_response(
        tenant_id: impl Into<String>,
        user_id: Option<String>,
        response: &TokenResponse,
        margin: Duration,
        now_millis: u64,
    ) -> Result<Self> {
        let api_domain = response.api_domain.clone().ok_or_else(|| {
            Error::InvalidInstallation("token response did not include api_domain".into())
        })?;
        let installation = Self {
            tenant_id: tenant_id.into(),
            user_id,
            access_token: Secret::new(response.access_token.clone()),
            refresh_token: Secret::new(response.refresh_token.clone()),
            expires_at: expiry_with_margin(response.expires_in, margin, now_millis),
            api_domain,
            scope: response.scope.clone().unwrap_or_default(),
        };
        installation.validate()?;
        Ok(installation)
    }

    /// Build the replacement record after a successful refresh.
    ///
    /// Tenant and user carry over. `api_domain` and `scope` carry over when
    /// the provider omits them from the refresh response.
    pub fn refreshed(&self, response: &TokenResponse, margin: Duration, now_millis: u64) -> Result<Self> {
        let next = Self {
            tenant_id: self.tenant_id.clone(),
            user_id: self.user_id.clone(),
            access_token: Secret::new(response.access_token.clone()),
            refresh_token: Secret::new(response.refresh_token.clone()),
            expires_at: expiry_with_margin(response.expires_in, margin, now_millis),
            api_domain: response
                .api_domain
                .clone()
                .unwrap_or_else(|| self.api_domain.clone()),
            scope: response.scope.clone().unwrap_or_else(|| self.scope.clone()),
        };
        next.validate()?;
        Ok(next)
    }

    /// True once `now` has reached the margin-adjusted expiry.
    pub fn needs_refresh(&self, now_millis: u64) -> bool {
        now_millis >= self.expires_at
    }

    /// Base URL for CRM API calls made on this tenant's behalf.
    pub fn api_base_url(&self) -> String {
        format!(
            "{}{}",
            self.api_domain.trim_end_matches('/'),
            crate::constants::API_PATH_PREFIX
        )
    }

    fn validate(&self) -> Result<()> {
        if self.tenant_id.trim().is_empty() {
            return Err(Error::InvalidInstallation("tenant id is empty".into()));
        }
        if self.access_token.is_blank() {
            return Err(Error::InvalidInstallation(format!(
                "access token for tenant {} is empty",
                self.tenant_id
            )));
        }
        if self.refresh_token.is_blank() {
            return Err(Error::InvalidInstallation(format!(
                "refresh token for tenant {} is empty",
                self.tenant_id
            )));
        }
        if self.api_domain.trim().is_empty() {
            return Err(Error::InvalidInstallation(format!(
                "api domain for tenant {} is empty",
                self.tenant_id
            )));
        }
        Ok(())
    }
}

/// `now + max(expires_in - margin, 0)` in unix milliseconds.
pub fn expiry_with_margin(expires_in_secs: u64, margin: Duration, now_millis: u64) -> u64 {
    let lifetime = expires_in_secs.saturating_sub(margin.as_secs());
    now_millis.saturating_add(lifetime.saturating_mul(1000))
}

/// Result of [`InstallationStore::compare_and_swap_refresh`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompareAndSwapOutcome {
    Updated,
    /// The tenant was removed; nothing was written.
    Missing,
    /// A different record replaced the expected one; it is returned unchanged.
    Superseded(Installation),
}

/// Thread-safe installation snapshot manager.
///
/// Reads clone out of the map under the lock; writes hold the lock across the
/// full snapshot write so snapshots land on disk in mutation order.
pub struct InstallationStore {
    path: PathBuf,
    state: Mutex<BTreeMap<String, Installation>>,
    persist_failures: AtomicU64,
}

impl InstallationStore {
    /// Load installations from the given snapshot path.
    ///
    /// Never fails: a missing file starts empty (and is created as `{}`), a
    /// corrupt file starts empty and is left untouched until the next write.
    /// Individual records that don't parse are skipped; unknown fields are
    /// ignored.
    pub async fn load(path: PathBuf) -> Self {
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => parse_snapshot(&path, &contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "installation file not found, starting with empty store");
                let empty = BTreeMap::new();
                if let Err(e) = write_atomic(&path, &empty).await {
                    warn!(path = %path.display(), error = %e, "could not create empty installation file");
                }
                empty
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read installation file, starting with empty store");
                BTreeMap::new()
            }
        };

        Self {
            path,
            state: Mutex::new(state),
            persist_failures: AtomicU64::new(0),
        }
    }

    /// Get a clone of a tenant's installation.
    pub async fn get(&self, tenant_id: &str) -> Option<Installation> {
        let state = self.state.lock().await;
        state.get(tenant_id).cloned()
    }

    /// Insert or wholesale-replace a tenant's installation and persist.
    ///
    /// Only invariant violations are returned as errors. A failed snapshot
    /// write is logged and counted; the in-memory record is still updated.
    pub async fn put(&self, installation: Installation) -> Result<()> {
        installation.validate()?;
        let tenant_id = installation.tenant_id.clone();
        let mut state = self.state.lock().await;
        state.insert(tenant_id.clone(), installation);
        debug!(tenant_id = %tenant_id, "stored installation");
        self.persist(&state).await;
        Ok(())
    }

    /// Replace a tenant's installation only if it still holds `expected_refresh`.
    ///
    /// Used to land a refresh result: an admin delete or a re-install that
    /// happened while the provider call was in flight wins over the refresh.
    pub async fn compare_and_swap_refresh(
        &self,
        expected_refresh: &Secret<String>,
        next: Installation,
    ) -> Result<CompareAndSwapOutcome> {
        next.validate()?;
        let mut state = self.state.lock().await;
        match state.get(&next.tenant_id) {
            None => return Ok(CompareAndSwapOutcome::Missing),
            Some(current) if current.refresh_token != *expected_refresh => {
                return Ok(CompareAndSwapOutcome::Superseded(current.clone()));
            }
            Some(_) => {}
        }
        let tenant_id = next.tenant_id.clone();
        state.insert(tenant_id.clone(), next);
        debug!(tenant_id = %tenant_id, "rotated installation tokens");
        self.persist(&state).await;
        Ok(CompareAndSwapOutcome::Updated)
    }

    /// Remove a tenant's installation (explicit admin action) and persist.
    pub async fn remove(&self, tenant_id: &str) -> Option<Installation> {
        let mut state = self.state.lock().await;
        let removed = state.remove(tenant_id);
        if removed.is_some() {
            info!(tenant_id, "removed installation");
            self.persist(&state).await;
        }
        removed
    }

    /// Snapshot of every installation, ordered by tenant id.
    pub async fn list(&self) -> Vec<Installation> {
        let state = self.state.lock().await;
        state.values().cloned().collect()
    }

    /// Number of stored installations.
    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshot writes that have failed since startup.
    pub fn persist_failures(&self) -> u64 {
        self.persist_failures.load(Ordering::Relaxed)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, state: &BTreeMap<String, Installation>) {
        if let Err(e) = write_atomic(&self.path, state).await {
            let failures = self.persist_failures.fetch_add(1, Ordering::Relaxed) + 1;
            metrics::counter!("crm_auth_store_persist_errors_total").increment(1);
            warn!(
                path = %self.path.display(),
                error = %e,
                failures,
                "failed to persist installations, continuing with in-memory state"
            );
        }
    }
}

fn parse_snapshot(path: &Path, contents: &str) -> BTreeMap<String, Installation> {
    if contents.trim().is_empty() {
        return BTreeMap::new();
    }

    let raw: BTreeMap<String, serde_json::Value> = match serde_json::from_str(contents) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "installation file is corrupt, starting with empty store");
            return BTreeMap::new();
        }
    };

    let mut installations = BTreeMap::new();
    for (key, value) in raw {
        let installation = match serde_json::from_value::<Installation>(value) {
            Ok(i) => i,
            Err(e) => {
                warn!(tenant_id = %key, error = %e, "skipping unreadable installation record");
                continue;
            }
        };
        if let Err(e) = installation.validate() {
            warn!(tenant_id = %key, error = %e, "skipping invalid installation record");
            continue;
        }
        if installation.tenant_id != key {
            warn!(
                key = %key,
                tenant_id = %installation.tenant_id,
                "installation key does not match record, using record tenant id"
            );
        }
        installations.insert(installation.tenant_id.clone(), installation);
    }

    info!(path = %path.display(), installations = installations.len(), "loaded installations");
    installations
}

/// Write the snapshot atomically.
///
/// Writes a temp file next to the target, then renames it over the target.
/// The file holds OAuth tokens, so it is created 0600 on unix. The parent
/// directory is created if needed.
async fn write_atomic(path: &Path, data: &BTreeMap<String, Installation>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Persistence(format!("serializing installations: {e}")))?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| Error::Persistence(format!("creating installation directory: {e}")))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "installations.json".into());
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    if let Err(e) = replace_with_temp(&tmp_path, path, json.as_bytes()).await {
        match tokio::fs::remove_file(&tmp_path).await {
            Err(cleanup) if cleanup.kind() != std::io::ErrorKind::NotFound => {
                warn!(path = %tmp_path.display(), error = %cleanup, "could not remove temp installation file");
            }
            _ => {}
        }
        return Err(e);
    }

    debug!(path = %path.display(), "persisted installations");
    Ok(())
}

async fn replace_with_temp(tmp_path: &Path, path: &Path, contents: &[u8]) -> Result<()> {
    tokio::fs::write(tmp_path, contents)
        .await
        .map_err(|e| Error::Persistence(format!("writing temp installation file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(tmp_path, perms)
            .await
            .map_err(|e| Error::Persistence(format!("setting installation file permissions: {e}")))?;
    }

    tokio::fs::rename(tmp_path, path)
        .await
        .map_err(|e| Error::Persistence(format!("renaming temp installation file: {e}")))
}
