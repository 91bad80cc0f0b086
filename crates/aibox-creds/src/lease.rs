//! Session-scoped lease lifecycle.
//!
//! The lease manager owns every credential minted for one
//! `(sandbox_id, user)` session: it assembles the environment injections
//! at start, re-fetches leases that are about to expire, and revokes
//! everything at stop under a bounded deadline. Missing or expired
//! credentials are warnings, never errors — a developer can start a
//! sandbox with partial secrets.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, mpsc};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use aibox_types::{CancelToken, CredentialType};

use crate::provider::Provider;
use crate::{CredError, Credential};

/// Upper bound on the whole revoke loop.
pub const REVOKE_DEADLINE: Duration = Duration::from_secs(5);

/// One minted credential's revocation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub credential_type: CredentialType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<String>,
    pub minted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// The `(sandbox_id, user)` pair a lease set belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub sandbox_id: String,
    pub user: String,
}

impl SessionContext {
    pub fn new(sandbox_id: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            user: user.into(),
        }
    }
}

/// What `mint_all` produced.
#[derive(Debug, Clone, Default)]
pub struct MintOutcome {
    /// `VAR=value` injections for the sandbox environment.
    pub env: BTreeMap<String, String>,
    pub leases: Vec<Lease>,
    /// Credential types skipped, with the reason (missing, expired,
    /// provider failure).
    pub skipped: Vec<(CredentialType, String)>,
}

/// What `revoke_all` managed before its deadline.
#[derive(Debug, Clone, Default)]
pub struct RevokeReport {
    pub revoked: usize,
    pub failed: Vec<(CredentialType, String)>,
    /// True when the deadline elapsed with leases still unrevoked; those
    /// expire via their own TTLs on the remote store.
    pub timed_out: bool,
}

/// Owns the minted leases of one sandbox session.
pub struct LeaseManager {
    provider: Arc<dyn Provider>,
    leases: Mutex<Vec<Lease>>,
    revoke_deadline: Duration,
}

impl LeaseManager {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            leases: Mutex::new(Vec::new()),
            revoke_deadline: REVOKE_DEADLINE,
        }
    }

    pub fn with_revoke_deadline(mut self, deadline: Duration) -> Self {
        self.revoke_deadline = deadline;
        self
    }

    pub fn held_leases(&self) -> Vec<Lease> {
        self.leases.lock().expect("lease mutex poisoned").clone()
    }

    /// Fetch every known credential type and assemble the environment
    /// injections. Missing and expired credentials are skipped with a
    /// warning.
    pub fn mint_all(&self, ctx: &SessionContext, cancel: &CancelToken) -> MintOutcome {
        let now = Utc::now();
        let mut outcome = MintOutcome::default();

        for credential_type in CredentialType::all() {
            if cancel.is_cancelled() {
                outcome
                    .skipped
                    .push((credential_type, "cancelled".to_string()));
                continue;
            }

            let credential = match self.provider.get(credential_type, cancel) {
                Ok(credential) => credential,
                Err(CredError::NotFound(_)) => {
                    warn!(
                        sandbox_id = %ctx.sandbox_id,
                        credential_type = %credential_type,
                        "credential missing, starting sandbox without it"
                    );
                    outcome.skipped.push((credential_type, "missing".to_string()));
                    continue;
                }
                Err(e) => {
                    warn!(
                        sandbox_id = %ctx.sandbox_id,
                        credential_type = %credential_type,
                        error = %e,
                        "credential fetch failed, starting sandbox without it"
                    );
                    outcome.skipped.push((credential_type, e.to_string()));
                    continue;
                }
            };

            if credential.is_expired(now) {
                warn!(
                    sandbox_id = %ctx.sandbox_id,
                    credential_type = %credential_type,
                    "credential already expired, skipping"
                );
                outcome.skipped.push((credential_type, "expired".to_string()));
                continue;
            }

            outcome
                .env
                .insert(credential_type.env_var().to_string(), credential.value.clone());
            outcome.leases.push(Lease {
                credential_type,
                lease_id: credential.lease_id().map(str::to_string),
                minted_at: now,
                expires_at: credential.expires_at,
            });
        }

        let mut held = self.leases.lock().expect("lease mutex poisoned");
        held.clone_from(&outcome.leases);
        outcome
    }

    /// Revoke every held lease, bounded by the revoke deadline. Each
    /// delete runs on a worker thread so a hanging provider cannot pin
    /// the loop past the deadline; the worker observes the cancel token.
    pub fn revoke_all(&self, ctx: &SessionContext, cancel: &CancelToken) -> RevokeReport {
        let deadline = Instant::now() + self.revoke_deadline;
        let leases: Vec<Lease> = self
            .leases
            .lock()
            .expect("lease mutex poisoned")
            .drain(..)
            .collect();

        let mut report = RevokeReport::default();

        for lease in leases {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if cancel.is_cancelled() || remaining.is_zero() {
                report.timed_out = true;
                warn!(
                    sandbox_id = %ctx.sandbox_id,
                    credential_type = %lease.credential_type,
                    "revoke deadline elapsed, lease left to expire via TTL"
                );
                continue;
            }

            match self.delete_bounded(lease.credential_type, remaining, cancel) {
                Ok(()) | Err(CredError::NotFound(_)) => report.revoked += 1,
                Err(CredError::Cancelled) => {
                    report.timed_out = true;
                    warn!(
                        sandbox_id = %ctx.sandbox_id,
                        credential_type = %lease.credential_type,
                        "revocation cancelled, lease left to expire via TTL"
                    );
                }
                Err(e) => {
                    warn!(
                        sandbox_id = %ctx.sandbox_id,
                        credential_type = %lease.credential_type,
                        error = %e,
                        "lease revocation failed"
                    );
                    report.failed.push((lease.credential_type, e.to_string()));
                }
            }
        }

        report
    }

    /// Re-fetch any held lease whose remaining TTL is below `threshold`.
    /// Returns the refreshed credentials so the caller can re-inject
    /// them.
    pub fn refresh_expiring(
        &self,
        threshold: Duration,
        cancel: &CancelToken,
    ) -> Vec<Credential> {
        let now = Utc::now();
        let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);

        let expiring: Vec<CredentialType> = self
            .leases
            .lock()
            .expect("lease mutex poisoned")
            .iter()
            .filter(|lease| {
                lease
                    .expires_at
                    .is_some_and(|at| at - now < threshold)
            })
            .map(|lease| lease.credential_type)
            .collect();

        let mut refreshed = Vec::new();
        for credential_type in expiring {
            if cancel.is_cancelled() {
                break;
            }
            match self.provider.get(credential_type, cancel) {
                Ok(credential) => {
                    let mut held = self.leases.lock().expect("lease mutex poisoned");
                    if let Some(lease) = held
                        .iter_mut()
                        .find(|l| l.credential_type == credential_type)
                    {
                        lease.lease_id = credential.lease_id().map(str::to_string);
                        lease.minted_at = now;
                        lease.expires_at = credential.expires_at;
                    }
                    refreshed.push(credential);
                }
                Err(e) => {
                    warn!(
                        credential_type = %credential_type,
                        error = %e,
                        "lease refresh failed, keeping existing credential"
                    );
                }
            }
        }
        refreshed
    }

    /// Run one provider delete on a worker thread, waiting at most
    /// `budget`. On timeout the shared cancel token is tripped so the
    /// worker can unwind; the lease counts as unrevoked.
    fn delete_bounded(
        &self,
        credential_type: CredentialType,
        budget: Duration,
        cancel: &CancelToken,
    ) -> Result<(), CredError> {
        let provider = Arc::clone(&self.provider);
        let worker_cancel = cancel.clone();
        let (tx, rx) = mpsc::channel();

        std::thread::spawn(move || {
            let _ = tx.send(provider.delete(credential_type, &worker_cancel));
        });

        match rx.recv_timeout(budget) {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                Err(CredError::Cancelled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use crate::provider::MemoryProvider;

    use super::*;

    fn ctx() -> SessionContext {
        SessionContext::new("aibox-alice-0011223344aa", "alice")
    }

    #[test]
    fn mint_all_injects_present_skips_missing() {
        let provider = Arc::new(MemoryProvider::with_credentials([
            Credential::new(CredentialType::GitToken, "ghp_tok", "x"),
            Credential::new(CredentialType::LlmApiKey, "sk-key", "x"),
        ]));
        let manager = LeaseManager::new(provider);

        let outcome = manager.mint_all(&ctx(), &CancelToken::new());

        assert_eq!(outcome.env.get("AIBOX_GIT_TOKEN").unwrap(), "ghp_tok");
        assert_eq!(outcome.env.get("AIBOX_LLM_API_KEY").unwrap(), "sk-key");
        assert!(!outcome.env.contains_key("AIBOX_MIRROR_TOKEN"));
        assert_eq!(outcome.leases.len(), 2);
        assert_eq!(
            outcome.skipped,
            vec![(CredentialType::MirrorToken, "missing".to_string())]
        );
        assert_eq!(manager.held_leases().len(), 2);
    }

    #[test]
    fn mint_all_skips_expired() {
        let expired = Credential::new(CredentialType::GitToken, "old", "x")
            .expires_at(Utc::now() - ChronoDuration::minutes(1));
        let provider = Arc::new(MemoryProvider::with_credentials([expired]));
        let manager = LeaseManager::new(provider);

        let outcome = manager.mint_all(&ctx(), &CancelToken::new());
        assert!(outcome.env.is_empty());
        assert!(
            outcome
                .skipped
                .contains(&(CredentialType::GitToken, "expired".to_string()))
        );
    }

    #[test]
    fn revoke_all_deletes_held_leases() {
        let provider = Arc::new(MemoryProvider::with_credentials([
            Credential::new(CredentialType::GitToken, "a", "x"),
            Credential::new(CredentialType::MirrorToken, "b", "x"),
        ]));
        let manager = LeaseManager::new(provider.clone());
        manager.mint_all(&ctx(), &CancelToken::new());

        let report = manager.revoke_all(&ctx(), &CancelToken::new());
        assert_eq!(report.revoked, 2);
        assert!(report.failed.is_empty());
        assert!(!report.timed_out);
        assert!(manager.held_leases().is_empty());
        assert!(provider.list(&CancelToken::new()).unwrap().is_empty());
    }

    #[test]
    fn revoke_all_survives_individual_failures() {
        struct FailingDelete;
        impl Provider for FailingDelete {
            fn name(&self) -> &str {
                "failing"
            }
            fn get(
                &self,
                t: CredentialType,
                _c: &CancelToken,
            ) -> Result<Credential, CredError> {
                Ok(Credential::new(t, "v", "failing"))
            }
            fn store(&self, _c: Credential, _t: &CancelToken) -> Result<(), CredError> {
                Ok(())
            }
            fn delete(&self, _t: CredentialType, _c: &CancelToken) -> Result<(), CredError> {
                Err(CredError::Unavailable {
                    provider: "failing".to_string(),
                    reason: "remote store down".to_string(),
                })
            }
            fn list(&self, _c: &CancelToken) -> Result<Vec<CredentialType>, CredError> {
                Ok(vec![])
            }
        }

        let manager = LeaseManager::new(Arc::new(FailingDelete));
        manager.mint_all(&ctx(), &CancelToken::new());

        let report = manager.revoke_all(&ctx(), &CancelToken::new());
        assert_eq!(report.revoked, 0);
        assert_eq!(report.failed.len(), 3);
        assert!(!report.timed_out);
    }

    #[test]
    fn revoke_all_honors_deadline_with_hanging_provider() {
        /// Hangs in delete until its cancel token trips.
        struct HangingDelete;
        impl Provider for HangingDelete {
            fn name(&self) -> &str {
                "hanging"
            }
            fn get(
                &self,
                t: CredentialType,
                _c: &CancelToken,
            ) -> Result<Credential, CredError> {
                Ok(Credential::new(t, "v", "hanging"))
            }
            fn store(&self, _c: Credential, _t: &CancelToken) -> Result<(), CredError> {
                Ok(())
            }
            fn delete(&self, _t: CredentialType, cancel: &CancelToken) -> Result<(), CredError> {
                while !cancel.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(CredError::Cancelled)
            }
            fn list(&self, _c: &CancelToken) -> Result<Vec<CredentialType>, CredError> {
                Ok(vec![])
            }
        }

        let manager =
            LeaseManager::new(Arc::new(HangingDelete)).with_revoke_deadline(Duration::from_millis(200));
        manager.mint_all(&ctx(), &CancelToken::new());

        let started = Instant::now();
        let report = manager.revoke_all(&ctx(), &CancelToken::new());
        let elapsed = started.elapsed();

        assert!(report.timed_out);
        assert_eq!(report.revoked, 0);
        // Bounded: well under one hang per lease.
        assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
    }

    #[test]
    fn refresh_expiring_refetches_only_near_expiry() {
        let near = Credential::new(CredentialType::GitToken, "near", "x")
            .expires_at(Utc::now() + ChronoDuration::seconds(30));
        let far = Credential::new(CredentialType::LlmApiKey, "far", "x")
            .expires_at(Utc::now() + ChronoDuration::hours(6));
        let provider = Arc::new(MemoryProvider::with_credentials([near, far]));
        let manager = LeaseManager::new(provider);
        manager.mint_all(&ctx(), &CancelToken::new());

        let refreshed = manager.refresh_expiring(Duration::from_secs(300), &CancelToken::new());
        assert_eq!(refreshed.len(), 1);
        assert_eq!(refreshed[0].credential_type, CredentialType::GitToken);
    }
}
