//! TTL cache wrapped around any inner provider.
//!
//! A live sandbox must keep working across transient Vault outages, so a
//! refresh failure after the TTL elapses returns the last cached value
//! with a warning instead of failing the caller. Stale values are tagged
//! `source: "cached:<inner>"` so the audit record reflects degraded
//! freshness.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::warn;

use aibox_types::{CancelToken, CredentialType};

use crate::provider::Provider;
use crate::{CredError, Credential};

struct CacheEntry {
    credential: Credential,
    fetched_at: Instant,
}

/// TTL cache layer. Read paths take the read lock; refresh, store, and
/// delete take the write lock.
pub struct CachedProvider {
    inner: Arc<dyn Provider>,
    ttl: Duration,
    name: String,
    entries: RwLock<BTreeMap<CredentialType, CacheEntry>>,
}

impl CachedProvider {
    pub fn new(inner: Arc<dyn Provider>, ttl: Duration) -> Self {
        let name = format!("cache({})", inner.name());
        Self {
            inner,
            ttl,
            name,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    fn fresh_hit(&self, credential_type: CredentialType) -> Option<Credential> {
        let entries = self.entries.read().expect("credential cache poisoned");
        let entry = entries.get(&credential_type)?;
        (entry.fetched_at.elapsed() < self.ttl).then(|| entry.credential.clone())
    }

    /// The stale-on-error path: a previously cached snapshot, tagged as
    /// degraded. Read under the read lock.
    fn stale_hit(&self, credential_type: CredentialType) -> Option<Credential> {
        let entries = self.entries.read().expect("credential cache poisoned");
        let entry = entries.get(&credential_type)?;
        let mut credential = entry.credential.clone();
        credential.source = format!("cached:{}", entry.credential.source);
        Some(credential)
    }

    fn insert(&self, credential: Credential) {
        self.entries
            .write()
            .expect("credential cache poisoned")
            .insert(
                credential.credential_type,
                CacheEntry {
                    credential,
                    fetched_at: Instant::now(),
                },
            );
    }
}

impl Provider for CachedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(
        &self,
        credential_type: CredentialType,
        cancel: &CancelToken,
    ) -> Result<Credential, CredError> {
        if let Some(credential) = self.fresh_hit(credential_type) {
            return Ok(credential);
        }

        match self.inner.get(credential_type, cancel) {
            Ok(credential) => {
                self.insert(credential.clone());
                Ok(credential)
            }
            Err(CredError::NotFound(_)) => {
                // Absence is authoritative; drop any cached copy.
                self.entries
                    .write()
                    .expect("credential cache poisoned")
                    .remove(&credential_type);
                Err(CredError::NotFound(credential_type))
            }
            Err(e) => {
                if let Some(stale) = self.stale_hit(credential_type) {
                    warn!(
                        credential_type = %credential_type,
                        provider = self.inner.name(),
                        error = %e,
                        "provider refresh failed, serving stale cached credential"
                    );
                    return Ok(stale);
                }
                Err(e)
            }
        }
    }

    fn store(&self, credential: Credential, cancel: &CancelToken) -> Result<(), CredError> {
        self.inner.store(credential.clone(), cancel)?;
        let mut stored = credential;
        stored.source = self.inner.name().to_string();
        self.insert(stored);
        Ok(())
    }

    fn delete(
        &self,
        credential_type: CredentialType,
        cancel: &CancelToken,
    ) -> Result<(), CredError> {
        self.entries
            .write()
            .expect("credential cache poisoned")
            .remove(&credential_type);
        self.inner.delete(credential_type, cancel)
    }

    fn list(&self, cancel: &CancelToken) -> Result<Vec<CredentialType>, CredError> {
        self.inner.list(cancel)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Succeeds the first `successes` calls, then fails with
    /// `Unavailable`.
    struct FlakyProvider {
        successes: Mutex<u32>,
        calls: Mutex<u32>,
    }

    impl FlakyProvider {
        fn new(successes: u32) -> Self {
            Self {
                successes: Mutex::new(successes),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    impl Provider for FlakyProvider {
        fn name(&self) -> &str {
            "flaky"
        }

        fn get(
            &self,
            credential_type: CredentialType,
            _cancel: &CancelToken,
        ) -> Result<Credential, CredError> {
            *self.calls.lock().unwrap() += 1;
            let mut left = self.successes.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                Ok(Credential::new(credential_type, "fresh-value", "flaky"))
            } else {
                Err(CredError::Unavailable {
                    provider: "flaky".to_string(),
                    reason: "simulated outage".to_string(),
                })
            }
        }

        fn store(&self, _c: Credential, _cancel: &CancelToken) -> Result<(), CredError> {
            Ok(())
        }

        fn delete(&self, _t: CredentialType, _cancel: &CancelToken) -> Result<(), CredError> {
            Ok(())
        }

        fn list(&self, _cancel: &CancelToken) -> Result<Vec<CredentialType>, CredError> {
            Ok(vec![])
        }
    }

    fn cancel() -> CancelToken {
        CancelToken::new()
    }

    #[test]
    fn fresh_hits_do_not_touch_the_inner_provider() {
        let inner = Arc::new(FlakyProvider::new(1));
        let cache = CachedProvider::new(inner.clone(), Duration::from_secs(60));

        let first = cache.get(CredentialType::GitToken, &cancel()).expect("get");
        assert_eq!(first.source, "flaky");
        let second = cache.get(CredentialType::GitToken, &cancel()).expect("get");
        assert_eq!(second.value, "fresh-value");
        assert_eq!(inner.calls(), 1);
    }

    #[test]
    fn stale_value_served_on_refresh_failure() {
        let inner = Arc::new(FlakyProvider::new(1));
        // Zero TTL: every get is a refresh attempt.
        let cache = CachedProvider::new(inner.clone(), Duration::ZERO);

        let first = cache.get(CredentialType::GitToken, &cancel()).expect("get");
        assert_eq!(first.source, "flaky");

        let stale = cache.get(CredentialType::GitToken, &cancel()).expect("stale get");
        assert_eq!(stale.value, "fresh-value");
        assert_eq!(stale.source, "cached:flaky");
        assert_eq!(inner.calls(), 2);
    }

    #[test]
    fn error_with_no_cached_snapshot_propagates() {
        let inner = Arc::new(FlakyProvider::new(0));
        let cache = CachedProvider::new(inner, Duration::from_secs(60));
        assert!(matches!(
            cache.get(CredentialType::GitToken, &cancel()),
            Err(CredError::Unavailable { .. })
        ));
    }

    #[test]
    fn not_found_evicts_and_propagates() {
        struct GoneProvider;
        impl Provider for GoneProvider {
            fn name(&self) -> &str {
                "gone"
            }
            fn get(
                &self,
                t: CredentialType,
                _c: &CancelToken,
            ) -> Result<Credential, CredError> {
                Err(CredError::NotFound(t))
            }
            fn store(&self, _c: Credential, _t: &CancelToken) -> Result<(), CredError> {
                Ok(())
            }
            fn delete(&self, _t: CredentialType, _c: &CancelToken) -> Result<(), CredError> {
                Ok(())
            }
            fn list(&self, _c: &CancelToken) -> Result<Vec<CredentialType>, CredError> {
                Ok(vec![])
            }
        }

        let cache = CachedProvider::new(Arc::new(GoneProvider), Duration::ZERO);
        assert!(matches!(
            cache.get(CredentialType::MirrorToken, &cancel()),
            Err(CredError::NotFound(CredentialType::MirrorToken))
        ));
    }

    #[test]
    fn delete_evicts_cache_entry() {
        let inner = Arc::new(FlakyProvider::new(2));
        let cache = CachedProvider::new(inner.clone(), Duration::from_secs(60));

        cache.get(CredentialType::GitToken, &cancel()).expect("get");
        cache.delete(CredentialType::GitToken, &cancel()).expect("delete");

        // Next get must hit the inner provider again.
        cache.get(CredentialType::GitToken, &cancel()).expect("get");
        assert_eq!(inner.calls(), 2);
    }

    #[test]
    fn cache_name_reflects_inner() {
        let cache = CachedProvider::new(Arc::new(FlakyProvider::new(0)), Duration::ZERO);
        assert_eq!(cache.name(), "cache(flaky)");
    }
}
