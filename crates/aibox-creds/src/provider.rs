//! The provider contract and the in-memory implementation.

use std::collections::BTreeMap;
use std::sync::Mutex;

use aibox_types::{CancelToken, CredentialType};

use crate::{CredError, Credential};

/// Uniform contract over heterogeneous secret storage.
///
/// Implementations return [`CredError::NotFound`] uniformly when a
/// credential is absent; intrinsically read-only stores return
/// [`CredError::ReadOnly`] from `store`. Long-running operations honor
/// the cancellation token.
pub trait Provider: Send + Sync {
    /// Stable provider name, recorded as credential provenance.
    fn name(&self) -> &str;

    fn get(&self, credential_type: CredentialType, cancel: &CancelToken)
    -> Result<Credential, CredError>;

    fn store(&self, credential: Credential, cancel: &CancelToken) -> Result<(), CredError>;

    fn delete(&self, credential_type: CredentialType, cancel: &CancelToken)
    -> Result<(), CredError>;

    fn list(&self, cancel: &CancelToken) -> Result<Vec<CredentialType>, CredError>;
}

/// Plain in-memory provider: the test substrate and the backing store of
/// the cache layer.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    entries: Mutex<BTreeMap<CredentialType, Credential>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(credentials: impl IntoIterator<Item = Credential>) -> Self {
        let provider = Self::new();
        {
            let mut entries = provider.entries.lock().expect("memory provider poisoned");
            for mut cred in credentials {
                cred.source = "memory".to_string();
                entries.insert(cred.credential_type, cred);
            }
        }
        provider
    }
}

impl Provider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    fn get(
        &self,
        credential_type: CredentialType,
        cancel: &CancelToken,
    ) -> Result<Credential, CredError> {
        if cancel.is_cancelled() {
            return Err(CredError::Cancelled);
        }
        self.entries
            .lock()
            .expect("memory provider poisoned")
            .get(&credential_type)
            .cloned()
            .ok_or(CredError::NotFound(credential_type))
    }

    fn store(&self, mut credential: Credential, cancel: &CancelToken) -> Result<(), CredError> {
        if cancel.is_cancelled() {
            return Err(CredError::Cancelled);
        }
        credential.source = self.name().to_string();
        self.entries
            .lock()
            .expect("memory provider poisoned")
            .insert(credential.credential_type, credential);
        Ok(())
    }

    fn delete(
        &self,
        credential_type: CredentialType,
        cancel: &CancelToken,
    ) -> Result<(), CredError> {
        if cancel.is_cancelled() {
            return Err(CredError::Cancelled);
        }
        self.entries
            .lock()
            .expect("memory provider poisoned")
            .remove(&credential_type)
            .map(|_| ())
            .ok_or(CredError::NotFound(credential_type))
    }

    fn list(&self, cancel: &CancelToken) -> Result<Vec<CredentialType>, CredError> {
        if cancel.is_cancelled() {
            return Err(CredError::Cancelled);
        }
        Ok(self
            .entries
            .lock()
            .expect("memory provider poisoned")
            .keys()
            .copied()
            .collect())
    }
}
