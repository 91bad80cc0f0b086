//! Credential record and display masking.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use aibox_types::CredentialType;

/// Metadata key under which revocable providers record their lease id.
pub const LEASE_ID_KEY: &str = "lease_id";

/// A secret minted for a sandbox session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub credential_type: CredentialType,
    pub value: String,
    /// Absent means non-expiring.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Name of the provider that last produced this credential.
    pub source: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Credential {
    pub fn new(
        credential_type: CredentialType,
        value: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            credential_type,
            value: value.into(),
            expires_at: None,
            source: source.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn with_lease_id(mut self, lease_id: impl Into<String>) -> Self {
        self.metadata.insert(LEASE_ID_KEY.to_string(), lease_id.into());
        self
    }

    pub fn lease_id(&self) -> Option<&str> {
        self.metadata.get(LEASE_ID_KEY).map(String::as_str)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Remaining lifetime at `now`; `None` for non-expiring credentials.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.expires_at.map(|at| at - now)
    }

    /// The value masked for diagnostics.
    pub fn masked_value(&self) -> String {
        mask_secret(&self.value)
    }
}

/// Mask a secret for safe display (first 4 and last 4 chars only).
pub fn mask_secret(secret: &str) -> String {
    if secret.len() <= 8 {
        return "*".repeat(secret.len());
    }
    format!("{}****{}", &secret[..4], &secret[secret.len() - 4..])
}
