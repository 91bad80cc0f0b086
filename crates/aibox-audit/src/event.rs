//! Audit event model and canonical serialization.
//!
//! The chain hash of an event is computed over the exact bytes written to
//! disk, so the serialized form is canonical: fields in declaration order,
//! timestamps as RFC3339 with nanosecond precision and a trailing `Z`, and
//! `details` omitted entirely when empty. Serialize once, hash that byte
//! slice, write the same bytes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use aibox_types::{Details, Severity};

use crate::AuditError;

/// Event kinds, grouped by category. Closed enumeration: unknown kinds are
/// deserialization errors, not a catch-all variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    // Lifecycle
    SandboxStart,
    SandboxStop,
    ShellStart,
    ShellEnd,
    // Network
    NetworkAllowed,
    NetworkBlocked,
    NetworkRateLimited,
    // DNS
    DnsQuery,
    DnsBlocked,
    // Tool
    ToolRequested,
    ToolAllowed,
    ToolBlocked,
    ToolReviewRequired,
    // Credential
    CredentialMinted,
    CredentialRevoked,
    CredentialExpired,
    CredentialRefreshed,
    // Policy
    PolicyLoaded,
    PolicyReloaded,
    PolicyViolation,
    // LLM
    LlmRequest,
    LlmResponse,
    // File
    FileAccessBlocked,
    // Runtime alert
    RuntimeAlert,
    // Recording
    SessionRecorded,
}

/// Category an event kind belongs to. Retention is derived from this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    Lifecycle,
    Network,
    Dns,
    Tool,
    Credential,
    Policy,
    Llm,
    File,
    RuntimeAlert,
    Recording,
}

/// Minimum retention period for an event, derived from its category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionClass {
    /// Lifecycle, tool, credential, and policy events: kept at least two
    /// years.
    TwoYears,
    /// Everything else: kept at least one year.
    OneYear,
}

impl RetentionClass {
    pub fn min_days(&self) -> u32 {
        match self {
            RetentionClass::TwoYears => 730,
            RetentionClass::OneYear => 365,
        }
    }
}

impl EventKind {
    pub fn category(&self) -> EventCategory {
        use EventKind::*;
        match self {
            SandboxStart | SandboxStop | ShellStart | ShellEnd => EventCategory::Lifecycle,
            NetworkAllowed | NetworkBlocked | NetworkRateLimited => EventCategory::Network,
            DnsQuery | DnsBlocked => EventCategory::Dns,
            ToolRequested | ToolAllowed | ToolBlocked | ToolReviewRequired => EventCategory::Tool,
            CredentialMinted | CredentialRevoked | CredentialExpired | CredentialRefreshed => {
                EventCategory::Credential
            }
            PolicyLoaded | PolicyReloaded | PolicyViolation => EventCategory::Policy,
            LlmRequest | LlmResponse => EventCategory::Llm,
            FileAccessBlocked => EventCategory::File,
            RuntimeAlert => EventCategory::RuntimeAlert,
            SessionRecorded => EventCategory::Recording,
        }
    }

    pub fn retention(&self) -> RetentionClass {
        match self.category() {
            EventCategory::Lifecycle
            | EventCategory::Tool
            | EventCategory::Credential
            | EventCategory::Policy => RetentionClass::TwoYears,
            _ => RetentionClass::OneYear,
        }
    }
}

/// One audit event. Immutable once logged; `hash_prev` is filled by the
/// logger at append time.
///
/// Field declaration order is the canonical JSON field order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    #[serde(with = "ts_nano")]
    pub timestamp: DateTime<Utc>,
    pub event_type: EventKind,
    pub sandbox_id: String,
    pub user_id: String,
    pub source: String,
    pub severity: Severity,
    pub hash_prev: String,
    #[serde(default, skip_serializing_if = "Details::is_empty")]
    pub details: Details,
}

impl AuditEvent {
    /// Build an event stamped now. `hash_prev` is left empty for the
    /// logger to fill.
    pub fn new(
        event_type: EventKind,
        sandbox_id: impl Into<String>,
        user_id: impl Into<String>,
        source: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            sandbox_id: sandbox_id.into(),
            user_id: user_id.into(),
            source: source.into(),
            severity,
            hash_prev: String::new(),
            details: Details::new(),
        }
    }

    /// Attach a detail entry.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<aibox_types::DetailValue>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Check the required-field invariants. `details` is the only optional
    /// field; everything else must be populated and the timestamp must not
    /// be the zero instant.
    pub fn validate(&self) -> Result<(), AuditError> {
        if self.timestamp.timestamp_nanos_opt().unwrap_or(0) == 0 {
            return Err(AuditError::MissingField("timestamp"));
        }
        if self.sandbox_id.is_empty() {
            return Err(AuditError::MissingField("sandbox_id"));
        }
        if self.user_id.is_empty() {
            return Err(AuditError::MissingField("user_id"));
        }
        if self.source.is_empty() {
            return Err(AuditError::MissingField("source"));
        }
        Ok(())
    }

    /// The canonical single-line JSON form, the same bytes the logger
    /// writes and the chain hashes.
    pub fn canonical_json(&self) -> Result<String, AuditError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// RFC3339 timestamps with fixed nanosecond precision and a trailing `Z`.
mod ts_nano {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Nanos, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(de)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(D::Error::custom)
    }
}
