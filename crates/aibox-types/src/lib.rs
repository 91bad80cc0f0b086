//! Shared domain types for aibox.
//!
//! This crate holds the vocabulary every other aibox crate speaks:
//! severities, risk classes, action kinds, credential types, the bounded
//! scalar values allowed in audit detail maps, short content digests, and
//! the cancellation token threaded through long-running provider calls.
//!
//! # Example
//!
//! ```
//! use aibox_types::{RiskClass, Severity};
//!
//! // Risk classes are ordered least- to most-restrictive.
//! assert!(RiskClass::Safe < RiskClass::ReviewRequired);
//! assert!(RiskClass::ReviewRequired < RiskClass::BlockedByDefault);
//!
//! assert_eq!(Severity::High.to_string(), "high");
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Errors from parsing the string forms of the shared enums.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("unknown severity: {0}")]
    Severity(String),
    #[error("unknown risk class: {0}")]
    RiskClass(String),
    #[error("unknown action kind: {0}")]
    ActionKind(String),
    #[error("unknown credential type: {0}")]
    CredentialType(String),
}

/// Severity attached to audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" | "warn" => Ok(Severity::Warning),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            _ => Err(ParseError::Severity(s.to_string())),
        }
    }
}

/// Risk class of a tool rule or a decision.
///
/// The derived ordering is the tighten-only merge order: an overriding
/// child rule must compare `>=` its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RiskClass {
    #[default]
    Safe,
    ReviewRequired,
    BlockedByDefault,
}

impl std::fmt::Display for RiskClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskClass::Safe => write!(f, "safe"),
            RiskClass::ReviewRequired => write!(f, "review-required"),
            RiskClass::BlockedByDefault => write!(f, "blocked-by-default"),
        }
    }
}

impl std::str::FromStr for RiskClass {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "safe" => Ok(RiskClass::Safe),
            "review-required" => Ok(RiskClass::ReviewRequired),
            "blocked-by-default" => Ok(RiskClass::BlockedByDefault),
            _ => Err(ParseError::RiskClass(s.to_string())),
        }
    }
}

/// The three action kinds the policy evaluator understands.
///
/// This is a closed enum on purpose: there is no fallback evaluation path
/// for unknown actions, so none can be constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Command,
    Network,
    Filesystem,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionKind::Command => write!(f, "command"),
            ActionKind::Network => write!(f, "network"),
            ActionKind::Filesystem => write!(f, "filesystem"),
        }
    }
}

impl std::str::FromStr for ActionKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "command" => Ok(ActionKind::Command),
            "network" => Ok(ActionKind::Network),
            "filesystem" => Ok(ActionKind::Filesystem),
            _ => Err(ParseError::ActionKind(s.to_string())),
        }
    }
}

/// The credential kinds the broker mints for a sandbox session.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialType {
    GitToken,
    LlmApiKey,
    MirrorToken,
}

impl CredentialType {
    /// All known credential types, in mint order.
    pub fn all() -> [CredentialType; 3] {
        [
            CredentialType::GitToken,
            CredentialType::LlmApiKey,
            CredentialType::MirrorToken,
        ]
    }

    /// Environment variable the credential is injected under inside the
    /// sandbox.
    pub fn env_var(&self) -> &'static str {
        match self {
            CredentialType::GitToken => "AIBOX_GIT_TOKEN",
            CredentialType::LlmApiKey => "AIBOX_LLM_API_KEY",
            CredentialType::MirrorToken => "AIBOX_MIRROR_TOKEN",
        }
    }
}

impl std::fmt::Display for CredentialType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialType::GitToken => write!(f, "git-token"),
            CredentialType::LlmApiKey => write!(f, "llm-api-key"),
            CredentialType::MirrorToken => write!(f, "mirror-token"),
        }
    }
}

impl std::str::FromStr for CredentialType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "git-token" => Ok(CredentialType::GitToken),
            "llm-api-key" => Ok(CredentialType::LlmApiKey),
            "mirror-token" => Ok(CredentialType::MirrorToken),
            _ => Err(ParseError::CredentialType(s.to_string())),
        }
    }
}

/// A scalar value allowed in the sparse `details` map of audit events and
/// decision records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DetailValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<&str> for DetailValue {
    fn from(v: &str) -> Self {
        DetailValue::Str(v.to_string())
    }
}

impl From<String> for DetailValue {
    fn from(v: String) -> Self {
        DetailValue::Str(v)
    }
}

impl From<i64> for DetailValue {
    fn from(v: i64) -> Self {
        DetailValue::Int(v)
    }
}

impl From<u64> for DetailValue {
    fn from(v: u64) -> Self {
        DetailValue::Int(v as i64)
    }
}

impl From<bool> for DetailValue {
    fn from(v: bool) -> Self {
        DetailValue::Bool(v)
    }
}

impl From<f64> for DetailValue {
    fn from(v: f64) -> Self {
        DetailValue::Float(v)
    }
}

/// Sparse free-form detail map. `BTreeMap` keeps serialization order
/// deterministic, which the audit hash chain depends on.
pub type Details = BTreeMap<String, DetailValue>;

/// Full lowercase-hex SHA-256 of `bytes` (64 chars).
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Short content digest: lowercase hex of the first 8 bytes of the
/// SHA-256 of `bytes` (16 chars). Used for policy versions and decision
/// input hashes.
pub fn short_digest(bytes: &[u8]) -> String {
    hex::encode(&Sha256::digest(bytes)[..8])
}

/// Cooperative cancellation flag shared between a caller and long-running
/// provider or revoke loops.
///
/// Cloning shares the flag. Cancellation is one-way and sticky.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. All clones observe it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn severity_roundtrip() {
        for s in [
            Severity::Info,
            Severity::Warning,
            Severity::High,
            Severity::Critical,
        ] {
            let parsed = Severity::from_str(&s.to_string()).expect("parse");
            assert_eq!(parsed, s);
        }
    }

    #[test]
    fn severity_rejects_unknown() {
        assert!(Severity::from_str("fatal").is_err());
    }

    #[test]
    fn risk_class_ordering_is_tighten_order() {
        assert!(RiskClass::Safe < RiskClass::ReviewRequired);
        assert!(RiskClass::ReviewRequired < RiskClass::BlockedByDefault);
    }

    #[test]
    fn risk_class_serializes_kebab_case() {
        let json = serde_json::to_string(&RiskClass::ReviewRequired).expect("serialize");
        assert_eq!(json, "\"review-required\"");

        let parsed: RiskClass = serde_json::from_str("\"blocked-by-default\"").expect("parse");
        assert_eq!(parsed, RiskClass::BlockedByDefault);
    }

    #[test]
    fn action_kind_roundtrip() {
        for a in [ActionKind::Command, ActionKind::Network, ActionKind::Filesystem] {
            assert_eq!(ActionKind::from_str(&a.to_string()).expect("parse"), a);
        }
        assert!(ActionKind::from_str("syscall").is_err());
    }

    #[test]
    fn credential_type_env_vars_are_distinct() {
        let vars: Vec<&str> = CredentialType::all().iter().map(|c| c.env_var()).collect();
        assert_eq!(vars.len(), 3);
        assert!(vars.iter().all(|v| v.starts_with("AIBOX_")));
        let mut dedup = vars.clone();
        dedup.dedup();
        assert_eq!(vars, dedup);
    }

    #[test]
    fn credential_type_display_matches_serde() {
        let json = serde_json::to_string(&CredentialType::LlmApiKey).expect("serialize");
        assert_eq!(json, format!("\"{}\"", CredentialType::LlmApiKey));
    }

    #[test]
    fn detail_value_untagged_serialization() {
        let mut details = Details::new();
        details.insert("count".to_string(), 3i64.into());
        details.insert("host".to_string(), "github.com".into());
        details.insert("allowed".to_string(), true.into());

        let json = serde_json::to_string(&details).expect("serialize");
        assert_eq!(
            json,
            r#"{"allowed":true,"count":3,"host":"github.com"}"#
        );

        let back: Details = serde_json::from_str(&json).expect("parse");
        assert_eq!(back, details);
    }

    #[test]
    fn short_digest_is_16_hex_chars() {
        let d = short_digest(b"aibox");
        assert_eq!(d.len(), 16);
        assert!(d.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(d, sha256_hex(b"aibox")[..16]);
    }

    #[test]
    fn sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn cancel_token_is_shared_and_sticky() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());

        token.cancel();
        assert!(clone.is_cancelled());
        assert!(token.is_cancelled());
    }
}
