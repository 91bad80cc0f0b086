//! Decision input and result records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use aibox_types::{ActionKind, Details, short_digest};

/// One authorization question: a command, a network target, or a
/// filesystem path, in the context of a user and workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionInput {
    pub action: ActionKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target: String,
    pub user: String,
    pub workspace: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Details::is_empty")]
    pub metadata: Details,
}

impl DecisionInput {
    pub fn command(
        command: impl IntoIterator<Item = impl Into<String>>,
        user: impl Into<String>,
        workspace: impl Into<String>,
    ) -> Self {
        Self {
            action: ActionKind::Command,
            command: command.into_iter().map(Into::into).collect(),
            target: String::new(),
            user: user.into(),
            workspace: workspace.into(),
            timestamp: Utc::now(),
            metadata: Details::new(),
        }
    }

    pub fn network(
        host: impl Into<String>,
        user: impl Into<String>,
        workspace: impl Into<String>,
    ) -> Self {
        Self {
            action: ActionKind::Network,
            command: Vec::new(),
            target: host.into(),
            user: user.into(),
            workspace: workspace.into(),
            timestamp: Utc::now(),
            metadata: Details::new(),
        }
    }

    pub fn filesystem(
        path: impl Into<String>,
        user: impl Into<String>,
        workspace: impl Into<String>,
    ) -> Self {
        Self {
            action: ActionKind::Filesystem,
            command: Vec::new(),
            target: path.into(),
            user: user.into(),
            workspace: workspace.into(),
            timestamp: Utc::now(),
            metadata: Details::new(),
        }
    }

    /// Short digest of the canonical serialization; stamped on the
    /// resulting decision.
    pub fn input_hash(&self) -> String {
        short_digest(&serde_json::to_vec(self).unwrap_or_default())
    }
}

/// The evaluator's answer, written verbatim to the decision log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionResult {
    pub allowed: bool,
    pub risk_class: aibox_types::RiskClass,
    /// Id of the rule that decided, or one of the built-in defaults
    /// (`default-safe`, `default-deny`, `deny-by-default`,
    /// `default-allow`).
    pub rule: String,
    pub reason: String,
    /// Digest of the effective policy the decision was made under.
    pub policy_version: String,
    pub input_hash: String,
    pub timestamp: DateTime<Utc>,
    /// Evaluation wall time.
    #[serde(with = "humantime_serde")]
    pub duration: std::time::Duration,
}
