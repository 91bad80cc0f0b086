//! Policy engine for aibox.
//!
//! Three YAML tiers (org, team, project) merge under a strictly
//! tighten-only discipline into one effective [`Policy`], addressable by
//! a short digest. The [`PolicyEngine`] evaluates command, network, and
//! filesystem actions with deterministic, ordered semantics and records
//! every decision to a sampled JSONL log.
//!
//! # Example
//!
//! ```
//! use aibox_policy::{
//!     DecisionInput, EnforcementMode, Policy, PolicyDoc, PolicyEngine, merge,
//! };
//!
//! let org = PolicyDoc::parse(r#"
//! version: 1
//! tools:
//!   rules:
//!     - match: [git, push]
//!       allow: true
//!       risk: review-required
//! "#).unwrap();
//!
//! let effective = merge(&org, None, None).unwrap();
//! let engine = PolicyEngine::new(effective, EnforcementMode::Async);
//!
//! let decision = engine.evaluate(&DecisionInput::command(
//!     ["git", "push", "origin", "main"],
//!     "alice",
//!     "/workspace",
//! ));
//! assert!(decision.allowed);
//! assert_eq!(decision.rule, "git push");
//! ```

mod decision;
mod decision_log;
mod eval;
mod merge;
mod model;

pub use decision::{DecisionInput, DecisionResult};
pub use decision_log::{DecisionLog, DecisionLogOptions};
pub use eval::{EnforcementMode, PolicyEngine};
pub use merge::{MergeError, Violation, merge};
pub use model::{
    AllowEntry, CredentialPolicy, FilesystemPolicy, NetworkMode, NetworkPolicy, Policy, PolicyDoc,
    ResourcePolicy, RuntimeEngine, RuntimePolicy, ToolRule, ToolsPolicy,
};

/// Structured policy-layer errors. `Blocked` and `ReviewRequired` carry
/// the full decision so callers can branch: abort, or stage the
/// operation (e.g. push to a staging ref) without blocking.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("{}", .0.reason)]
    Blocked(Box<DecisionResult>),

    #[error("review required: {}", .0.reason)]
    ReviewRequired(Box<DecisionResult>),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("failed to load policy {path}: {reason}")]
    Load { path: String, reason: String },

    #[error("failed to parse policy {path}: {reason}")]
    Parse { path: String, reason: String },
}

impl PolicyError {
    /// The decision attached to a blocked or review-required error.
    pub fn decision(&self) -> Option<&DecisionResult> {
        match self {
            PolicyError::Blocked(d) | PolicyError::ReviewRequired(d) => Some(d),
            _ => None,
        }
    }
}
