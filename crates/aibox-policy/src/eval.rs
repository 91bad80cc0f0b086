//! The policy evaluator and enforcement gate.
//!
//! Evaluation is exhaustive over the three action kinds; there is no
//! fallback path for unknown actions because none can be constructed.
//! Readers hold the policy behind an `RwLock`, so a hot reload is an
//! atomic swap: a decision sees the old policy or the new one, never a
//! mix.

use std::sync::{Arc, RwLock};
use std::time::Instant;

use chrono::Utc;
use tracing::warn;

use aibox_types::{ActionKind, RiskClass};

use crate::decision::{DecisionInput, DecisionResult};
use crate::decision_log::DecisionLog;
use crate::model::Policy;
use crate::PolicyError;

/// How the gate treats review-required decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnforcementMode {
    /// Review-required passes; the attempt is recorded.
    #[default]
    Async,
    /// Review-required is returned as a structured error carrying the
    /// decision so the caller can stage the operation.
    Sync,
}

struct Snapshot {
    policy: Policy,
    digest: String,
}

/// Evaluates decisions against the effective policy and gates callers.
pub struct PolicyEngine {
    snapshot: RwLock<Arc<Snapshot>>,
    decision_log: Option<DecisionLog>,
    mode: EnforcementMode,
}

impl PolicyEngine {
    pub fn new(policy: Policy, mode: EnforcementMode) -> Self {
        let digest = policy.digest();
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot { policy, digest })),
            decision_log: None,
            mode,
        }
    }

    pub fn with_decision_log(mut self, log: DecisionLog) -> Self {
        self.decision_log = Some(log);
        self
    }

    /// Digest of the policy decisions are currently made under.
    pub fn policy_digest(&self) -> String {
        self.snapshot
            .read()
            .expect("policy lock poisoned")
            .digest
            .clone()
    }

    /// Snapshot of the current effective policy.
    pub fn current_policy(&self) -> Policy {
        self.snapshot
            .read()
            .expect("policy lock poisoned")
            .policy
            .clone()
    }

    /// Atomically replace the effective policy. In-flight readers keep
    /// the snapshot they already hold.
    pub fn reload(&self, policy: Policy) {
        let digest = policy.digest();
        let mut slot = self.snapshot.write().expect("policy lock poisoned");
        *slot = Arc::new(Snapshot { policy, digest });
    }

    /// Evaluate one input and record the decision (best-effort).
    pub fn evaluate(&self, input: &DecisionInput) -> DecisionResult {
        let started = Instant::now();
        let snapshot = self.snapshot.read().expect("policy lock poisoned").clone();

        let (allowed, risk_class, rule, reason) = match input.action {
            ActionKind::Command => evaluate_command(&snapshot.policy, &input.command),
            ActionKind::Network => evaluate_network(&snapshot.policy, &input.target),
            ActionKind::Filesystem => evaluate_filesystem(&snapshot.policy, &input.target),
        };

        let decision = DecisionResult {
            allowed,
            risk_class,
            rule,
            reason,
            policy_version: snapshot.digest.clone(),
            input_hash: input.input_hash(),
            timestamp: Utc::now(),
            duration: started.elapsed(),
        };

        if let Some(log) = &self.decision_log
            && let Err(e) = log.record(&decision)
        {
            // Best-effort: a log write failure never fails an evaluation.
            warn!(error = %e, "decision log write failed");
        }

        decision
    }

    /// Evaluate and enforce. Denials and (in sync mode) review-required
    /// decisions come back as structured errors carrying the full
    /// decision.
    pub fn enforce(&self, input: &DecisionInput) -> Result<DecisionResult, PolicyError> {
        let decision = self.evaluate(input);

        if !decision.allowed {
            return Err(PolicyError::Blocked(Box::new(decision)));
        }
        if decision.risk_class == RiskClass::ReviewRequired && self.mode == EnforcementMode::Sync {
            return Err(PolicyError::ReviewRequired(Box::new(decision)));
        }
        Ok(decision)
    }

    pub fn mode(&self) -> EnforcementMode {
        self.mode
    }
}

/// Walk the ordered tool rules; first match wins. With no rules at all
/// the default is safe-allow; with rules present but none matching, the
/// gate is default-deny — a policy that asserts rules speaks for every
/// command.
fn evaluate_command(policy: &Policy, command: &[String]) -> (bool, RiskClass, String, String) {
    for rule in &policy.tools.rules {
        if pattern_matches(&rule.pattern, command) {
            let reason = if rule.allow {
                format!("allowed by rule {:?}", rule.id())
            } else {
                format!(
                    "denied by rule {:?}; file a policy amendment to request access",
                    rule.id()
                )
            };
            return (rule.allow, rule.risk, rule.id(), reason);
        }
    }

    if policy.tools.rules.is_empty() {
        (
            true,
            RiskClass::Safe,
            "default-safe".to_string(),
            "no tool rules configured".to_string(),
        )
    } else {
        (
            false,
            RiskClass::BlockedByDefault,
            "default-deny".to_string(),
            "no rule matched; file a policy amendment to request access".to_string(),
        )
    }
}

/// A pattern matches when it is no longer than the command and every
/// token equals the command token or the `*` wildcard.
fn pattern_matches(pattern: &[String], command: &[String]) -> bool {
    if pattern.is_empty() || pattern.len() > command.len() {
        return false;
    }
    pattern
        .iter()
        .zip(command)
        .all(|(p, c)| p == "*" || p == c)
}

fn evaluate_network(policy: &Policy, host: &str) -> (bool, RiskClass, String, String) {
    match policy.network.entry_for_host(host) {
        Some(entry) => (
            true,
            RiskClass::Safe,
            entry.id.clone(),
            format!("host {host} allowed by entry {:?}", entry.id),
        ),
        None => (
            false,
            RiskClass::BlockedByDefault,
            "deny-by-default".to_string(),
            format!("host {host} not in the allow list; file a policy amendment to request access"),
        ),
    }
}

fn evaluate_filesystem(policy: &Policy, path: &str) -> (bool, RiskClass, String, String) {
    for prefix in &policy.filesystem.deny {
        if path.starts_with(prefix.as_str()) {
            return (
                false,
                RiskClass::BlockedByDefault,
                prefix.clone(),
                format!("path {path} under denied prefix {prefix:?}"),
            );
        }
    }
    (
        true,
        RiskClass::Safe,
        "default-allow".to_string(),
        format!("path {path} not under any denied prefix"),
    )
}
