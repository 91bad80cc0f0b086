//! Typed policy model and strict YAML loading.
//!
//! Each tier (org, team, project) is one [`PolicyDoc`]: a versioned
//! document whose sub-policies are optional overlays. The merge produces
//! an effective [`Policy`] with every sub-policy resolved. Unknown YAML
//! fields are load errors; a typo in a security policy must not silently
//! widen it.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use aibox_types::{CredentialType, RiskClass, short_digest};

use crate::PolicyError;

/// Network admission mode. Only deny-by-default is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkMode {
    #[default]
    DenyByDefault,
}

/// One network allow-list entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AllowEntry {
    pub id: String,
    pub hosts: Vec<String>,
    #[serde(default)]
    pub ports: Vec<u16>,
    /// Requests per minute; absent means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkPolicy {
    #[serde(default)]
    pub mode: NetworkMode,
    #[serde(default)]
    pub allow: Vec<AllowEntry>,
}

impl NetworkPolicy {
    /// Every host named by any allow entry.
    pub fn all_hosts(&self) -> Vec<&str> {
        self.allow
            .iter()
            .flat_map(|e| e.hosts.iter().map(String::as_str))
            .collect()
    }

    pub fn entry_for_host(&self, host: &str) -> Option<&AllowEntry> {
        self.allow.iter().find(|e| e.hosts.iter().any(|h| h == host))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilesystemPolicy {
    #[serde(default = "default_workspace_root")]
    pub workspace_root: String,
    /// Deny-prefix list; any path under one of these is refused.
    #[serde(default)]
    pub deny: Vec<String>,
}

fn default_workspace_root() -> String {
    "/workspace".to_string()
}

impl Default for FilesystemPolicy {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            deny: Vec::new(),
        }
    }
}

/// One ordered tool rule. First match wins at evaluation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolRule {
    /// Token pattern; `*` matches any single token. A pattern matches a
    /// command when it is a (tokenwise) prefix of it.
    #[serde(rename = "match")]
    pub pattern: Vec<String>,
    pub allow: bool,
    pub risk: RiskClass,
}

impl ToolRule {
    /// Stable rule id used in decisions and merge diagnostics.
    pub fn id(&self) -> String {
        self.pattern.join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolsPolicy {
    #[serde(default)]
    pub rules: Vec<ToolRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourcePolicy {
    pub cpu: String,
    pub memory: String,
    pub disk: String,
}

impl Default for ResourcePolicy {
    fn default() -> Self {
        Self {
            cpu: "4".to_string(),
            memory: "8g".to_string(),
            disk: "20g".to_string(),
        }
    }
}

/// Container runtime engine selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeEngine {
    Gvisor,
    Runc,
}

impl std::fmt::Display for RuntimeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeEngine::Gvisor => write!(f, "gvisor"),
            RuntimeEngine::Runc => write!(f, "runc"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimePolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<RuntimeEngine>,
    #[serde(default = "default_true")]
    pub rootless: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RuntimePolicy {
    fn default() -> Self {
        Self {
            engine: None,
            rootless: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialPolicy {
    /// TTL per credential type, humantime syntax.
    #[serde(default)]
    pub ttl: BTreeMap<CredentialType, String>,
    #[serde(default = "default_true")]
    pub revoke_on_stop: bool,
    #[serde(default = "default_true")]
    pub no_persist: bool,
}

impl Default for CredentialPolicy {
    fn default() -> Self {
        Self {
            ttl: BTreeMap::new(),
            revoke_on_stop: true,
            no_persist: true,
        }
    }
}

/// One tier's policy document. Sub-policies a tier does not mention are
/// inherited unchanged from the parent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyDoc {
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<FilesystemPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<CredentialPolicy>,
}

impl PolicyDoc {
    /// Strict YAML load: unknown fields are errors.
    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let content = std::fs::read_to_string(path).map_err(|source| PolicyError::Load {
            path: path.display().to_string(),
            reason: source.to_string(),
        })?;
        Self::parse(&content).map_err(|e| match e {
            PolicyError::Parse { reason, .. } => PolicyError::Parse {
                path: path.display().to_string(),
                reason,
            },
            other => other,
        })
    }

    pub fn parse(yaml: &str) -> Result<Self, PolicyError> {
        serde_yaml::from_str(yaml).map_err(|source| PolicyError::Parse {
            path: "<inline>".to_string(),
            reason: source.to_string(),
        })
    }
}

/// The effective policy: every sub-policy resolved, addressable by a
/// short stable digest that appears on every decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub version: u64,
    pub network: NetworkPolicy,
    pub filesystem: FilesystemPolicy,
    pub tools: ToolsPolicy,
    pub resources: ResourcePolicy,
    pub runtime: RuntimePolicy,
    pub credentials: CredentialPolicy,
}

impl Policy {
    /// Resolve a single document against the built-in defaults (the
    /// degenerate merge with no overlays).
    pub fn from_doc(doc: &PolicyDoc) -> Self {
        Self {
            version: doc.version,
            network: doc.network.clone().unwrap_or_default(),
            filesystem: doc.filesystem.clone().unwrap_or_default(),
            tools: doc.tools.clone().unwrap_or_default(),
            resources: doc.resources.clone().unwrap_or_default(),
            runtime: doc.runtime.clone().unwrap_or_default(),
            credentials: doc.credentials.clone().unwrap_or_default(),
        }
    }

    /// First 8 bytes of the SHA-256 of the canonical serialization,
    /// lowercase hex.
    pub fn digest(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        short_digest(&canonical)
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::from_doc(&PolicyDoc::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_DOC: &str = r#"
version: 3
network:
  mode: deny-by-default
  allow:
    - id: harbor
      hosts: [harbor.internal]
      ports: [443]
      rate_limit: 120
filesystem:
  workspace_root: /workspace
  deny:
    - /etc
    - /root/.ssh
tools:
  rules:
    - match: [git, push]
      allow: true
      risk: review-required
    - match: [curl, "*"]
      allow: false
      risk: blocked-by-default
resources:
  cpu: "4"
  memory: 8g
  disk: 20g
runtime:
  engine: gvisor
  rootless: true
credentials:
  ttl:
    git-token: 15m
  revoke_on_stop: true
  no_persist: true
"#;

    #[test]
    fn full_document_parses() {
        let doc = PolicyDoc::parse(FULL_DOC).expect("parse");
        assert_eq!(doc.version, 3);

        let network = doc.network.expect("network");
        assert_eq!(network.allow.len(), 1);
        assert_eq!(network.allow[0].hosts, vec!["harbor.internal"]);
        assert_eq!(network.allow[0].rate_limit, Some(120));

        let tools = doc.tools.expect("tools");
        assert_eq!(tools.rules[0].pattern, vec!["git", "push"]);
        assert_eq!(tools.rules[0].risk, RiskClass::ReviewRequired);
        assert_eq!(tools.rules[1].id(), "curl *");

        let runtime = doc.runtime.expect("runtime");
        assert_eq!(runtime.engine, Some(RuntimeEngine::Gvisor));
        assert!(runtime.rootless);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let yaml = "version: 1\nnetwork:\n  mode: deny-by-default\n  alow: []\n";
        assert!(matches!(
            PolicyDoc::parse(yaml),
            Err(PolicyError::Parse { .. })
        ));

        let yaml = "version: 1\nsurprise: true\n";
        assert!(PolicyDoc::parse(yaml).is_err());
    }

    #[test]
    fn unknown_network_mode_is_rejected() {
        let yaml = "version: 1\nnetwork:\n  mode: allow-by-default\n";
        assert!(PolicyDoc::parse(yaml).is_err());
    }

    #[test]
    fn minimal_document_gets_defaults() {
        let doc = PolicyDoc::parse("version: 1\n").expect("parse");
        let policy = Policy::from_doc(&doc);
        assert_eq!(policy.filesystem.workspace_root, "/workspace");
        assert_eq!(policy.resources.memory, "8g");
        assert!(policy.runtime.rootless);
        assert!(policy.credentials.revoke_on_stop);
        assert!(policy.credentials.no_persist);
        assert!(policy.tools.rules.is_empty());
    }

    #[test]
    fn digest_is_stable_and_sensitive() {
        let doc = PolicyDoc::parse(FULL_DOC).expect("parse");
        let policy = Policy::from_doc(&doc);
        let digest = policy.digest();
        assert_eq!(digest.len(), 16);
        assert_eq!(digest, Policy::from_doc(&doc).digest());

        let mut widened = policy.clone();
        widened.network.allow[0].hosts.push("evil.com".to_string());
        assert_ne!(digest, widened.digest());
    }

    #[test]
    fn entry_for_host_finds_the_entry() {
        let doc = PolicyDoc::parse(FULL_DOC).expect("parse");
        let policy = Policy::from_doc(&doc);
        assert_eq!(
            policy.network.entry_for_host("harbor.internal").map(|e| e.id.as_str()),
            Some("harbor")
        );
        assert!(policy.network.entry_for_host("evil.com").is_none());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = PolicyDoc::load(Path::new("/nonexistent/org.yaml")).unwrap_err();
        assert!(matches!(err, PolicyError::Load { .. }));
    }
}
