//! Three-tier tighten-only merge.
//!
//! `merge(org, team?, project?)` applies the overlays in order onto a
//! deep copy of the org policy. Every sub-policy has its own rule; any
//! attempt to loosen a parent is collected as a violation and the whole
//! merge fails with all of them reported, never just the first.

use tracing::warn;

use aibox_units::{format_size, format_ttl, parse_size, parse_ttl};

use crate::model::{Policy, PolicyDoc, RuntimeEngine};

/// One structural loosening, named precisely enough to fix the overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Which overlay loosened: `org`, `team`, or `project`.
    pub tier: String,
    /// Sub-policy the rule belongs to.
    pub subpolicy: &'static str,
    pub detail: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{} / {}] {}", self.tier, self.subpolicy, self.detail)
    }
}

/// Aggregated merge failure carrying every violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeError {
    pub violations: Vec<Violation>,
}

impl std::fmt::Display for MergeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "policy merge failed with {} violation(s):", self.violations.len())?;
        for violation in &self.violations {
            writeln!(f, "  - {violation}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MergeError {}

/// Merge the tiers into one effective policy, or fail with the full
/// violation list. Pure: the inputs are not modified.
pub fn merge(
    org: &PolicyDoc,
    team: Option<&PolicyDoc>,
    project: Option<&PolicyDoc>,
) -> Result<Policy, MergeError> {
    let mut violations = Vec::new();

    // Org-tier constraint: when the org pins an engine it must be the
    // isolated-syscall platform.
    if let Some(runtime) = &org.runtime
        && let Some(engine) = runtime.engine
        && engine != RuntimeEngine::Gvisor
    {
        violations.push(Violation {
            tier: "org".to_string(),
            subpolicy: "runtime",
            detail: format!("org engine must be gvisor when set, found {engine}"),
        });
    }

    let mut effective = Policy::from_doc(org);

    for (tier, overlay) in [("team", team), ("project", project)] {
        let Some(overlay) = overlay else { continue };
        if overlay.version != org.version {
            warn!(
                tier,
                org_version = org.version,
                overlay_version = overlay.version,
                "policy version mismatch across tiers"
            );
        }
        apply_overlay(&mut effective, overlay, tier, &mut violations);
    }

    if violations.is_empty() {
        Ok(effective)
    } else {
        Err(MergeError { violations })
    }
}

fn apply_overlay(
    effective: &mut Policy,
    overlay: &PolicyDoc,
    tier: &str,
    violations: &mut Vec<Violation>,
) {
    if let Some(network) = &overlay.network {
        merge_network(effective, network, tier, violations);
    }
    if let Some(filesystem) = &overlay.filesystem {
        // Deny prefixes only accumulate.
        effective.filesystem.workspace_root = filesystem.workspace_root.clone();
        for path in &filesystem.deny {
            if !effective.filesystem.deny.contains(path) {
                effective.filesystem.deny.push(path.clone());
            }
        }
    }
    if let Some(tools) = &overlay.tools {
        merge_tools(effective, tools, tier, violations);
    }
    if let Some(resources) = &overlay.resources {
        merge_resources(effective, resources, tier, violations);
    }
    if let Some(runtime) = &overlay.runtime {
        merge_runtime(effective, runtime, tier, violations);
    }
    if let Some(credentials) = &overlay.credentials {
        merge_credentials(effective, credentials, tier, violations);
    }
}

/// Child hosts must be a subset of the parent's; the effective list is
/// the child's (the intersection, since the subset check passed).
fn merge_network(
    effective: &mut Policy,
    child: &crate::model::NetworkPolicy,
    tier: &str,
    violations: &mut Vec<Violation>,
) {
    let parent_hosts: Vec<&str> = effective.network.all_hosts();
    let mut ok = true;
    for entry in &child.allow {
        for host in &entry.hosts {
            if !parent_hosts.contains(&host.as_str()) {
                ok = false;
                violations.push(Violation {
                    tier: tier.to_string(),
                    subpolicy: "network",
                    detail: format!(
                        "allow entry {:?} adds host {host} not allowed by parent",
                        entry.id
                    ),
                });
            }
        }
    }
    if ok {
        effective.network = child.clone();
    }
}

/// Tool rules are keyed by their token pattern. A new pattern from the
/// child is appended; an overriding pattern must be at equal or higher
/// risk and may not re-allow what the parent refused.
fn merge_tools(
    effective: &mut Policy,
    child: &crate::model::ToolsPolicy,
    tier: &str,
    violations: &mut Vec<Violation>,
) {
    for rule in &child.rules {
        match effective
            .tools
            .rules
            .iter_mut()
            .find(|existing| existing.pattern == rule.pattern)
        {
            Some(existing) => {
                if rule.risk < existing.risk {
                    violations.push(Violation {
                        tier: tier.to_string(),
                        subpolicy: "tools",
                        detail: format!(
                            "rule {:?} lowers risk from {} to {}",
                            rule.id(),
                            existing.risk,
                            rule.risk
                        ),
                    });
                } else if rule.allow && !existing.allow {
                    violations.push(Violation {
                        tier: tier.to_string(),
                        subpolicy: "tools",
                        detail: format!("rule {:?} re-allows a command the parent refused", rule.id()),
                    });
                } else {
                    *existing = rule.clone();
                }
            }
            None => effective.tools.rules.push(rule.clone()),
        }
    }
}

/// Each child value must parse to at most the parent's; the effective
/// value is the smaller. Unparseable strings in an overlay fail the
/// merge.
fn merge_resources(
    effective: &mut Policy,
    child: &crate::model::ResourcePolicy,
    tier: &str,
    violations: &mut Vec<Violation>,
) {
    let pairs: [(&'static str, &String, &mut String); 3] = [
        ("cpu", &child.cpu, &mut effective.resources.cpu),
        ("memory", &child.memory, &mut effective.resources.memory),
        ("disk", &child.disk, &mut effective.resources.disk),
    ];

    for (name, child_value, parent_value) in pairs {
        let parent_bytes = match parse_size(parent_value) {
            Ok(v) => v,
            Err(e) => {
                violations.push(Violation {
                    tier: tier.to_string(),
                    subpolicy: "resources",
                    detail: format!("parent {name} {parent_value:?} unparseable: {e}"),
                });
                continue;
            }
        };
        match parse_size(child_value) {
            Ok(child_bytes) if child_bytes > parent_bytes => {
                violations.push(Violation {
                    tier: tier.to_string(),
                    subpolicy: "resources",
                    detail: format!(
                        "{name} {child_value} exceeds parent limit {} ({})",
                        parent_value,
                        format_size(parent_bytes)
                    ),
                });
            }
            Ok(_) => *parent_value = child_value.clone(),
            Err(e) => {
                violations.push(Violation {
                    tier: tier.to_string(),
                    subpolicy: "resources",
                    detail: format!("{name} {child_value:?} unparseable: {e}"),
                });
            }
        }
    }
}

/// A gVisor parent pins the engine; rootless cannot be turned off.
fn merge_runtime(
    effective: &mut Policy,
    child: &crate::model::RuntimePolicy,
    tier: &str,
    violations: &mut Vec<Violation>,
) {
    match (effective.runtime.engine, child.engine) {
        (Some(RuntimeEngine::Gvisor), Some(engine)) if engine != RuntimeEngine::Gvisor => {
            violations.push(Violation {
                tier: tier.to_string(),
                subpolicy: "runtime",
                detail: format!("engine change from gvisor to {engine} is not allowed"),
            });
        }
        (_, Some(engine)) => effective.runtime.engine = Some(engine),
        (_, None) => {}
    }

    if effective.runtime.rootless && !child.rootless {
        violations.push(Violation {
            tier: tier.to_string(),
            subpolicy: "runtime",
            detail: "rootless cannot be turned off".to_string(),
        });
    }
}

/// TTLs may only be shortened; `revoke_on_stop` and `no_persist` may not
/// be disabled.
fn merge_credentials(
    effective: &mut Policy,
    child: &crate::model::CredentialPolicy,
    tier: &str,
    violations: &mut Vec<Violation>,
) {
    for (credential_type, child_ttl) in &child.ttl {
        let child_parsed = match parse_ttl(child_ttl) {
            Ok(d) => d,
            Err(e) => {
                violations.push(Violation {
                    tier: tier.to_string(),
                    subpolicy: "credentials",
                    detail: format!("ttl for {credential_type} {child_ttl:?} unparseable: {e}"),
                });
                continue;
            }
        };

        match effective.credentials.ttl.get(credential_type) {
            Some(parent_ttl) => match parse_ttl(parent_ttl) {
                Ok(parent_parsed) if child_parsed > parent_parsed => {
                    violations.push(Violation {
                        tier: tier.to_string(),
                        subpolicy: "credentials",
                        detail: format!(
                            "ttl for {credential_type} lengthened from {} to {child_ttl}",
                            format_ttl(parent_parsed)
                        ),
                    });
                }
                Ok(_) => {
                    effective
                        .credentials
                        .ttl
                        .insert(*credential_type, child_ttl.clone());
                }
                Err(e) => {
                    violations.push(Violation {
                        tier: tier.to_string(),
                        subpolicy: "credentials",
                        detail: format!(
                            "parent ttl for {credential_type} unparseable: {e}"
                        ),
                    });
                }
            },
            None => {
                effective
                    .credentials
                    .ttl
                    .insert(*credential_type, child_ttl.clone());
            }
        }
    }

    if effective.credentials.revoke_on_stop && !child.revoke_on_stop {
        violations.push(Violation {
            tier: tier.to_string(),
            subpolicy: "credentials",
            detail: "revoke_on_stop cannot be disabled".to_string(),
        });
    }
    if effective.credentials.no_persist && !child.no_persist {
        violations.push(Violation {
            tier: tier.to_string(),
            subpolicy: "credentials",
            detail: "no_persist cannot be disabled".to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use aibox_types::RiskClass;

    use crate::model::PolicyDoc;

    use super::*;

    fn org() -> PolicyDoc {
        PolicyDoc::parse(
            r#"
version: 2
network:
  allow:
    - id: harbor
      hosts: [harbor.internal, mirror.internal]
filesystem:
  deny: [/etc]
tools:
  rules:
    - match: [git, push]
      allow: true
      risk: review-required
    - match: [rm, -rf, "*"]
      allow: false
      risk: blocked-by-default
resources:
  cpu: "8"
  memory: 16g
  disk: 40g
runtime:
  engine: gvisor
  rootless: true
credentials:
  ttl:
    git-token: 1h
  revoke_on_stop: true
  no_persist: true
"#,
        )
        .expect("org")
    }

    #[test]
    fn merge_without_overlays_is_identity() {
        let org = org();
        let effective = merge(&org, None, None).expect("merge");
        assert_eq!(effective, Policy::from_doc(&org));
    }

    #[test]
    fn network_subset_tightens_to_the_child_list() {
        let team = PolicyDoc::parse(
            r#"
version: 2
network:
  allow:
    - id: harbor-only
      hosts: [harbor.internal]
"#,
        )
        .expect("team");

        let effective = merge(&org(), Some(&team), None).expect("merge");
        assert_eq!(effective.network.all_hosts(), vec!["harbor.internal"]);
    }

    #[test]
    fn network_added_host_is_a_violation_naming_the_host() {
        let team = PolicyDoc::parse(
            r#"
version: 2
network:
  allow:
    - id: harbor
      hosts: [harbor.internal, evil.com]
"#,
        )
        .expect("team");

        let err = merge(&org(), Some(&team), None).unwrap_err();
        assert_eq!(err.violations.len(), 1);
        assert_eq!(err.violations[0].subpolicy, "network");
        assert_eq!(err.violations[0].tier, "team");
        assert!(err.violations[0].detail.contains("evil.com"));
    }

    #[test]
    fn filesystem_deny_paths_union() {
        let team = PolicyDoc::parse("version: 2\nfilesystem:\n  deny: [/root/.ssh, /etc]\n")
            .expect("team");
        let effective = merge(&org(), Some(&team), None).expect("merge");
        assert_eq!(effective.filesystem.deny, vec!["/etc", "/root/.ssh"]);
    }

    #[test]
    fn tool_override_may_raise_risk_but_not_lower_it() {
        let raise = PolicyDoc::parse(
            "version: 2\ntools:\n  rules:\n    - match: [git, push]\n      allow: true\n      risk: blocked-by-default\n",
        )
        .expect("raise");
        let effective = merge(&org(), Some(&raise), None).expect("merge");
        assert_eq!(
            effective.tools.rules[0].risk,
            RiskClass::BlockedByDefault
        );

        let lower = PolicyDoc::parse(
            "version: 2\ntools:\n  rules:\n    - match: [git, push]\n      allow: true\n      risk: safe\n",
        )
        .expect("lower");
        let err = merge(&org(), Some(&lower), None).unwrap_err();
        assert_eq!(err.violations[0].subpolicy, "tools");
        assert!(err.violations[0].detail.contains("git push"));
    }

    #[test]
    fn tool_override_cannot_reallow_refused_command() {
        let team = PolicyDoc::parse(
            "version: 2\ntools:\n  rules:\n    - match: [rm, -rf, \"*\"]\n      allow: true\n      risk: blocked-by-default\n",
        )
        .expect("team");
        let err = merge(&org(), Some(&team), None).unwrap_err();
        assert!(err.violations[0].detail.contains("re-allows"));
    }

    #[test]
    fn new_tool_rule_from_child_is_appended() {
        let team = PolicyDoc::parse(
            "version: 2\ntools:\n  rules:\n    - match: [docker]\n      allow: false\n      risk: blocked-by-default\n",
        )
        .expect("team");
        let effective = merge(&org(), Some(&team), None).expect("merge");
        assert_eq!(effective.tools.rules.len(), 3);
        assert_eq!(effective.tools.rules[2].id(), "docker");
    }

    #[test]
    fn resources_take_the_minimum_and_reject_increases() {
        let smaller =
            PolicyDoc::parse("version: 2\nresources:\n  cpu: \"4\"\n  memory: 8g\n  disk: 40g\n")
                .expect("smaller");
        let effective = merge(&org(), Some(&smaller), None).expect("merge");
        assert_eq!(effective.resources.cpu, "4");
        assert_eq!(effective.resources.memory, "8g");
        assert_eq!(effective.resources.disk, "40g");

        let bigger =
            PolicyDoc::parse("version: 2\nresources:\n  cpu: \"8\"\n  memory: 32g\n  disk: 40g\n")
                .expect("bigger");
        let err = merge(&org(), Some(&bigger), None).unwrap_err();
        assert_eq!(err.violations.len(), 1);
        assert!(err.violations[0].detail.contains("memory 32g"));
    }

    #[test]
    fn invalid_resource_string_fails_the_merge() {
        let team = PolicyDoc::parse(
            "version: 2\nresources:\n  cpu: \"4\"\n  memory: plenty\n  disk: 40g\n",
        )
        .expect("team");
        let err = merge(&org(), Some(&team), None).unwrap_err();
        assert!(err.violations[0].detail.contains("unparseable"));
    }

    #[test]
    fn gvisor_parent_pins_engine_and_rootless() {
        let team =
            PolicyDoc::parse("version: 2\nruntime:\n  engine: runc\n  rootless: true\n")
                .expect("team");
        let err = merge(&org(), Some(&team), None).unwrap_err();
        assert!(err.violations[0].detail.contains("gvisor"));

        let rootful = PolicyDoc::parse("version: 2\nruntime:\n  rootless: false\n").expect("team");
        let err = merge(&org(), Some(&rootful), None).unwrap_err();
        assert!(err.violations[0].detail.contains("rootless"));
    }

    #[test]
    fn org_engine_other_than_gvisor_is_rejected() {
        let mut org = org();
        org.runtime.as_mut().unwrap().engine = Some(RuntimeEngine::Runc);
        let err = merge(&org, None, None).unwrap_err();
        assert_eq!(err.violations[0].tier, "org");
    }

    #[test]
    fn credential_ttls_shorten_only_and_flags_stay_on() {
        let shorter =
            PolicyDoc::parse("version: 2\ncredentials:\n  ttl:\n    git-token: 15m\n").expect("t");
        let effective = merge(&org(), Some(&shorter), None).expect("merge");
        assert_eq!(effective.credentials.ttl.get(&aibox_types::CredentialType::GitToken).unwrap(), "15m");

        let longer =
            PolicyDoc::parse("version: 2\ncredentials:\n  ttl:\n    git-token: 4h\n").expect("t");
        let err = merge(&org(), Some(&longer), None).unwrap_err();
        assert!(err.violations[0].detail.contains("lengthened"));

        let disabled =
            PolicyDoc::parse("version: 2\ncredentials:\n  revoke_on_stop: false\n").expect("t");
        let err = merge(&org(), Some(&disabled), None).unwrap_err();
        assert!(err.violations[0].detail.contains("revoke_on_stop"));

        let persist = PolicyDoc::parse("version: 2\ncredentials:\n  no_persist: false\n").expect("t");
        let err = merge(&org(), Some(&persist), None).unwrap_err();
        assert!(err.violations[0].detail.contains("no_persist"));
    }

    #[test]
    fn all_violations_are_collected_not_just_the_first() {
        let team = PolicyDoc::parse(
            r#"
version: 2
network:
  allow:
    - id: wide
      hosts: [evil.com]
resources:
  cpu: "16"
  memory: 32g
  disk: 80g
runtime:
  rootless: false
"#,
        )
        .expect("team");

        let err = merge(&org(), Some(&team), None).unwrap_err();
        let subpolicies: Vec<&str> = err.violations.iter().map(|v| v.subpolicy).collect();
        assert!(subpolicies.contains(&"network"));
        assert!(subpolicies.contains(&"resources"));
        assert!(subpolicies.contains(&"runtime"));
        assert!(err.violations.len() >= 5);
    }

    #[test]
    fn project_tier_applies_after_team() {
        let team = PolicyDoc::parse(
            "version: 2\nnetwork:\n  allow:\n    - id: both\n      hosts: [harbor.internal, mirror.internal]\n",
        )
        .expect("team");
        let project = PolicyDoc::parse(
            "version: 2\nnetwork:\n  allow:\n    - id: harbor\n      hosts: [harbor.internal]\n",
        )
        .expect("project");

        let effective = merge(&org(), Some(&team), Some(&project)).expect("merge");
        assert_eq!(effective.network.all_hosts(), vec!["harbor.internal"]);
    }

    #[test]
    fn merge_error_display_lists_every_violation() {
        let err = MergeError {
            violations: vec![
                Violation {
                    tier: "team".to_string(),
                    subpolicy: "network",
                    detail: "allow entry \"wide\" adds host evil.com not allowed by parent"
                        .to_string(),
                },
                Violation {
                    tier: "project".to_string(),
                    subpolicy: "resources",
                    detail: "memory 32g exceeds parent limit 16g (16g)".to_string(),
                },
            ],
        };
        insta::assert_snapshot!(err.to_string(), @r#"
        policy merge failed with 2 violation(s):
          - [team / network] allow entry "wide" adds host evil.com not allowed by parent
          - [project / resources] memory 32g exceeds parent limit 16g (16g)
        "#);
    }

    #[test]
    fn project_cannot_relax_what_team_tightened() {
        let team = PolicyDoc::parse(
            "version: 2\nnetwork:\n  allow:\n    - id: harbor\n      hosts: [harbor.internal]\n",
        )
        .expect("team");
        // mirror.internal was in org but the team dropped it.
        let project = PolicyDoc::parse(
            "version: 2\nnetwork:\n  allow:\n    - id: wide\n      hosts: [mirror.internal]\n",
        )
        .expect("project");

        let err = merge(&org(), Some(&team), Some(&project)).unwrap_err();
        assert_eq!(err.violations[0].tier, "project");
        assert!(err.violations[0].detail.contains("mirror.internal"));
    }
}
