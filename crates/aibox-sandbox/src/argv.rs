//! Runtime argv assembly.
//!
//! The launch argv is assembled from configuration, the effective
//! policy, and the minted credential environment. Everything
//! security-relevant that lands here is re-checked by the pre-launch
//! invariant gate, because the argv has too many sources to trust any
//! single one of them.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use aibox_policy::Policy;

/// Label key attached to every sandbox so later operations can find and
/// clean it up by filter.
pub const SANDBOX_LABEL_KEY: &str = "aibox.sandbox";

/// Mount point of the workspace bind mount inside the sandbox.
pub const WORKSPACE_MOUNT: &str = "/workspace";

/// Static launch configuration, resolved before any sandbox starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchSettings {
    pub image: String,
    /// Installed seccomp profile, referenced by path.
    pub seccomp_profile: String,
    /// AppArmor profile name; absent when the host has no AppArmor, in
    /// which case the sandbox degrades to gVisor + seccomp.
    pub apparmor_profile: Option<String>,
    /// Whether the isolated syscall platform is required.
    pub gvisor: bool,
    /// Runtime selector passed as `--runtime` when gVisor is required.
    pub gvisor_platform: String,
    pub http_proxy: String,
    pub https_proxy: String,
    pub dns: String,
    /// SSH on port 22. Enabling this relaxes cap-drop and
    /// no-new-privileges because sshd needs privilege separation.
    pub ssh_enabled: bool,
    /// Named volume mounted at the agent home.
    pub home_volume: String,
    /// Non-root default user inside the sandbox.
    pub container_user: String,
    pub tmpfs_size: String,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            image: "aibox/agent:latest".to_string(),
            seccomp_profile: "/etc/aibox/seccomp.json".to_string(),
            apparmor_profile: Some("aibox-agent".to_string()),
            gvisor: false,
            gvisor_platform: "runsc".to_string(),
            http_proxy: "http://127.0.0.1:3128".to_string(),
            https_proxy: "http://127.0.0.1:3128".to_string(),
            dns: "127.0.0.1".to_string(),
            ssh_enabled: false,
            home_volume: "aibox-home".to_string(),
            container_user: "1000:1000".to_string(),
            tmpfs_size: "512m".to_string(),
        }
    }
}

/// What the invariant gate must find in the assembled argv.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityExpectations {
    pub seccomp_profile: String,
    pub label: String,
    /// Runtime selector, required when the config asserts gVisor.
    pub runtime_platform: Option<String>,
    pub apparmor_profile: Option<String>,
    /// Relaxed when SSH is enabled.
    pub cap_drop_all: bool,
    pub no_new_privileges: bool,
}

impl SecurityExpectations {
    pub fn for_launch(settings: &LaunchSettings, name: &str) -> Self {
        Self {
            seccomp_profile: settings.seccomp_profile.clone(),
            label: format!("{SANDBOX_LABEL_KEY}={name}"),
            runtime_platform: settings
                .gvisor
                .then(|| settings.gvisor_platform.clone()),
            apparmor_profile: settings.apparmor_profile.clone(),
            cap_drop_all: !settings.ssh_enabled,
            no_new_privileges: !settings.ssh_enabled,
        }
    }
}

/// Assemble the full `run` argv for one sandbox.
pub fn build_launch_argv(
    name: &str,
    workspace: &Path,
    settings: &LaunchSettings,
    policy: &Policy,
    credential_env: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut argv: Vec<String> = vec![
        "run".into(),
        "--detach".into(),
        "--name".into(),
        name.into(),
        "--label".into(),
        format!("{SANDBOX_LABEL_KEY}={name}"),
    ];

    // Mount layout: read-only root, writable noexec tmpfs, named home
    // volume, workspace bind mount.
    argv.push("--read-only".into());
    argv.push("--tmpfs".into());
    argv.push(format!("/tmp:rw,noexec,nosuid,size={}", settings.tmpfs_size));
    argv.push("--volume".into());
    argv.push(format!("{}:/home/agent", settings.home_volume));
    argv.push("--volume".into());
    argv.push(format!("{}:{WORKSPACE_MOUNT}", workspace.display()));

    // Resource limits from the effective policy.
    argv.push("--cpus".into());
    argv.push(policy.resources.cpu.clone());
    argv.push("--memory".into());
    argv.push(policy.resources.memory.clone());

    // Egress routing: everything goes through the proxy and the single
    // DNS resolver.
    argv.push("--env".into());
    argv.push(format!("HTTP_PROXY={}", settings.http_proxy));
    argv.push("--env".into());
    argv.push(format!("HTTPS_PROXY={}", settings.https_proxy));
    argv.push("--dns".into());
    argv.push(settings.dns.clone());

    // Security options.
    argv.push("--security-opt".into());
    argv.push(format!("seccomp={}", settings.seccomp_profile));
    if let Some(profile) = &settings.apparmor_profile {
        argv.push("--security-opt".into());
        argv.push(format!("apparmor={profile}"));
    }
    if settings.ssh_enabled {
        // sshd needs privilege separation: cap-drop and
        // no-new-privileges are relaxed, documented as a known
        // compromise.
        argv.push("--publish".into());
        argv.push("22:22".into());
    } else {
        argv.push("--cap-drop".into());
        argv.push("ALL".into());
        argv.push("--security-opt".into());
        argv.push("no-new-privileges".into());
    }
    if policy.runtime.rootless {
        argv.push("--user".into());
        argv.push(settings.container_user.clone());
    }

    if settings.gvisor {
        argv.push("--runtime".into());
        argv.push(settings.gvisor_platform.clone());
    }

    // Credential injections from the broker.
    for (key, value) in credential_env {
        argv.push("--env".into());
        argv.push(format!("{key}={value}"));
    }

    argv.push(settings.image.clone());
    argv
}

#[cfg(test)]
mod tests {
    use aibox_policy::PolicyDoc;

    use super::*;

    fn policy() -> Policy {
        Policy::from_doc(&PolicyDoc::parse("version: 1\nresources:\n  cpu: \"2\"\n  memory: 4g\n  disk: 10g\n").unwrap())
    }

    fn env() -> BTreeMap<String, String> {
        BTreeMap::from([("AIBOX_GIT_TOKEN".to_string(), "ghp_x".to_string())])
    }

    #[test]
    fn argv_carries_label_mounts_and_limits() {
        let settings = LaunchSettings::default();
        let argv = build_launch_argv(
            "aibox-alice-0011223344aa",
            Path::new("/home/alice/proj"),
            &settings,
            &policy(),
            &env(),
        );

        let joined = argv.join(" ");
        assert!(joined.starts_with("run --detach --name aibox-alice-0011223344aa"));
        assert!(joined.contains("--label aibox.sandbox=aibox-alice-0011223344aa"));
        assert!(joined.contains("--read-only"));
        assert!(joined.contains("--tmpfs /tmp:rw,noexec,nosuid,size=512m"));
        assert!(joined.contains("--volume aibox-home:/home/agent"));
        assert!(joined.contains("--volume /home/alice/proj:/workspace"));
        assert!(joined.contains("--cpus 2"));
        assert!(joined.contains("--memory 4g"));
        assert!(joined.contains("--dns 127.0.0.1"));
        assert!(joined.contains("--security-opt seccomp=/etc/aibox/seccomp.json"));
        assert!(joined.contains("--security-opt apparmor=aibox-agent"));
        assert!(joined.contains("--cap-drop ALL"));
        assert!(joined.contains("--security-opt no-new-privileges"));
        assert!(joined.contains("--user 1000:1000"));
        assert!(joined.contains("--env AIBOX_GIT_TOKEN=ghp_x"));
        assert_eq!(argv.last().unwrap(), "aibox/agent:latest");
    }

    #[test]
    fn gvisor_adds_the_runtime_selector() {
        let settings = LaunchSettings {
            gvisor: true,
            ..Default::default()
        };
        let argv = build_launch_argv("n", Path::new("/w"), &settings, &policy(), &env());
        let joined = argv.join(" ");
        assert!(joined.contains("--runtime runsc"));
    }

    #[test]
    fn ssh_relaxes_cap_drop_and_no_new_privileges() {
        let settings = LaunchSettings {
            ssh_enabled: true,
            ..Default::default()
        };
        let argv = build_launch_argv("n", Path::new("/w"), &settings, &policy(), &env());
        let joined = argv.join(" ");
        assert!(joined.contains("--publish 22:22"));
        assert!(!joined.contains("--cap-drop"));
        assert!(!joined.contains("no-new-privileges"));
    }

    #[test]
    fn expectations_follow_the_settings() {
        let settings = LaunchSettings {
            gvisor: true,
            ..Default::default()
        };
        let exp = SecurityExpectations::for_launch(&settings, "box-1");
        assert_eq!(exp.label, "aibox.sandbox=box-1");
        assert_eq!(exp.runtime_platform.as_deref(), Some("runsc"));
        assert!(exp.cap_drop_all);
        assert!(exp.no_new_privileges);

        let ssh = LaunchSettings {
            ssh_enabled: true,
            ..Default::default()
        };
        let exp = SecurityExpectations::for_launch(&ssh, "box-1");
        assert!(!exp.cap_drop_all);
        assert!(!exp.no_new_privileges);
    }

    #[test]
    fn missing_apparmor_degrades_but_keeps_seccomp() {
        let settings = LaunchSettings {
            apparmor_profile: None,
            ..Default::default()
        };
        let argv = build_launch_argv("n", Path::new("/w"), &settings, &policy(), &env());
        let joined = argv.join(" ");
        assert!(!joined.contains("apparmor="));
        assert!(joined.contains("seccomp="));
    }
}
