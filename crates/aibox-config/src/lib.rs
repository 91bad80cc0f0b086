//! `AIBOX_*` environment configuration.
//!
//! Every knob the core reads at startup, each with a compile-time
//! default. Invalid values are errors, not silent fallbacks: a typo in a
//! security-relevant variable must surface before a sandbox launches.
//!
//! # Example
//!
//! ```
//! use aibox_config::Config;
//!
//! let config = Config::from_env().unwrap();
//! assert!(!config.runtime.is_empty());
//! ```

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use aibox_units::parse_ttl;

/// Which provider stack backs the credential broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialsMode {
    Memory,
    #[default]
    File,
    Keychain,
    Vault,
}

impl std::str::FromStr for CredentialsMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(CredentialsMode::Memory),
            "file" => Ok(CredentialsMode::File),
            "keychain" => Ok(CredentialsMode::Keychain),
            "vault" => Ok(CredentialsMode::Vault),
            other => bail!("unknown credentials mode: {other}"),
        }
    }
}

impl std::fmt::Display for CredentialsMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialsMode::Memory => write!(f, "memory"),
            CredentialsMode::File => write!(f, "file"),
            CredentialsMode::Keychain => write!(f, "keychain"),
            CredentialsMode::Vault => write!(f, "vault"),
        }
    }
}

/// Log output format for the CLI subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => bail!("unknown log format: {other}"),
        }
    }
}

/// Resolved startup configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub runtime: String,
    pub image: String,
    pub gvisor: bool,
    pub gvisor_platform: String,
    pub cpus: String,
    pub memory: String,
    pub disk: String,
    pub http_proxy: String,
    pub https_proxy: String,
    pub dns: String,
    pub net_allowlist: Vec<String>,
    pub policy_org: PathBuf,
    pub policy_team: Option<PathBuf>,
    pub policy_project: Option<PathBuf>,
    pub decision_log: PathBuf,
    #[serde(with = "humantime_duration")]
    pub policy_reload_interval: Duration,
    pub credentials_mode: CredentialsMode,
    pub audit_log: PathBuf,
    pub archive_dir: PathBuf,
    pub seccomp_profile: String,
    pub apparmor_profile: Option<String>,
    pub ssh_enabled: bool,
    pub record_shell: bool,
    pub log_format: LogFormat,
    pub log_level: String,
}

/// Humantime duration fields, routed through aibox-units so config does
/// not grow its own humantime dependency.
mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&aibox_units::format_ttl(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(de)?;
        aibox_units::parse_ttl(&raw).map_err(D::Error::custom)
    }
}

impl Default for Config {
    fn default() -> Self {
        let home = home_dir();
        Self {
            runtime: "docker".to_string(),
            image: "aibox/agent:latest".to_string(),
            gvisor: false,
            gvisor_platform: "runsc".to_string(),
            cpus: "4".to_string(),
            memory: "8g".to_string(),
            disk: "20g".to_string(),
            http_proxy: "http://127.0.0.1:3128".to_string(),
            https_proxy: "http://127.0.0.1:3128".to_string(),
            dns: "127.0.0.1".to_string(),
            net_allowlist: Vec::new(),
            policy_org: PathBuf::from("/etc/aibox/policy-org.yaml"),
            policy_team: None,
            policy_project: None,
            decision_log: home.join(".aibox/decisions.jsonl"),
            policy_reload_interval: Duration::from_secs(30),
            credentials_mode: CredentialsMode::File,
            audit_log: home.join(".aibox/audit.jsonl"),
            archive_dir: home.join(".aibox/archive"),
            seccomp_profile: "/etc/aibox/seccomp.json".to_string(),
            apparmor_profile: Some("aibox-agent".to_string()),
            ssh_enabled: false,
            record_shell: false,
            log_format: LogFormat::Text,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Read the full `AIBOX_*` environment on top of the defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Some(v) = var("AIBOX_RUNTIME") {
            config.runtime = v;
        }
        if let Some(v) = var("AIBOX_IMAGE") {
            config.image = v;
        }
        if let Some(v) = var("AIBOX_GVISOR") {
            config.gvisor = parse_bool("AIBOX_GVISOR", &v)?;
        }
        if let Some(v) = var("AIBOX_GVISOR_PLATFORM") {
            config.gvisor_platform = v;
        }
        if let Some(v) = var("AIBOX_CPUS") {
            config.cpus = v;
        }
        if let Some(v) = var("AIBOX_MEMORY") {
            config.memory = v;
        }
        if let Some(v) = var("AIBOX_DISK") {
            config.disk = v;
        }
        if let Some(v) = var("AIBOX_HTTP_PROXY") {
            config.http_proxy = v;
        }
        if let Some(v) = var("AIBOX_HTTPS_PROXY") {
            config.https_proxy = v;
        }
        if let Some(v) = var("AIBOX_DNS") {
            config.dns = v;
        }
        if let Some(v) = var("AIBOX_NET_ALLOWLIST") {
            config.net_allowlist = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = var("AIBOX_POLICY_ORG") {
            config.policy_org = PathBuf::from(v);
        }
        config.policy_team = var("AIBOX_POLICY_TEAM").map(PathBuf::from);
        config.policy_project = var("AIBOX_POLICY_PROJECT").map(PathBuf::from);
        if let Some(v) = var("AIBOX_DECISION_LOG") {
            config.decision_log = PathBuf::from(v);
        }
        if let Some(v) = var("AIBOX_POLICY_RELOAD_INTERVAL") {
            config.policy_reload_interval =
                parse_ttl(&v).context("invalid AIBOX_POLICY_RELOAD_INTERVAL")?;
        }
        if let Some(v) = var("AIBOX_CREDENTIALS_MODE") {
            config.credentials_mode = v.parse().context("invalid AIBOX_CREDENTIALS_MODE")?;
        }
        if let Some(v) = var("AIBOX_AUDIT_LOG") {
            config.audit_log = PathBuf::from(v);
        }
        if let Some(v) = var("AIBOX_ARCHIVE_DIR") {
            config.archive_dir = PathBuf::from(v);
        }
        if let Some(v) = var("AIBOX_SECCOMP_PROFILE") {
            config.seccomp_profile = v;
        }
        if let Ok(v) = env::var("AIBOX_APPARMOR_PROFILE") {
            // An explicitly empty profile disables AppArmor (degraded to
            // gVisor + seccomp).
            config.apparmor_profile = (!v.is_empty()).then_some(v);
        }
        if let Some(v) = var("AIBOX_SSH_ENABLED") {
            config.ssh_enabled = parse_bool("AIBOX_SSH_ENABLED", &v)?;
        }
        if let Some(v) = var("AIBOX_RECORD_SHELL") {
            config.record_shell = parse_bool("AIBOX_RECORD_SHELL", &v)?;
        }
        if let Some(v) = var("AIBOX_LOG_FORMAT") {
            config.log_format = v.parse().context("invalid AIBOX_LOG_FORMAT")?;
        }
        if let Some(v) = var("AIBOX_LOG_LEVEL") {
            config.log_level = v;
        }

        Ok(config)
    }
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("invalid boolean for {name}: {other}"),
    }
}

fn home_dir() -> PathBuf {
    env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    #[serial]
    fn defaults_apply_without_env() {
        temp_env::with_vars_unset(
            ["AIBOX_RUNTIME", "AIBOX_GVISOR", "AIBOX_CREDENTIALS_MODE"],
            || {
                let config = Config::from_env().expect("from_env");
                assert_eq!(config.runtime, "docker");
                assert_eq!(config.image, "aibox/agent:latest");
                assert!(!config.gvisor);
                assert_eq!(config.credentials_mode, CredentialsMode::File);
                assert_eq!(config.policy_reload_interval, Duration::from_secs(30));
                assert_eq!(config.log_format, LogFormat::Text);
            },
        );
    }

    #[test]
    #[serial]
    fn env_overrides_take_effect() {
        temp_env::with_vars(
            [
                ("AIBOX_RUNTIME", Some("podman")),
                ("AIBOX_GVISOR", Some("true")),
                ("AIBOX_MEMORY", Some("4g")),
                ("AIBOX_NET_ALLOWLIST", Some("harbor.internal, mirror.internal")),
                ("AIBOX_CREDENTIALS_MODE", Some("vault")),
                ("AIBOX_POLICY_RELOAD_INTERVAL", Some("90s")),
                ("AIBOX_LOG_FORMAT", Some("json")),
            ],
            || {
                let config = Config::from_env().expect("from_env");
                assert_eq!(config.runtime, "podman");
                assert!(config.gvisor);
                assert_eq!(config.memory, "4g");
                assert_eq!(
                    config.net_allowlist,
                    vec!["harbor.internal".to_string(), "mirror.internal".to_string()]
                );
                assert_eq!(config.credentials_mode, CredentialsMode::Vault);
                assert_eq!(config.policy_reload_interval, Duration::from_secs(90));
                assert_eq!(config.log_format, LogFormat::Json);
            },
        );
    }

    #[test]
    #[serial]
    fn invalid_values_are_errors_not_fallbacks() {
        temp_env::with_var("AIBOX_GVISOR", Some("maybe"), || {
            assert!(Config::from_env().is_err());
        });
        temp_env::with_var("AIBOX_CREDENTIALS_MODE", Some("post-it"), || {
            assert!(Config::from_env().is_err());
        });
        temp_env::with_var("AIBOX_POLICY_RELOAD_INTERVAL", Some("sometimes"), || {
            assert!(Config::from_env().is_err());
        });
    }

    #[test]
    #[serial]
    fn empty_apparmor_profile_disables_it() {
        temp_env::with_var("AIBOX_APPARMOR_PROFILE", Some(""), || {
            let config = Config::from_env().expect("from_env");
            assert_eq!(config.apparmor_profile, None);
        });
        temp_env::with_var("AIBOX_APPARMOR_PROFILE", Some("custom-profile"), || {
            let config = Config::from_env().expect("from_env");
            assert_eq!(config.apparmor_profile.as_deref(), Some("custom-profile"));
        });
    }

    #[test]
    fn credentials_mode_roundtrip() {
        for mode in [
            CredentialsMode::Memory,
            CredentialsMode::File,
            CredentialsMode::Keychain,
            CredentialsMode::Vault,
        ] {
            assert_eq!(mode.to_string().parse::<CredentialsMode>().unwrap(), mode);
        }
    }
}
