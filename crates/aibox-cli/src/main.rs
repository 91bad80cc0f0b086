use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use aibox_archive::{ArchiveBackend, ArchiveBatch, FileArchive, verify_archive};
use aibox_audit::{GENESIS_HASH, read_events, recover_head, verify_chain};
use aibox_config::{Config, CredentialsMode, LogFormat};
use aibox_creds::{
    CachedProvider, FileProvider, KeychainProvider, LeaseManager, MemoryProvider, Provider,
    VaultAuth, VaultConfig, VaultProvider, mask_secret,
};
use aibox_policy::{
    DecisionLog, DecisionLogOptions, EnforcementMode, Policy, PolicyDoc, PolicyEngine, merge,
};
use aibox_sandbox::{ContainerRuntime, LaunchSettings, SandboxManager, StopOutcome};
use aibox_types::CancelToken;

#[derive(Parser, Debug)]
#[command(name = "aibox", version)]
#[command(about = "Policy-governed container sandboxes for AI coding assistants")]
struct Cli {
    /// Workspace directory the sandbox is bound to.
    #[arg(long, default_value = ".")]
    workspace: PathBuf,

    /// User identity for naming and audit attribution (default: $USER).
    #[arg(long)]
    user: Option<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start (or resume) the sandbox for this workspace.
    Start,
    /// Stop the sandbox and revoke its credentials.
    Stop,
    /// Attach an interactive shell to the running sandbox.
    Shell,
    /// Show the sandbox state and effective policy digest.
    Status,
    /// Policy operations.
    #[command(subcommand)]
    Policy(PolicyCommands),
    /// Audit log operations.
    #[command(subcommand)]
    Audit(AuditCommands),
    /// Archive operations.
    #[command(subcommand)]
    Archive(ArchiveCommands),
    /// Print environment and tooling diagnostics.
    Doctor,
}

#[derive(Subcommand, Debug)]
enum PolicyCommands {
    /// Merge the configured tiers and report the effective policy or the
    /// full violation list.
    Check,
}

#[derive(Subcommand, Debug)]
enum AuditCommands {
    /// Verify the hash chain of an audit log file.
    Verify {
        /// Log file (default: the configured audit log).
        path: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum ArchiveCommands {
    /// Seal the current audit log into checksummed archive batches.
    Seal {
        /// Lines per batch.
        #[arg(long, default_value_t = 1000)]
        batch_size: usize,
    },
    /// Verify every batch checksum and the global chain.
    Verify {
        /// Archive root (default: the configured archive dir).
        dir: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    init_tracing(&config);

    let user = cli
        .user
        .clone()
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "user".to_string());
    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| cli.workspace.clone());

    match cli.cmd {
        Commands::Start => {
            let manager = build_manager(&config)?;
            let outcome = manager.start(&workspace, &user, &CancelToken::new())?;
            if outcome.already_running {
                println!("{}: already running", outcome.name);
            } else {
                println!("{}: started (policy {})", outcome.name, outcome.policy_digest);
                for (credential_type, reason) in &outcome.skipped_credentials {
                    println!("  credential {credential_type} skipped: {reason}");
                }
            }
        }
        Commands::Stop => {
            let manager = build_manager(&config)?;
            match manager.stop(&workspace, &user, &CancelToken::new())? {
                StopOutcome::NotFound { name } => {
                    println!("{name}: no sandbox for this workspace");
                }
                StopOutcome::Stopped { name, revocation } => {
                    println!("{name}: stopped ({} lease(s) revoked)", revocation.revoked);
                    for (credential_type, reason) in &revocation.failed {
                        println!("  warning: revoke {credential_type} failed: {reason}");
                    }
                    if revocation.timed_out {
                        println!("  warning: revoke deadline elapsed; remaining leases expire via TTL");
                    }
                }
            }
        }
        Commands::Shell => {
            let manager = build_manager(&config)?;
            let code = manager.shell(&workspace, &user)?;
            if code != 0 {
                std::process::exit(1);
            }
        }
        Commands::Status => {
            let manager = build_manager(&config)?;
            let status = manager.status(&workspace, &user)?;
            println!("sandbox: {}", status.name);
            println!("state:   {}", status.state);
            println!("policy:  {}", status.policy_digest);
        }
        Commands::Policy(PolicyCommands::Check) => {
            let effective = load_effective_policy(&config)?;
            println!("effective policy: {}", effective.digest());
            println!("version:          {}", effective.version);
            println!("network allows:   {} host(s)", effective.network.all_hosts().len());
            println!("fs deny prefixes: {}", effective.filesystem.deny.len());
            println!("tool rules:       {}", effective.tools.rules.len());
            println!(
                "resources:        cpu={} memory={} disk={}",
                effective.resources.cpu, effective.resources.memory, effective.resources.disk
            );
        }
        Commands::Audit(AuditCommands::Verify { path }) => {
            let path = path.unwrap_or_else(|| config.audit_log.clone());
            let events = read_events(&path)
                .with_context(|| format!("failed to read audit log {}", path.display()))?;
            let verification = verify_chain(&events, GENESIS_HASH);
            println!("events:   {}", events.len());
            println!("verified: {}", verification.verified);
            if verification.intact {
                println!("chain:    intact");
            } else {
                println!(
                    "chain:    BROKEN at event {}",
                    verification.broken_at.unwrap_or_default()
                );
                bail!("audit chain verification failed");
            }
        }
        Commands::Archive(ArchiveCommands::Seal { batch_size }) => {
            seal_audit_log(&config, batch_size)?;
        }
        Commands::Archive(ArchiveCommands::Verify { dir }) => {
            let dir = dir.unwrap_or_else(|| config.archive_dir.clone());
            let archive = FileArchive::open(&dir)?;
            let report = verify_archive(&archive)?;
            println!("batches:  {} ({} intact, {} corrupt)",
                report.total_batches, report.intact_batches, report.corrupt_batches);
            println!("events:   {}", report.total_events);
            if report.chain_intact {
                println!("chain:    intact");
            } else {
                println!(
                    "chain:    BROKEN at event {}",
                    report.chain_broken_at.unwrap_or_default()
                );
            }
            if let Some(error) = &report.first_error {
                println!("first error: {error}");
            }
            if !report.chain_intact || report.corrupt_batches > 0 {
                bail!("archive verification failed");
            }
        }
        Commands::Doctor => {
            run_doctor(&config, &workspace, &user)?;
        }
    }

    Ok(())
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let init_result = match config.log_format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    // A second init in-process (tests) is fine to ignore.
    let _ = init_result;
}

fn load_effective_policy(config: &Config) -> Result<Policy> {
    let org = PolicyDoc::load(&config.policy_org)?;
    let team = config
        .policy_team
        .as_deref()
        .map(PolicyDoc::load)
        .transpose()?;
    let project = config
        .policy_project
        .as_deref()
        .map(PolicyDoc::load)
        .transpose()?;
    Ok(merge(&org, team.as_ref(), project.as_ref())?)
}

fn build_provider(config: &Config) -> Result<Arc<dyn Provider>> {
    let inner: Arc<dyn Provider> = match config.credentials_mode {
        CredentialsMode::Memory => Arc::new(MemoryProvider::new()),
        CredentialsMode::File => {
            let path = std::env::var("AIBOX_CREDENTIALS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_credentials_file());
            let passphrase = std::env::var("AIBOX_CREDENTIALS_PASSPHRASE")
                .context("AIBOX_CREDENTIALS_PASSPHRASE is required for the file provider")?;
            Arc::new(FileProvider::new(path, passphrase))
        }
        CredentialsMode::Keychain => Arc::new(KeychainProvider::new()),
        CredentialsMode::Vault => {
            let addr = std::env::var("AIBOX_VAULT_ADDR")
                .context("AIBOX_VAULT_ADDR is required for the vault provider")?;
            let auth = match std::env::var("AIBOX_VAULT_TOKEN") {
                Ok(token) => VaultAuth::Token(token),
                Err(_) => VaultAuth::Spiffe {
                    socket_path: std::env::var("AIBOX_WORKLOAD_SOCKET")
                        .map(PathBuf::from)
                        .unwrap_or_else(|_| PathBuf::from("/run/aibox/workload.sock")),
                    audience: "vault".to_string(),
                    role: "aibox".to_string(),
                },
            };
            Arc::new(VaultProvider::new(VaultConfig::new(addr, auth))?)
        }
    };
    Ok(Arc::new(CachedProvider::new(inner, Duration::from_secs(300))))
}

fn default_credentials_file() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".aibox/credentials.sealed")
}

fn build_manager(config: &Config) -> Result<SandboxManager> {
    let effective = load_effective_policy(config)?;
    let decision_log = DecisionLog::open(
        DecisionLogOptions::new(&config.decision_log).sample_safe(0.1),
    )
    .with_context(|| {
        format!(
            "failed to open decision log {}",
            config.decision_log.display()
        )
    })?;
    let engine = Arc::new(
        PolicyEngine::new(effective, EnforcementMode::Async).with_decision_log(decision_log),
    );

    let provider = build_provider(config)?;
    let leases = Arc::new(LeaseManager::new(provider));

    let audit = aibox_audit::AuditLogger::open(aibox_audit::AuditLoggerOptions::new(
        &config.audit_log,
    ))?;

    let settings = LaunchSettings {
        image: config.image.clone(),
        seccomp_profile: config.seccomp_profile.clone(),
        apparmor_profile: config.apparmor_profile.clone(),
        gvisor: config.gvisor,
        gvisor_platform: config.gvisor_platform.clone(),
        http_proxy: config.http_proxy.clone(),
        https_proxy: config.https_proxy.clone(),
        dns: config.dns.clone(),
        ssh_enabled: config.ssh_enabled,
        ..Default::default()
    };

    let mut manager = SandboxManager::new(
        ContainerRuntime::new(config.runtime.clone()),
        settings,
        engine,
        leases,
        audit,
    );
    if config.record_shell {
        let dir = config
            .audit_log
            .parent()
            .map(|p| p.join("recordings"))
            .unwrap_or_else(|| PathBuf::from("recordings"));
        manager = manager.with_shell_recording(dir);
    }
    Ok(manager)
}

/// Seal the audit log into archive batches of `batch_size` raw lines.
fn seal_audit_log(config: &Config, batch_size: usize) -> Result<()> {
    let content = std::fs::read_to_string(&config.audit_log).with_context(|| {
        format!("failed to read audit log {}", config.audit_log.display())
    })?;
    let lines: Vec<String> = content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(str::to_string)
        .collect();
    if lines.is_empty() {
        println!("nothing to seal");
        return Ok(());
    }

    let archive = FileArchive::open(&config.archive_dir)?;
    let batch_size = batch_size.max(1);
    let mut sealed = 0usize;
    for chunk in lines.chunks(batch_size) {
        let chain_head = aibox_types::sha256_hex(chunk.last().expect("non-empty chunk").as_bytes());
        let key = archive.append(&ArchiveBatch::from_lines(chunk.to_vec(), chain_head))?;
        println!("sealed {} line(s) into {key}", chunk.len());
        sealed += chunk.len();
    }

    // Sanity: the final batch head must match the live chain head.
    let live_head = recover_head(&config.audit_log);
    if live_head != GENESIS_HASH
        && aibox_types::sha256_hex(lines.last().expect("non-empty").as_bytes()) != live_head
    {
        tracing::warn!("audit log advanced while sealing; re-run seal to capture the tail");
    }

    println!("sealed {sealed} event line(s) total");
    Ok(())
}

fn run_doctor(config: &Config, workspace: &Path, user: &str) -> Result<()> {
    println!("workspace:        {}", workspace.display());
    println!("user:             {user}");
    println!(
        "sandbox name:     {}",
        aibox_sandbox::container_name(user, workspace)
    );
    println!("runtime:          {}", config.runtime);
    print_cmd_version(&config.runtime);
    println!("image:            {}", config.image);
    println!(
        "gvisor:           {} (platform {})",
        config.gvisor, config.gvisor_platform
    );
    println!("credentials mode: {}", config.credentials_mode);
    if let Ok(token) = std::env::var("AIBOX_VAULT_TOKEN") {
        println!("vault token:      {}", mask_secret(&token));
    }
    println!("policy org:       {}", config.policy_org.display());
    println!(
        "policy reload:    every {}",
        aibox_units::format_ttl(config.policy_reload_interval)
    );
    println!(
        "egress:           proxy {} dns {} allowlist [{}]",
        config.http_proxy,
        config.dns,
        config.net_allowlist.join(", ")
    );
    match load_effective_policy(config) {
        Ok(policy) => println!("policy digest:    {}", policy.digest()),
        Err(e) => println!("policy digest:    unavailable ({e})"),
    }
    println!("audit log:        {}", config.audit_log.display());
    println!("decision log:     {}", config.decision_log.display());
    println!("archive dir:      {}", config.archive_dir.display());
    println!("seccomp profile:  {}", config.seccomp_profile);
    println!(
        "apparmor profile: {}",
        config.apparmor_profile.as_deref().unwrap_or("(disabled)")
    );
    Ok(())
}

fn print_cmd_version(cmd: &str) {
    let out = Command::new(cmd).arg("--version").output();
    match out {
        Ok(o) if o.status.success() => {
            let s = String::from_utf8_lossy(&o.stdout).trim().to_string();
            println!("runtime version:  {s}");
        }
        Ok(o) => {
            println!(
                "runtime version:  unavailable ({})",
                String::from_utf8_lossy(&o.stderr).trim()
            );
        }
        Err(e) => {
            println!("runtime version:  unavailable ({e})");
        }
    }
}
