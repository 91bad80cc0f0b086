//! The start/stop/shell/status state machine.
//!
//! One sandbox per workspace. `start` drives credential minting, argv
//! assembly, the invariant gate, and the runtime launch, emitting
//! lifecycle audit events along the way; a failed launch rolls back the
//! minted leases and leaves nothing behind but an error-class audit
//! entry. `stop` revokes all leases and never fails loudly on revocation
//! errors — an un-revoked lease must not block a user from shutting the
//! sandbox down.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::warn;

use aibox_audit::{AuditEvent, AuditLogger, EventKind};
use aibox_creds::{LeaseManager, RevokeReport, SessionContext};
use aibox_policy::PolicyEngine;
use aibox_types::{CancelToken, Severity};

use crate::argv::{LaunchSettings, SecurityExpectations, build_launch_argv};
use crate::invariant::verify_launch_argv;
use crate::name::container_name;
use crate::runtime::{ContainerRuntime, ContainerState};
use crate::SandboxError;

const AUDIT_SOURCE: &str = "lifecycle";

/// Result of a `start`.
#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub name: String,
    /// True when the sandbox was already running and nothing was done.
    pub already_running: bool,
    pub policy_digest: String,
    /// Credential types skipped at mint time, with reasons.
    pub skipped_credentials: Vec<(aibox_types::CredentialType, String)>,
}

/// Result of a `stop`.
#[derive(Debug, Clone)]
pub enum StopOutcome {
    /// No such sandbox; informational, not an error.
    NotFound { name: String },
    Stopped {
        name: String,
        revocation: RevokeReport,
    },
}

/// Point-in-time descriptor for `status`.
#[derive(Debug, Clone)]
pub struct SandboxStatus {
    pub name: String,
    pub state: ContainerState,
    pub policy_digest: String,
}

/// Orchestrates the credential broker, policy engine, audit log, and
/// container runtime into one safe lifecycle.
pub struct SandboxManager {
    runtime: ContainerRuntime,
    settings: LaunchSettings,
    engine: Arc<PolicyEngine>,
    leases: Arc<LeaseManager>,
    audit: AuditLogger,
    shell: String,
    recording_dir: Option<PathBuf>,
}

impl SandboxManager {
    pub fn new(
        runtime: ContainerRuntime,
        settings: LaunchSettings,
        engine: Arc<PolicyEngine>,
        leases: Arc<LeaseManager>,
        audit: AuditLogger,
    ) -> Self {
        Self {
            runtime,
            settings,
            engine,
            leases,
            audit,
            shell: "/bin/bash".to_string(),
            recording_dir: None,
        }
    }

    /// Record shell sessions under `dir` and report byte counts.
    pub fn with_shell_recording(mut self, dir: impl Into<PathBuf>) -> Self {
        self.recording_dir = Some(dir.into());
        self
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn container_name_for(&self, user: &str, workspace: &Path) -> String {
        container_name(user, workspace)
    }

    /// Start the sandbox for `(user, workspace)`. Legal from absent and
    /// exited (after an implicit remove); a no-op when already running.
    pub fn start(
        &self,
        workspace: &Path,
        user: &str,
        cancel: &CancelToken,
    ) -> Result<StartOutcome, SandboxError> {
        let name = container_name(user, workspace);

        match self.runtime.state(&name)? {
            ContainerState::Running => {
                return Ok(StartOutcome {
                    name,
                    already_running: true,
                    policy_digest: self.engine.policy_digest(),
                    skipped_credentials: Vec::new(),
                });
            }
            ContainerState::Exited | ContainerState::Created => {
                self.runtime.remove(&name)?;
            }
            ContainerState::NotFound => {}
        }

        let policy = self.engine.current_policy();
        let digest = self.engine.policy_digest();
        let ctx = SessionContext::new(name.clone(), user);
        let minted = self.leases.mint_all(&ctx, cancel);

        let argv = build_launch_argv(&name, workspace, &self.settings, &policy, &minted.env);
        let expectations = SecurityExpectations::for_launch(&self.settings, &name);
        if let Err(e) = verify_launch_argv(&argv, &expectations) {
            self.rollback(&ctx, user, cancel, &e);
            return Err(e);
        }

        if !self.runtime.image_exists(&self.settings.image)? {
            if let Err(e) = self.runtime.pull(&self.settings.image) {
                self.rollback(&ctx, user, cancel, &e);
                return Err(e);
            }
        }

        if let Err(e) = self.runtime.run_checked(&argv) {
            self.rollback(&ctx, user, cancel, &e);
            return Err(e);
        }

        if self.settings.ssh_enabled {
            self.emit(
                AuditEvent::new(EventKind::RuntimeAlert, &name, user, AUDIT_SOURCE, Severity::Warning)
                    .with_detail(
                        "reason",
                        "ssh enabled: cap-drop and no-new-privileges relaxed for sshd",
                    ),
            );
        }

        self.emit(
            AuditEvent::new(EventKind::SandboxStart, &name, user, AUDIT_SOURCE, Severity::Info)
                .with_detail("runtime", self.runtime.binary())
                .with_detail("image", self.settings.image.as_str())
                .with_detail(
                    "platform",
                    if self.settings.gvisor {
                        self.settings.gvisor_platform.as_str()
                    } else {
                        "default"
                    },
                )
                .with_detail("cpus", policy.resources.cpu.as_str())
                .with_detail("memory", policy.resources.memory.as_str())
                .with_detail("policy_digest", digest.as_str()),
        );

        Ok(StartOutcome {
            name,
            already_running: false,
            policy_digest: digest,
            skipped_credentials: minted.skipped,
        })
    }

    /// Stop the sandbox and revoke its leases. Stopping a non-existent
    /// sandbox is a no-op.
    pub fn stop(
        &self,
        workspace: &Path,
        user: &str,
        cancel: &CancelToken,
    ) -> Result<StopOutcome, SandboxError> {
        let name = container_name(user, workspace);

        match self.runtime.state(&name)? {
            ContainerState::NotFound => {
                return Ok(StopOutcome::NotFound { name });
            }
            ContainerState::Running => {
                self.runtime.stop(&name)?;
            }
            _ => {}
        }

        let ctx = SessionContext::new(name.clone(), user);
        let revocation = if self.engine.current_policy().credentials.revoke_on_stop {
            self.leases.revoke_all(&ctx, cancel)
        } else {
            RevokeReport::default()
        };

        self.emit(
            AuditEvent::new(EventKind::SandboxStop, &name, user, AUDIT_SOURCE, Severity::Info)
                .with_detail("revoked", revocation.revoked as i64)
                .with_detail("revoke_failures", revocation.failed.len() as i64)
                .with_detail("revoke_timed_out", revocation.timed_out),
        );

        Ok(StopOutcome::Stopped { name, revocation })
    }

    /// Attach an interactive shell; requires a running sandbox. Returns
    /// the shell's exit code.
    pub fn shell(&self, workspace: &Path, user: &str) -> Result<i32, SandboxError> {
        let name = container_name(user, workspace);

        if self.runtime.state(&name)? != ContainerState::Running {
            return Err(SandboxError::NotRunning { name });
        }

        self.emit(AuditEvent::new(
            EventKind::ShellStart,
            &name,
            user,
            AUDIT_SOURCE,
            Severity::Info,
        ));

        let (exit_code, recorded) = match &self.recording_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let path = dir.join(format!("{name}-{}.log", Utc::now().format("%Y%m%dT%H%M%S")));
                let mut file = std::fs::File::create(&path)?;
                let (code, bytes) = self.runtime.exec_recorded(&name, &self.shell, &mut file)?;
                self.emit(
                    AuditEvent::new(
                        EventKind::SessionRecorded,
                        &name,
                        user,
                        AUDIT_SOURCE,
                        Severity::Info,
                    )
                    .with_detail("path", path.display().to_string())
                    .with_detail("bytes", bytes as i64),
                );
                (code, Some(bytes))
            }
            None => (self.runtime.exec_interactive(&name, &self.shell)?, None),
        };

        let mut end = AuditEvent::new(EventKind::ShellEnd, &name, user, AUDIT_SOURCE, Severity::Info)
            .with_detail("exit_code", exit_code as i64);
        if let Some(bytes) = recorded {
            end = end.with_detail("bytes", bytes as i64);
        }
        self.emit(end);

        Ok(exit_code)
    }

    pub fn status(&self, workspace: &Path, user: &str) -> Result<SandboxStatus, SandboxError> {
        let name = container_name(user, workspace);
        Ok(SandboxStatus {
            state: self.runtime.state(&name)?,
            name,
            policy_digest: self.engine.policy_digest(),
        })
    }

    /// Undo a partial start: revoke whatever was minted and leave one
    /// error-class audit entry.
    fn rollback(&self, ctx: &SessionContext, user: &str, cancel: &CancelToken, error: &SandboxError) {
        let report = self.leases.revoke_all(ctx, cancel);
        if !report.failed.is_empty() || report.timed_out {
            warn!(sandbox_id = %ctx.sandbox_id, "rollback revocation incomplete");
        }
        self.emit(
            AuditEvent::new(
                EventKind::RuntimeAlert,
                &ctx.sandbox_id,
                user,
                AUDIT_SOURCE,
                Severity::Critical,
            )
            .with_detail("reason", format!("launch aborted: {error}")),
        );
    }

    /// Audit emission is load-bearing but must not wedge the lifecycle:
    /// failures are logged and surfaced through the log stream itself.
    fn emit(&self, event: AuditEvent) {
        if let Err(e) = self.audit.log(event) {
            warn!(error = %e, "audit emission failed");
        }
    }
}
