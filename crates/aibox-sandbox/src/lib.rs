//! Sandbox lifecycle controller for aibox.
//!
//! Composes the policy engine, credential broker, audit log, and the
//! external container runtime into one safe start/stop/shell flow. Every
//! launch passes through credential minting, argv assembly, and a
//! pre-launch invariant gate that refuses argvs missing any promised
//! security flag.

mod argv;
mod invariant;
mod lifecycle;
mod name;
mod runtime;

pub use argv::{
    LaunchSettings, SANDBOX_LABEL_KEY, SecurityExpectations, WORKSPACE_MOUNT, build_launch_argv,
};
pub use invariant::verify_launch_argv;
pub use lifecycle::{SandboxManager, SandboxStatus, StartOutcome, StopOutcome};
pub use name::{container_name, sanitize_user};
pub use runtime::{ContainerRuntime, ContainerState, RunOutput};

/// Errors from the sandbox lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Pre-launch invariant gate failure. Fatal: no runtime process is
    /// spawned and no partial sandbox is created.
    #[error(
        "launch aborted, argv is missing security invariants:\n{}",
        .missing.iter().map(|m| format!("  - {m}")).collect::<Vec<_>>().join("\n")
    )]
    LaunchInvariant { missing: Vec<String> },

    /// `shell` against a sandbox that is not running.
    #[error("sandbox {name} is not running; start it first")]
    NotRunning { name: String },

    /// Image pull failure, surfaced with the runtime's stderr.
    #[error("failed to pull image {image}: {stderr}")]
    Pull { image: String, stderr: String },

    /// Any other runtime invocation failure.
    #[error("runtime {operation} failed: {stderr}")]
    Runtime { operation: String, stderr: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
