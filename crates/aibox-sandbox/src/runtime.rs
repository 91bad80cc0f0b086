//! Subprocess adapter for the container runtime.
//!
//! The core never speaks a binary RPC to the runtime: everything is a
//! command-line invocation with captured, stdout-parsed output.

use std::io::Write;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::SandboxError;

/// Captured result of one runtime invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Lifecycle state of a named container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContainerState {
    NotFound,
    Created,
    Running,
    Exited,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerState::NotFound => write!(f, "not-found"),
            ContainerState::Created => write!(f, "created"),
            ContainerState::Running => write!(f, "running"),
            ContainerState::Exited => write!(f, "exited"),
        }
    }
}

/// Handle on the runtime binary (`docker`, `podman`, compatible).
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    binary: String,
}

impl ContainerRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    pub fn available(&self) -> bool {
        which::which(&self.binary).is_ok()
    }

    /// Run the runtime with `args`, capturing output.
    pub fn run(&self, args: &[String]) -> Result<RunOutput, SandboxError> {
        let started = Instant::now();
        let output = Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| SandboxError::Runtime {
                operation: args.first().cloned().unwrap_or_default(),
                stderr: format!("failed to invoke {}: {e}", self.binary),
            })?;

        Ok(RunOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration: started.elapsed(),
        })
    }

    /// Run and require exit code 0, surfacing the runtime's stderr.
    pub fn run_checked(&self, args: &[String]) -> Result<RunOutput, SandboxError> {
        let output = self.run(args)?;
        if !output.success() {
            return Err(SandboxError::Runtime {
                operation: args.first().cloned().unwrap_or_default(),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Container state via runtime-inspect.
    pub fn state(&self, name: &str) -> Result<ContainerState, SandboxError> {
        let output = self.run(&args([
            "inspect",
            "--format",
            "{{.State.Status}}",
            name,
        ]))?;
        if !output.success() {
            return Ok(ContainerState::NotFound);
        }
        Ok(match output.stdout.trim() {
            "running" => ContainerState::Running,
            "created" => ContainerState::Created,
            "exited" | "dead" | "stopped" => ContainerState::Exited,
            other => {
                tracing::warn!(state = other, "unrecognized container state, treating as exited");
                ContainerState::Exited
            }
        })
    }

    pub fn image_exists(&self, image: &str) -> Result<bool, SandboxError> {
        let output = self.run(&args(["image", "inspect", image]))?;
        Ok(output.success())
    }

    pub fn pull(&self, image: &str) -> Result<(), SandboxError> {
        let output = self.run(&args(["pull", image]))?;
        if !output.success() {
            return Err(SandboxError::Pull {
                image: image.to_string(),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    pub fn stop(&self, name: &str) -> Result<(), SandboxError> {
        self.run_checked(&args(["stop", name])).map(|_| ())
    }

    pub fn remove(&self, name: &str) -> Result<(), SandboxError> {
        self.run_checked(&args(["rm", "-f", name])).map(|_| ())
    }

    /// Names of containers carrying `label`.
    pub fn find_by_label(&self, label: &str) -> Result<Vec<String>, SandboxError> {
        let filter = format!("label={label}");
        let output = self.run_checked(&args([
            "ps",
            "--all",
            "--filter",
            &filter,
            "--format",
            "{{.Names}}",
        ]))?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Attach an interactive shell. Stdio is inherited; the exit code of
    /// the shell is returned.
    pub fn exec_interactive(&self, name: &str, shell: &str) -> Result<i32, SandboxError> {
        let status = Command::new(&self.binary)
            .args(["exec", "-it", name, shell])
            .status()
            .map_err(|e| SandboxError::Runtime {
                operation: "exec".to_string(),
                stderr: format!("failed to invoke {}: {e}", self.binary),
            })?;
        Ok(status.code().unwrap_or(-1))
    }

    /// Run a shell with stdout/stderr tee'd into `writer`, returning
    /// `(exit_code, bytes_recorded)`. Used when session recording is
    /// enabled.
    pub fn exec_recorded(
        &self,
        name: &str,
        shell: &str,
        writer: &mut dyn std::io::Write,
    ) -> Result<(i32, u64), SandboxError> {
        use std::io::Read;

        let mut child = Command::new(&self.binary)
            .args(["exec", "-i", name, shell])
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| SandboxError::Runtime {
                operation: "exec".to_string(),
                stderr: format!("failed to invoke {}: {e}", self.binary),
            })?;

        let mut bytes = 0u64;
        if let Some(mut stdout) = child.stdout.take() {
            let mut buf = [0u8; 8192];
            loop {
                let n = stdout.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                std::io::stdout().write_all(&buf[..n])?;
                writer.write_all(&buf[..n])?;
                bytes += n as u64;
            }
        }

        let status = child.wait()?;
        Ok((status.code().unwrap_or(-1), bytes))
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}
