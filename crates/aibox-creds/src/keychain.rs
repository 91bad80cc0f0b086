//! OS keychain provider.
//!
//! Talks to the desktop secret service through the `secret-tool` CLI so
//! secrets live in the user's keyring, never in the workspace. The
//! attribute pair `service aibox` / `credential <type>` namespaces the
//! entries.

use std::io::Write;
use std::process::{Command, Stdio};

use aibox_types::{CancelToken, CredentialType};

use crate::provider::Provider;
use crate::{CredError, Credential};

const SERVICE: &str = "aibox";

/// Provider backed by the host secret service via `secret-tool`.
pub struct KeychainProvider {
    binary: String,
}

impl Default for KeychainProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl KeychainProvider {
    pub fn new() -> Self {
        Self {
            binary: "secret-tool".to_string(),
        }
    }

    /// Override the helper binary (tests point this at a stub script).
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Whether the helper binary is on PATH.
    pub fn available(&self) -> bool {
        Command::new(&self.binary)
            .arg("--help")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok()
    }

    fn run(&self, args: &[&str], stdin: Option<&str>) -> Result<std::process::Output, CredError> {
        let mut command = Command::new(&self.binary);
        command.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
        if stdin.is_some() {
            command.stdin(Stdio::piped());
        }

        let mut child = command.spawn().map_err(|e| CredError::Unavailable {
            provider: "keychain".to_string(),
            reason: format!("failed to run {}: {e}", self.binary),
        })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())?;
        }

        let output = child.wait_with_output()?;
        Ok(output)
    }
}

impl Provider for KeychainProvider {
    fn name(&self) -> &str {
        "keychain"
    }

    fn get(
        &self,
        credential_type: CredentialType,
        cancel: &CancelToken,
    ) -> Result<Credential, CredError> {
        if cancel.is_cancelled() {
            return Err(CredError::Cancelled);
        }
        let ctype = credential_type.to_string();
        let output = self.run(
            &["lookup", "service", SERVICE, "credential", &ctype],
            None,
        )?;

        if !output.status.success() {
            // secret-tool exits non-zero when the item is absent.
            return Err(CredError::NotFound(credential_type));
        }

        let value = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        if value.is_empty() {
            return Err(CredError::NotFound(credential_type));
        }

        Ok(Credential::new(credential_type, value, self.name()))
    }

    fn store(&self, credential: Credential, cancel: &CancelToken) -> Result<(), CredError> {
        if cancel.is_cancelled() {
            return Err(CredError::Cancelled);
        }
        let ctype = credential.credential_type.to_string();
        let label = format!("aibox {ctype}");
        let output = self.run(
            &[
                "store",
                "--label",
                &label,
                "service",
                SERVICE,
                "credential",
                &ctype,
            ],
            Some(&credential.value),
        )?;

        if !output.status.success() {
            return Err(CredError::Unavailable {
                provider: "keychain".to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    fn delete(
        &self,
        credential_type: CredentialType,
        cancel: &CancelToken,
    ) -> Result<(), CredError> {
        if cancel.is_cancelled() {
            return Err(CredError::Cancelled);
        }
        let ctype = credential_type.to_string();
        let output = self.run(
            &["clear", "service", SERVICE, "credential", &ctype],
            None,
        )?;

        if !output.status.success() {
            return Err(CredError::NotFound(credential_type));
        }
        Ok(())
    }

    fn list(&self, cancel: &CancelToken) -> Result<Vec<CredentialType>, CredError> {
        // The secret service has no cheap enumeration; probe each known
        // type.
        let mut present = Vec::new();
        for ctype in CredentialType::all() {
            if cancel.is_cancelled() {
                return Err(CredError::Cancelled);
            }
            if self.get(ctype, cancel).is_ok() {
                present.push(ctype);
            }
        }
        Ok(present)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use tempfile::tempdir;

    use super::*;

    /// Stub `secret-tool` that serves one fixed secret for lookups and
    /// succeeds on store/clear.
    fn stub_binary(dir: &std::path::Path, lookup_exit: i32) -> String {
        let path = dir.join("secret-tool");
        let script = format!(
            "#!/usr/bin/env sh\ncase \"$1\" in\n  lookup) printf 'stub-secret'; exit {lookup_exit} ;;\n  store) cat >/dev/null; exit 0 ;;\n  clear) exit 0 ;;\n  *) exit 0 ;;\nesac\n"
        );
        std::fs::write(&path, script).expect("write stub");
        let mut perms = std::fs::metadata(&path).expect("meta").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod");
        path.to_string_lossy().to_string()
    }

    #[test]
    fn lookup_success_builds_credential() {
        let td = tempdir().expect("tempdir");
        let provider = KeychainProvider::with_binary(stub_binary(td.path(), 0));

        let cred = provider
            .get(CredentialType::GitToken, &CancelToken::new())
            .expect("get");
        assert_eq!(cred.value, "stub-secret");
        assert_eq!(cred.source, "keychain");
    }

    #[test]
    fn lookup_failure_is_not_found() {
        let td = tempdir().expect("tempdir");
        let provider = KeychainProvider::with_binary(stub_binary(td.path(), 1));

        assert!(matches!(
            provider.get(CredentialType::GitToken, &CancelToken::new()),
            Err(CredError::NotFound(CredentialType::GitToken))
        ));
    }

    #[test]
    fn store_pipes_secret_through_stdin() {
        let td = tempdir().expect("tempdir");
        let provider = KeychainProvider::with_binary(stub_binary(td.path(), 0));

        provider
            .store(
                Credential::new(CredentialType::LlmApiKey, "sk-abc", "x"),
                &CancelToken::new(),
            )
            .expect("store");
    }

    #[test]
    fn missing_binary_is_unavailable() {
        let provider = KeychainProvider::with_binary("/definitely/not/secret-tool");
        assert!(matches!(
            provider.get(CredentialType::GitToken, &CancelToken::new()),
            Err(CredError::Unavailable { .. })
        ));
        assert!(!provider.available());
    }
}
