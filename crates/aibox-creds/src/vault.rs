//! Vault provider: HTTPS REST access to a KV v2 mount.
//!
//! Two auth modes: a static client token, or a SPIFFE-derived JWT fetched
//! from a local workload-identity socket and exchanged at the JWT login
//! endpoint. Every successful `get` records the returned lease id so
//! `delete` (and session revoke) can call the revoke endpoint. Vault is
//! intrinsically read-only from the broker's perspective: `store` is
//! refused.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use aibox_types::{CancelToken, CredentialType};

use crate::provider::Provider;
use crate::{CredError, Credential};

/// How the provider authenticates to Vault.
#[derive(Debug, Clone)]
pub enum VaultAuth {
    /// Pre-issued client token.
    Token(String),
    /// JWT from the workload-identity socket, exchanged via
    /// `auth/jwt/login`.
    Spiffe {
        socket_path: PathBuf,
        audience: String,
        role: String,
    },
}

#[derive(Debug, Clone)]
pub struct VaultConfig {
    /// e.g. `https://vault.internal:8200`
    pub base_url: String,
    /// KV v2 mount name.
    pub mount: String,
    pub auth: VaultAuth,
    pub timeout: Duration,
}

impl VaultConfig {
    pub fn new(base_url: impl Into<String>, auth: VaultAuth) -> Self {
        Self {
            base_url: base_url.into(),
            mount: "secret".to_string(),
            auth,
            timeout: Duration::from_secs(10),
        }
    }
}

pub struct VaultProvider {
    config: VaultConfig,
    client: reqwest::blocking::Client,
    token: Mutex<Option<String>>,
    leases: Mutex<BTreeMap<CredentialType, String>>,
}

impl VaultProvider {
    pub fn new(config: VaultConfig) -> Result<Self, CredError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CredError::Unavailable {
                provider: "vault".to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            config,
            client,
            token: Mutex::new(None),
            leases: Mutex::new(BTreeMap::new()),
        })
    }

    /// Lease ids currently held, by credential type.
    pub fn held_leases(&self) -> BTreeMap<CredentialType, String> {
        self.leases.lock().expect("vault lease mutex poisoned").clone()
    }

    fn unavailable(&self, reason: impl Into<String>) -> CredError {
        CredError::Unavailable {
            provider: "vault".to_string(),
            reason: reason.into(),
        }
    }

    /// Resolve and cache the client token for the configured auth mode.
    fn ensure_token(&self, cancel: &CancelToken) -> Result<String, CredError> {
        let mut slot = self.token.lock().expect("vault token mutex poisoned");
        if let Some(token) = slot.as_ref() {
            return Ok(token.clone());
        }
        if cancel.is_cancelled() {
            return Err(CredError::Cancelled);
        }

        let token = match &self.config.auth {
            VaultAuth::Token(token) => token.clone(),
            VaultAuth::Spiffe {
                socket_path,
                audience,
                role,
            } => {
                let jwt = fetch_workload_jwt(socket_path, audience)
                    .map_err(|e| self.unavailable(format!("workload identity socket: {e}")))?;
                self.jwt_login(&jwt, role)?
            }
        };

        *slot = Some(token.clone());
        Ok(token)
    }

    fn jwt_login(&self, jwt: &str, role: &str) -> Result<String, CredError> {
        let url = format!("{}/v1/auth/jwt/login", self.config.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "jwt": jwt, "role": role }))
            .send()
            .map_err(|e| self.unavailable(format!("jwt login request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(self.unavailable(format!("jwt login rejected: {}", response.status())));
        }

        let body: Value = response
            .json()
            .map_err(|e| self.unavailable(format!("jwt login payload invalid: {e}")))?;
        body.pointer("/auth/client_token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| self.unavailable("jwt login response missing auth.client_token"))
    }
}

impl Provider for VaultProvider {
    fn name(&self) -> &str {
        "vault"
    }

    fn get(
        &self,
        credential_type: CredentialType,
        cancel: &CancelToken,
    ) -> Result<Credential, CredError> {
        if cancel.is_cancelled() {
            return Err(CredError::Cancelled);
        }
        let token = self.ensure_token(cancel)?;

        let url = format!(
            "{}/v1/{}/data/{}",
            self.config.base_url, self.config.mount, credential_type
        );
        let response = self
            .client
            .get(&url)
            .header("X-Vault-Token", &token)
            .send()
            .map_err(|e| self.unavailable(format!("get request failed: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CredError::NotFound(credential_type));
        }
        if !response.status().is_success() {
            return Err(self.unavailable(format!("get rejected: {}", response.status())));
        }

        let body: Value = response
            .json()
            .map_err(|e| self.unavailable(format!("get payload invalid: {e}")))?;

        let value = body
            .pointer("/data/data/value")
            .and_then(Value::as_str)
            .ok_or_else(|| self.unavailable("secret payload missing data.data.value"))?
            .to_string();

        let expires_at = body
            .pointer("/data/data/expires_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let lease_id = body
            .get("lease_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let mut credential = Credential::new(credential_type, value, self.name());
        credential.expires_at = expires_at;
        if let Some(lease_id) = lease_id {
            self.leases
                .lock()
                .expect("vault lease mutex poisoned")
                .insert(credential_type, lease_id.clone());
            credential = credential.with_lease_id(lease_id);
        }
        Ok(credential)
    }

    fn store(&self, _credential: Credential, _cancel: &CancelToken) -> Result<(), CredError> {
        Err(CredError::ReadOnly("vault"))
    }

    fn delete(
        &self,
        credential_type: CredentialType,
        cancel: &CancelToken,
    ) -> Result<(), CredError> {
        if cancel.is_cancelled() {
            return Err(CredError::Cancelled);
        }

        let lease_id = self
            .leases
            .lock()
            .expect("vault lease mutex poisoned")
            .remove(&credential_type);
        let Some(lease_id) = lease_id else {
            // Nothing minted through us; nothing to revoke.
            return Ok(());
        };

        let token = self.ensure_token(cancel)?;
        let url = format!("{}/v1/sys/leases/revoke", self.config.base_url);
        let response = self
            .client
            .put(&url)
            .header("X-Vault-Token", &token)
            .json(&json!({ "lease_id": lease_id }))
            .send()
            .map_err(|e| self.unavailable(format!("revoke request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(self.unavailable(format!("revoke rejected: {}", response.status())));
        }
        Ok(())
    }

    fn list(&self, cancel: &CancelToken) -> Result<Vec<CredentialType>, CredError> {
        if cancel.is_cancelled() {
            return Err(CredError::Cancelled);
        }
        let token = self.ensure_token(cancel)?;

        let url = format!(
            "{}/v1/{}/metadata?list=true",
            self.config.base_url, self.config.mount
        );
        let response = self
            .client
            .get(&url)
            .header("X-Vault-Token", &token)
            .send()
            .map_err(|e| self.unavailable(format!("list request failed: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(self.unavailable(format!("list rejected: {}", response.status())));
        }

        let body: Value = response
            .json()
            .map_err(|e| self.unavailable(format!("list payload invalid: {e}")))?;
        let keys = body
            .pointer("/data/keys")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(keys
            .iter()
            .filter_map(Value::as_str)
            .filter_map(|k| k.parse().ok())
            .collect())
    }
}

/// Fetch a JWT-SVID from the local workload-identity socket.
///
/// The exchange is one HTTP/1.1 GET over the unix socket; the response
/// body is JSON with a `token` field. Deliberately minimal: the socket is
/// local, trusted, and serves exactly this shape.
#[cfg(unix)]
fn fetch_workload_jwt(socket_path: &std::path::Path, audience: &str) -> anyhow::Result<String> {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    use anyhow::Context;

    let mut stream = UnixStream::connect(socket_path)
        .with_context(|| format!("connect {}", socket_path.display()))?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.set_write_timeout(Some(Duration::from_secs(5)))?;

    let request = format!(
        "GET /svid/jwt?audience={audience} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(request.as_bytes())?;

    let mut raw = String::new();
    stream.read_to_string(&mut raw)?;

    let body = raw
        .split_once("\r\n\r\n")
        .map(|(_, body)| body)
        .context("workload response has no body")?;
    let parsed: Value = serde_json::from_str(body.trim()).context("workload body is not JSON")?;
    parsed
        .get("token")
        .and_then(Value::as_str)
        .map(str::to_string)
        .context("workload body missing token")
}

#[cfg(not(unix))]
fn fetch_workload_jwt(_socket_path: &std::path::Path, _audience: &str) -> anyhow::Result<String> {
    anyhow::bail!("workload identity sockets require unix")
}
