//! Credential broker for aibox sandboxes.
//!
//! A uniform [`Provider`] contract over heterogeneous secret storage
//! (in-memory, sealed file, OS keychain, Vault), a TTL [`CachedProvider`]
//! layered in front for stale-on-error resilience, and a session-scoped
//! [`LeaseManager`] that mints credentials at sandbox start and revokes
//! them at stop under a bounded deadline.
//!
//! Secrets are injected into the sandbox environment and never persisted
//! to the workspace.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use aibox_creds::{CachedProvider, Credential, LeaseManager, MemoryProvider, SessionContext};
//! use aibox_types::{CancelToken, CredentialType};
//!
//! let provider = Arc::new(MemoryProvider::with_credentials([
//!     Credential::new(CredentialType::GitToken, "ghp_example", "memory"),
//! ]));
//! let cached = Arc::new(CachedProvider::new(provider, Duration::from_secs(60)));
//!
//! let manager = LeaseManager::new(cached);
//! let ctx = SessionContext::new("aibox-alice-0011223344aa", "alice");
//! let minted = manager.mint_all(&ctx, &CancelToken::new());
//! assert_eq!(minted.env.get("AIBOX_GIT_TOKEN").unwrap(), "ghp_example");
//! ```

mod cache;
mod credential;
mod file;
mod keychain;
mod lease;
mod provider;
mod vault;

pub use cache::CachedProvider;
pub use credential::{Credential, LEASE_ID_KEY, mask_secret};
pub use file::FileProvider;
pub use keychain::KeychainProvider;
pub use lease::{
    Lease, LeaseManager, MintOutcome, REVOKE_DEADLINE, RevokeReport, SessionContext,
};
pub use provider::{MemoryProvider, Provider};
pub use vault::{VaultAuth, VaultConfig, VaultProvider};

use aibox_types::CredentialType;

/// Errors from the credential broker.
#[derive(Debug, thiserror::Error)]
pub enum CredError {
    /// Uniform absence signal across every provider.
    #[error("credential {0} not found")]
    NotFound(CredentialType),

    /// The provider cannot store credentials.
    #[error("provider {0} is read-only")]
    ReadOnly(&'static str),

    /// The operation was cancelled or its deadline elapsed.
    #[error("credential operation cancelled")]
    Cancelled,

    /// The backing store is unreachable or misbehaving.
    #[error("provider {provider} unavailable: {reason}")]
    Unavailable { provider: String, reason: String },

    /// Sealing, unsealing, or file-mode failures on the encrypted store.
    #[error("credential store integrity error: {0}")]
    Crypto(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
