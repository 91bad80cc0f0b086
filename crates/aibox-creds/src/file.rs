//! Encrypted-file provider.
//!
//! The full credential set is persisted as a single AES-256-GCM sealed
//! blob: `base64(salt ‖ nonce ‖ ciphertext)`, with the key derived from a
//! passphrase via PBKDF2-SHA256. The file is created owner-read/write
//! only; a looser mode on an existing file is an error.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, OsRng, rand_core::RngCore},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use pbkdf2::pbkdf2_hmac_array;
use sha2::Sha256;

use aibox_types::{CancelToken, CredentialType};

use crate::provider::Provider;
use crate::{CredError, Credential};

const SALT_SIZE: usize = 16;
const NONCE_SIZE: usize = 12;
const PBKDF2_ITERATIONS: u32 = 100_000;
const KEY_SIZE: usize = 32;

#[cfg(unix)]
const OWNER_ONLY_MODE: u32 = 0o600;

type CredentialSet = BTreeMap<CredentialType, Credential>;

/// Provider persisting all credentials in one sealed blob on disk.
pub struct FileProvider {
    path: PathBuf,
    passphrase: String,
    // Serializes read-modify-write cycles on the blob.
    io: Mutex<()>,
}

impl FileProvider {
    pub fn new(path: impl Into<PathBuf>, passphrase: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            passphrase: passphrase.into(),
            io: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<CredentialSet, CredError> {
        if !self.path.exists() {
            return Ok(CredentialSet::new());
        }

        #[cfg(unix)]
        self.check_mode()?;

        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(CredentialSet::new());
        }

        let plaintext = unseal(content.trim(), &self.passphrase)?;
        let set: CredentialSet = serde_json::from_slice(&plaintext)
            .map_err(|e| CredError::Crypto(format!("sealed blob is not a credential set: {e}")))?;
        Ok(set)
    }

    fn save(&self, set: &CredentialSet) -> Result<(), CredError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let plaintext = serde_json::to_vec(set)
            .map_err(|e| CredError::Crypto(format!("credential set serialization failed: {e}")))?;
        let sealed = seal(&plaintext, &self.passphrase)?;

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &sealed)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(OWNER_ONLY_MODE))?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    #[cfg(unix)]
    fn check_mode(&self) -> Result<(), CredError> {
        use std::os::unix::fs::PermissionsExt;

        let mode = std::fs::metadata(&self.path)?.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            return Err(CredError::Crypto(format!(
                "credential file {} has mode {mode:o}; must be owner-only (0600)",
                self.path.display()
            )));
        }
        Ok(())
    }
}

impl Provider for FileProvider {
    fn name(&self) -> &str {
        "file"
    }

    fn get(
        &self,
        credential_type: CredentialType,
        cancel: &CancelToken,
    ) -> Result<Credential, CredError> {
        if cancel.is_cancelled() {
            return Err(CredError::Cancelled);
        }
        let _guard = self.io.lock().expect("file provider poisoned");
        self.load()?
            .remove(&credential_type)
            .ok_or(CredError::NotFound(credential_type))
    }

    fn store(&self, mut credential: Credential, cancel: &CancelToken) -> Result<(), CredError> {
        if cancel.is_cancelled() {
            return Err(CredError::Cancelled);
        }
        let _guard = self.io.lock().expect("file provider poisoned");
        let mut set = self.load()?;
        credential.source = self.name().to_string();
        set.insert(credential.credential_type, credential);
        self.save(&set)
    }

    fn delete(
        &self,
        credential_type: CredentialType,
        cancel: &CancelToken,
    ) -> Result<(), CredError> {
        if cancel.is_cancelled() {
            return Err(CredError::Cancelled);
        }
        let _guard = self.io.lock().expect("file provider poisoned");
        let mut set = self.load()?;
        if set.remove(&credential_type).is_none() {
            return Err(CredError::NotFound(credential_type));
        }
        self.save(&set)
    }

    fn list(&self, cancel: &CancelToken) -> Result<Vec<CredentialType>, CredError> {
        if cancel.is_cancelled() {
            return Err(CredError::Cancelled);
        }
        let _guard = self.io.lock().expect("file provider poisoned");
        Ok(self.load()?.keys().copied().collect())
    }
}

/// Seal plaintext: `base64(salt ‖ nonce ‖ ciphertext)`.
fn seal(plaintext: &[u8], passphrase: &str) -> Result<String, CredError> {
    let mut salt = [0u8; SALT_SIZE];
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut nonce_bytes);

    let key = derive_key(passphrase, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| CredError::Crypto(format!("cipher init failed: {e:?}")))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| CredError::Crypto(format!("encryption failed: {e:?}")))?;

    let mut sealed = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&salt);
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(sealed))
}

/// Reverse of [`seal`]. Wrong passphrase and corrupted blobs are
/// indistinguishable by design (GCM tag failure).
fn unseal(sealed: &str, passphrase: &str) -> Result<Vec<u8>, CredError> {
    let data = BASE64
        .decode(sealed)
        .map_err(|e| CredError::Crypto(format!("invalid base64: {e}")))?;
    if data.len() < SALT_SIZE + NONCE_SIZE + 16 {
        return Err(CredError::Crypto("sealed blob too short".to_string()));
    }

    let salt = &data[..SALT_SIZE];
    let nonce = &data[SALT_SIZE..SALT_SIZE + NONCE_SIZE];
    let ciphertext = &data[SALT_SIZE + NONCE_SIZE..];

    let key = derive_key(passphrase, salt);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| CredError::Crypto(format!("cipher init failed: {e:?}")))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| {
            CredError::Crypto("decryption failed: wrong passphrase or corrupted blob".to_string())
        })
}

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; KEY_SIZE] {
    pbkdf2_hmac_array::<Sha256, KEY_SIZE>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS)
}
