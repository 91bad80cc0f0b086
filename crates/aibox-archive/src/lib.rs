//! Immutable batched archive for aibox audit streams.
//!
//! Batches of raw JSONL audit lines are sealed under time-ordered keys
//! with a per-batch SHA-256 checksum and the chain head after the last
//! entry. Batches are immutable once stored; writes go to a temporary
//! file and are renamed into place. [`verify_archive`] walks every batch
//! in key order, re-checking checksums and the global hash chain across
//! batch boundaries.
//!
//! # Example
//!
//! ```
//! use aibox_archive::{ArchiveBackend, ArchiveBatch, FileArchive};
//! use aibox_audit::GENESIS_HASH;
//!
//! let td = tempfile::tempdir().unwrap();
//! let archive = FileArchive::open(td.path()).unwrap();
//!
//! let batch = ArchiveBatch::from_lines(
//!     vec![r#"{"k":"v"}"#.to_string()],
//!     GENESIS_HASH.to_string(),
//! );
//! let key = archive.append(&batch).unwrap();
//! assert_eq!(archive.read(&key).unwrap().entries, batch.entries);
//! ```

mod verify;

pub use verify::{ArchiveReport, verify_archive};

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use aibox_types::sha256_hex;

/// Errors from the archive persistence and integrity path.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// Stored checksum does not match the batch body.
    #[error("archive batch {key} is corrupted: {reason}")]
    Corrupted { key: String, reason: String },

    /// An append targeted a key that already exists. Batches are
    /// immutable; rewriting one is a protocol error.
    #[error("archive batch {0} already exists and is immutable")]
    Immutable(String),

    #[error("archive batch {0} not found")]
    NotFound(String),

    #[error("archive metadata for {key} is invalid: {source}")]
    Metadata {
        key: String,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A contiguous run of raw JSONL entries sealed for long-term storage.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveBatch {
    /// Raw JSONL lines, one event each, without trailing newlines.
    pub entries: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// Audit chain head after the last entry of this batch.
    pub chain_head: String,
    /// Lowercase-hex SHA-256 over the batch body.
    pub checksum: String,
}

impl ArchiveBatch {
    /// Seal `lines` into a batch stamped now.
    pub fn from_lines(entries: Vec<String>, chain_head: String) -> Self {
        let checksum = checksum_of(&entries);
        Self {
            entries,
            created_at: Utc::now(),
            chain_head,
            checksum,
        }
    }

    /// The on-disk body: entries joined by newlines, with a trailing
    /// newline when non-empty. The checksum covers exactly these bytes.
    pub fn body(&self) -> String {
        if self.entries.is_empty() {
            String::new()
        } else {
            let mut body = self.entries.join("\n");
            body.push('\n');
            body
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Checksum over the concatenated entries (the batch body bytes).
pub fn checksum_of(entries: &[String]) -> String {
    if entries.is_empty() {
        return sha256_hex(b"");
    }
    let mut body = entries.join("\n");
    body.push('\n');
    sha256_hex(body.as_bytes())
}

/// Sidecar metadata stored next to each batch body.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BatchMeta {
    created_at: DateTime<Utc>,
    chain_head: String,
    checksum: String,
    entry_count: usize,
}

/// Keyed, time-ordered, checksummed batch store.
pub trait ArchiveBackend: Send + Sync {
    /// Atomically store a batch and return its key. Keys are assigned
    /// lexicographically greater than any key previously returned by
    /// this backend.
    fn append(&self, batch: &ArchiveBatch) -> Result<String, ArchiveError>;

    /// Retrieve a batch, verifying its checksum.
    fn read(&self, key: &str) -> Result<ArchiveBatch, ArchiveError>;

    /// Keys in chronological order, optionally bounded by creation time.
    fn list(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<String>, ArchiveError>;
}

struct KeyState {
    seq: u64,
    last_key: Option<String>,
}

/// Filesystem archive backend. Each batch is `<key>.jsonl` plus a
/// `<key>.meta.json` sidecar under the root directory.
pub struct FileArchive {
    root: PathBuf,
    keys: Mutex<KeyState>,
}

const DATA_SUFFIX: &str = ".jsonl";
const META_SUFFIX: &str = ".meta.json";

impl FileArchive {
    /// Open (or create) an archive rooted at `root`, resuming key
    /// assignment after the highest existing key.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ArchiveError> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let mut last_key: Option<String> = None;
        let mut seq = 0u64;
        for key in existing_keys(&root)? {
            if let Some(n) = key.rsplit('-').next().and_then(|s| s.parse::<u64>().ok()) {
                seq = seq.max(n);
            }
            if last_key.as_deref().is_none_or(|k| key.as_str() > k) {
                last_key = Some(key);
            }
        }

        Ok(Self {
            root,
            keys: Mutex::new(KeyState { seq, last_key }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn data_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}{DATA_SUFFIX}"))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}{META_SUFFIX}"))
    }

    /// Allocate the next key: UTC timestamp at nanosecond precision plus
    /// a monotonically increasing sequence number. If the wall clock ran
    /// backwards, the previous key's timestamp is reused so the new key
    /// still sorts after it.
    fn next_key(&self) -> String {
        let mut state = self.keys.lock().expect("archive key mutex poisoned");
        state.seq += 1;
        let ts = Utc::now().format("%Y%m%dT%H%M%S%9f").to_string();
        let mut key = format!("{ts}-{:06}", state.seq);
        if let Some(last) = &state.last_key
            && key <= *last
        {
            let prev_ts = last.split('-').next().unwrap_or(&ts).to_string();
            key = format!("{prev_ts}-{:06}", state.seq);
        }
        state.last_key = Some(key.clone());
        key
    }

    /// Assemble the full representation in a temp file, then rename.
    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), ArchiveError> {
        if path.exists() {
            return Err(ArchiveError::Immutable(
                path.file_name()
                    .map(|f| f.to_string_lossy().to_string())
                    .unwrap_or_default(),
            ));
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl ArchiveBackend for FileArchive {
    fn append(&self, batch: &ArchiveBatch) -> Result<String, ArchiveError> {
        let key = self.next_key();

        let meta = BatchMeta {
            created_at: batch.created_at,
            chain_head: batch.chain_head.clone(),
            checksum: batch.checksum.clone(),
            entry_count: batch.entries.len(),
        };
        let meta_json =
            serde_json::to_vec(&meta).map_err(|source| ArchiveError::Metadata {
                key: key.clone(),
                source,
            })?;

        self.write_atomic(&self.data_path(&key), batch.body().as_bytes())?;
        self.write_atomic(&self.meta_path(&key), &meta_json)?;
        Ok(key)
    }

    fn read(&self, key: &str) -> Result<ArchiveBatch, ArchiveError> {
        let meta_path = self.meta_path(key);
        if !meta_path.exists() {
            return Err(ArchiveError::NotFound(key.to_string()));
        }

        let meta: BatchMeta = serde_json::from_slice(&fs::read(&meta_path)?).map_err(
            |source| ArchiveError::Metadata {
                key: key.to_string(),
                source,
            },
        )?;

        let body = fs::read_to_string(self.data_path(key))?;
        let actual = sha256_hex(body.as_bytes());
        if actual != meta.checksum {
            return Err(ArchiveError::Corrupted {
                key: key.to_string(),
                reason: format!("checksum mismatch: stored {} actual {actual}", meta.checksum),
            });
        }

        let entries: Vec<String> = body.lines().map(|l| l.to_string()).collect();
        if entries.len() != meta.entry_count {
            return Err(ArchiveError::Corrupted {
                key: key.to_string(),
                reason: format!(
                    "entry count mismatch: stored {} actual {}",
                    meta.entry_count,
                    entries.len()
                ),
            });
        }

        Ok(ArchiveBatch {
            entries,
            created_at: meta.created_at,
            chain_head: meta.chain_head,
            checksum: meta.checksum,
        })
    }

    fn list(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<String>, ArchiveError> {
        let mut keys = existing_keys(&self.root)?;
        keys.sort();

        if since.is_none() && until.is_none() {
            return Ok(keys);
        }

        let mut filtered = Vec::new();
        for key in keys {
            let meta: BatchMeta = serde_json::from_slice(&fs::read(self.meta_path(&key))?)
                .map_err(|source| ArchiveError::Metadata {
                    key: key.clone(),
                    source,
                })?;
            if since.is_some_and(|s| meta.created_at < s) {
                continue;
            }
            if until.is_some_and(|u| meta.created_at > u) {
                continue;
            }
            filtered.push(key);
        }
        Ok(filtered)
    }
}

fn existing_keys(root: &Path) -> Result<Vec<String>, ArchiveError> {
    let mut keys = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(key) = name.strip_suffix(META_SUFFIX) {
            keys.push(key.to_string());
        }
    }
    Ok(keys)
}
