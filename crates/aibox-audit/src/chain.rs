//! Hash-chain verification and chain-head recovery.

use std::fs;
use std::path::Path;

use tracing::warn;

use aibox_types::sha256_hex;

use crate::event::AuditEvent;

/// Chain head before any event has been logged. Deliberately not a
/// reachable SHA-256 output of anything this system hashes.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Result of verifying a run of events against the chain discipline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainVerification {
    /// True when every `hash_prev` matched.
    pub intact: bool,
    /// Index of the first event whose `hash_prev` check failed.
    pub broken_at: Option<usize>,
    /// Events verified before the first break (all of them when intact).
    pub verified: usize,
}

impl ChainVerification {
    fn intact_over(count: usize) -> Self {
        Self {
            intact: true,
            broken_at: None,
            verified: count,
        }
    }

    fn broken(at: usize) -> Self {
        Self {
            intact: false,
            broken_at: Some(at),
            verified: at,
        }
    }
}

/// Verify that `events[0].hash_prev == genesis` and every later event
/// links to the canonical SHA-256 of its predecessor.
///
/// An empty slice is trivially intact.
pub fn verify_chain(events: &[AuditEvent], genesis: &str) -> ChainVerification {
    let Some(first) = events.first() else {
        return ChainVerification::intact_over(0);
    };

    if first.hash_prev != genesis {
        return ChainVerification::broken(0);
    }

    let mut prev_hash = match first.canonical_json() {
        Ok(json) => sha256_hex(json.as_bytes()),
        Err(_) => return ChainVerification::broken(0),
    };

    for (i, event) in events.iter().enumerate().skip(1) {
        if event.hash_prev != prev_hash {
            return ChainVerification::broken(i);
        }
        prev_hash = match event.canonical_json() {
            Ok(json) => sha256_hex(json.as_bytes()),
            Err(_) => return ChainVerification::broken(i),
        };
    }

    ChainVerification::intact_over(events.len())
}

/// Recover the chain head from an existing log file.
///
/// Reads the last complete line, checks it parses as an event, and hashes
/// the raw line bytes. A missing file, an empty file, or an unparseable
/// last line restarts the chain from genesis with a warning; recovery
/// never aborts an open.
pub fn recover_head(path: &Path) -> String {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return GENESIS_HASH.to_string(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "audit log unreadable, restarting chain from genesis");
            return GENESIS_HASH.to_string();
        }
    };

    // A line is only complete once its newline hit the disk.
    let complete = match content.rfind('\n') {
        Some(end) => &content[..end],
        None if content.is_empty() => return GENESIS_HASH.to_string(),
        None => {
            warn!(path = %path.display(), "audit log has no complete line, restarting chain from genesis");
            return GENESIS_HASH.to_string();
        }
    };

    let Some(last_line) = complete.lines().rev().find(|l| !l.trim().is_empty()) else {
        return GENESIS_HASH.to_string();
    };

    match serde_json::from_str::<AuditEvent>(last_line) {
        Ok(_) => sha256_hex(last_line.as_bytes()),
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "last audit line unparseable, restarting chain from genesis"
            );
            GENESIS_HASH.to_string()
        }
    }
}
