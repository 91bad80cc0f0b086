//! Tamper-evident audit logging for aibox.
//!
//! Every event appended through [`AuditLogger`] carries `hash_prev`, the
//! canonical SHA-256 of the event before it (or the genesis constant for
//! the first). The serialized line on disk is the exact byte sequence that
//! was hashed, so any later mutation of the file is detectable by
//! [`verify_chain`].
//!
//! # Example
//!
//! ```no_run
//! use aibox_audit::{AuditEvent, AuditLogger, AuditLoggerOptions, EventKind, GENESIS_HASH};
//! use aibox_audit::{read_events, verify_chain};
//! use aibox_types::Severity;
//!
//! let logger = AuditLogger::open(AuditLoggerOptions::new("audit.jsonl"))?;
//! logger.log(AuditEvent::new(
//!     EventKind::SandboxStart,
//!     "aibox-alice-0011223344aa",
//!     "alice",
//!     "lifecycle",
//!     Severity::Info,
//! ))?;
//! logger.close()?;
//!
//! let events = read_events("audit.jsonl".as_ref())?;
//! assert!(verify_chain(&events, GENESIS_HASH).intact);
//! # Ok::<(), aibox_audit::AuditError>(())
//! ```

mod chain;
mod event;
mod logger;

pub use chain::{ChainVerification, GENESIS_HASH, recover_head, verify_chain};
pub use event::{AuditEvent, EventCategory, EventKind, RetentionClass};
pub use logger::{
    AuditLogger, AuditLoggerOptions, MAX_ROTATED_FILES, genesis, read_events, rotated_path,
};

/// Errors from the audit validation and persistence path.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// A required event field is absent or zero.
    #[error("missing required audit field: {0}")]
    MissingField(&'static str),

    /// The logger has been closed.
    #[error("audit logger is closed")]
    Closed,

    #[error("audit serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
