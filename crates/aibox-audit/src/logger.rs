//! The append-only audit logger.
//!
//! One logger owns one log file. Appends are serialized under a mutex so
//! the hash chain cannot interleave; writes are buffered and pushed to
//! disk by an explicit [`AuditLogger::flush`] or by a background periodic
//! flusher. Rotation shifts `audit.jsonl.N` to `audit.jsonl.N+1` (capped
//! at 9) and keeps the in-memory chain head so the first event of the
//! fresh file still links to the last event before rotation.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::warn;

use aibox_types::sha256_hex;

use crate::chain::{GENESIS_HASH, recover_head};
use crate::event::AuditEvent;
use crate::AuditError;

/// Highest rotation suffix kept on disk.
pub const MAX_ROTATED_FILES: u32 = 9;

/// Logger tuning knobs.
#[derive(Debug, Clone)]
pub struct AuditLoggerOptions {
    /// Log file path.
    pub path: PathBuf,
    /// Rotate once the current file grows beyond this many bytes.
    /// `0` disables rotation.
    pub max_size: u64,
    /// Background flush cadence.
    pub flush_interval: Duration,
}

impl AuditLoggerOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_size: 64 * 1024 * 1024,
            flush_interval: Duration::from_secs(2),
        }
    }

    pub fn max_size(mut self, bytes: u64) -> Self {
        self.max_size = bytes;
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }
}

struct LoggerState {
    writer: Option<BufWriter<File>>,
    head: String,
    file_len: u64,
    closed: bool,
}

struct Shared {
    options: AuditLoggerOptions,
    state: Mutex<LoggerState>,
    stop_tx: Mutex<Option<Sender<()>>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

/// Hash-chained JSONL audit logger. Clones share the same file and chain.
#[derive(Clone)]
pub struct AuditLogger {
    shared: Arc<Shared>,
}

impl AuditLogger {
    /// Open (or create) the log at `options.path`, recovering the chain
    /// head from its last complete line, and start the background
    /// flusher.
    pub fn open(options: AuditLoggerOptions) -> Result<Self, AuditError> {
        if let Some(parent) = options.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let head = recover_head(&options.path);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&options.path)?;
        let file_len = file.metadata()?.len();

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let shared = Arc::new(Shared {
            options,
            state: Mutex::new(LoggerState {
                writer: Some(BufWriter::new(file)),
                head,
                file_len,
                closed: false,
            }),
            stop_tx: Mutex::new(Some(stop_tx)),
            flusher: Mutex::new(None),
        });

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let interval = shared.options.flush_interval;
        let handle = std::thread::Builder::new()
            .name("aibox-audit-flush".to_string())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            let Some(shared) = weak.upgrade() else { break };
                            let mut state = shared.state.lock().expect("audit mutex poisoned");
                            if let Some(writer) = state.writer.as_mut()
                                && let Err(e) = writer.flush()
                            {
                                warn!(error = %e, "periodic audit flush failed");
                            }
                        }
                        _ => break,
                    }
                }
            })?;
        *shared.flusher.lock().expect("audit mutex poisoned") = Some(handle);

        Ok(Self { shared })
    }

    /// Current chain head: the canonical SHA-256 of the last appended
    /// event, or the genesis constant.
    pub fn head(&self) -> String {
        self.shared
            .state
            .lock()
            .expect("audit mutex poisoned")
            .head
            .clone()
    }

    /// Validate and append one event. On success the returned event
    /// carries the `hash_prev` it was written with.
    pub fn log(&self, mut event: AuditEvent) -> Result<AuditEvent, AuditError> {
        event.validate()?;

        let mut state = self.shared.state.lock().expect("audit mutex poisoned");
        if state.closed {
            return Err(AuditError::Closed);
        }

        let max_size = self.shared.options.max_size;
        if max_size > 0 && state.file_len > max_size {
            self.rotate_locked(&mut state)?;
        }

        event.hash_prev = state.head.clone();
        let line = event.canonical_json()?;

        let writer = state.writer.as_mut().ok_or(AuditError::Closed)?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;

        state.head = sha256_hex(line.as_bytes());
        state.file_len += line.len() as u64 + 1;

        Ok(event)
    }

    /// Drain the write buffer to disk.
    pub fn flush(&self) -> Result<(), AuditError> {
        let mut state = self.shared.state.lock().expect("audit mutex poisoned");
        if let Some(writer) = state.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    /// Stop the flusher, flush, and close the file. Safe to call more
    /// than once; `log` returns [`AuditError::Closed`] afterwards.
    pub fn close(&self) -> Result<(), AuditError> {
        if let Some(tx) = self
            .shared
            .stop_tx
            .lock()
            .expect("audit mutex poisoned")
            .take()
        {
            drop(tx); // disconnects the flusher's recv
        }
        if let Some(handle) = self
            .shared
            .flusher
            .lock()
            .expect("audit mutex poisoned")
            .take()
        {
            let _ = handle.join();
        }

        let mut state = self.shared.state.lock().expect("audit mutex poisoned");
        state.closed = true;
        if let Some(mut writer) = state.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }

    /// Shift rotated files up, move the live file to `.1`, and start a
    /// fresh file. Called with the state lock held; the chain head in
    /// memory survives so the next event still links across the rotation.
    fn rotate_locked(&self, state: &mut LoggerState) -> Result<(), AuditError> {
        if let Some(mut writer) = state.writer.take() {
            writer.flush()?;
        }

        let path = &self.shared.options.path;
        for n in (1..MAX_ROTATED_FILES).rev() {
            let from = rotated_path(path, n);
            if from.exists() {
                fs::rename(&from, rotated_path(path, n + 1))?;
            }
        }
        if path.exists() {
            fs::rename(path, rotated_path(path, 1))?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        state.writer = Some(BufWriter::new(file));
        state.file_len = 0;
        Ok(())
    }
}

/// `audit.jsonl` → `audit.jsonl.3`
pub fn rotated_path(path: &Path, n: u32) -> PathBuf {
    let name = path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| "audit.jsonl".to_string());
    path.with_file_name(format!("{name}.{n}"))
}

/// Read every well-formed event from a log file. Malformed lines are
/// skipped with a warning; they are not part of the chain verification
/// input.
pub fn read_events(path: &Path) -> Result<Vec<AuditEvent>, AuditError> {
    use std::io::BufRead;

    let file = File::open(path)?;
    let reader = std::io::BufReader::new(file);
    let mut events = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditEvent>(&line) {
            Ok(event) => events.push(event),
            Err(e) => {
                warn!(path = %path.display(), line = idx + 1, error = %e, "skipping malformed audit line");
            }
        }
    }

    Ok(events)
}

/// Genesis constant, re-exported next to the logger for callers that
/// verify.
pub fn genesis() -> &'static str {
    GENESIS_HASH
}
