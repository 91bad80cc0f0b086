//! Append-only JSONL decision log.
//!
//! Routine safe allows may be sampled (`sample_safe`) so the log stays
//! proportionate; denials and review-required decisions are always
//! written. A size cap stops writing (with one warning) rather than
//! failing evaluations — the log is best-effort by design.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::warn;

use aibox_types::RiskClass;

use crate::decision::DecisionResult;

#[derive(Debug, Clone)]
pub struct DecisionLogOptions {
    pub path: PathBuf,
    /// Fraction of safe allows to record: `1.0` logs all, `0.1` logs one
    /// in ten, `0.0` logs none.
    pub sample_safe: f64,
    /// Stop writing once the file reaches this size. `0` means no cap.
    pub max_size: u64,
}

impl DecisionLogOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sample_safe: 1.0,
            max_size: 0,
        }
    }

    pub fn sample_safe(mut self, ratio: f64) -> Self {
        self.sample_safe = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn max_size(mut self, bytes: u64) -> Self {
        self.max_size = bytes;
        self
    }
}

struct LogState {
    written: u64,
    safe_seen: u64,
    cap_warned: bool,
}

pub struct DecisionLog {
    options: DecisionLogOptions,
    state: Mutex<LogState>,
}

impl DecisionLog {
    pub fn open(options: DecisionLogOptions) -> std::io::Result<Self> {
        if let Some(parent) = options.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let written = std::fs::metadata(&options.path).map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            options,
            state: Mutex::new(LogState {
                written,
                safe_seen: 0,
                cap_warned: false,
            }),
        })
    }

    /// Append one decision, subject to sampling and the size cap.
    /// Returns whether the line was written.
    pub fn record(&self, decision: &DecisionResult) -> std::io::Result<bool> {
        let mut state = self.state.lock().expect("decision log poisoned");

        if decision.allowed && decision.risk_class == RiskClass::Safe {
            state.safe_seen += 1;
            if !sample_hit(self.options.sample_safe, state.safe_seen) {
                return Ok(false);
            }
        }

        if self.options.max_size > 0 && state.written >= self.options.max_size {
            if !state.cap_warned {
                state.cap_warned = true;
                warn!(
                    path = %self.options.path.display(),
                    max_size = self.options.max_size,
                    "decision log reached its size cap; further decisions are not persisted"
                );
            }
            return Ok(false);
        }

        let line = serde_json::to_string(decision)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.options.path)?;
        writeln!(file, "{line}")?;
        state.written += line.len() as u64 + 1;
        Ok(true)
    }

    /// Read the log back, skipping malformed lines.
    pub fn read_all(&self) -> std::io::Result<Vec<DecisionResult>> {
        use std::io::BufRead;

        if !self.options.path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(&self.options.path)?;
        let reader = std::io::BufReader::new(file);
        let mut decisions = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(decision) => decisions.push(decision),
                Err(e) => warn!(error = %e, "skipping malformed decision line"),
            }
        }
        Ok(decisions)
    }
}

/// Deterministic sampler: with ratio `r`, hit roughly every `1/r`-th
/// safe allow, starting with the first.
fn sample_hit(ratio: f64, seen: u64) -> bool {
    if ratio >= 1.0 {
        return true;
    }
    if ratio <= 0.0 {
        return false;
    }
    let every = (1.0 / ratio).round().max(1.0) as u64;
    (seen - 1) % every == 0
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tempfile::tempdir;

    use super::*;

    fn decision(allowed: bool, risk: RiskClass) -> DecisionResult {
        DecisionResult {
            allowed,
            risk_class: risk,
            rule: "r".to_string(),
            reason: "because".to_string(),
            policy_version: "0011223344556677".to_string(),
            input_hash: "8899aabbccddeeff".to_string(),
            timestamp: Utc::now(),
            duration: std::time::Duration::from_micros(10),
        }
    }

    #[test]
    fn records_and_reads_back() {
        let td = tempdir().expect("tempdir");
        let log =
            DecisionLog::open(DecisionLogOptions::new(td.path().join("decisions.jsonl"))).unwrap();

        assert!(log.record(&decision(false, RiskClass::BlockedByDefault)).unwrap());
        assert!(log.record(&decision(true, RiskClass::ReviewRequired)).unwrap());

        let decisions = log.read_all().unwrap();
        assert_eq!(decisions.len(), 2);
        assert!(!decisions[0].allowed);
    }

    #[test]
    fn safe_allows_are_sampled() {
        let td = tempdir().expect("tempdir");
        let log = DecisionLog::open(
            DecisionLogOptions::new(td.path().join("decisions.jsonl")).sample_safe(0.25),
        )
        .unwrap();

        let mut written = 0;
        for _ in 0..20 {
            if log.record(&decision(true, RiskClass::Safe)).unwrap() {
                written += 1;
            }
        }
        assert_eq!(written, 5);

        // Denials are never sampled away.
        assert!(log.record(&decision(false, RiskClass::BlockedByDefault)).unwrap());
    }

    #[test]
    fn zero_ratio_drops_all_safe_allows() {
        let td = tempdir().expect("tempdir");
        let log = DecisionLog::open(
            DecisionLogOptions::new(td.path().join("decisions.jsonl")).sample_safe(0.0),
        )
        .unwrap();
        assert!(!log.record(&decision(true, RiskClass::Safe)).unwrap());
        assert!(log.record(&decision(true, RiskClass::ReviewRequired)).unwrap());
    }

    #[test]
    fn size_cap_stops_writing() {
        let td = tempdir().expect("tempdir");
        let log = DecisionLog::open(
            DecisionLogOptions::new(td.path().join("decisions.jsonl")).max_size(10),
        )
        .unwrap();

        assert!(log.record(&decision(false, RiskClass::BlockedByDefault)).unwrap());
        // Cap reached after the first line.
        assert!(!log.record(&decision(false, RiskClass::BlockedByDefault)).unwrap());
        assert_eq!(log.read_all().unwrap().len(), 1);
    }

    #[test]
    fn sampler_arithmetic() {
        assert!(sample_hit(1.0, 1));
        assert!(sample_hit(1.0, 999));
        assert!(!sample_hit(0.0, 1));
        assert!(sample_hit(0.5, 1));
        assert!(!sample_hit(0.5, 2));
        assert!(sample_hit(0.5, 3));
    }
}
