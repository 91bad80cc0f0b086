//! Resource-size and TTL parsing for aibox.
//!
//! Policy documents and environment configuration carry resource limits as
//! human strings (`8g`, `512m`, `20g`) and credential TTLs as humantime
//! durations (`15m`, `2h`). The tighten-only policy merge compares both
//! numerically, so parsing must be strict: an invalid string in a child
//! policy fails the merge rather than silently passing.
//!
//! # Example
//!
//! ```
//! use aibox_units::{parse_size, parse_ttl};
//! use std::time::Duration;
//!
//! assert_eq!(parse_size("512m").unwrap(), 512 * 1024 * 1024);
//! assert_eq!(parse_size("8g").unwrap(), 8 * 1024 * 1024 * 1024);
//! assert_eq!(parse_ttl("15m").unwrap(), Duration::from_secs(900));
//! ```

use std::time::Duration;

use anyhow::{Context, Result, bail};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;
const TIB: u64 = 1024 * GIB;

/// Parse a human resource string into a byte count.
///
/// Accepts an integer or decimal number followed by an optional binary
/// suffix `k`, `m`, `g`, or `t` (case-insensitive, optional trailing `b`,
/// e.g. `512mb`). A bare number is taken literally, which also makes this
/// usable for CPU counts (`4`, `2.5` — compared at multiplier 1).
pub fn parse_size(s: &str) -> Result<u64> {
    let trimmed = s.trim().to_lowercase();
    if trimmed.is_empty() {
        bail!("empty size string");
    }

    let numeric_end = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(numeric_end);

    let multiplier = match suffix.trim_end_matches('b') {
        "" => 1,
        "k" => KIB,
        "m" => MIB,
        "g" => GIB,
        "t" => TIB,
        other => bail!("unknown size suffix {other:?} in {s:?}"),
    };

    // Whole numbers stay in integer arithmetic; f64 would lose precision
    // above 2^53.
    if let Ok(whole) = number.parse::<u64>() {
        return whole
            .checked_mul(multiplier)
            .with_context(|| format!("size overflows: {s}"));
    }

    let value: f64 = number
        .parse()
        .with_context(|| format!("invalid size: {s}"))?;
    if value < 0.0 || !value.is_finite() {
        bail!("invalid size: {s}");
    }
    Ok((value * multiplier as f64).round() as u64)
}

/// Render a byte count back into the shortest exact binary-suffix form.
///
/// Values that are not whole multiples of a suffix fall back to plain
/// bytes.
pub fn format_size(bytes: u64) -> String {
    for (unit, suffix) in [(TIB, "t"), (GIB, "g"), (MIB, "m"), (KIB, "k")] {
        if bytes >= unit && bytes % unit == 0 {
            return format!("{}{}", bytes / unit, suffix);
        }
    }
    bytes.to_string()
}

/// Parse a credential TTL (humantime syntax: `90s`, `15m`, `2h 30m`).
pub fn parse_ttl(s: &str) -> Result<Duration> {
    humantime::parse_duration(s.trim()).with_context(|| format!("invalid duration: {s}"))
}

/// Render a duration in humantime syntax.
pub fn format_ttl(d: Duration) -> String {
    humantime::format_duration(d).to_string()
}

/// Serde adapter for optional humantime duration fields.
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use std::time::Duration;
///
/// #[derive(Serialize, Deserialize)]
/// struct Knobs {
///     #[serde(default, with = "aibox_units::opt_ttl")]
///     timeout: Option<Duration>,
/// }
/// ```
pub mod opt_ttl {
    pub use humantime_serde::option::{deserialize, serialize};
}
