//! Minimal line-protocol helpers for the write path.
//!
//! The proxy never fully parses a point - it only needs the measurement name
//! to place a line on the ring, a cheap shape check to reject garbage early,
//! and timestamp normalization so every forwarded line carries nanoseconds.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use snafu::Snafu;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Snafu)]
#[allow(missing_copy_implementations)]
pub enum Error {
    #[snafu(display("invalid line: no measurement"))]
    NoMeasurement,

    #[snafu(display("invalid line: bad escape at end of measurement"))]
    DanglingEscape,

    #[snafu(display("invalid precision {precision:?}"))]
    InvalidPrecision { precision: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Write-endpoint timestamp precision.
///
/// The accepted spellings mirror the InfluxDB 1.x write API: `n`, `ns`, `u`,
/// `ms`, `s`, `m`, `h`. An empty string means nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
}

impl Default for Precision {
    fn default() -> Self {
        Self::Nanoseconds
    }
}

impl Precision {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "" | "n" | "ns" => Ok(Self::Nanoseconds),
            "u" => Ok(Self::Microseconds),
            "ms" => Ok(Self::Milliseconds),
            "s" => Ok(Self::Seconds),
            "m" => Ok(Self::Minutes),
            "h" => Ok(Self::Hours),
            other => InvalidPrecisionSnafu { precision: other }.fail(),
        }
    }

    /// Multiplier from a timestamp in this precision to nanoseconds.
    pub fn factor(&self) -> i64 {
        match self {
            Self::Nanoseconds => 1,
            Self::Microseconds => 1_000,
            Self::Milliseconds => 1_000_000,
            Self::Seconds => 1_000_000_000,
            Self::Minutes => 60 * 1_000_000_000,
            Self::Hours => 3600 * 1_000_000_000,
        }
    }
}

/// Wall-clock nanoseconds since the Unix epoch.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

/// Extract the measurement name from a line, unescaping `\,`, `\ ` and `\\`.
///
/// The measurement runs from the start of the line to the first unescaped
/// comma or space. Returns the unescaped name together with the byte offset
/// where it ends, so callers can validate the remainder of the line.
pub fn scan_key(line: &[u8]) -> Result<(String, usize)> {
    let mut meas = Vec::with_capacity(16);
    let mut i = 0;
    while i < line.len() {
        match line[i] {
            b'\\' => {
                if i + 1 >= line.len() {
                    return DanglingEscapeSnafu.fail();
                }
                meas.push(line[i + 1]);
                i += 2;
            }
            b',' | b' ' => break,
            c => {
                meas.push(c);
                i += 1;
            }
        }
    }
    if meas.is_empty() {
        return NoMeasurementSnafu.fail();
    }
    // Measurements are required to be UTF-8; invalid bytes never place
    // correctly on the ring and get rejected here.
    let meas = String::from_utf8(meas).map_err(|_| Error::NoMeasurement)?;
    Ok((meas, i))
}

/// Cheap shape validation for everything after the measurement token.
///
/// Accepts iff the remainder contains an unescaped space followed by at least
/// one `key=value` field pair, and carries no control bytes or invalid UTF-8.
pub fn rapid_check(tail: &[u8]) -> bool {
    if std::str::from_utf8(tail).is_err() {
        return false;
    }
    let mut saw_space = false;
    let mut saw_eq = false;
    let mut i = 0;
    while i < tail.len() {
        match tail[i] {
            b'\\' => i += 1,
            b' ' if !saw_space => saw_space = true,
            b'=' if saw_space => saw_eq = true,
            c if c < 0x20 && c != b'\n' && c != b'\t' => return false,
            _ => {}
        }
        i += 1;
    }
    saw_space && saw_eq
}

/// Normalize a line to carry a timestamp.
///
/// A line whose final whitespace-separated token parses as an integer
/// already has a timestamp and is passed through verbatim; otherwise the
/// current wall clock in nanoseconds, truncated to the request's precision,
/// is appended.
pub fn append_nanos(line: &[u8], precision: Precision) -> Vec<u8> {
    let trimmed = trim_ascii(line);

    if let Some(pos) = trimmed.iter().rposition(|&c| c == b' ') {
        let last = &trimmed[pos + 1..];
        if std::str::from_utf8(last)
            .unwrap_or("")
            .parse::<i64>()
            .is_ok()
        {
            return trimmed.to_vec();
        }
    }

    let factor = precision.factor();
    let nanos = (now_nanos() / factor) * factor;
    let mut out = trimmed.to_vec();
    out.push(b' ');
    out.extend_from_slice(nanos.to_string().as_bytes());
    out
}

fn trim_ascii(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|c| !c.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|c| !c.is_ascii_whitespace())
        .map(|p| p + 1)
        .unwrap_or(start);
    &line[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_key_plain() {
        assert_eq!(scan_key(b"cpu,host=h1 v=1").unwrap(), ("cpu".to_string(), 3));
        assert_eq!(scan_key(b"cpu v=1").unwrap(), ("cpu".to_string(), 3));
    }

    #[test]
    fn scan_key_escaped() {
        let (meas, end) = scan_key(br"c\,pu,host=h1 v=1").unwrap();
        assert_eq!(meas, "c,pu");
        assert_eq!(end, 5);
        let (meas, _) = scan_key(br"c\ pu v=1").unwrap();
        assert_eq!(meas, "c pu");
    }

    #[test]
    fn scan_key_empty_line() {
        assert!(scan_key(b"").is_err());
        assert!(scan_key(b",host=h1 v=1").is_err());
    }

    #[test]
    fn scan_key_dangling_escape() {
        assert!(scan_key(br"cpu\").is_err());
    }

    #[test]
    fn rapid_check_accepts_fields() {
        let line = b"cpu,host=h1 v=1 1000000000";
        let (_, end) = scan_key(line).unwrap();
        assert!(rapid_check(&line[end..]));
    }

    #[test]
    fn rapid_check_rejects_missing_fields() {
        assert!(!rapid_check(b",host=h1"));
        assert!(!rapid_check(b" novalue"));
    }

    #[test]
    fn rapid_check_rejects_binary() {
        assert!(!rapid_check(b",host=h1 v=1\x00"));
        assert!(!rapid_check(&[b' ', b'v', b'=', 0xff, 0xfe]));
    }

    #[test]
    fn append_nanos_preserves_existing() {
        let out = append_nanos(b"cpu,host=h1 v=1 1000000000", Precision::Nanoseconds);
        assert_eq!(out, b"cpu,host=h1 v=1 1000000000");
    }

    #[test]
    fn append_nanos_preserves_existing_regardless_of_precision() {
        // An explicit timestamp is never rewritten, whatever the request's
        // precision says.
        for precision in [
            Precision::Seconds,
            Precision::Milliseconds,
            Precision::Minutes,
            Precision::Hours,
        ] {
            let out = append_nanos(b"cpu,host=h1 v=1 5", precision);
            assert_eq!(out, b"cpu,host=h1 v=1 5", "{precision:?}");
        }
    }

    #[test]
    fn append_nanos_appends_when_missing() {
        let before = now_nanos();
        let out = append_nanos(b"cpu,host=h1 v=1", Precision::Nanoseconds);
        let s = std::str::from_utf8(&out).unwrap();
        let ts: i64 = s.rsplit(' ').next().unwrap().parse().unwrap();
        assert!(ts >= before);
        assert!(s.starts_with("cpu,host=h1 v=1 "));
    }

    #[test]
    fn append_nanos_truncates_to_precision() {
        let out = append_nanos(b"cpu v=1", Precision::Seconds);
        let s = std::str::from_utf8(&out).unwrap();
        let ts: i64 = s.rsplit(' ').next().unwrap().parse().unwrap();
        assert_eq!(ts % 1_000_000_000, 0);
    }

    #[test]
    fn precision_parse() {
        assert_eq!(Precision::parse("").unwrap(), Precision::Nanoseconds);
        assert_eq!(Precision::parse("ms").unwrap(), Precision::Milliseconds);
        assert!(Precision::parse("fortnight").is_err());
    }
}
