// Copyright 2025-Present The SLE Authors
// SPDX-License-Identifier: Apache-2.0

//! Line enrichment: leading-timestamp detection and log-level extraction.

use std::sync::LazyLock;

use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use regex::Regex;

/// How far into the (post-timestamp) line the level scan looks.
const LEVEL_SCAN_WINDOW: usize = 64;

/// Result of enriching one raw line.
#[derive(Debug, Clone, PartialEq)]
pub struct Enriched {
    /// The line with any detected leading timestamp/level stripped.
    pub text: String,
    /// Extracted or caller-supplied instant, nanoseconds since the epoch.
    pub timestamp_ns: i64,
    pub level: Option<&'static str>,
}

// Timestamp patterns tried in order, anchored at line start with an optional
// leading `[`. The matched prefix plus trailing whitespace/`]` is stripped.
static ISO_TS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\[?(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:[.,]\d{1,9})?(?:Z|[+-]\d{2}:?\d{2})?)[\]\s]*",
    )
    .expect("invalid ISO timestamp pattern")
});
static SPACED_TS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[?(\d{4}-\d{2}-\d{2}) (\d{2}:\d{2}:\d{2}(?:[.,]\d{1,9})?)[\]\s]*")
        .expect("invalid spaced timestamp pattern")
});
static SYSLOG_TS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[?([A-Z][a-z]{2}) +(\d{1,2}) (\d{2}:\d{2}:\d{2})[\]\s]*")
        .expect("invalid syslog timestamp pattern")
});
static EPOCH_TS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[?(\d{13}|\d{10})\b[\]\s]*").expect("invalid epoch timestamp pattern")
});

// Longest alternatives first so the whole token is consumed.
static LEVEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(TRACE|DEBUG|INFO|NOTICE|WARNING|WARN|ERROR|ERR|CRITICAL|CRIT|FATAL|ALERT|EMERGENCY)\b",
    )
    .expect("invalid level pattern")
});

/// Extracts timestamp and level from `raw`, falling back to `now_ns` when the
/// line carries no recognizable timestamp. Pure; never fails.
pub fn enrich(raw: &str, now_ns: i64) -> Enriched {
    let (rest, timestamp_ns) = match strip_timestamp(raw) {
        Some((consumed, ns)) => (&raw[consumed..], ns),
        None => (raw, now_ns),
    };

    let (text, level) = strip_level(rest);

    // Never reduce a line to nothing: keep the original and drop the level.
    if text.is_empty() {
        return Enriched {
            text: raw.to_string(),
            timestamp_ns,
            level: None,
        };
    }

    Enriched {
        text,
        timestamp_ns,
        level,
    }
}

/// Returns `(bytes_to_strip, timestamp_ns)` when a leading timestamp matches.
fn strip_timestamp(line: &str) -> Option<(usize, i64)> {
    if let Some(caps) = ISO_TS.captures(line) {
        if let Some(ns) = parse_iso(&caps[1]) {
            return Some((caps.get(0).map(|m| m.end())?, ns));
        }
    }
    if let Some(caps) = SPACED_TS.captures(line) {
        let joined = format!("{} {}", &caps[1], &caps[2]);
        if let Some(ns) = parse_naive(&joined.replace(',', "."), "%Y-%m-%d %H:%M:%S%.f") {
            return Some((caps.get(0).map(|m| m.end())?, ns));
        }
    }
    if let Some(caps) = SYSLOG_TS.captures(line) {
        if let Some(ns) = parse_syslog(&caps[1], &caps[2], &caps[3]) {
            return Some((caps.get(0).map(|m| m.end())?, ns));
        }
    }
    if let Some(caps) = EPOCH_TS.captures(line) {
        let digits = &caps[1];
        let value: i64 = digits.parse().ok()?;
        let ns = if digits.len() == 13 {
            value.checked_mul(1_000_000)?
        } else {
            value.checked_mul(1_000_000_000)?
        };
        return Some((caps.get(0).map(|m| m.end())?, ns));
    }
    None
}

fn parse_iso(ts: &str) -> Option<i64> {
    let ts = ts.replace(',', ".");
    if let Ok(dt) = chrono::DateTime::parse_from_str(&ts, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return dt.timestamp_nanos_opt();
    }
    if let Some(naive) = ts.strip_suffix('Z') {
        let ndt = NaiveDateTime::parse_from_str(naive, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
        return Utc.from_utc_datetime(&ndt).timestamp_nanos_opt();
    }
    // Zoneless timestamps are read in the machine's local timezone.
    parse_naive(&ts, "%Y-%m-%dT%H:%M:%S%.f")
}

fn parse_naive(ts: &str, format: &str) -> Option<i64> {
    let ndt = NaiveDateTime::parse_from_str(ts, format).ok()?;
    Local
        .from_local_datetime(&ndt)
        .earliest()?
        .timestamp_nanos_opt()
}

/// RFC-3164 has no year; the current one is assumed.
fn parse_syslog(month: &str, day: &str, time: &str) -> Option<i64> {
    let month = match month {
        "Jan" => 1,
        "Feb" => 2,
        "Mar" => 3,
        "Apr" => 4,
        "May" => 5,
        "Jun" => 6,
        "Jul" => 7,
        "Aug" => 8,
        "Sep" => 9,
        "Oct" => 10,
        "Nov" => 11,
        "Dec" => 12,
        _ => return None,
    };
    let day: u32 = day.parse().ok()?;
    let date = NaiveDate::from_ymd_opt(Local::now().year(), month, day)?;
    let time = NaiveTime::parse_from_str(time, "%H:%M:%S").ok()?;
    Local
        .from_local_datetime(&date.and_time(time))
        .earliest()?
        .timestamp_nanos_opt()
}

/// Finds the first bounded level token within the scan window, removes it from
/// the text and returns the normalized level name.
fn strip_level(text: &str) -> (String, Option<&'static str>) {
    let window = &text[..floor_char_boundary(text, LEVEL_SCAN_WINDOW)];
    let Some(m) = LEVEL_RE.find(window) else {
        return (text.to_string(), None);
    };

    let level = normalize_level(m.as_str());
    let before = text[..m.start()].trim_end();
    let after = text[m.end()..].trim_start();
    let stripped = match (before.is_empty(), after.is_empty()) {
        (true, _) => after.to_string(),
        (_, true) => before.to_string(),
        (false, false) => format!("{before} {after}"),
    };
    (stripped, Some(level))
}

fn normalize_level(token: &str) -> &'static str {
    match token.to_ascii_uppercase().as_str() {
        "TRACE" => "TRACE",
        "DEBUG" => "DEBUG",
        "INFO" => "INFO",
        "NOTICE" => "NOTICE",
        "WARN" | "WARNING" => "WARN",
        "ERR" | "ERROR" => "ERROR",
        "CRIT" | "CRITICAL" => "CRITICAL",
        "FATAL" => "FATAL",
        "ALERT" => "ALERT",
        _ => "EMERGENCY",
    }
}

/// Largest valid char boundary <= `idx`, so the scan window never splits a
/// multi-byte character.
fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const NOW: i64 = 1_700_000_000_000_000_000;

    #[test]
    fn iso_with_offset() {
        let e = enrich("2025-10-17T02:26:16+0200 INFO Complete!", NOW);
        assert_eq!(e.timestamp_ns, 1_760_660_776_000_000_000);
        assert_eq!(e.level, Some("INFO"));
        assert_eq!(e.text, "Complete!");
    }

    #[test]
    fn iso_utc_with_fraction() {
        let e = enrich("2025-01-02T03:04:05.123Z started worker", NOW);
        let expected = Utc
            .with_ymd_and_hms(2025, 1, 2, 3, 4, 5)
            .unwrap()
            .timestamp_nanos_opt()
            .unwrap()
            + 123_000_000;
        assert_eq!(e.timestamp_ns, expected);
        assert_eq!(e.level, None);
        assert_eq!(e.text, "started worker");
    }

    #[test]
    fn bracketed_timestamp() {
        let e = enrich("[2025-01-02T03:04:05Z] listening on :8080", NOW);
        assert_eq!(e.text, "listening on :8080");
        assert_ne!(e.timestamp_ns, NOW);
    }

    #[test]
    fn spaced_timestamp_local() {
        let e = enrich("2025-03-04 05:06:07 db WARN slow query", NOW);
        let expected = Local
            .with_ymd_and_hms(2025, 3, 4, 5, 6, 7)
            .earliest()
            .unwrap()
            .timestamp_nanos_opt()
            .unwrap();
        assert_eq!(e.timestamp_ns, expected);
        assert_eq!(e.level, Some("WARN"));
        assert_eq!(e.text, "db slow query");
    }

    #[test]
    fn syslog_timestamp_uses_current_year() {
        let e = enrich("Oct 17 02:26:16 kernel: oom", NOW);
        let expected = Local
            .with_ymd_and_hms(Local::now().year(), 10, 17, 2, 26, 16)
            .earliest()
            .unwrap()
            .timestamp_nanos_opt()
            .unwrap();
        assert_eq!(e.timestamp_ns, expected);
        assert_eq!(e.text, "kernel: oom");
    }

    #[test]
    fn epoch_seconds_and_millis() {
        let e = enrich("1712345678 boot", NOW);
        assert_eq!(e.timestamp_ns, 1_712_345_678_000_000_000);
        assert_eq!(e.text, "boot");

        let e = enrich("1712345678901 boot", NOW);
        assert_eq!(e.timestamp_ns, 1_712_345_678_901_000_000);
        assert_eq!(e.text, "boot");
    }

    #[test]
    fn eleven_digit_number_is_not_a_timestamp() {
        let e = enrich("12345678901 leading id", NOW);
        assert_eq!(e.timestamp_ns, NOW);
        assert_eq!(e.text, "12345678901 leading id");
    }

    #[test]
    fn missing_timestamp_falls_back_to_now() {
        let e = enrich("plain message", NOW);
        assert_eq!(e.timestamp_ns, NOW);
        assert_eq!(e.text, "plain message");
        assert_eq!(e.level, None);
    }

    #[test]
    fn level_normalization() {
        assert_eq!(enrich("warning: disk", NOW).level, Some("WARN"));
        assert_eq!(enrich("err: disk", NOW).level, Some("ERROR"));
        assert_eq!(enrich("crit: disk", NOW).level, Some("CRITICAL"));
        assert_eq!(enrich("FATAL: disk", NOW).level, Some("FATAL"));
        assert_eq!(enrich("notice: disk", NOW).level, Some("NOTICE"));
    }

    #[test]
    fn level_must_be_bounded() {
        assert_eq!(enrich("INFORMATIONAL stuff", NOW).level, None);
        assert_eq!(enrich("NOTICEABLE stuff", NOW).level, None);
        assert_eq!(enrich("xERROR stuff", NOW).level, None);
    }

    #[test]
    fn level_beyond_window_is_ignored() {
        let line = format!("{} ERROR tail", "x".repeat(70));
        assert_eq!(enrich(&line, NOW).level, None);
    }

    #[test]
    fn never_strips_to_empty() {
        let e = enrich("INFO", NOW);
        assert_eq!(e.text, "INFO");
        assert_eq!(e.level, None);
    }

    #[test]
    fn enrichment_is_idempotent() {
        let first = enrich("2025-10-17T02:26:16+0200 INFO Complete!", NOW);
        let second = enrich(&first.text, NOW);
        assert_eq!(second.text, first.text);
        assert_eq!(second.timestamp_ns, NOW);
    }

    #[test]
    fn multibyte_line_does_not_panic() {
        let e = enrich("───── séparateur ─────", NOW);
        assert_eq!(e.timestamp_ns, NOW);
    }
}
