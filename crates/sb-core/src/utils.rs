use std::{sync::OnceLock, time::Duration};

use chrono::{DateTime, Utc};
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::{
    domain::{AlertHash, Ldap},
    errors::Error,
    Result,
};

// ============== Alert Hashing ==============

/// Hash identifying a newly created alert.
///
/// Fields are length-prefixed so `("ab", "c")` and `("a", "bc")` differ; the
/// creation time keeps repeated identical alerts distinct.
pub fn alert_hash(
    ldap: &Ldap,
    title: &str,
    description: &str,
    reason: &str,
    url: &str,
    created_at: DateTime<Utc>,
) -> AlertHash {
    let mut hasher = Sha256::new();
    for field in [ldap.as_str(), title, description, reason, url] {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field.as_bytes());
    }
    let nanos = created_at.timestamp_nanos_opt().unwrap_or_default();
    hasher.update(nanos.to_be_bytes());
    AlertHash(hex::encode(hasher.finalize()))
}

// ============== Durations ==============

pub const MAX_IGNORE_DURATION: Duration = Duration::from_secs(7 * 24 * 3600);

fn duration_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^(?:(\d+)d)?(?:(\d+)h)?(?:(\d+)m)?(?:(\d+)s)?$").expect("valid regex"))
}

/// Parse `30m`, `4h`, `2d`, `1h30m`. A bare number means minutes.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(Error::InvalidInput("empty duration".to_string()));
    }
    if let Ok(mins) = s.parse::<u64>() {
        return Ok(Duration::from_secs(mins.saturating_mul(60)));
    }

    let caps = duration_re()
        .captures(s)
        .ok_or_else(|| Error::InvalidInput(format!("invalid duration {s:?}")))?;

    let mut secs = 0u64;
    for (idx, unit) in [(1usize, 86_400u64), (2, 3600), (3, 60), (4, 1)] {
        if let Some(m) = caps.get(idx) {
            let n: u64 = m
                .as_str()
                .parse()
                .map_err(|_| Error::InvalidInput(format!("invalid duration {s:?}")))?;
            secs = secs.saturating_add(n.saturating_mul(unit));
        }
    }
    if secs == 0 {
        return Err(Error::InvalidInput(format!("invalid duration {s:?}")));
    }
    Ok(Duration::from_secs(secs))
}

/// Render a duration the way users type it (`1h30m`).
pub fn format_duration(d: Duration) -> String {
    let mut secs = d.as_secs();
    if secs == 0 {
        return "0m".to_string();
    }
    let mut out = String::new();
    for (unit, label) in [(86_400u64, 'd'), (3600, 'h'), (60, 'm')] {
        if secs >= unit {
            out.push_str(&format!("{}{label}", secs / unit));
            secs %= unit;
        }
    }
    if secs > 0 || out.is_empty() {
        out.push_str(&format!("{secs}s"));
    }
    out
}

// ============== Text ==============

/// Truncate on a char boundary, appending `…` when cut.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn alert_hash_is_hex_and_time_sensitive() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let t1 = t0 + chrono::Duration::nanoseconds(1);
        let ldap = Ldap::new("alice");
        let a = alert_hash(&ldap, "t", "d", "r", "", t0);
        let b = alert_hash(&ldap, "t", "d", "r", "", t1);
        assert!(AlertHash::is_well_formed(a.as_str()));
        assert_ne!(a, b);
        assert_eq!(a, alert_hash(&ldap, "t", "d", "r", "", t0));
        assert_ne!(
            alert_hash(&ldap, "ab", "c", "r", "", t0),
            alert_hash(&ldap, "a", "bc", "r", "", t0)
        );
    }

    #[test]
    fn parse_duration_accepts_compound_units() {
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("4h").unwrap(), Duration::from_secs(4 * 3600));
        assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(2 * 86_400));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("15").unwrap(), Duration::from_secs(900));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("0h").is_err());
    }

    #[test]
    fn format_duration_round_trips_common_values() {
        assert_eq!(format_duration(Duration::from_secs(5400)), "1h30m");
        assert_eq!(format_duration(Duration::from_secs(86_400)), "1d");
        assert_eq!(format_duration(Duration::from_secs(45)), "45s");
    }

    #[test]
    fn truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("héllo", 10), "héllo");
        assert_eq!(truncate_chars("héllo", 3), "hé…");
    }
}
