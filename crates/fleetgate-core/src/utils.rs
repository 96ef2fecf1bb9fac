//! Small shared helpers

use chrono::{DateTime, Duration, Utc};

/// Maximum tolerated skew between a device clock and the wall clock
pub const MAX_CLOCK_SKEW_DAYS: i64 = 20;

/// Replace a device timestamp that is more than [`MAX_CLOCK_SKEW_DAYS`]
/// away from `now` (in either direction) with `now` itself.
///
/// Returns the timestamp to persist and whether a substitution happened,
/// so callers can count misbehaving device clocks.
#[must_use]
pub fn clamp_stale_timestamp(ts: DateTime<Utc>, now: DateTime<Utc>) -> (DateTime<Utc>, bool) {
    let skew = (now - ts).abs();
    if skew > Duration::days(MAX_CLOCK_SKEW_DAYS) {
        (now, true)
    } else {
        (ts, false)
    }
}

/// Format a 6-byte MAC as `aa:bb:cc:dd:ee:ff`
#[must_use]
pub fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

/// Unix seconds to UTC, clamping nonsense values to the epoch
#[must_use]
pub fn unix_to_utc(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_else(|| DateTime::from_timestamp(0, 0).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn fresh_timestamp_is_kept() {
        let now = Utc::now();
        let ts = now - Duration::hours(3);
        let (kept, substituted) = clamp_stale_timestamp(ts, now);
        assert_eq!(kept, ts);
        assert!(!substituted);
    }

    #[test]
    fn stale_timestamp_is_replaced_in_both_directions() {
        let now = Utc::now();

        let past = now - Duration::days(MAX_CLOCK_SKEW_DAYS + 1);
        let (kept, substituted) = clamp_stale_timestamp(past, now);
        assert_eq!(kept, now);
        assert!(substituted);

        // A clock running ahead is just as wrong as one running behind
        let future = now + Duration::days(MAX_CLOCK_SKEW_DAYS + 1);
        let (kept, substituted) = clamp_stale_timestamp(future, now);
        assert_eq!(kept, now);
        assert!(substituted);
    }

    #[test]
    fn skew_at_exactly_twenty_days_is_kept() {
        let now = Utc::now();
        let ts = now - Duration::days(MAX_CLOCK_SKEW_DAYS);
        let (kept, substituted) = clamp_stale_timestamp(ts, now);
        assert_eq!(kept, ts);
        assert!(!substituted);
    }

    #[test]
    fn mac_formatting() {
        assert_eq!(
            format_mac(&[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]),
            "aa:bb:cc:dd:ee:ff"
        );
        assert_eq!(format_mac(&[0, 1, 2, 3, 4, 5]), "00:01:02:03:04:05");
    }

    #[test]
    fn unix_conversion() {
        let ts = unix_to_utc(1_735_689_600); // 2025-01-01T00:00:00Z
        assert_eq!(ts.to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }
}
