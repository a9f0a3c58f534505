use chrono::{DateTime, Duration as ChronoDuration, Months, Utc};

// Lower edge of each band. "Now" in seconds is ~1.7e9, in ms ~1.7e12,
// in µs ~1.7e15 and in ns ~1.7e18.
const NANOS_FLOOR: i64 = 100_000_000_000_000_000;
const MICROS_FLOOR: i64 = 100_000_000_000_000;
const MILLIS_FLOOR: i64 = 100_000_000_000;

const MAX_AGE: Months = Months::new(12 * 10);
const MAX_LEAD_HOURS: i64 = 24;

/// Unit guessed for an epoch value of unknown precision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EpochUnit {
    Seconds,
    Millis,
    Micros,
    Nanos,
}

impl EpochUnit {
    pub fn classify(value: i64) -> Self {
        if value >= NANOS_FLOOR {
            EpochUnit::Nanos
        } else if value >= MICROS_FLOOR {
            EpochUnit::Micros
        } else if value >= MILLIS_FLOOR {
            EpochUnit::Millis
        } else {
            EpochUnit::Seconds
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EpochUnit::Seconds => "s",
            EpochUnit::Millis => "ms",
            EpochUnit::Micros => "us",
            EpochUnit::Nanos => "ns",
        }
    }

    /// `None` when the value does not fit chrono's representable range.
    pub fn to_datetime(self, value: i64) -> Option<DateTime<Utc>> {
        match self {
            EpochUnit::Nanos => Some(DateTime::from_timestamp_nanos(value)),
            EpochUnit::Micros => DateTime::from_timestamp_micros(value),
            EpochUnit::Millis => DateTime::from_timestamp_millis(value),
            EpochUnit::Seconds => DateTime::from_timestamp(value, 0),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimestampSource {
    Payload(EpochUnit),
    Broker,
}

impl std::fmt::Display for TimestampSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimestampSource::Payload(unit) => write!(f, "ts_ns({})", unit.as_str()),
            TimestampSource::Broker => f.write_str("broker"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub source: TimestampSource,
    pub timestamp: Option<DateTime<Utc>>,
    pub valid: bool,
}

impl Resolution {
    /// The resolved timestamp, only if it passed the sanity window.
    pub fn accepted(&self) -> Option<DateTime<Utc>> {
        self.timestamp.filter(|_| self.valid)
    }
}

/// Picks the payload override when present and positive, otherwise the
/// broker receipt time, and checks it against the window around `now`.
pub fn resolve(
    override_value: Option<i64>,
    fallback: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Resolution {
    let (source, timestamp) = match override_value.filter(|value| *value > 0) {
        Some(value) => {
            let unit = EpochUnit::classify(value);
            (TimestampSource::Payload(unit), unit.to_datetime(value))
        }
        None => (TimestampSource::Broker, Some(fallback)),
    };

    let valid = timestamp
        .map(|ts| within_window(ts, now))
        .unwrap_or(false);

    Resolution {
        source,
        timestamp,
        valid,
    }
}

/// `[now - 10 years, now + 24h]`, both edges inclusive.
pub fn within_window(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    let earliest = now.checked_sub_months(MAX_AGE);
    let latest = now.checked_add_signed(ChronoDuration::hours(MAX_LEAD_HOURS));
    match (earliest, latest) {
        (Some(earliest), Some(latest)) => timestamp >= earliest && timestamp <= latest,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn classifies_band_edges() {
        assert_eq!(EpochUnit::classify(99_999_999_999_999_999), EpochUnit::Micros);
        assert_eq!(EpochUnit::classify(100_000_000_000_000_000), EpochUnit::Nanos);
        assert_eq!(EpochUnit::classify(99_999_999_999_999), EpochUnit::Millis);
        assert_eq!(EpochUnit::classify(100_000_000_000_000), EpochUnit::Micros);
        assert_eq!(EpochUnit::classify(99_999_999_999), EpochUnit::Seconds);
        assert_eq!(EpochUnit::classify(100_000_000_000), EpochUnit::Millis);
        assert_eq!(EpochUnit::classify(1), EpochUnit::Seconds);
    }

    #[test]
    fn same_instant_in_every_unit_resolves_identically() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap();
        let secs = expected.timestamp();
        for value in [secs, secs * 1_000, secs * 1_000_000, secs * 1_000_000_000] {
            let first = resolve(Some(value), now(), now());
            let second = resolve(Some(value), now(), now());
            assert_eq!(first, second);
            assert_eq!(first.accepted(), Some(expected), "value {value}");
        }
    }

    #[test]
    fn millisecond_override_is_converted() {
        let resolved = resolve(Some(1_700_000_000_000), now(), now());
        assert_eq!(resolved.source, TimestampSource::Payload(EpochUnit::Millis));
        assert_eq!(
            resolved.timestamp.map(|ts| ts.timestamp_nanos_opt()),
            Some(Some(1_700_000_000_000_000_000))
        );
        assert!(resolved.valid);
    }

    #[test]
    fn missing_or_non_positive_override_uses_broker_time() {
        let fallback = now() - ChronoDuration::minutes(3);
        for override_value in [None, Some(0), Some(-5)] {
            let resolved = resolve(override_value, fallback, now());
            assert_eq!(resolved.source, TimestampSource::Broker);
            assert_eq!(resolved.accepted(), Some(fallback));
        }
    }

    #[test]
    fn far_future_nanos_are_rejected() {
        let resolved = resolve(Some(99_999_999_999_999_999), now(), now());
        assert_eq!(resolved.source, TimestampSource::Payload(EpochUnit::Micros));
        assert!(!resolved.valid);
        assert_eq!(resolved.accepted(), None);
    }

    #[test]
    fn window_edges_are_inclusive() {
        let now = now();
        let earliest = Utc.with_ymd_and_hms(2014, 3, 1, 12, 0, 0).unwrap();
        assert!(within_window(earliest, now));
        assert!(!within_window(earliest - ChronoDuration::nanoseconds(1), now));
        let latest = now + ChronoDuration::hours(24);
        assert!(within_window(latest, now));
        assert!(!within_window(latest + ChronoDuration::nanoseconds(1), now));
    }

    #[test]
    fn small_second_values_fall_outside_window() {
        let resolved = resolve(Some(42), now(), now());
        assert_eq!(resolved.source, TimestampSource::Payload(EpochUnit::Seconds));
        assert!(!resolved.valid);
    }

    #[test]
    fn stale_broker_time_is_rejected() {
        let fallback = Utc.with_ymd_and_hms(2001, 1, 1, 0, 0, 0).unwrap();
        assert!(!resolve(None, fallback, now()).valid);
    }
}
