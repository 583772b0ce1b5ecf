//! Time helpers shared by every simulation in the engine.
//!
//! All simulations step on a fixed grid (5 minutes by default) anchored at the
//! Unix epoch, so floor/ceil here define where effect timelines land.

use crate::types::TimelineValue;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Default step between simulated timeline points
pub fn default_delta() -> Duration {
    Duration::minutes(5)
}

/// Duration as fractional seconds
pub fn seconds(d: Duration) -> f64 {
    match d.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        None => d.num_milliseconds() as f64 / 1_000.0,
    }
}

/// Duration as fractional hours
pub fn hours(d: Duration) -> f64 {
    seconds(d) / 3600.0
}

/// Build a duration from fractional seconds (microsecond resolution)
pub fn from_seconds(s: f64) -> Duration {
    Duration::microseconds((s * 1_000_000.0).round() as i64)
}

/// Seconds elapsed from `since` to `date` (negative when `date` is earlier)
pub fn interval(date: DateTime<Utc>, since: DateTime<Utc>) -> f64 {
    seconds(date - since)
}

/// Round `date` down onto the `delta` grid
pub fn floored(date: DateTime<Utc>, delta: Duration) -> DateTime<Utc> {
    let step = delta.num_seconds().max(1);
    let rem = date.timestamp().rem_euclid(step);
    date - Duration::seconds(rem) - Duration::nanoseconds(i64::from(date.timestamp_subsec_nanos()))
}

/// Round `date` up onto the `delta` grid
pub fn ceiled(date: DateTime<Utc>, delta: Duration) -> DateTime<Utc> {
    let floor = floored(date, delta);
    if floor == date {
        date
    } else {
        floor + Duration::seconds(delta.num_seconds().max(1))
    }
}

/// Grid-aligned `(start, end)` covering `samples` plus `duration + delay`.
///
/// Explicit bounds win over the sample-derived ones. Returns `None` for an
/// empty sample set.
pub fn simulation_date_range<T: TimelineValue>(
    samples: &[T],
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    duration: Duration,
    delay: Duration,
    delta: Duration,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let first = samples.first()?;

    if let (Some(start), Some(end)) = (start, end) {
        return Some((floored(start, delta), ceiled(end, delta)));
    }

    let mut min_date = first.start_date();
    let mut max_date = min_date;
    for sample in samples {
        min_date = min_date.min(sample.start_date());
        max_date = max_date.max(sample.end_date());
    }

    Some((
        floored(start.unwrap_or(min_date), delta),
        ceiled(end.unwrap_or(max_date + duration + delay), delta),
    ))
}

/// A closed interval of time
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateInterval {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end: end.max(start) }
    }

    pub fn with_duration(start: DateTime<Utc>, duration: Duration) -> Self {
        Self::new(start, start + duration)
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn contains(&self, date: DateTime<Utc>) -> bool {
        self.start <= date && date <= self.end
    }

    /// Overlap of two intervals, if they touch at all
    pub fn intersection(&self, other: &DateInterval) -> Option<DateInterval> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start <= end).then_some(DateInterval { start, end })
    }
}

/// Serialize a `chrono::Duration` as fractional seconds.
pub mod serde_seconds {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(super::seconds(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(super::from_seconds(f64::deserialize(d)?))
    }
}

/// Same as [`serde_seconds`] for optional durations.
pub mod serde_seconds_opt {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&super::seconds(*d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<f64>::deserialize(d)?.map(super::from_seconds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_floor_and_ceil_on_five_minute_grid() {
        let date = Utc.with_ymd_and_hms(2015, 7, 13, 12, 2, 37).unwrap();
        assert_eq!(
            floored(date, default_delta()),
            Utc.with_ymd_and_hms(2015, 7, 13, 12, 0, 0).unwrap()
        );
        assert_eq!(
            ceiled(date, default_delta()),
            Utc.with_ymd_and_hms(2015, 7, 13, 12, 5, 0).unwrap()
        );
    }

    #[test]
    fn test_ceil_keeps_grid_dates() {
        let date = Utc.with_ymd_and_hms(2024, 1, 3, 12, 0, 0).unwrap();
        assert_eq!(ceiled(date, default_delta()), date);
        assert_eq!(floored(date, default_delta()), date);
    }

    #[test]
    fn test_simulation_range_extends_past_last_sample() {
        let date = Utc.with_ymd_and_hms(2015, 7, 13, 12, 2, 37).unwrap();
        let samples = vec![crate::types::GlucoseEffect::new(date, 100.0)];
        let (start, end) = simulation_date_range(
            &samples,
            None,
            None,
            Duration::minutes(60),
            Duration::zero(),
            default_delta(),
        )
        .unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2015, 7, 13, 12, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2015, 7, 13, 13, 5, 0).unwrap());

        let empty: Vec<crate::types::GlucoseEffect> = Vec::new();
        assert!(simulation_date_range(&empty, None, None, Duration::zero(), Duration::zero(), default_delta()).is_none());
    }

    #[test]
    fn test_interval_intersection() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 3, 12, 0, 0).unwrap();
        let a = DateInterval::with_duration(t0, Duration::minutes(30));
        let b = DateInterval::with_duration(t0 + Duration::minutes(20), Duration::minutes(30));
        let overlap = a.intersection(&b).unwrap();
        assert_eq!(overlap.duration(), Duration::minutes(10));
        assert!(a
            .intersection(&DateInterval::with_duration(t0 + Duration::hours(1), Duration::minutes(5)))
            .is_none());
    }
}
