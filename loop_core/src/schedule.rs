//! Scheduled timelines: basal rates, sensitivities, carb ratios and targets
//! expressed as absolute, time-bounded constant segments.

use crate::types::TimelineValue;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// One constant-value segment of a schedule
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AbsoluteScheduleValue<T> {
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub value: T,
}

impl<T> AbsoluteScheduleValue<T> {
    pub fn new(start_date: DateTime<Utc>, end_date: DateTime<Utc>, value: T) -> Self {
        Self {
            start_date,
            end_date,
            value,
        }
    }

    pub fn duration(&self) -> Duration {
        self.end_date - self.start_date
    }
}

impl<T> TimelineValue for AbsoluteScheduleValue<T> {
    fn start_date(&self) -> DateTime<Utc> {
        self.start_date
    }

    fn end_date(&self) -> DateTime<Utc> {
        self.end_date
    }
}

/// Inclusive glucose range in mg/dL
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GlucoseRange {
    pub lower_bound: f64,
    pub upper_bound: f64,
}

impl GlucoseRange {
    pub fn new(lower_bound: f64, upper_bound: f64) -> Self {
        Self {
            lower_bound,
            upper_bound,
        }
    }

    pub fn average(&self) -> f64 {
        (self.lower_bound + self.upper_bound) / 2.0
    }
}

/// Basal rate timeline in U/hr
pub type BasalTimeline = [AbsoluteScheduleValue<f64>];
/// Insulin sensitivity timeline in mg/dL per U
pub type SensitivityTimeline = [AbsoluteScheduleValue<f64>];
/// Carb ratio timeline in g per U
pub type CarbRatioTimeline = [AbsoluteScheduleValue<f64>];
/// Correction range timeline
pub type GlucoseRangeTimeline = [AbsoluteScheduleValue<GlucoseRange>];

/// Last segment whose start is at or before `date`.
///
/// The segment's end is not checked; coverage is validated by callers.
pub fn closest_prior<T>(
    timeline: &[AbsoluteScheduleValue<T>],
    date: DateTime<Utc>,
) -> Option<&AbsoluteScheduleValue<T>> {
    timeline.iter().take_while(|s| s.start_date <= date).last()
}

/// Segments overlapping `[start, end]`, returned whole
pub fn filter_date_range<T>(
    timeline: &[AbsoluteScheduleValue<T>],
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Vec<&AbsoluteScheduleValue<T>> {
    timeline
        .iter()
        .filter(|s| start.map_or(true, |start| s.end_date >= start))
        .filter(|s| end.map_or(true, |end| s.start_date <= end))
        .collect()
}

/// Segments clipped to `[from, to]`; empty results are dropped
pub fn trimmed<T: Clone>(
    timeline: &[AbsoluteScheduleValue<T>],
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> Vec<AbsoluteScheduleValue<T>> {
    timeline
        .iter()
        .filter_map(|s| {
            if from.map_or(false, |from| s.end_date < from) {
                return None;
            }
            if to.map_or(false, |to| s.start_date > to) {
                return None;
            }
            let start_date = from.map_or(s.start_date, |from| from.max(s.start_date));
            let end_date = to.map_or(s.end_date, |to| to.min(s.end_date));
            (start_date < end_date)
                .then(|| AbsoluteScheduleValue::new(start_date, end_date, s.value.clone()))
        })
        .collect()
}

/// Value of the segment that contains `date`, if any segment does
pub fn value_at<T: Copy>(timeline: &[AbsoluteScheduleValue<T>], date: DateTime<Utc>) -> Option<T> {
    closest_prior(timeline, date)
        .filter(|s| s.end_date >= date)
        .map(|s| s.value)
}
