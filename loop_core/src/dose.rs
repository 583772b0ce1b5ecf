//! Basal-relative doses and the insulin math built on them.
//!
//! Raw deliveries are annotated against the scheduled basal timeline so every
//! dose carries its net effect relative to the insulin already accounted for
//! by the schedule. Insulin on board and glucose effects are computed from
//! that net amount.

use crate::insulin::{InsulinModel, InsulinModelProvider};
use crate::schedule::{self, AbsoluteScheduleValue, BasalTimeline, SensitivityTimeline};
use crate::time::{self, DateInterval};
use crate::types::{DeliveryType, GlucoseEffect, InsulinDose, InsulinType, InsulinValue, TimelineValue};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Longest time any dose is considered active
pub fn default_insulin_activity_duration() -> Duration {
    Duration::hours(6) + Duration::minutes(10)
}

/// Doses no longer than this multiple of the step are treated as instantaneous
const MOMENTARY_DOSE_FACTOR: f64 = 1.05;

/// Whether a basal-relative dose is a bolus or a basal segment
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BasalRelativeDoseKind {
    Bolus,
    #[serde(rename_all = "camelCase")]
    Basal { scheduled_rate: f64 },
}

/// A dose expressed net of the scheduled basal rate during it
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BasalRelativeDose {
    pub kind: BasalRelativeDoseKind,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub volume: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insulin_type: Option<InsulinType>,
}

impl BasalRelativeDose {
    pub fn from_bolus(dose: &InsulinDose) -> Self {
        Self {
            kind: BasalRelativeDoseKind::Bolus,
            start_date: dose.start_date,
            end_date: dose.end_date,
            volume: dose.volume,
            insulin_type: dose.insulin_type,
        }
    }

    pub fn duration(&self) -> Duration {
        self.end_date - self.start_date
    }

    /// Units delivered beyond (or short of) what the schedule already assumed
    pub fn net_basal_units(&self) -> f64 {
        match self.kind {
            BasalRelativeDoseKind::Basal { scheduled_rate } => {
                let hours = time::hours(self.duration());
                if hours <= 0.0 {
                    return 0.0;
                }
                self.volume - scheduled_rate * hours
            }
            BasalRelativeDoseKind::Bolus => self.volume,
        }
    }

    fn is_momentary(&self, delta: f64) -> bool {
        time::seconds(self.duration()) <= MOMENTARY_DOSE_FACTOR * delta
    }

    /// Sums `f(time - offset)` over `delta`-sized sub-segments of the dose,
    /// weighting each by the fraction of the dose it represents.
    fn integrate_continuous<F: Fn(f64) -> f64>(
        &self,
        date: DateTime<Utc>,
        model: &dyn InsulinModel,
        delta: f64,
        f: F,
    ) -> f64 {
        let dose_duration = time::seconds(self.duration());
        let t = time::interval(date, self.start_date);
        let delay = time::seconds(model.delay());
        let last_offset = (((t + delay) / delta).floor() * delta).min(dose_duration);

        let mut total = 0.0;
        let mut offset = 0.0;
        loop {
            let segment = if dose_duration > 0.0 {
                ((offset + delta).min(dose_duration) - offset).max(0.0) / dose_duration
            } else {
                1.0
            };
            total += segment * f(t - offset);
            offset += delta;
            if offset > last_offset {
                break;
            }
        }
        total
    }

    fn continuous_percent_effect(&self, date: DateTime<Utc>, model: &dyn InsulinModel, delta: f64) -> f64 {
        self.integrate_continuous(date, model, delta, |t| 1.0 - model.percent_effect_remaining(t))
    }

    /// Units still active at `date`
    pub fn insulin_on_board(&self, date: DateTime<Utc>, model: &dyn InsulinModel, delta: Duration) -> f64 {
        let t = time::interval(date, self.start_date);
        if t < 0.0 {
            return 0.0;
        }
        let delta = time::seconds(delta);

        if self.is_momentary(delta) {
            self.net_basal_units() * model.percent_effect_remaining(t)
        } else {
            self.net_basal_units()
                * self.integrate_continuous(date, model, delta, |t| model.percent_effect_remaining(t))
        }
    }

    /// Cumulative glucose effect (mg/dL) of this dose at `date`
    pub fn glucose_effect_at(
        &self,
        date: DateTime<Utc>,
        model: &dyn InsulinModel,
        insulin_sensitivity: f64,
        delta: Duration,
    ) -> f64 {
        let t = time::interval(date, self.start_date);
        if t < 0.0 {
            return 0.0;
        }
        let delta = time::seconds(delta);

        let percent_effect = if self.is_momentary(delta) {
            1.0 - model.percent_effect_remaining(t)
        } else {
            self.continuous_percent_effect(date, model, delta)
        };
        self.net_basal_units() * -insulin_sensitivity * percent_effect
    }

    /// Glucose effect (mg/dL) of this dose accrued within `interval`
    pub fn glucose_effect_during(
        &self,
        interval: DateInterval,
        model: &dyn InsulinModel,
        insulin_sensitivity: f64,
        delta: Duration,
    ) -> f64 {
        let start = time::interval(interval.start, self.start_date);
        let end = time::interval(interval.end, self.start_date);
        if end - start < 0.0 {
            return 0.0;
        }
        let delta = time::seconds(delta);

        let effect = if self.is_momentary(delta) {
            model.percent_effect_remaining(start) - model.percent_effect_remaining(end)
        } else {
            let start_remaining = 1.0 - self.continuous_percent_effect(interval.start, model, delta);
            let end_remaining = 1.0 - self.continuous_percent_effect(interval.end, model, delta);
            start_remaining - end_remaining
        };
        self.net_basal_units() * -insulin_sensitivity * effect
    }
}

impl TimelineValue for BasalRelativeDose {
    fn start_date(&self) -> DateTime<Utc> {
        self.start_date
    }

    fn end_date(&self) -> DateTime<Utc> {
        self.end_date
    }
}

// ============================================================================
// Basal Annotation
// ============================================================================

impl InsulinDose {
    /// Split a basal dose at every scheduled-rate boundary.
    ///
    /// `basal_items` must be the schedule segments overlapping the dose. Volume
    /// is apportioned by time fraction.
    pub fn annotated(&self, basal_items: &[&AbsoluteScheduleValue<f64>]) -> Vec<BasalRelativeDose> {
        if self.delivery_type == DeliveryType::Bolus {
            return vec![BasalRelativeDose::from_bolus(self)];
        }

        let duration = time::seconds(self.duration());
        let mut doses = Vec::with_capacity(basal_items.len());

        for (index, item) in basal_items.iter().enumerate() {
            let start = if index == 0 { self.start_date } else { item.start_date };
            let end = match basal_items.get(index + 1) {
                Some(next) => next.start_date,
                None => self.end_date,
            };

            let segment_start = start.max(self.start_date);
            let segment_end = start.max(end.min(self.end_date));
            let segment_duration = time::interval(segment_end, segment_start);

            let volume = if duration > 0.0 {
                self.volume * (segment_duration / duration)
            } else {
                0.0
            };

            doses.push(BasalRelativeDose {
                kind: BasalRelativeDoseKind::Basal {
                    scheduled_rate: item.value,
                },
                start_date: segment_start,
                end_date: segment_end,
                volume,
                insulin_type: self.insulin_type,
            });
        }

        doses
    }
}

fn scheduled_basal_doses(basal: &BasalTimeline, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<BasalRelativeDose> {
    schedule::trimmed(basal, Some(start), Some(end))
        .into_iter()
        .map(|entry| BasalRelativeDose {
            kind: BasalRelativeDoseKind::Basal {
                scheduled_rate: entry.value,
            },
            start_date: entry.start_date,
            end_date: entry.end_date,
            volume: entry.value * time::hours(entry.duration()),
            insulin_type: None,
        })
        .collect()
}

/// Annotate doses with the basal schedule, optionally filling uncovered spans
/// with scheduled-basal doses.
pub fn annotated(doses: &[InsulinDose], basal: &BasalTimeline, fill_basal_gaps: bool) -> Vec<BasalRelativeDose> {
    let basal_doses: Vec<&InsulinDose> = doses
        .iter()
        .filter(|d| d.delivery_type == DeliveryType::Basal)
        .collect();

    if !fill_basal_gaps && doses.is_empty() {
        return Vec::new();
    }

    let first_date = [
        basal.first().map(|b| b.start_date),
        basal_doses.first().map(|d| d.start_date),
    ]
    .into_iter()
    .flatten()
    .min();
    let Some(mut date) = first_date else {
        return Vec::new();
    };

    let mut annotated_doses = Vec::new();

    for dose in doses {
        if dose.delivery_type != DeliveryType::Basal {
            annotated_doses.push(BasalRelativeDose::from_bolus(dose));
            continue;
        }

        if fill_basal_gaps && date < dose.start_date {
            annotated_doses.extend(scheduled_basal_doses(basal, date, dose.start_date));
        }

        let basal_items = schedule::filter_date_range(basal, Some(dose.start_date), Some(dose.end_date));
        if basal_items.is_empty() {
            warn!(
                "No scheduled basal covers dose at {}, dropping it from basal-relative history",
                dose.start_date
            );
        }
        annotated_doses.extend(dose.annotated(&basal_items));
        date = dose.end_date;
    }

    let end_date = [
        basal.last().map(|b| b.end_date),
        basal_doses.last().map(|d| d.end_date),
    ]
    .into_iter()
    .flatten()
    .max()
    .unwrap_or(date);

    if fill_basal_gaps && date < end_date {
        annotated_doses.extend(scheduled_basal_doses(basal, date, end_date));
    }

    annotated_doses
}

// ============================================================================
// Collection Math
// ============================================================================

/// Total insulin on board at `date`
pub fn insulin_on_board(
    doses: &[BasalRelativeDose],
    provider: &dyn InsulinModelProvider,
    date: DateTime<Utc>,
) -> f64 {
    doses
        .iter()
        .map(|dose| dose.insulin_on_board(date, provider.model(dose.insulin_type), time::default_delta()))
        .sum()
}

/// Insulin on board every `delta` across the doses' active span
pub fn insulin_on_board_timeline(
    doses: &[BasalRelativeDose],
    provider: &dyn InsulinModelProvider,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    delta: Duration,
) -> Vec<InsulinValue> {
    let Some((start, end)) = time::simulation_date_range(
        doses,
        start,
        end,
        default_insulin_activity_duration(),
        Duration::zero(),
        delta,
    ) else {
        return Vec::new();
    };

    let mut values = Vec::new();
    let mut date = start;
    loop {
        let value = doses
            .iter()
            .map(|dose| dose.insulin_on_board(date, provider.model(dose.insulin_type), delta))
            .sum();
        values.push(InsulinValue { start_date: date, value });
        date += delta;
        if date > end {
            break;
        }
    }
    values
}

fn active_doses(doses: &[BasalRelativeDose]) -> Vec<BasalRelativeDose> {
    doses.iter().filter(|d| d.net_basal_units() != 0.0).cloned().collect()
}

/// Glucose effect timeline using, for each dose, the sensitivity in effect
/// when the dose started.
pub fn glucose_effects(
    doses: &[BasalRelativeDose],
    provider: &dyn InsulinModelProvider,
    sensitivity: &SensitivityTimeline,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    delta: Duration,
) -> Vec<GlucoseEffect> {
    let active = active_doses(doses);
    let Some((start, end)) = time::simulation_date_range(
        &active,
        start,
        end,
        default_insulin_activity_duration(),
        Duration::zero(),
        delta,
    ) else {
        return Vec::new();
    };

    let dose_sensitivities: Vec<(&BasalRelativeDose, f64)> = active
        .iter()
        .filter_map(|dose| match schedule::value_at(sensitivity, dose.start_date) {
            Some(isf) => Some((dose, isf)),
            None => {
                warn!("No insulin sensitivity covers dose at {}, skipping its effect", dose.start_date);
                None
            }
        })
        .collect();

    let mut values = Vec::new();
    let mut date = start;
    loop {
        let value = dose_sensitivities
            .iter()
            .map(|(dose, isf)| dose.glucose_effect_at(date, provider.model(dose.insulin_type), *isf, delta))
            .sum();
        values.push(GlucoseEffect::new(date, value));
        date += delta;
        if date > end {
            break;
        }
    }
    values
}

/// Effect of every dose accrued between `last` and `date`, split on the
/// sensitivity segments crossed.
fn interval_effect(
    doses: &[BasalRelativeDose],
    provider: &dyn InsulinModelProvider,
    sensitivity: &SensitivityTimeline,
    last: DateTime<Utc>,
    date: DateTime<Utc>,
    delta: Duration,
) -> f64 {
    let segments = schedule::filter_date_range(sensitivity, Some(last), Some(date));
    if segments.is_empty() {
        warn!("No insulin sensitivity covers {} to {}", last, date);
    }

    doses
        .iter()
        .map(|dose| {
            let model = provider.model(dose.insulin_type);
            segments
                .iter()
                .filter_map(|segment| {
                    let interval = DateInterval {
                        start: last.max(segment.start_date),
                        end: date.min(segment.end_date),
                    };
                    (interval.end > interval.start)
                        .then(|| dose.glucose_effect_during(interval, model, segment.value, delta))
                })
                .sum::<f64>()
        })
        .sum()
}

/// Glucose effect timeline where each dose's effect follows the sensitivity
/// timeline across its absorption.
pub fn glucose_effects_mid_absorption_isf(
    doses: &[BasalRelativeDose],
    provider: &dyn InsulinModelProvider,
    sensitivity: &SensitivityTimeline,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    delta: Duration,
) -> Vec<GlucoseEffect> {
    let active = active_doses(doses);
    let Some((start, end)) = time::simulation_date_range(
        &active,
        start,
        end,
        default_insulin_activity_duration(),
        Duration::zero(),
        delta,
    ) else {
        return Vec::new();
    };

    let mut values = Vec::new();
    let mut value = 0.0;
    let mut last = start;
    let mut date = start;
    loop {
        if date != last {
            value += interval_effect(&active, provider, sensitivity, last, date, delta);
        }
        values.push(GlucoseEffect::new(date, value));
        last = date;
        date += delta;
        if date > end {
            break;
        }
    }
    values
}

/// Cumulative effects at arbitrary dates, following the sensitivity timeline.
///
/// Each returned value is the effect accrued since the previous date, so the
/// first entry is always zero.
pub fn glucose_effects_at_dates(
    doses: &[BasalRelativeDose],
    provider: &dyn InsulinModelProvider,
    sensitivity: &SensitivityTimeline,
    dates: &[DateTime<Utc>],
    delta: Duration,
) -> Vec<GlucoseEffect> {
    let Some(&first) = dates.first() else {
        return Vec::new();
    };

    let mut last = first;
    dates
        .iter()
        .map(|&date| {
            let value = if date == last {
                0.0
            } else {
                interval_effect(doses, provider, sensitivity, last, date, delta)
            };
            last = date;
            GlucoseEffect::new(date, value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insulin::{ExponentialInsulinModelPreset, PresetInsulinModelProvider};
    use chrono::TimeZone;

    fn t(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap() + Duration::minutes(min)
    }

    fn adult() -> &'static dyn InsulinModel {
        ExponentialInsulinModelPreset::RapidActingAdult.model()
    }

    #[test]
    fn test_net_basal_units() {
        let temp = BasalRelativeDose {
            kind: BasalRelativeDoseKind::Basal { scheduled_rate: 1.0 },
            start_date: t(0),
            end_date: t(30),
            volume: 1.5,
            insulin_type: None,
        };
        assert!((temp.net_basal_units() - 1.0).abs() < 1e-9);

        let empty = BasalRelativeDose { end_date: t(0), ..temp.clone() };
        assert_eq!(empty.net_basal_units(), 0.0);
    }

    #[test]
    fn test_bolus_iob_follows_curve() {
        let bolus = BasalRelativeDose::from_bolus(&InsulinDose::bolus(t(0), t(0), 2.0));
        assert_eq!(bolus.insulin_on_board(t(-5), adult(), time::default_delta()), 0.0);
        assert_eq!(bolus.insulin_on_board(t(5), adult(), time::default_delta()), 2.0);
        let iob = bolus.insulin_on_board(t(90), adult(), time::default_delta());
        assert!((iob - 2.0 * 0.6657).abs() < 1e-3);
        assert_eq!(bolus.insulin_on_board(t(370), adult(), time::default_delta()), 0.0);
    }

    #[test]
    fn test_continuous_dose_iob_is_bounded() {
        let temp = BasalRelativeDose {
            kind: BasalRelativeDoseKind::Basal { scheduled_rate: 0.0 },
            start_date: t(0),
            end_date: t(60),
            volume: 1.0,
            insulin_type: None,
        };
        let mut last = f64::MAX;
        for minute in (0..=440).step_by(5) {
            let iob = temp.insulin_on_board(t(minute), adult(), time::default_delta());
            assert!((0.0..=1.0 + 1e-9).contains(&iob));
            last = iob;
        }
        assert!(last.abs() < 1e-9);

        // only the part delivered so far is on board at the start
        let early = temp.insulin_on_board(t(0), adult(), time::default_delta());
        assert!((early - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_effect_during_sums_to_effect_at() {
        let bolus = BasalRelativeDose::from_bolus(&InsulinDose::bolus(t(0), t(0), 1.0));
        let full = bolus.glucose_effect_at(t(120), adult(), 50.0, time::default_delta());
        let split = bolus.glucose_effect_during(DateInterval::new(t(0), t(60)), adult(), 50.0, time::default_delta())
            + bolus.glucose_effect_during(DateInterval::new(t(60), t(120)), adult(), 50.0, time::default_delta());
        assert!((full - split).abs() < 1e-9);
        assert!(full < 0.0);
    }

    #[test]
    fn test_annotated_splits_at_schedule_boundaries() {
        let basal = vec![
            AbsoluteScheduleValue::new(t(0), t(60), 1.0),
            AbsoluteScheduleValue::new(t(60), t(120), 2.0),
        ];
        let doses = vec![InsulinDose::basal(t(30), t(90), 3.0)];
        let annotated = annotated(&doses, &basal, false);

        assert_eq!(annotated.len(), 2);
        assert_eq!(annotated[0].start_date, t(30));
        assert_eq!(annotated[0].end_date, t(60));
        assert!((annotated[0].volume - 1.5).abs() < 1e-9);
        assert_eq!(annotated[0].kind, BasalRelativeDoseKind::Basal { scheduled_rate: 1.0 });
        assert_eq!(annotated[1].start_date, t(60));
        assert_eq!(annotated[1].end_date, t(90));
        assert_eq!(annotated[1].kind, BasalRelativeDoseKind::Basal { scheduled_rate: 2.0 });
        assert!((annotated[0].net_basal_units() - 1.0).abs() < 1e-9);
        assert!((annotated[1].net_basal_units() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_annotated_fills_gaps_with_schedule() {
        let basal = vec![AbsoluteScheduleValue::new(t(0), t(120), 1.0)];
        let doses = vec![
            InsulinDose::bolus(t(10), t(11), 1.0),
            InsulinDose::basal(t(30), t(60), 0.0),
        ];
        let annotated = annotated(&doses, &basal, true);

        assert_eq!(annotated.len(), 4);
        assert_eq!(annotated[0].kind, BasalRelativeDoseKind::Bolus);
        assert_eq!((annotated[1].start_date, annotated[1].end_date), (t(0), t(30)));
        assert!((annotated[1].volume - 0.5).abs() < 1e-9);
        assert!((annotated[2].net_basal_units() + 0.5).abs() < 1e-9);
        assert_eq!((annotated[3].start_date, annotated[3].end_date), (t(60), t(120)));
        assert_eq!(annotated[3].net_basal_units(), 0.0);
    }

    #[test]
    fn test_mid_absorption_isf_changes_bolus_effect() {
        let provider = PresetInsulinModelProvider::default();
        let doses = vec![BasalRelativeDose::from_bolus(&InsulinDose::bolus(
            t(0),
            t(0) + Duration::seconds(20),
            1.0,
        ))];
        let sensitivity = vec![
            AbsoluteScheduleValue::new(t(-24 * 60), t(90), 50.0),
            AbsoluteScheduleValue::new(t(90), t(24 * 60), 100.0),
        ];

        let flat = glucose_effects(&doses, &provider, &sensitivity, None, None, time::default_delta());
        assert!((flat.last().unwrap().quantity + 50.0).abs() < 0.5);

        let varying =
            glucose_effects_mid_absorption_isf(&doses, &provider, &sensitivity, None, None, time::default_delta());
        assert!((varying.last().unwrap().quantity + 83.0).abs() < 0.5);
    }

    #[test]
    fn test_effects_at_dates_start_at_zero() {
        let provider = PresetInsulinModelProvider::default();
        let doses = vec![BasalRelativeDose::from_bolus(&InsulinDose::bolus(t(0), t(0), 1.0))];
        let sensitivity = vec![AbsoluteScheduleValue::new(t(-60), t(600), 40.0)];
        let dates = vec![t(0), t(60), t(400)];
        let effects = glucose_effects_at_dates(&doses, &provider, &sensitivity, &dates, time::default_delta());

        assert_eq!(effects.len(), 3);
        assert_eq!(effects[0].quantity, 0.0);
        let total: f64 = effects.iter().map(|e| e.quantity).sum();
        assert!((total + 40.0).abs() < 1e-6);
    }

    #[test]
    fn test_iob_timeline_decays_to_zero() {
        let provider = PresetInsulinModelProvider::default();
        let doses = vec![BasalRelativeDose::from_bolus(&InsulinDose::bolus(t(0), t(0), 1.0))];
        let timeline = insulin_on_board_timeline(&doses, &provider, None, None, time::default_delta());
        assert_eq!(timeline.first().unwrap().value, 1.0);
        assert_eq!(timeline.last().unwrap().value, 0.0);
        assert_eq!(timeline.last().unwrap().start_date, t(370));
    }
}
