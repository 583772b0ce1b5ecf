//! Dose recommendations from a glucose forecast.
//!
//! The forecast is first reduced to an [`InsulinCorrection`], which is then
//! shaped into one of three recommendation kinds:
//!
//! - **Temp basal**: a 30 minute rate above or below the scheduled basal
//! - **Automatic dose**: a partial bolus alongside a neutral temp basal
//! - **Manual bolus**: a capped amount with an informational notice

use crate::insulin::InsulinModel;
use crate::schedule::{self, GlucoseRangeTimeline, SensitivityTimeline};
use crate::time;
use crate::types::{
    AutomaticDoseRecommendation, BolusRecommendationNotice, GlucoseValue, ManualBolusRecommendation,
    PredictedGlucoseValue, SimpleGlucoseValue, TempBasalRecommendation,
};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::warn;

/// Fraction of the needed correction delivered by an automatic bolus
pub const DEFAULT_BOLUS_PARTIAL_APPLICATION_FACTOR: f64 = 0.4;

/// Fraction of the insulin effect duration during which the target stays at
/// the suspend threshold
const USE_MIN_VALUE_UNTIL_PERCENT: f64 = 0.5;

pub fn temp_basal_duration() -> Duration {
    Duration::minutes(30)
}

/// Maximum age of the latest glucose sample at prediction start
pub fn input_data_recency_interval() -> Duration {
    Duration::minutes(15)
}

// ============================================================================
// Insulin Correction
// ============================================================================

/// How the forecast relates to the correction range
#[derive(Clone, Copy, Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InsulinCorrection {
    InRange,
    #[serde(rename_all = "camelCase")]
    AboveRange {
        min_glucose: PredictedGlucoseValue,
        correcting_glucose: PredictedGlucoseValue,
        min_target: f64,
        units: f64,
    },
    #[serde(rename_all = "camelCase")]
    EntirelyBelowRange {
        min_glucose: PredictedGlucoseValue,
        min_target: f64,
        units: f64,
    },
    #[serde(rename_all = "camelCase")]
    Suspend { min_glucose: PredictedGlucoseValue },
}

impl InsulinCorrection {
    /// Correction amount in units; negative when glucose is below range
    pub fn units(&self) -> f64 {
        match self {
            Self::AboveRange { units, .. } | Self::EntirelyBelowRange { units, .. } => *units,
            Self::InRange | Self::Suspend { .. } => 0.0,
        }
    }

    /// Deliver the correction as a rate over `duration` on top of the
    /// neutral basal, clamped to `[0, max_basal_rate]`.
    pub fn as_temp_basal(
        &self,
        neutral_basal_rate: f64,
        max_basal_rate: f64,
        duration: Duration,
        rate_rounder: Option<fn(f64) -> f64>,
    ) -> TempBasalRecommendation {
        let mut rate = self.units() / time::hours(duration);
        if !matches!(self, Self::Suspend { .. }) {
            rate += neutral_basal_rate;
        }

        rate = rate.max(0.0).min(max_basal_rate);
        if let Some(round) = rate_rounder {
            rate = round(rate);
        }

        TempBasalRecommendation {
            units_per_hour: rate,
            duration,
        }
    }

    pub fn bolus_recommendation_notice(&self) -> Option<BolusRecommendationNotice> {
        match self {
            Self::Suspend { min_glucose } => Some(BolusRecommendationNotice::GlucoseBelowSuspendThreshold {
                min_glucose: SimpleGlucoseValue::from_value(min_glucose),
            }),
            Self::InRange => Some(BolusRecommendationNotice::PredictedGlucoseInRange),
            Self::EntirelyBelowRange { min_glucose, .. } => Some(BolusRecommendationNotice::AllGlucoseBelowTarget {
                min_glucose: SimpleGlucoseValue::from_value(min_glucose),
            }),
            Self::AboveRange {
                min_glucose,
                min_target,
                units,
                ..
            } => (*units > 0.0 && min_glucose.quantity < *min_target).then(|| {
                BolusRecommendationNotice::PredictedGlucoseBelowTarget {
                    min_glucose: SimpleGlucoseValue::from_value(min_glucose),
                }
            }),
        }
    }

    pub fn as_manual_bolus(&self, max_bolus: f64) -> ManualBolusRecommendation {
        ManualBolusRecommendation {
            amount: self.units().max(0.0).min(max_bolus),
            notice: self.bolus_recommendation_notice(),
        }
    }

    /// Fraction of the correction to deliver now, capped at `max_bolus_units`
    pub fn as_partial_bolus(&self, partial_application_factor: f64, max_bolus_units: f64) -> f64 {
        (self.units() * partial_application_factor).max(0.0).min(max_bolus_units)
    }

    /// True when correcting upward while some point is still under target
    fn min_below_target(&self) -> bool {
        matches!(self, Self::AboveRange { min_glucose, min_target, .. } if min_glucose.quantity < *min_target)
    }
}

/// Target for a point `percent_effect_duration` into the insulin action:
/// the suspend threshold for the first half, then a straight line up to the
/// range midpoint.
pub fn target_glucose_value(percent_effect_duration: f64, min_value: f64, max_value: f64) -> f64 {
    if percent_effect_duration <= USE_MIN_VALUE_UNTIL_PERCENT {
        return min_value;
    }
    if percent_effect_duration >= 1.0 {
        return max_value;
    }
    let slope = (max_value - min_value) / (1.0 - USE_MIN_VALUE_UNTIL_PERCENT);
    min_value + slope * (percent_effect_duration - USE_MIN_VALUE_UNTIL_PERCENT)
}

/// Sensitivity weighted by the fraction of insulin effect that lands between
/// `date` and `until`, summed across every segment crossed.
fn effected_sensitivity(
    sensitivity: &SensitivityTimeline,
    date: DateTime<Utc>,
    until: DateTime<Utc>,
    model: &dyn InsulinModel,
) -> f64 {
    schedule::filter_date_range(sensitivity, Some(date), Some(until))
        .into_iter()
        .map(|segment| {
            let start = time::interval(segment.start_date.max(date), date);
            let end = time::interval(segment.end_date.min(until), date);
            (model.percent_effect_remaining(start) - model.percent_effect_remaining(end)) * segment.value
        })
        .sum()
}

fn correction_units(from: f64, to: f64, effected_sensitivity: f64) -> f64 {
    (from - to) / effected_sensitivity.max(f64::EPSILON)
}

/// Reduce a forecast to the smallest correction that brings it to target.
///
/// Any point below `suspend_threshold` short-circuits to
/// [`InsulinCorrection::Suspend`]. Points before `date` are ignored.
pub fn insulin_correction(
    prediction: &[PredictedGlucoseValue],
    date: DateTime<Utc>,
    target: &GlucoseRangeTimeline,
    suspend_threshold: f64,
    sensitivity: &SensitivityTimeline,
    model: &dyn InsulinModel,
) -> InsulinCorrection {
    let effect_duration = time::seconds(model.effect_duration());

    let mut min_glucose: Option<(PredictedGlucoseValue, f64)> = None;
    let mut eventual_glucose: Option<PredictedGlucoseValue> = None;
    let mut min_correction: Option<(PredictedGlucoseValue, f64)> = None;

    for prediction in prediction.iter().filter(|p| p.start_date >= date) {
        if prediction.quantity < suspend_threshold {
            return InsulinCorrection::Suspend {
                min_glucose: *prediction,
            };
        }

        let Some(range) = schedule::closest_prior(target, prediction.start_date) else {
            warn!("No correction range covers {}; skipping prediction", prediction.start_date);
            continue;
        };
        eventual_glucose = Some(*prediction);

        let elapsed = time::interval(prediction.start_date, date);
        let target_value = target_glucose_value(elapsed / effect_duration, suspend_threshold, range.value.average());
        let effected = effected_sensitivity(sensitivity, date, prediction.start_date, model);

        if min_glucose.map_or(true, |(min, _)| prediction.quantity < min.quantity) {
            min_glucose = Some((*prediction, effected));
        }

        let units = correction_units(prediction.quantity, target_value, effected);
        if units <= 0.0 {
            continue;
        }
        if min_correction.map_or(true, |(_, min_units)| units < min_units) {
            min_correction = Some((*prediction, units));
        }
    }

    let (Some((min, effected_at_min)), Some(eventual)) = (min_glucose, eventual_glucose) else {
        return InsulinCorrection::InRange;
    };
    let (Some(min_targets), Some(eventual_targets)) = (
        schedule::closest_prior(target, min.start_date),
        schedule::closest_prior(target, eventual.start_date),
    ) else {
        return InsulinCorrection::InRange;
    };

    if min.quantity < min_targets.value.lower_bound && eventual.quantity < eventual_targets.value.lower_bound {
        InsulinCorrection::EntirelyBelowRange {
            min_glucose: min,
            min_target: min_targets.value.lower_bound,
            units: correction_units(min.quantity, min_targets.value.average(), effected_at_min),
        }
    } else if let Some((correcting, units)) =
        min_correction.filter(|_| eventual.quantity > eventual_targets.value.upper_bound)
    {
        InsulinCorrection::AboveRange {
            min_glucose: min,
            correcting_glucose: correcting,
            min_target: eventual_targets.value.lower_bound,
            units,
        }
    } else {
        InsulinCorrection::InRange
    }
}

// ============================================================================
// Recommendations
// ============================================================================

/// Temp basal for the correction, bounded so thirty minutes at the rate
/// cannot push active insulin past twice `max_bolus`.
pub fn recommend_temp_basal(
    correction: &InsulinCorrection,
    neutral_basal_rate: f64,
    active_insulin: f64,
    max_bolus: f64,
    max_basal_rate: f64,
) -> TempBasalRecommendation {
    let mut max_basal_rate = max_basal_rate;
    if correction.min_below_target() {
        max_basal_rate = neutral_basal_rate;
    }

    let iob_headroom = max_bolus * 2.0 - active_insulin;
    let max_rate_below_iob_limit = iob_headroom / time::hours(temp_basal_duration()) + neutral_basal_rate;
    max_basal_rate = max_basal_rate.min(max_rate_below_iob_limit);

    correction.as_temp_basal(neutral_basal_rate, max_basal_rate, temp_basal_duration(), None)
}

/// Partial bolus plus a temp basal capped at the neutral rate.
///
/// Returns `None` only when there is neither a basal adjustment nor any
/// bolus to deliver.
pub fn recommend_automatic_dose(
    correction: &InsulinCorrection,
    application_factor: f64,
    neutral_basal_rate: f64,
    active_insulin: f64,
    max_bolus: f64,
) -> Option<AutomaticDoseRecommendation> {
    let delivery_headroom = (max_bolus * 2.0 - active_insulin).max(0.0);
    let mut delivery_max = (max_bolus * application_factor).min(delivery_headroom);
    if correction.min_below_target() {
        delivery_max = 0.0;
    }

    let basal_adjustment = Some(correction.as_temp_basal(
        neutral_basal_rate,
        neutral_basal_rate,
        temp_basal_duration(),
        None,
    ));
    let bolus_units = correction.as_partial_bolus(application_factor, delivery_max);

    (basal_adjustment.is_some() || bolus_units > 0.0).then_some(AutomaticDoseRecommendation {
        basal_adjustment,
        bolus_units: Some(bolus_units),
    })
}

/// Capped bolus with a notice; current glucose under the target range
/// overrides any forecast notice.
pub fn recommend_manual_bolus<G: GlucoseValue>(
    correction: &InsulinCorrection,
    max_bolus: f64,
    current_glucose: &G,
    target: &GlucoseRangeTimeline,
) -> ManualBolusRecommendation {
    let mut bolus = correction.as_manual_bolus(max_bolus);
    if let Some(range) = schedule::closest_prior(target, current_glucose.start_date()) {
        if current_glucose.quantity() < range.value.lower_bound {
            bolus.notice = Some(BolusRecommendationNotice::CurrentGlucoseBelowTarget {
                glucose: SimpleGlucoseValue::from_value(current_glucose),
            });
        }
    }
    bolus
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insulin::ExponentialInsulinModelPreset;
    use crate::schedule::{AbsoluteScheduleValue, GlucoseRange};
    use crate::types::GlucoseSample;
    use chrono::TimeZone;
    use rstest::rstest;

    const SUSPEND_THRESHOLD: f64 = 55.0;
    const MAX_BASAL_RATE: f64 = 3.0;
    const BASAL_RATE: f64 = 1.0;
    const MAX_BOLUS: f64 = 6.0;

    fn test_date() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 3, 12, 0, 0).unwrap()
    }

    fn at(hours: f64) -> DateTime<Utc> {
        test_date() + time::from_seconds(hours * 3600.0)
    }

    fn prediction(points: &[(f64, f64)]) -> Vec<PredictedGlucoseValue> {
        points.iter().map(|&(h, v)| PredictedGlucoseValue::new(at(h), v)).collect()
    }

    fn target() -> Vec<AbsoluteScheduleValue<GlucoseRange>> {
        vec![AbsoluteScheduleValue::new(at(-24.0), at(24.0), GlucoseRange::new(90.0, 120.0))]
    }

    fn sensitivity() -> Vec<AbsoluteScheduleValue<f64>> {
        vec![AbsoluteScheduleValue::new(at(-24.0), at(24.0), 60.0)]
    }

    fn correction_for(points: &[(f64, f64)]) -> InsulinCorrection {
        insulin_correction(
            &prediction(points),
            test_date(),
            &target(),
            SUSPEND_THRESHOLD,
            &sensitivity(),
            ExponentialInsulinModelPreset::RapidActingAdult.model(),
        )
    }

    fn current_glucose() -> GlucoseSample {
        GlucoseSample::new(test_date(), 120.0)
    }

    #[rstest]
    #[case::no_change(&[(0.0, 100.0), (6.2, 100.0)], 1.0, 0.0, 0.0)]
    #[case::start_high_end_in_range(&[(0.0, 200.0), (0.5, 180.0), (1.0, 150.0), (1.5, 120.0), (6.2, 100.0)], 1.0, 0.0, 0.0)]
    #[case::start_low_end_in_range(&[(0.0, 60.0), (0.5, 70.0), (1.0, 80.0), (1.5, 90.0), (6.2, 100.0)], 1.0, 0.0, 0.0)]
    #[case::correct_low_at_min(&[(0.0, 100.0), (0.5, 90.0), (1.0, 85.0), (1.5, 90.0), (6.2, 100.0)], 1.0, 0.0, 0.0)]
    #[case::start_high_end_low(&[(0.0, 200.0), (0.5, 160.0), (1.0, 120.0), (1.5, 80.0), (6.2, 60.0)], 0.0, 0.0, 0.0)]
    #[case::start_low_end_high(&[(0.0, 60.0), (0.5, 80.0), (1.0, 120.0), (1.5, 160.0), (6.2, 200.0)], 1.0, 0.0, 1.6)]
    #[case::flat_and_high(&[(0.0, 200.0), (6.2, 200.0)], 3.0, 0.65, 1.6)]
    #[case::high_and_falling(&[(0.0, 240.0), (1.0, 220.0), (2.0, 200.0), (3.0, 160.0), (6.2, 124.0)], 1.63, 0.13, 0.32)]
    #[case::in_range_and_rising(&[(0.0, 90.0), (1.0, 100.0), (2.0, 110.0), (3.0, 120.0), (6.2, 125.0)], 1.67, 0.13, 0.33)]
    #[case::high_and_rising(&[(0.0, 140.0), (1.0, 150.0), (2.0, 160.0), (3.0, 170.0), (6.2, 180.0)], 3.0, 0.5, 1.25)]
    #[case::very_low_and_rising(&[(0.0, 60.0), (1.0, 50.0), (2.0, 60.0), (3.0, 70.0), (6.2, 100.0)], 0.0, 0.0, 0.0)]
    fn test_correction_dosing(
        #[case] points: &[(f64, f64)],
        #[case] temp_rate: f64,
        #[case] automatic_bolus: f64,
        #[case] manual_bolus: f64,
    ) {
        let correction = correction_for(points);

        let temp = recommend_temp_basal(&correction, BASAL_RATE, 0.0, MAX_BOLUS, MAX_BASAL_RATE);
        assert!((temp.units_per_hour - temp_rate).abs() < 0.05, "temp {}", temp.units_per_hour);
        assert_eq!(temp.duration, Duration::minutes(30));

        let automatic = recommend_automatic_dose(&correction, 0.4, BASAL_RATE, 0.0, MAX_BOLUS).unwrap();
        let bolus = automatic.bolus_units.unwrap();
        assert!((bolus - automatic_bolus).abs() < 0.05, "automatic {}", bolus);
        assert!(automatic.basal_adjustment.unwrap().units_per_hour <= BASAL_RATE);

        let manual = recommend_manual_bolus(&correction, MAX_BOLUS, &current_glucose(), &target());
        assert!((manual.amount - manual_bolus).abs() < 0.05, "manual {}", manual.amount);
    }

    #[test]
    fn test_in_range_notice() {
        let correction = correction_for(&[(0.0, 100.0), (6.2, 100.0)]);
        assert_eq!(correction, InsulinCorrection::InRange);

        let manual = recommend_manual_bolus(&correction, MAX_BOLUS, &current_glucose(), &target());
        assert_eq!(manual.notice, Some(BolusRecommendationNotice::PredictedGlucoseInRange));
    }

    #[test]
    fn test_suspend_short_circuits() {
        let correction = correction_for(&[(0.0, 60.0), (1.0, 50.0), (2.0, 60.0), (3.0, 70.0), (6.2, 100.0)]);

        match correction {
            InsulinCorrection::Suspend { min_glucose } => {
                assert_eq!(min_glucose.quantity, 50.0);
                assert_eq!(min_glucose.start_date, at(1.0));
            }
            other => panic!("expected suspend, got {:?}", other),
        }

        let manual = recommend_manual_bolus(&correction, MAX_BOLUS, &current_glucose(), &target());
        assert_eq!(manual.amount, 0.0);
        assert!(matches!(
            manual.notice,
            Some(BolusRecommendationNotice::GlucoseBelowSuspendThreshold { min_glucose }) if min_glucose.quantity == 50.0
        ));
    }

    #[test]
    fn test_entirely_below_range_notice() {
        let correction = correction_for(&[(0.0, 200.0), (0.5, 160.0), (1.0, 120.0), (1.5, 80.0), (6.2, 60.0)]);

        assert!(matches!(correction, InsulinCorrection::EntirelyBelowRange { .. }));
        assert!(correction.units() < 0.0);

        let manual = recommend_manual_bolus(&correction, MAX_BOLUS, &current_glucose(), &target());
        assert!(matches!(
            manual.notice,
            Some(BolusRecommendationNotice::AllGlucoseBelowTarget { min_glucose }) if min_glucose.quantity == 60.0
        ));
    }

    #[test]
    fn test_above_range_with_low_min_notice() {
        let correction = correction_for(&[(0.0, 60.0), (0.5, 80.0), (1.0, 120.0), (1.5, 160.0), (6.2, 200.0)]);

        let manual = recommend_manual_bolus(&correction, MAX_BOLUS, &current_glucose(), &target());
        assert!(matches!(
            manual.notice,
            Some(BolusRecommendationNotice::PredictedGlucoseBelowTarget { min_glucose }) if min_glucose.quantity == 60.0
        ));
    }

    #[test]
    fn test_flat_and_high_has_no_notice() {
        let correction = correction_for(&[(0.0, 200.0), (6.2, 200.0)]);
        let manual = recommend_manual_bolus(&correction, MAX_BOLUS, &current_glucose(), &target());
        assert_eq!(manual.notice, None);
    }

    #[test]
    fn test_current_glucose_below_target_overrides_notice() {
        let correction = correction_for(&[(0.0, 200.0), (6.2, 200.0)]);
        let low = GlucoseSample::new(test_date(), 80.0);

        let manual = recommend_manual_bolus(&correction, MAX_BOLUS, &low, &target());
        assert!(matches!(
            manual.notice,
            Some(BolusRecommendationNotice::CurrentGlucoseBelowTarget { glucose }) if glucose.quantity == 80.0
        ));
    }

    #[test]
    fn test_temp_basal_respects_iob_ceiling() {
        let correction = correction_for(&[(0.0, 200.0), (6.2, 200.0)]);

        // already at twice max bolus, so only the neutral rate remains
        let temp = recommend_temp_basal(&correction, BASAL_RATE, 12.0, MAX_BOLUS, MAX_BASAL_RATE);
        assert!((temp.units_per_hour - BASAL_RATE).abs() < 1e-9);

        let automatic = recommend_automatic_dose(&correction, 0.4, BASAL_RATE, 12.0, MAX_BOLUS).unwrap();
        assert_eq!(automatic.bolus_units, Some(0.0));
    }

    #[test]
    fn test_manual_bolus_capped_at_max() {
        let correction = correction_for(&[(0.0, 400.0), (6.2, 400.0)]);
        let manual = recommend_manual_bolus(&correction, 2.0, &current_glucose(), &target());
        assert_eq!(manual.amount, 2.0);
    }

    #[test]
    fn test_empty_prediction_is_in_range() {
        let correction = insulin_correction(
            &[],
            test_date(),
            &target(),
            SUSPEND_THRESHOLD,
            &sensitivity(),
            ExponentialInsulinModelPreset::RapidActingAdult.model(),
        );
        assert_eq!(correction, InsulinCorrection::InRange);
    }

    #[test]
    fn test_target_glucose_value_blend() {
        assert_eq!(target_glucose_value(0.2, 55.0, 105.0), 55.0);
        assert_eq!(target_glucose_value(0.75, 55.0, 105.0), 80.0);
        assert_eq!(target_glucose_value(1.2, 55.0, 105.0), 105.0);
    }

    #[test]
    fn test_temp_basal_rounder() {
        let correction = correction_for(&[(0.0, 240.0), (1.0, 220.0), (2.0, 200.0), (3.0, 160.0), (6.2, 124.0)]);
        let temp = correction.as_temp_basal(BASAL_RATE, MAX_BASAL_RATE, temp_basal_duration(), Some(|r: f64| {
            (r * 20.0).floor() / 20.0
        }));
        assert!((temp.units_per_hour * 20.0).fract().abs() < 1e-9);
    }
}
