//! Core domain types for the loop dosing engine.
//!
//! This module defines the value types that flow through the pipeline:
//! - Glucose samples, effects and predictions
//! - Insulin doses as delivered and as recommended
//! - Carbohydrate entries
//! - Recommendation results
//!
//! Glucose is always mg/dL, insulin is U, carbs are grams.

use crate::time::{self, DateInterval};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Timeline Contract
// ============================================================================

/// Anything positioned on the timeline
pub trait TimelineValue {
    fn start_date(&self) -> DateTime<Utc>;

    fn end_date(&self) -> DateTime<Utc> {
        self.start_date()
    }
}

/// A point-in-time glucose reading in mg/dL
pub trait GlucoseValue: TimelineValue {
    fn quantity(&self) -> f64;
}

/// Entries whose end is at or after `start` and whose start is at or before `end`
pub fn filter_date_range<T: TimelineValue + Clone>(
    values: &[T],
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Vec<T> {
    values
        .iter()
        .filter(|v| start.map_or(true, |s| v.end_date() >= s))
        .filter(|v| end.map_or(true, |e| v.start_date() <= e))
        .cloned()
        .collect()
}

// ============================================================================
// Glucose Types
// ============================================================================

/// Direction of glucose change reported by a sensor
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum GlucoseTrend {
    UpUpUp,
    UpUp,
    Up,
    Flat,
    Down,
    DownDown,
    DownDownDown,
}

/// A single glucose measurement
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GlucoseSample {
    pub start_date: DateTime<Utc>,
    pub quantity: f64,
    #[serde(default)]
    pub is_display_only: bool,
    #[serde(default)]
    pub was_user_entered: bool,
    #[serde(default)]
    pub provenance_identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trend: Option<GlucoseTrend>,
}

impl GlucoseSample {
    pub fn new(start_date: DateTime<Utc>, quantity: f64) -> Self {
        Self {
            start_date,
            quantity,
            is_display_only: false,
            was_user_entered: false,
            provenance_identifier: String::new(),
            trend: None,
        }
    }
}

impl TimelineValue for GlucoseSample {
    fn start_date(&self) -> DateTime<Utc> {
        self.start_date
    }
}

impl GlucoseValue for GlucoseSample {
    fn quantity(&self) -> f64 {
        self.quantity
    }
}

/// A bare glucose value, used in recommendation notices
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SimpleGlucoseValue {
    pub start_date: DateTime<Utc>,
    pub quantity: f64,
}

impl SimpleGlucoseValue {
    pub fn from_value<G: GlucoseValue + ?Sized>(value: &G) -> Self {
        Self {
            start_date: value.start_date(),
            quantity: value.quantity(),
        }
    }
}

/// One point of the glucose forecast
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PredictedGlucoseValue {
    pub start_date: DateTime<Utc>,
    pub quantity: f64,
}

impl PredictedGlucoseValue {
    pub fn new(start_date: DateTime<Utc>, quantity: f64) -> Self {
        Self { start_date, quantity }
    }
}

impl TimelineValue for PredictedGlucoseValue {
    fn start_date(&self) -> DateTime<Utc> {
        self.start_date
    }
}

impl GlucoseValue for PredictedGlucoseValue {
    fn quantity(&self) -> f64 {
        self.quantity
    }
}

/// Cumulative glucose effect (mg/dL) attributed to one cause at a point in time
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GlucoseEffect {
    pub start_date: DateTime<Utc>,
    pub quantity: f64,
}

impl GlucoseEffect {
    pub fn new(start_date: DateTime<Utc>, quantity: f64) -> Self {
        Self { start_date, quantity }
    }
}

impl TimelineValue for GlucoseEffect {
    fn start_date(&self) -> DateTime<Utc> {
        self.start_date
    }
}

impl GlucoseValue for GlucoseEffect {
    fn quantity(&self) -> f64 {
        self.quantity
    }
}

/// Average rate of glucose change (mg/dL/s) over an interval
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GlucoseEffectVelocity {
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub mgdl_per_second: f64,
}

impl GlucoseEffectVelocity {
    /// Total change over the interval, dated at its end
    pub fn effect(&self) -> GlucoseEffect {
        let duration = time::interval(self.end_date, self.start_date);
        GlucoseEffect::new(self.end_date, self.mgdl_per_second * duration)
    }
}

impl TimelineValue for GlucoseEffectVelocity {
    fn start_date(&self) -> DateTime<Utc> {
        self.start_date
    }

    fn end_date(&self) -> DateTime<Utc> {
        self.end_date
    }
}

/// A glucose delta accumulated over an interval
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GlucoseChange {
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub quantity: f64,
}

impl GlucoseChange {
    /// Widen the interval to include `effect` and add its quantity
    pub fn append(&mut self, effect: &GlucoseEffect) {
        self.start_date = self.start_date.min(effect.start_date);
        self.end_date = self.end_date.max(effect.start_date);
        self.quantity += effect.quantity;
    }
}

impl TimelineValue for GlucoseChange {
    fn start_date(&self) -> DateTime<Utc> {
        self.start_date
    }

    fn end_date(&self) -> DateTime<Utc> {
        self.end_date
    }
}

// ============================================================================
// Insulin Types
// ============================================================================

/// Insulin formulation, which selects the activity curve
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum InsulinType {
    Novolog,
    Humalog,
    Apidra,
    Fiasp,
    Lyumjev,
    Afrezza,
}

/// How a reconciled dose was delivered
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DeliveryType {
    Bolus,
    Basal,
}

/// A reconciled insulin delivery record
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InsulinDose {
    pub delivery_type: DeliveryType,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    /// Units actually delivered
    pub volume: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insulin_type: Option<InsulinType>,
}

impl InsulinDose {
    pub fn bolus(start_date: DateTime<Utc>, end_date: DateTime<Utc>, volume: f64) -> Self {
        Self {
            delivery_type: DeliveryType::Bolus,
            start_date,
            end_date,
            volume,
            insulin_type: None,
        }
    }

    pub fn basal(start_date: DateTime<Utc>, end_date: DateTime<Utc>, volume: f64) -> Self {
        Self {
            delivery_type: DeliveryType::Basal,
            start_date,
            end_date,
            volume,
            insulin_type: None,
        }
    }

    pub fn duration(&self) -> Duration {
        self.end_date - self.start_date
    }
}

impl TimelineValue for InsulinDose {
    fn start_date(&self) -> DateTime<Utc> {
        self.start_date
    }

    fn end_date(&self) -> DateTime<Utc> {
        self.end_date
    }
}

/// Insulin on board at a point in time
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InsulinValue {
    pub start_date: DateTime<Utc>,
    pub value: f64,
}

impl TimelineValue for InsulinValue {
    fn start_date(&self) -> DateTime<Utc> {
        self.start_date
    }
}

// ============================================================================
// Carbohydrate Types
// ============================================================================

/// A user-entered carbohydrate record
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CarbEntry {
    pub start_date: DateTime<Utc>,
    pub grams: f64,
    #[serde(
        default,
        with = "crate::time::serde_seconds_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub absorption_time: Option<Duration>,
}

impl CarbEntry {
    pub fn new(start_date: DateTime<Utc>, grams: f64, absorption_time: Option<Duration>) -> Self {
        Self {
            start_date,
            grams,
            absorption_time,
        }
    }
}

impl TimelineValue for CarbEntry {
    fn start_date(&self) -> DateTime<Utc> {
        self.start_date
    }
}

/// Grams of carbohydrate over an interval (observed absorption or COB)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CarbValue {
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub grams: f64,
}

impl CarbValue {
    pub fn at(date: DateTime<Utc>, grams: f64) -> Self {
        Self {
            start_date: date,
            end_date: date,
            grams,
        }
    }
}

impl TimelineValue for CarbValue {
    fn start_date(&self) -> DateTime<Utc> {
        self.start_date
    }

    fn end_date(&self) -> DateTime<Utc> {
        self.end_date
    }
}

/// Absorption state of one carb entry after comparing the model against ICE
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AbsorbedCarbValue {
    /// Grams attributed from observed counteraction effects
    pub observed: f64,
    /// Absorbed grams used for modeling, never above `total`
    pub clamped: f64,
    pub total: f64,
    pub remaining: f64,
    pub observed_date: DateInterval,
    #[serde(with = "crate::time::serde_seconds")]
    pub estimated_time_remaining: Duration,
    #[serde(with = "crate::time::serde_seconds")]
    pub time_to_absorb_observed_carbs: Duration,
}

impl AbsorbedCarbValue {
    /// Span from entry start to the predicted end of absorption
    pub fn estimated_date(&self) -> DateInterval {
        DateInterval::with_duration(
            self.observed_date.start,
            self.observed_date.duration() + self.estimated_time_remaining,
        )
    }

    pub fn is_active(&self) -> bool {
        self.estimated_time_remaining > Duration::zero()
    }

    /// Fraction of the entry that has been absorbed
    pub fn observed_progress(&self) -> f64 {
        if self.total > 0.0 {
            self.clamped / self.total
        } else {
            0.0
        }
    }
}

/// A carb entry together with what has been observed about it
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CarbStatus {
    pub entry: CarbEntry,
    pub absorption: Option<AbsorbedCarbValue>,
    /// `None` when observed absorption is below the modeled minimum
    pub observed_timeline: Option<Vec<CarbValue>>,
}

impl CarbStatus {
    pub fn quantity(&self) -> f64 {
        self.entry.grams
    }

    pub fn original_absorption_time(&self) -> Option<Duration> {
        self.entry.absorption_time
    }

    /// Estimated absorption time when known, else the entered one
    pub fn absorption_time(&self) -> Option<Duration> {
        self.absorption
            .map(|a| a.estimated_date().duration())
            .or(self.entry.absorption_time)
    }
}

impl TimelineValue for CarbStatus {
    fn start_date(&self) -> DateTime<Utc> {
        self.entry.start_date
    }
}

// ============================================================================
// Recommendation Types
// ============================================================================

/// Which kind of dose the caller wants recommended
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DoseRecommendationType {
    ManualBolus,
    AutomaticBolus,
    TempBasal,
}

impl DoseRecommendationType {
    pub fn is_automated(&self) -> bool {
        matches!(self, Self::AutomaticBolus | Self::TempBasal)
    }
}

/// A temporary basal rate to run for `duration`
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TempBasalRecommendation {
    pub units_per_hour: f64,
    #[serde(with = "crate::time::serde_seconds")]
    pub duration: Duration,
}

/// Dose the loop may enact without user confirmation
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutomaticDoseRecommendation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basal_adjustment: Option<TempBasalRecommendation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bolus_units: Option<f64>,
}

/// Informational context attached to a manual bolus recommendation
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BolusRecommendationNotice {
    #[serde(rename_all = "camelCase")]
    GlucoseBelowSuspendThreshold { min_glucose: SimpleGlucoseValue },
    #[serde(rename_all = "camelCase")]
    CurrentGlucoseBelowTarget { glucose: SimpleGlucoseValue },
    #[serde(rename_all = "camelCase")]
    PredictedGlucoseBelowTarget { min_glucose: SimpleGlucoseValue },
    PredictedGlucoseInRange,
    #[serde(rename_all = "camelCase")]
    AllGlucoseBelowTarget { min_glucose: SimpleGlucoseValue },
}

/// Bolus amount suggested to the user
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManualBolusRecommendation {
    pub amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notice: Option<BolusRecommendationNotice>,
}

/// Final dosing output; exactly one branch is populated
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoopAlgorithmDoseRecommendation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual: Option<ManualBolusRecommendation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automatic: Option<AutomaticDoseRecommendation>,
}

impl LoopAlgorithmDoseRecommendation {
    pub fn manual(recommendation: ManualBolusRecommendation) -> Self {
        Self {
            manual: Some(recommendation),
            automatic: None,
        }
    }

    pub fn automatic(recommendation: AutomaticDoseRecommendation) -> Self {
        Self {
            manual: None,
            automatic: Some(recommendation),
        }
    }
}
