//! Combining effect timelines into a glucose forecast.

use crate::dose::BasalRelativeDose;
use crate::types::{
    CarbStatus, GlucoseChange, GlucoseEffect, GlucoseEffectVelocity, GlucoseValue, PredictedGlucoseValue,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::str::FromStr;

bitflags::bitflags! {
    /// Which effects contribute to the forecast
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AlgorithmEffectsOptions: u8 {
        const CARBS = 1 << 0;
        const INSULIN = 1 << 1;
        const MOMENTUM = 1 << 2;
        const RETROSPECTION = 1 << 3;
    }
}

impl Default for AlgorithmEffectsOptions {
    fn default() -> Self {
        Self::all()
    }
}

impl FromStr for AlgorithmEffectsOptions {
    type Err = String;

    /// Parse a comma-separated list such as `carbs,insulin`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut options = Self::empty();
        for name in s.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            options |= match name.to_ascii_lowercase().as_str() {
                "carbs" => Self::CARBS,
                "insulin" => Self::INSULIN,
                "momentum" => Self::MOMENTUM,
                "retrospection" | "rc" => Self::RETROSPECTION,
                "all" => Self::all(),
                other => return Err(format!("unknown effect '{}'", other)),
            };
        }
        Ok(options)
    }
}

/// Intermediate effects computed while forecasting
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoopAlgorithmEffects {
    pub insulin: Vec<GlucoseEffect>,
    pub carbs: Vec<GlucoseEffect>,
    pub carb_status: Vec<CarbStatus>,
    pub retrospective_correction: Vec<GlucoseEffect>,
    pub momentum: Vec<GlucoseEffect>,
    pub insulin_counteraction: Vec<GlucoseEffectVelocity>,
    pub retrospective_glucose_discrepancies: Vec<GlucoseChange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_glucose_correction_effect: Option<f64>,
}

/// Forecast plus everything that went into it
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoopPrediction {
    pub glucose: Vec<PredictedGlucoseValue>,
    pub effects: LoopAlgorithmEffects,
    pub doses_relative_to_basal: Vec<BasalRelativeDose>,
    pub active_insulin: Option<f64>,
    pub active_carbs: Option<f64>,
}

/// Forecast glucose from `starting_glucose` by summing the step changes of
/// every effect timeline.
///
/// Momentum, when given, is blended in: it dominates the first steps and
/// hands over linearly to the summed effects by its last point.
pub fn predict_glucose<G: GlucoseValue>(
    starting_glucose: &G,
    momentum: &[GlucoseEffect],
    effects: &[&[GlucoseEffect]],
) -> Vec<PredictedGlucoseValue> {
    let mut changes: BTreeMap<DateTime<Utc>, f64> = BTreeMap::new();

    for timeline in effects {
        let mut previous = timeline.first().map_or(0.0, |e| e.quantity);
        for effect in timeline.iter() {
            *changes.entry(effect.start_date).or_insert(0.0) += effect.quantity - previous;
            previous = effect.quantity;
        }
    }

    // a two-point momentum has no room to blend
    if momentum.len() > 2 {
        let blend_count = (momentum.len() - 2) as f64;
        let time_delta = (momentum[1].start_date - momentum[0].start_date).num_milliseconds() as f64;
        let momentum_offset = (starting_glucose.start_date() - momentum[0].start_date).num_milliseconds() as f64;
        let blend_slope = 1.0 / blend_count;
        let blend_offset = momentum_offset / time_delta * blend_slope;

        let mut previous = momentum[0].quantity;
        for (index, effect) in momentum.iter().enumerate() {
            let change = effect.quantity - previous;
            let split = ((momentum.len() - index) as f64 / blend_count - blend_slope + blend_offset).clamp(0.0, 1.0);
            let summed = changes.get(&effect.start_date).copied().unwrap_or(0.0);
            changes.insert(effect.start_date, (1.0 - split) * summed + split * change);
            previous = effect.quantity;
        }
    }

    let start = starting_glucose.start_date();
    let mut prediction = vec![PredictedGlucoseValue::new(start, starting_glucose.quantity())];
    let mut value = starting_glucose.quantity();
    for (date, change) in changes.range(start..).filter(|(date, _)| **date > start) {
        value += change;
        prediction.push(PredictedGlucoseValue::new(*date, value));
    }
    prediction
}
