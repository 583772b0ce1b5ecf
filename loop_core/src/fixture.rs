//! JSON scenario boundary.
//!
//! A fixture is one self-contained algorithm invocation: history, schedules,
//! limits and flags, all in mg/dL, grams and units. Flags left out of the
//! fixture fall back to the `[algorithm]` and `[carbs]` sections of [`Config`].
//!
//! Doses may be given already reconciled (`doses`) or as raw pump history
//! (`pumpEvents`); the latter is reconciled before it reaches the engine.

use crate::algorithm::{LoopAlgorithmInput, LoopAlgorithmOutput};
use crate::carb::CarbAbsorptionModel;
use crate::config::Config;
use crate::dose::BasalRelativeDose;
use crate::error::AlgorithmError;
use crate::prediction::LoopAlgorithmEffects;
use crate::reconcile::{self, DoseEntry};
use crate::schedule::{AbsoluteScheduleValue, GlucoseRange};
use crate::types::{
    CarbEntry, DeliveryType, DoseRecommendationType, GlucoseSample, GlucoseTrend, InsulinDose, InsulinType,
    LoopAlgorithmDoseRecommendation, PredictedGlucoseValue,
};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;
use tracing::debug;

/// Provenance recorded for samples that do not name one
pub const DEFAULT_PROVENANCE_IDENTIFIER: &str = "loop-algorithm.fixture";

// ============================================================================
// Input Records
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FixtureGlucoseSample {
    #[serde(alias = "startDate")]
    pub date: DateTime<Utc>,
    /// mg/dL
    #[serde(alias = "quantity")]
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance_identifier: Option<String>,
    #[serde(default)]
    pub is_display_only: bool,
    #[serde(default)]
    pub was_user_entered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trend: Option<GlucoseTrend>,
}

impl From<FixtureGlucoseSample> for GlucoseSample {
    fn from(sample: FixtureGlucoseSample) -> Self {
        GlucoseSample {
            start_date: sample.date,
            quantity: sample.value,
            is_display_only: sample.is_display_only,
            was_user_entered: sample.was_user_entered,
            provenance_identifier: sample
                .provenance_identifier
                .unwrap_or_else(|| DEFAULT_PROVENANCE_IDENTIFIER.to_string()),
            trend: sample.trend,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FixtureInsulinDose {
    #[serde(rename = "type")]
    pub delivery_type: DeliveryType,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    /// Units delivered
    pub volume: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insulin_type: Option<InsulinType>,
}

impl From<FixtureInsulinDose> for InsulinDose {
    fn from(dose: FixtureInsulinDose) -> Self {
        InsulinDose {
            delivery_type: dose.delivery_type,
            start_date: dose.start_date,
            end_date: dose.end_date,
            volume: dose.volume,
            insulin_type: dose.insulin_type,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FixtureCarbEntry {
    #[serde(alias = "startDate")]
    pub date: DateTime<Utc>,
    #[serde(alias = "quantity")]
    pub grams: f64,
    /// Seconds
    #[serde(
        default,
        with = "crate::time::serde_seconds_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub absorption_time: Option<Duration>,
}

impl From<FixtureCarbEntry> for CarbEntry {
    fn from(entry: FixtureCarbEntry) -> Self {
        CarbEntry::new(entry.date, entry.grams, entry.absorption_time)
    }
}

/// Target range segment, flattened the way fixtures write it
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FixtureTargetValue {
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub lower_bound: f64,
    pub upper_bound: f64,
}

impl From<FixtureTargetValue> for AbsoluteScheduleValue<GlucoseRange> {
    fn from(target: FixtureTargetValue) -> Self {
        AbsoluteScheduleValue::new(
            target.start_date,
            target.end_date,
            GlucoseRange::new(target.lower_bound, target.upper_bound),
        )
    }
}

// ============================================================================
// Fixture Input
// ============================================================================

/// One scenario as read from JSON
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FixtureInput {
    pub prediction_start: DateTime<Utc>,
    pub glucose_history: Vec<FixtureGlucoseSample>,
    #[serde(default)]
    pub doses: Vec<FixtureInsulinDose>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pump_events: Vec<DoseEntry>,
    #[serde(default)]
    pub carb_entries: Vec<FixtureCarbEntry>,
    pub basal: Vec<AbsoluteScheduleValue<f64>>,
    pub sensitivity: Vec<AbsoluteScheduleValue<f64>>,
    pub carb_ratio: Vec<AbsoluteScheduleValue<f64>>,
    pub target: Vec<FixtureTargetValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend_threshold: Option<f64>,
    pub max_bolus: f64,
    pub max_basal_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_integral_retrospective_correction: Option<bool>,
    #[serde(
        default,
        rename = "includePositiveVelocityAndRC",
        alias = "includePositiveVelocityAndRc",
        skip_serializing_if = "Option::is_none"
    )]
    pub include_positive_velocity_and_rc: Option<bool>,
    #[serde(
        default,
        rename = "useMidAbsorptionISF",
        alias = "useMidAbsorptionIsf",
        skip_serializing_if = "Option::is_none"
    )]
    pub use_mid_absorption_isf: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carb_absorption_model: Option<CarbAbsorptionModel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation_insulin_type: Option<InsulinType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation_type: Option<DoseRecommendationType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automatic_bolus_application_factor: Option<f64>,
}

impl FixtureInput {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        Ok(serde_json::from_reader(reader)?)
    }

    /// Read a fixture file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let fixture = Self::from_json(&contents)?;
        debug!("Loaded fixture from {:?}", path);
        Ok(fixture)
    }

    /// Validate and convert into engine input.
    ///
    /// Flags the fixture leaves unset come from `config`. Every timeline is
    /// sorted by start date on the way through.
    pub fn into_input(self, config: &Config) -> Result<LoopAlgorithmInput> {
        self.validate()?;
        let defaults = &config.algorithm;

        let mut glucose_history: Vec<GlucoseSample> = self.glucose_history.into_iter().map(Into::into).collect();
        glucose_history.sort_by_key(|sample| sample.start_date);

        let mut pump_events = self.pump_events;
        pump_events.sort_by_key(|entry| entry.start_date);
        let mut doses: Vec<InsulinDose> = self.doses.into_iter().map(Into::into).collect();
        if !pump_events.is_empty() {
            let reconciled = reconcile::reconciled_insulin_doses(&pump_events);
            debug!("Reconciled {} pump events into {} doses", pump_events.len(), reconciled.len());
            doses.extend(reconciled);
        }
        doses.sort_by_key(|dose| dose.start_date);

        let mut carb_entries: Vec<CarbEntry> = self.carb_entries.into_iter().map(Into::into).collect();
        carb_entries.sort_by_key(|entry| entry.start_date);

        let mut target: Vec<AbsoluteScheduleValue<GlucoseRange>> = self.target.into_iter().map(Into::into).collect();
        target.sort_by_key(|value| value.start_date);

        Ok(LoopAlgorithmInput {
            prediction_start: self.prediction_start,
            glucose_history,
            doses,
            carb_entries,
            basal: sorted(self.basal),
            sensitivity: sorted(self.sensitivity),
            carb_ratio: sorted(self.carb_ratio),
            target,
            suspend_threshold: self.suspend_threshold,
            max_bolus: self.max_bolus,
            max_basal_rate: self.max_basal_rate,
            use_integral_retrospective_correction: self
                .use_integral_retrospective_correction
                .unwrap_or(defaults.use_integral_retrospective_correction),
            include_positive_velocity_and_rc: self
                .include_positive_velocity_and_rc
                .unwrap_or(defaults.include_positive_velocity_and_rc),
            use_mid_absorption_isf: self.use_mid_absorption_isf.unwrap_or(defaults.use_mid_absorption_isf),
            carb_absorption_model: self.carb_absorption_model.unwrap_or(config.carbs.absorption_model),
            recommendation_insulin_type: self
                .recommendation_insulin_type
                .unwrap_or(defaults.recommendation_insulin_type),
            recommendation_type: self.recommendation_type.unwrap_or(defaults.recommendation_type),
            automatic_bolus_application_factor: self
                .automatic_bolus_application_factor
                .or(Some(defaults.automatic_bolus_application_factor)),
        })
    }

    fn validate(&self) -> Result<()> {
        check_limit("maxBolus", self.max_bolus)?;
        check_limit("maxBasalRate", self.max_basal_rate)?;
        if let Some(threshold) = self.suspend_threshold {
            check_limit("suspendThreshold", threshold)?;
        }
        if let Some(factor) = self.automatic_bolus_application_factor {
            if !(0.0..=1.0).contains(&factor) {
                return Err(Error::Fixture(format!(
                    "automaticBolusApplicationFactor {} is outside 0..=1",
                    factor
                )));
            }
        }

        if let Some(sample) = self.glucose_history.iter().find(|s| !s.value.is_finite()) {
            return Err(Error::Fixture(format!("glucose value at {} is not finite", sample.date)));
        }
        if let Some(entry) = self.carb_entries.iter().find(|e| !e.grams.is_finite() || e.grams < 0.0) {
            return Err(Error::Fixture(format!("carb entry at {} has invalid grams", entry.date)));
        }

        for dose in &self.doses {
            check_interval("dose", dose.start_date, dose.end_date)?;
        }
        for event in &self.pump_events {
            check_interval("pump event", event.start_date, event.end_date)?;
        }
        for (name, timeline) in [
            ("basal", &self.basal),
            ("sensitivity", &self.sensitivity),
            ("carbRatio", &self.carb_ratio),
        ] {
            for value in timeline {
                check_interval(name, value.start_date, value.end_date)?;
            }
        }
        for target in &self.target {
            check_interval("target", target.start_date, target.end_date)?;
            if target.lower_bound > target.upper_bound {
                return Err(Error::Fixture(format!(
                    "target at {} has lowerBound {} above upperBound {}",
                    target.start_date, target.lower_bound, target.upper_bound
                )));
            }
        }
        Ok(())
    }
}

fn check_limit(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(Error::Fixture(format!("{} must be a non-negative number, got {}", name, value)))
    }
}

fn check_interval(name: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<()> {
    if end < start {
        return Err(Error::Fixture(format!("{} ends at {} before it starts at {}", name, end, start)));
    }
    Ok(())
}

fn sorted<T>(mut timeline: Vec<AbsoluteScheduleValue<T>>) -> Vec<AbsoluteScheduleValue<T>> {
    timeline.sort_by_key(|value| value.start_date);
    timeline
}

// ============================================================================
// Fixture Output
// ============================================================================

/// Why no recommendation was produced
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct FixtureError {
    pub code: AlgorithmError,
    pub message: String,
}

/// Serialized result of one run
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FixtureOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<LoopAlgorithmDoseRecommendation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FixtureError>,
    pub predicted_glucose: Vec<PredictedGlucoseValue>,
    pub active_insulin: Option<f64>,
    pub active_carbs: Option<f64>,
    pub effects: LoopAlgorithmEffects,
    pub doses_relative_to_basal: Vec<BasalRelativeDose>,
}

impl From<&LoopAlgorithmOutput> for FixtureOutput {
    fn from(output: &LoopAlgorithmOutput) -> Self {
        let (recommendation, error) = match &output.recommendation_result {
            Ok(recommendation) => (Some(*recommendation), None),
            Err(e) => (
                None,
                Some(FixtureError {
                    code: *e,
                    message: e.to_string(),
                }),
            ),
        };
        FixtureOutput {
            recommendation,
            error,
            predicted_glucose: output.predicted_glucose.clone(),
            active_insulin: output.active_insulin,
            active_carbs: output.active_carbs,
            effects: output.effects.clone(),
            doses_relative_to_basal: output.doses_relative_to_basal.clone(),
        }
    }
}

impl FixtureOutput {
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::{self, AlgorithmSettings};
    use crate::reconcile::{DoseEntryKind, DoseUnit};
    use chrono::TimeZone;
    use serde_json::json;

    fn scenario() -> serde_json::Value {
        json!({
            "predictionStart": "2024-01-03T12:00:00Z",
            "glucoseHistory": [
                {"date": "2024-01-03T11:56:00Z", "value": 160},
                {"date": "2024-01-03T11:41:00Z", "value": 100},
                {"date": "2024-01-03T11:51:00Z", "value": 140},
                {"date": "2024-01-03T11:46:00Z", "value": 120}
            ],
            "doses": [],
            "carbEntries": [],
            "basal": [{"startDate": "2024-01-03T02:00:00Z", "endDate": "2024-01-03T12:00:00Z", "value": 1.0}],
            "sensitivity": [{"startDate": "2024-01-03T02:00:00Z", "endDate": "2024-01-04T00:00:00Z", "value": 55}],
            "carbRatio": [{"startDate": "2024-01-03T02:00:00Z", "endDate": "2024-01-04T00:00:00Z", "value": 10}],
            "target": [{
                "startDate": "2024-01-03T02:00:00Z",
                "endDate": "2024-01-04T00:00:00Z",
                "lowerBound": 100,
                "upperBound": 110
            }],
            "suspendThreshold": 65,
            "maxBolus": 6,
            "maxBasalRate": 8,
            "recommendationType": "tempBasal"
        })
    }

    fn parse(value: serde_json::Value) -> Result<LoopAlgorithmInput> {
        FixtureInput::from_json(&value.to_string())?.into_input(&Config::default())
    }

    #[test]
    fn test_parse_sorts_and_applies_defaults() {
        let input = parse(scenario()).unwrap();

        let values: Vec<f64> = input.glucose_history.iter().map(|s| s.quantity).collect();
        assert_eq!(values, vec![100.0, 120.0, 140.0, 160.0]);
        assert_eq!(input.glucose_history[0].provenance_identifier, DEFAULT_PROVENANCE_IDENTIFIER);
        assert_eq!(input.recommendation_type, DoseRecommendationType::TempBasal);
        assert_eq!(input.recommendation_insulin_type, InsulinType::Novolog);
        assert!(input.include_positive_velocity_and_rc);
        assert!(!input.use_integral_retrospective_correction);
        assert_eq!(input.carb_absorption_model, CarbAbsorptionModel::PiecewiseLinear);
        assert_eq!(input.target[0].value, GlucoseRange::new(100.0, 110.0));
        assert_eq!(input.automatic_bolus_application_factor, Some(0.4));
    }

    #[test]
    fn test_config_defaults_fill_missing_flags() {
        let mut config = Config::default();
        config.algorithm.use_integral_retrospective_correction = true;
        config.algorithm.recommendation_type = DoseRecommendationType::ManualBolus;
        config.carbs.absorption_model = CarbAbsorptionModel::Linear;

        let mut value = scenario();
        value.as_object_mut().unwrap().remove("recommendationType");
        value["includePositiveVelocityAndRC"] = json!(false);

        let input = FixtureInput::from_json(&value.to_string())
            .unwrap()
            .into_input(&config)
            .unwrap();
        assert!(input.use_integral_retrospective_correction);
        assert_eq!(input.carb_absorption_model, CarbAbsorptionModel::Linear);
        assert!(!input.include_positive_velocity_and_rc);
        assert_eq!(input.recommendation_type, DoseRecommendationType::ManualBolus);
    }

    #[test]
    fn test_field_aliases() {
        let mut value = scenario();
        value["glucoseHistory"] = json!([{"startDate": "2024-01-03T11:56:00Z", "quantity": 150}]);
        value["carbEntries"] = json!([{"startDate": "2024-01-03T11:00:00Z", "quantity": 30, "absorptionTime": 7200}]);
        value["doses"] = json!([{
            "type": "bolus",
            "startDate": "2024-01-03T11:00:00Z",
            "endDate": "2024-01-03T11:00:00Z",
            "volume": 2.5,
            "insulinType": "fiasp"
        }]);

        let input = parse(value).unwrap();
        assert_eq!(input.glucose_history[0].quantity, 150.0);
        assert_eq!(input.carb_entries[0].grams, 30.0);
        assert_eq!(input.carb_entries[0].absorption_time, Some(Duration::hours(2)));
        assert_eq!(input.doses[0].delivery_type, DeliveryType::Bolus);
        assert_eq!(input.doses[0].insulin_type, Some(InsulinType::Fiasp));
    }

    #[test]
    fn test_pump_events_are_reconciled() {
        let at = |h: u32, m: u32| Utc.with_ymd_and_hms(2024, 1, 3, h, m, 0).unwrap();
        let mut value = scenario();
        value["pumpEvents"] = serde_json::to_value(vec![
            DoseEntry::new(DoseEntryKind::TempBasal, at(10, 0), at(10, 30), 2.0, DoseUnit::UnitsPerHour),
            DoseEntry::new(DoseEntryKind::TempBasal, at(10, 10), at(10, 40), 0.0, DoseUnit::UnitsPerHour),
        ])
        .unwrap();

        let input = parse(value).unwrap();
        assert_eq!(input.doses.len(), 2);
        assert_eq!(input.doses[0].end_date, at(10, 10));
        assert!(input.doses.windows(2).all(|w| w[0].end_date <= w[1].start_date));
    }

    #[test]
    fn test_invalid_fixtures_rejected() {
        let mut value = scenario();
        value["maxBolus"] = json!(-1);
        assert!(matches!(parse(value), Err(Error::Fixture(_))));

        let mut value = scenario();
        value["target"][0]["lowerBound"] = json!(120);
        assert!(matches!(parse(value), Err(Error::Fixture(_))));

        let mut value = scenario();
        value["basal"][0]["endDate"] = json!("2024-01-03T01:00:00Z");
        assert!(matches!(parse(value), Err(Error::Fixture(_))));

        let mut value = scenario();
        value.as_object_mut().unwrap().remove("maxBasalRate");
        assert!(matches!(parse(value), Err(Error::Json(_))));
    }

    #[test]
    fn test_output_carries_recommendation() {
        let input = parse(scenario()).unwrap();
        let output = FixtureOutput::from(&algorithm::run(&input, &AlgorithmSettings::default()));
        let json: serde_json::Value = serde_json::from_str(&output.to_json_pretty().unwrap()).unwrap();

        assert!(json.get("error").is_none());
        let rate = json["recommendation"]["automatic"]["basalAdjustment"]["unitsPerHour"]
            .as_f64()
            .unwrap();
        assert!(rate > 1.0);
        assert!(!json["predictedGlucose"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_output_carries_error_code() {
        let mut value = scenario();
        value["predictionStart"] = json!("2024-01-03T12:30:00Z");
        let input = parse(value).unwrap();
        let output = FixtureOutput::from(&algorithm::run(&input, &AlgorithmSettings::default()));
        let json = serde_json::to_value(&output).unwrap();

        assert!(json.get("recommendation").is_none());
        assert_eq!(json["error"]["code"], "glucoseTooOld");
        assert!(!json["predictedGlucose"].as_array().unwrap().is_empty());
    }
}
