//! End-to-end forecast and dose recommendation.
//!
//! [`generate_prediction`] is best-effort: it builds whatever forecast and
//! effects the inputs allow and never fails. [`run`] adds the validation gate
//! and the dosing policy on top, reporting problems as an [`AlgorithmError`]
//! carried in the output next to the forecast.

use crate::carb::{self, CarbAbsorptionModel, CarbMapOptions};
use crate::dose::{self, default_insulin_activity_duration, BasalRelativeDose};
use crate::dosing::{self, DEFAULT_BOLUS_PARTIAL_APPLICATION_FACTOR};
use crate::error::AlgorithmError;
use crate::glucose;
use crate::insulin::{InsulinModelProvider, PresetInsulinModelProvider};
use crate::prediction::{self, AlgorithmEffectsOptions, LoopAlgorithmEffects, LoopPrediction};
use crate::retrospective::{
    self, IntegralRetrospectiveCorrection, RetrospectiveCorrection, StandardRetrospectiveCorrection,
};
use crate::schedule::{self, AbsoluteScheduleValue, GlucoseRange};
use crate::time::{self, DateInterval};
use crate::types::{
    filter_date_range, AutomaticDoseRecommendation, CarbEntry, DeliveryType, DoseRecommendationType, GlucoseEffect,
    GlucoseSample, InsulinDose, InsulinType, LoopAlgorithmDoseRecommendation, PredictedGlucoseValue,
};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

// ============================================================================
// Input / Output
// ============================================================================

/// Everything one algorithm invocation needs, in engine units (mg/dL, U, g)
#[derive(Clone, Debug, PartialEq)]
pub struct LoopAlgorithmInput {
    pub prediction_start: DateTime<Utc>,
    /// Ascending by date
    pub glucose_history: Vec<GlucoseSample>,
    /// Reconciled deliveries, ascending by start
    pub doses: Vec<InsulinDose>,
    pub carb_entries: Vec<CarbEntry>,
    /// Scheduled basal, U/hr
    pub basal: Vec<AbsoluteScheduleValue<f64>>,
    /// Insulin sensitivity, mg/dL per U
    pub sensitivity: Vec<AbsoluteScheduleValue<f64>>,
    /// Carb ratio, g per U
    pub carb_ratio: Vec<AbsoluteScheduleValue<f64>>,
    pub target: Vec<AbsoluteScheduleValue<GlucoseRange>>,
    pub suspend_threshold: Option<f64>,
    pub max_bolus: f64,
    pub max_basal_rate: f64,
    pub use_integral_retrospective_correction: bool,
    pub include_positive_velocity_and_rc: bool,
    pub use_mid_absorption_isf: bool,
    pub carb_absorption_model: CarbAbsorptionModel,
    pub recommendation_insulin_type: InsulinType,
    pub recommendation_type: DoseRecommendationType,
    pub automatic_bolus_application_factor: Option<f64>,
}

/// Tuning that is not part of a single scenario
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AlgorithmSettings {
    pub insulin_models: PresetInsulinModelProvider,
    /// `absorption_model` is taken from the input instead
    pub carb_options: CarbMapOptions,
    pub effects: AlgorithmEffectsOptions,
}

/// Result of [`run`]: the forecast is always present, the recommendation
/// only when every precondition held
#[derive(Clone, Debug, PartialEq)]
pub struct LoopAlgorithmOutput {
    pub recommendation_result: Result<LoopAlgorithmDoseRecommendation, AlgorithmError>,
    pub predicted_glucose: Vec<PredictedGlucoseValue>,
    pub effects: LoopAlgorithmEffects,
    pub doses_relative_to_basal: Vec<BasalRelativeDose>,
    pub active_insulin: Option<f64>,
    pub active_carbs: Option<f64>,
}

impl LoopAlgorithmOutput {
    pub fn recommendation(&self) -> Option<&LoopAlgorithmDoseRecommendation> {
        self.recommendation_result.as_ref().ok()
    }
}

// ============================================================================
// Prediction
// ============================================================================

/// Forecast glucose from the latest sample using the enabled effects.
///
/// Insulin history is only used when the basal timeline starts at or before
/// the first dose; otherwise active insulin is reported as zero.
pub fn generate_prediction(input: &LoopAlgorithmInput, settings: &AlgorithmSettings) -> LoopPrediction {
    let start = input.prediction_start;
    let delta = time::default_delta();
    let provider = &settings.insulin_models;
    let carb_options = CarbMapOptions {
        absorption_model: input.carb_absorption_model,
        ..settings.carb_options
    };

    let mut effects = LoopAlgorithmEffects::default();
    let mut doses_relative_to_basal = Vec::new();

    let basal_covers_doses = match (input.doses.first(), input.basal.first()) {
        (Some(dose), Some(basal)) => basal.start_date <= dose.start_date,
        _ => false,
    };

    let active_insulin = if basal_covers_doses {
        doses_relative_to_basal = dose::annotated(&input.doses, &input.basal, false);

        let effects_start = time::floored(start - carb::maximum_absorption_time(), delta);
        effects.insulin = if input.use_mid_absorption_isf {
            dose::glucose_effects_mid_absorption_isf(
                &doses_relative_to_basal,
                provider,
                &input.sensitivity,
                Some(effects_start),
                None,
                delta,
            )
        } else {
            dose::glucose_effects(&doses_relative_to_basal, provider, &input.sensitivity, Some(effects_start), None, delta)
        };

        effects.insulin_counteraction = glucose::counteraction_effects(&input.glucose_history, &effects.insulin);
        dose::insulin_on_board(&doses_relative_to_basal, provider, start)
    } else {
        if !input.doses.is_empty() {
            warn!("Basal timeline does not cover the first dose; insulin history ignored");
        }
        0.0
    };

    effects.carb_status = carb::map_carb_status(
        &input.carb_entries,
        &effects.insulin_counteraction,
        &input.carb_ratio,
        &input.sensitivity,
        &carb_options,
    );
    effects.carbs = carb::dynamic_glucose_effects(
        &effects.carb_status,
        Some(start - retrospective::retrospection_interval()),
        None,
        &input.carb_ratio,
        &input.sensitivity,
        &carb_options,
    );
    let active_carbs = carb::dynamic_carbs_on_board_at(&effects.carb_status, start, &carb_options);

    let discrepancies = glucose::subtracting(&effects.insulin_counteraction, &effects.carbs, delta);
    let summing_interval = time::from_seconds(time::seconds(retrospective::grouping_interval()) * 1.01);
    effects.retrospective_glucose_discrepancies = glucose::combined_sums(&discrepancies, summing_interval);

    let mut glucose_prediction = Vec::new();

    if let Some(latest) = input.glucose_history.last() {
        let mut rc: Box<dyn RetrospectiveCorrection> = if input.use_integral_retrospective_correction {
            Box::new(IntegralRetrospectiveCorrection::new(retrospective::effect_duration()))
        } else {
            Box::new(StandardRetrospectiveCorrection::new(retrospective::effect_duration()))
        };
        effects.retrospective_correction = rc.compute_effect(
            latest,
            &effects.retrospective_glucose_discrepancies,
            retrospective::recency_interval(),
            retrospective::grouping_interval(),
        );
        effects.total_glucose_correction_effect = rc.total_glucose_correction_effect();

        let mut use_momentum = false;
        if settings.effects.contains(AlgorithmEffectsOptions::MOMENTUM) {
            let recent = filter_date_range(
                &input.glucose_history,
                Some(start - glucose::momentum_data_interval()),
                Some(start),
            );
            effects.momentum = glucose::linear_momentum_effect(&recent, glucose::momentum_duration(), delta);
            use_momentum = input.include_positive_velocity_and_rc || !is_rising(&effects.momentum);
        }

        let mut timelines: Vec<&[GlucoseEffect]> = Vec::new();
        if settings.effects.contains(AlgorithmEffectsOptions::CARBS) {
            timelines.push(&effects.carbs);
        }
        if settings.effects.contains(AlgorithmEffectsOptions::INSULIN) {
            timelines.push(&effects.insulin);
        }
        if settings.effects.contains(AlgorithmEffectsOptions::RETROSPECTION)
            && (input.include_positive_velocity_and_rc || !is_rising(&effects.retrospective_correction))
        {
            timelines.push(&effects.retrospective_correction);
        }

        let momentum: &[GlucoseEffect] = if use_momentum { &effects.momentum } else { &[] };
        glucose_prediction = prediction::predict_glucose(latest, momentum, &timelines);

        // dosing needs the forecast to span a full insulin action
        let final_date = latest.start_date + default_insulin_activity_duration();
        if let Some(last) = glucose_prediction.last().copied() {
            if last.start_date < final_date {
                glucose_prediction.push(PredictedGlucoseValue::new(final_date, last.quantity));
            }
        }
    }

    debug!(
        "Prediction: {} points, {} insulin effects, {} carb effects, IOB {:.2} U, COB {:.1} g",
        glucose_prediction.len(),
        effects.insulin.len(),
        effects.carbs.len(),
        active_insulin,
        active_carbs
    );

    LoopPrediction {
        glucose: glucose_prediction,
        effects,
        doses_relative_to_basal,
        active_insulin: Some(active_insulin),
        active_carbs: Some(active_carbs),
    }
}

fn is_rising(effects: &[GlucoseEffect]) -> bool {
    glucose::net_effect(effects).map_or(false, |net| net.quantity > 0.0)
}

// ============================================================================
// Recommendation
// ============================================================================

/// Span the sensitivity timeline must cover: from the earliest dose or
/// glucose sample through the end of both historical dose effects and the
/// recommended dose's effect, snapped outward to the simulation grid.
pub fn timeline_interval_for_sensitivity(
    doses: &[InsulinDose],
    glucose_history_start: DateTime<Utc>,
    recommendation_effect_interval: DateInterval,
) -> DateInterval {
    let delta = time::default_delta();

    let start = doses
        .first()
        .map_or(glucose_history_start, |dose| dose.start_date.min(glucose_history_start));

    let end = doses
        .iter()
        .map(|dose| dose.end_date + default_insulin_activity_duration())
        .max()
        .map_or(recommendation_effect_interval.end, |end| end.max(recommendation_effect_interval.end));

    DateInterval::new(time::floored(start, delta), time::ceiled(end, delta))
}

/// Forecast, validate and recommend
pub fn run(input: &LoopAlgorithmInput, settings: &AlgorithmSettings) -> LoopAlgorithmOutput {
    let prediction = generate_prediction(input, settings);
    let recommendation_result = recommend(input, settings, &prediction);

    match &recommendation_result {
        Ok(recommendation) => info!("Recommendation ({:?}): {:?}", input.recommendation_type, recommendation),
        Err(e) => warn!("No recommendation: {}", e),
    }

    LoopAlgorithmOutput {
        recommendation_result,
        predicted_glucose: prediction.glucose,
        effects: prediction.effects,
        doses_relative_to_basal: prediction.doses_relative_to_basal,
        active_insulin: prediction.active_insulin,
        active_carbs: prediction.active_carbs,
    }
}

fn recommend(
    input: &LoopAlgorithmInput,
    settings: &AlgorithmSettings,
    prediction: &LoopPrediction,
) -> Result<LoopAlgorithmDoseRecommendation, AlgorithmError> {
    let start = input.prediction_start;

    let (Some(first_glucose), Some(latest_glucose)) = (input.glucose_history.first(), input.glucose_history.last())
    else {
        return Err(AlgorithmError::MissingGlucose);
    };

    if start - latest_glucose.start_date >= dosing::input_data_recency_interval() {
        return Err(AlgorithmError::GlucoseTooOld);
    }

    if input.recommendation_type.is_automated()
        && input
            .doses
            .iter()
            .any(|dose| dose.delivery_type == DeliveryType::Basal && dose.end_date > start)
    {
        return Err(AlgorithmError::FutureBasalNotAllowed);
    }

    let model = settings.insulin_models.model(Some(input.recommendation_insulin_type));
    let needed = timeline_interval_for_sensitivity(
        &input.doses,
        first_glucose.start_date,
        DateInterval::with_duration(start, model.effect_duration()),
    );
    match (input.sensitivity.first(), input.sensitivity.last()) {
        (Some(first), _) if first.start_date > needed.start => {
            return Err(AlgorithmError::SensitivityTimelineStartsTooLate)
        }
        (_, Some(last)) if last.end_date < needed.end => return Err(AlgorithmError::SensitivityTimelineEndsTooEarly),
        (None, _) | (_, None) => return Err(AlgorithmError::SensitivityTimelineStartsTooLate),
        _ => {}
    }

    let neutral_basal_rate = schedule::closest_prior(&input.basal, start)
        .ok_or(AlgorithmError::BasalTimelineIncomplete)?
        .value;

    let suspend_threshold = input
        .suspend_threshold
        .or_else(|| schedule::closest_prior(&input.target, start).map(|range| range.value.lower_bound))
        .ok_or(AlgorithmError::MissingSuspendThreshold)?;

    let flat_sensitivity;
    let correction_sensitivity: &[AbsoluteScheduleValue<f64>] = if input.use_mid_absorption_isf {
        &input.sensitivity
    } else {
        let isf = schedule::value_at(&input.sensitivity, start).ok_or(AlgorithmError::SensitivityTimelineEndsTooEarly)?;
        flat_sensitivity = [AbsoluteScheduleValue::new(start, start + model.effect_duration(), isf)];
        &flat_sensitivity
    };

    let correction = dosing::insulin_correction(
        &prediction.glucose,
        start,
        &input.target,
        suspend_threshold,
        correction_sensitivity,
        model,
    );
    debug!("Correction: {:?}", correction);

    let active_insulin = prediction.active_insulin.unwrap_or(0.0);

    let recommendation = match input.recommendation_type {
        DoseRecommendationType::ManualBolus => LoopAlgorithmDoseRecommendation::manual(
            dosing::recommend_manual_bolus(&correction, input.max_bolus, latest_glucose, &input.target),
        ),
        DoseRecommendationType::AutomaticBolus => {
            let automatic = dosing::recommend_automatic_dose(
                &correction,
                input
                    .automatic_bolus_application_factor
                    .unwrap_or(DEFAULT_BOLUS_PARTIAL_APPLICATION_FACTOR),
                neutral_basal_rate,
                active_insulin,
                input.max_bolus,
            );
            LoopAlgorithmDoseRecommendation::automatic(automatic.unwrap_or_default())
        }
        DoseRecommendationType::TempBasal => {
            let temp = dosing::recommend_temp_basal(
                &correction,
                neutral_basal_rate,
                active_insulin,
                input.max_bolus,
                input.max_basal_rate,
            );
            LoopAlgorithmDoseRecommendation::automatic(AutomaticDoseRecommendation {
                basal_adjustment: Some(temp),
                bolus_units: None,
            })
        }
    };

    Ok(recommendation)
}
