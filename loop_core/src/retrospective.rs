//! Retrospective correction.
//!
//! Compares what the models predicted against what glucose actually did over
//! the recent past and projects the unexplained part forward as a decaying
//! effect.

use crate::glucose;
use crate::time;
use crate::types::{filter_date_range, GlucoseChange, GlucoseEffect, GlucoseSample};
use chrono::Duration;
use tracing::debug;

/// Width of the window discrepancies are summed over
pub fn grouping_interval() -> Duration {
    Duration::minutes(30)
}

/// How long a correction effect lasts by default
pub fn effect_duration() -> Duration {
    Duration::minutes(60)
}

/// Discrepancies older than this (relative to the latest glucose) are ignored
pub fn recency_interval() -> Duration {
    Duration::minutes(15)
}

/// Strategy turning summed discrepancies into a forward glucose effect
pub trait RetrospectiveCorrection {
    /// Effect starting at `starting_glucose`, or empty when the latest
    /// discrepancy is stale
    fn compute_effect(
        &mut self,
        starting_glucose: &GlucoseSample,
        discrepancies: &[GlucoseChange],
        recency_interval: Duration,
        grouping_interval: Duration,
    ) -> Vec<GlucoseEffect>;

    /// Total correction applied by the last computation, in mg/dL
    fn total_glucose_correction_effect(&self) -> Option<f64>;
}

/// Latest discrepancy if it ended within `recency_interval` of `glucose`
fn current_discrepancy<'a>(
    starting_glucose: &GlucoseSample,
    discrepancies: &'a [GlucoseChange],
    recency_interval: Duration,
) -> Option<&'a GlucoseChange> {
    discrepancies
        .last()
        .filter(|d| starting_glucose.start_date - d.end_date <= recency_interval)
}

fn discrepancy_velocity(discrepancy: &GlucoseChange, value: f64, grouping_interval: Duration) -> f64 {
    let span = time::seconds(discrepancy.end_date - discrepancy.start_date);
    value / span.max(time::seconds(grouping_interval))
}

// ============================================================================
// Standard
// ============================================================================

/// Projects the latest discrepancy as a velocity decaying over a fixed time
#[derive(Clone, Debug, PartialEq)]
pub struct StandardRetrospectiveCorrection {
    pub effect_duration: Duration,
    total_glucose_correction_effect: Option<f64>,
}

impl StandardRetrospectiveCorrection {
    pub fn new(effect_duration: Duration) -> Self {
        Self {
            effect_duration,
            total_glucose_correction_effect: None,
        }
    }
}

impl RetrospectiveCorrection for StandardRetrospectiveCorrection {
    fn compute_effect(
        &mut self,
        starting_glucose: &GlucoseSample,
        discrepancies: &[GlucoseChange],
        recency_interval: Duration,
        grouping_interval: Duration,
    ) -> Vec<GlucoseEffect> {
        let Some(current) = current_discrepancy(starting_glucose, discrepancies, recency_interval) else {
            self.total_glucose_correction_effect = None;
            return Vec::new();
        };

        self.total_glucose_correction_effect = Some(current.quantity);
        let velocity = discrepancy_velocity(current, current.quantity, grouping_interval);
        glucose::decay_effect(starting_glucose, velocity, self.effect_duration, time::default_delta())
    }

    fn total_glucose_correction_effect(&self) -> Option<f64> {
        self.total_glucose_correction_effect
    }
}

// ============================================================================
// Integral
// ============================================================================

const CURRENT_DISCREPANCY_GAIN: f64 = 1.0;
const PERSISTENT_DISCREPANCY_GAIN: f64 = 2.0;
const DIFFERENTIAL_GAIN: f64 = 2.0;

/// How far back discrepancies are integrated
pub fn retrospection_interval() -> Duration {
    Duration::minutes(180)
}

fn correction_time_constant() -> Duration {
    Duration::minutes(60)
}

fn maximum_correction_effect_duration() -> Duration {
    Duration::minutes(180)
}

fn integral_forget() -> f64 {
    (-time::seconds(time::default_delta()) / time::seconds(correction_time_constant())).exp()
}

fn integral_gain() -> f64 {
    let forget = integral_forget();
    ((1.0 - forget) / forget) * (PERSISTENT_DISCREPANCY_GAIN - CURRENT_DISCREPANCY_GAIN)
}

fn proportional_gain() -> f64 {
    CURRENT_DISCREPANCY_GAIN - integral_gain()
}

/// Proportional-integral-differential correction over contiguous
/// same-sign discrepancies.
///
/// Persistent discrepancies raise the correction and lengthen how long it
/// lasts, up to three hours.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IntegralRetrospectiveCorrection {
    pub effect_duration: Duration,
    pub proportional_correction: Option<f64>,
    pub integral_correction: Option<f64>,
    pub differential_correction: Option<f64>,
    pub integral_correction_effect_duration: Option<Duration>,
    /// Contiguous same-sign discrepancies used, oldest first
    pub recent_discrepancy_values: Vec<f64>,
    total_glucose_correction_effect: Option<f64>,
}

impl IntegralRetrospectiveCorrection {
    pub fn new(effect_duration: Duration) -> Self {
        Self {
            effect_duration,
            ..Self::default()
        }
    }

    fn reset(&mut self) {
        self.proportional_correction = None;
        self.integral_correction = None;
        self.differential_correction = None;
        self.integral_correction_effect_duration = None;
        self.recent_discrepancy_values.clear();
        self.total_glucose_correction_effect = None;
    }
}

impl RetrospectiveCorrection for IntegralRetrospectiveCorrection {
    fn compute_effect(
        &mut self,
        starting_glucose: &GlucoseSample,
        discrepancies: &[GlucoseChange],
        recency_interval: Duration,
        grouping_interval: Duration,
    ) -> Vec<GlucoseEffect> {
        let Some(current) = current_discrepancy(starting_glucose, discrepancies, recency_interval) else {
            self.reset();
            return Vec::new();
        };

        let glucose_date = starting_glucose.start_date;
        let past = filter_date_range(discrepancies, Some(glucose_date - retrospection_interval()), Some(glucose_date));

        let max_gap = time::from_seconds(time::seconds(grouping_interval) * 1.01);
        let current_is_negative = current.quantity.is_sign_negative();
        let mut recent = Vec::new();
        let mut next = current;
        for discrepancy in past.iter().rev() {
            if discrepancy.quantity.is_sign_negative() != current_is_negative
                || next.end_date - discrepancy.end_date > max_gap
            {
                break;
            }
            recent.push(discrepancy.quantity);
            next = discrepancy;
        }
        recent.reverse();

        let delta_minutes = time::seconds(time::default_delta()) / 60.0;
        let mut integral = 0.0;
        let mut effect_minutes = time::seconds(self.effect_duration) / 60.0 - 2.0 * delta_minutes;
        for value in &recent {
            integral = integral_forget() * integral + integral_gain() * value;
            effect_minutes += 2.0 * delta_minutes;
        }

        let differential_discrepancy = match recent.len() {
            n if n > 1 => current.quantity - recent[n - 2],
            _ => 0.0,
        };

        let proportional = proportional_gain() * current.quantity;
        let differential = if differential_discrepancy < 0.0 {
            DIFFERENTIAL_GAIN * differential_discrepancy
        } else {
            0.0
        };
        let total = proportional + integral + differential;

        let max_minutes = time::seconds(maximum_correction_effect_duration()) / 60.0;
        let duration_minutes = effect_minutes.min(max_minutes).max(time::seconds(self.effect_duration) / 60.0);
        let duration = time::from_seconds(duration_minutes * 60.0);

        debug!(
            "Integral RC: proportional {:.2}, integral {:.2}, differential {:.2} over {} discrepancies",
            proportional,
            integral,
            differential,
            recent.len()
        );

        self.proportional_correction = Some(proportional);
        self.integral_correction = Some(integral);
        self.differential_correction = Some(differential);
        self.integral_correction_effect_duration = Some(duration);
        self.recent_discrepancy_values = recent;
        self.total_glucose_correction_effect = Some(total);

        let velocity = discrepancy_velocity(current, total, grouping_interval);
        glucose::decay_effect(starting_glucose, velocity, duration, time::default_delta())
    }

    fn total_glucose_correction_effect(&self) -> Option<f64> {
        self.total_glucose_correction_effect
    }
}
