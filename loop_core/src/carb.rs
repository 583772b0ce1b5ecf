//! Carbohydrate absorption.
//!
//! - Absorption curves ([`CarbAbsorptionComputable`]) in normalized time
//! - Mapping observed insulin counteraction onto carb entries ([`map_carb_status`])
//! - Carbs-on-board and glucose-effect timelines, static and dynamic
//!
//! All times handed to the curves are `f64` seconds.

use crate::schedule::{self, CarbRatioTimeline, SensitivityTimeline};
use crate::time::{self, DateInterval};
use crate::types::{AbsorbedCarbValue, CarbEntry, CarbStatus, CarbValue, GlucoseEffect, GlucoseEffectVelocity};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Longest absorption time accepted for any entry
pub fn maximum_absorption_time() -> Duration {
    Duration::hours(10)
}

/// Absorption time used for entries that do not specify one
pub fn default_absorption_time() -> Duration {
    Duration::hours(3)
}

/// Time between eating and the first glucose effect
pub fn default_effect_delay() -> Duration {
    Duration::minutes(10)
}

pub const DEFAULT_ABSORPTION_TIME_OVERRUN: f64 = 1.5;
pub const DEFAULT_INITIAL_ABSORPTION_TIME_OVERRUN: f64 = 1.5;
pub const DEFAULT_ADAPTIVE_RATE_STANDBY_INTERVAL_FRACTION: f64 = 0.2;

// ============================================================================
// Absorption Curves
// ============================================================================

/// Shape of carb absorption over normalized time `t ∈ [0, 1]`
pub trait CarbAbsorptionComputable {
    /// Fraction absorbed after `percent_time` of the absorption time
    fn percent_absorption_at_percent_time(&self, percent_time: f64) -> f64;

    /// Inverse of [`Self::percent_absorption_at_percent_time`]
    fn percent_time_at_percent_absorption(&self, percent_absorption: f64) -> f64;

    /// Normalized absorption rate at `percent_time`
    fn percent_rate_at_percent_time(&self, percent_time: f64) -> f64;

    fn absorbed_carbs(&self, total: f64, time: f64, absorption_time: f64) -> f64 {
        total * self.percent_absorption_at_percent_time(time / absorption_time)
    }

    fn unabsorbed_carbs(&self, total: f64, time: f64, absorption_time: f64) -> f64 {
        total * (1.0 - self.percent_absorption_at_percent_time(time / absorption_time))
    }

    /// Total absorption time implied by reaching `percent_absorption` at `time`
    fn absorption_time(&self, percent_absorption: f64, time: f64) -> f64 {
        let percent_time = self.percent_time_at_percent_absorption(percent_absorption).max(f64::EPSILON);
        time / percent_time
    }

    /// Time needed to absorb `percent_absorbed` given the total absorption time
    fn time_to_absorb(&self, percent_absorbed: f64, total_absorption_time: f64) -> f64 {
        self.percent_time_at_percent_absorption(percent_absorbed) * total_absorption_time
    }

    /// Absorption rate in `total` per second
    fn absorption_rate(&self, total: f64, time: f64, absorption_time: f64) -> f64 {
        total * self.percent_rate_at_percent_time(time / absorption_time) / absorption_time
    }
}

/// Constant-rate absorption
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinearAbsorption;

impl CarbAbsorptionComputable for LinearAbsorption {
    fn percent_absorption_at_percent_time(&self, percent_time: f64) -> f64 {
        percent_time.clamp(0.0, 1.0)
    }

    fn percent_time_at_percent_absorption(&self, percent_absorption: f64) -> f64 {
        percent_absorption.clamp(0.0, 1.0)
    }

    fn percent_rate_at_percent_time(&self, percent_time: f64) -> f64 {
        if percent_time > 0.0 && percent_time <= 1.0 {
            1.0
        } else {
            0.0
        }
    }
}

/// Trapezoidal rate: linear rise to 15%, plateau to 50%, linear fall to 100%
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PiecewiseLinearAbsorption {
    /// Normalized time at which the plateau begins
    pub percent_end_of_rise: f64,
    /// Normalized time at which the decay begins
    pub percent_start_of_fall: f64,
}

impl Default for PiecewiseLinearAbsorption {
    fn default() -> Self {
        Self {
            percent_end_of_rise: 0.15,
            percent_start_of_fall: 0.5,
        }
    }
}

impl PiecewiseLinearAbsorption {
    fn scale(&self) -> f64 {
        2.0 / (1.0 + self.percent_start_of_fall - self.percent_end_of_rise)
    }
}

impl CarbAbsorptionComputable for PiecewiseLinearAbsorption {
    fn percent_absorption_at_percent_time(&self, t: f64) -> f64 {
        let (e, s, scale) = (self.percent_end_of_rise, self.percent_start_of_fall, self.scale());
        if t <= 0.0 {
            0.0
        } else if t < e {
            0.5 * scale * t * t / e
        } else if t < s {
            scale * (t - e / 2.0)
        } else if t < 1.0 {
            scale * (s - e / 2.0 + (t - s) * (1.0 - 0.5 * (t - s) / (1.0 - s)))
        } else {
            1.0
        }
    }

    fn percent_time_at_percent_absorption(&self, a: f64) -> f64 {
        let (e, s, scale) = (self.percent_end_of_rise, self.percent_start_of_fall, self.scale());
        if a <= 0.0 {
            0.0
        } else if a <= 0.5 * scale * e {
            (2.0 * e * a / scale).sqrt()
        } else if a <= scale * (s - e / 2.0) {
            a / scale + e / 2.0
        } else if a < 1.0 {
            let c = a / scale - s + e / 2.0;
            s + (1.0 - s) * (1.0 - (1.0 - 2.0 * c / (1.0 - s)).max(0.0).sqrt())
        } else {
            1.0
        }
    }

    fn percent_rate_at_percent_time(&self, t: f64) -> f64 {
        let (e, s, scale) = (self.percent_end_of_rise, self.percent_start_of_fall, self.scale());
        if t <= 0.0 {
            0.0
        } else if t < e {
            scale * t / e
        } else if t < s {
            scale
        } else if t < 1.0 {
            scale * (1.0 - t) / (1.0 - s)
        } else {
            0.0
        }
    }
}

/// Rate rising linearly to a peak at half time, then falling symmetrically
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParabolicAbsorption;

impl CarbAbsorptionComputable for ParabolicAbsorption {
    fn percent_absorption_at_percent_time(&self, t: f64) -> f64 {
        if t <= 0.0 {
            0.0
        } else if t <= 0.5 {
            2.0 * t * t
        } else if t < 1.0 {
            -1.0 + 2.0 * t * (2.0 - t)
        } else {
            1.0
        }
    }

    fn percent_time_at_percent_absorption(&self, a: f64) -> f64 {
        if a <= 0.0 {
            0.0
        } else if a <= 0.5 {
            (a / 2.0).sqrt()
        } else if a < 1.0 {
            1.0 - (0.5 * (1.0 - a)).sqrt()
        } else {
            1.0
        }
    }

    fn percent_rate_at_percent_time(&self, t: f64) -> f64 {
        if t <= 0.0 {
            0.0
        } else if t <= 0.5 {
            4.0 * t
        } else if t < 1.0 {
            4.0 - 4.0 * t
        } else {
            0.0
        }
    }
}

static LINEAR: LinearAbsorption = LinearAbsorption;
static PIECEWISE_LINEAR: PiecewiseLinearAbsorption = PiecewiseLinearAbsorption {
    percent_end_of_rise: 0.15,
    percent_start_of_fall: 0.5,
};
static PARABOLIC: ParabolicAbsorption = ParabolicAbsorption;

/// Selectable absorption curve
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CarbAbsorptionModel {
    Linear,
    #[default]
    PiecewiseLinear,
    Parabolic,
}

impl CarbAbsorptionModel {
    pub fn model(&self) -> &'static dyn CarbAbsorptionComputable {
        match self {
            Self::Linear => &LINEAR,
            Self::PiecewiseLinear => &PIECEWISE_LINEAR,
            Self::Parabolic => &PARABOLIC,
        }
    }
}

// ============================================================================
// Options
// ============================================================================

/// Tuning for carb status mapping and carb timelines
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CarbMapOptions {
    pub absorption_model: CarbAbsorptionModel,
    /// Multiplier on the entered absorption time before any observation
    pub initial_absorption_time_overrun: f64,
    /// Multiplier on the entered absorption time giving the longest allowed
    pub absorption_time_overrun: f64,
    pub default_absorption_time: Duration,
    pub delay: Duration,
    pub delta: Duration,
    pub adaptive_absorption_rate_enabled: bool,
    pub adaptive_rate_standby_interval_fraction: f64,
}

impl Default for CarbMapOptions {
    fn default() -> Self {
        Self {
            absorption_model: CarbAbsorptionModel::default(),
            initial_absorption_time_overrun: DEFAULT_INITIAL_ABSORPTION_TIME_OVERRUN,
            absorption_time_overrun: DEFAULT_ABSORPTION_TIME_OVERRUN,
            default_absorption_time: default_absorption_time(),
            delay: default_effect_delay(),
            delta: time::default_delta(),
            adaptive_absorption_rate_enabled: false,
            adaptive_rate_standby_interval_fraction: DEFAULT_ADAPTIVE_RATE_STANDBY_INTERVAL_FRACTION,
        }
    }
}

impl CarbMapOptions {
    pub fn with_model(absorption_model: CarbAbsorptionModel) -> Self {
        Self {
            absorption_model,
            ..Self::default()
        }
    }

    fn model(&self) -> &'static dyn CarbAbsorptionComputable {
        self.absorption_model.model()
    }
}

/// Carb sensitivity factor (mg/dL per gram) in effect at `date`
fn carb_sensitivity(
    carb_ratio: &CarbRatioTimeline,
    sensitivity: &SensitivityTimeline,
    date: DateTime<Utc>,
) -> Option<f64> {
    let ratio = schedule::closest_prior(carb_ratio, date)?.value;
    let isf = schedule::closest_prior(sensitivity, date)?.value;
    (ratio > 0.0).then(|| isf / ratio)
}

// ============================================================================
// Entry Math
// ============================================================================

impl CarbEntry {
    /// Grams not yet absorbed at `date` under the unobserved model
    pub fn carbs_on_board_at(&self, date: DateTime<Utc>, options: &CarbMapOptions) -> f64 {
        let time = time::interval(date, self.start_date);
        if time < 0.0 {
            return 0.0;
        }
        let absorption_time = self.absorption_time.unwrap_or(options.default_absorption_time);
        options.model().unabsorbed_carbs(
            self.grams,
            time - time::seconds(options.delay),
            time::seconds(absorption_time),
        )
    }

    /// Grams absorbed by `date` under the unobserved model
    pub fn absorbed_carbs_at(&self, date: DateTime<Utc>, absorption_time: Duration, options: &CarbMapOptions) -> f64 {
        let time = time::interval(date, self.start_date);
        options.model().absorbed_carbs(
            self.grams,
            time - time::seconds(options.delay),
            time::seconds(absorption_time),
        )
    }
}

/// Grid range spanning every entry through the end of its absorption
fn carb_simulation_date_range(
    entries: impl Iterator<Item = (DateTime<Utc>, Option<Duration>)>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    options: &CarbMapOptions,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let mut bounds: Option<(DateTime<Utc>, DateTime<Utc>)> = None;
    for (start, absorption_time) in entries {
        let end = start + absorption_time.unwrap_or(options.default_absorption_time) + options.delay;
        bounds = Some(match bounds {
            Some((min, max)) => (min.min(start), max.max(end)),
            None => (start, end),
        });
    }
    let (min_date, max_date) = bounds?;

    Some((
        time::floored(from.unwrap_or(min_date), options.delta),
        time::ceiled(to.unwrap_or(max_date), options.delta),
    ))
}

fn grid(start: DateTime<Utc>, end: DateTime<Utc>, delta: Duration) -> Vec<DateTime<Utc>> {
    let mut dates = Vec::new();
    let mut date = start;
    loop {
        dates.push(date);
        date += delta;
        if date > end {
            break;
        }
    }
    dates
}

/// Static carbs-on-board timeline for raw entries
pub fn carbs_on_board(
    entries: &[CarbEntry],
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    options: &CarbMapOptions,
) -> Vec<CarbValue> {
    let Some((start, end)) =
        carb_simulation_date_range(entries.iter().map(|e| (e.start_date, e.absorption_time)), from, to, options)
    else {
        return Vec::new();
    };

    grid(start, end, options.delta)
        .into_iter()
        .map(|date| CarbValue::at(date, entries.iter().map(|e| e.carbs_on_board_at(date, options)).sum()))
        .collect()
}

/// Static glucose effect timeline for raw entries
pub fn glucose_effects(
    entries: &[CarbEntry],
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    carb_ratio: &CarbRatioTimeline,
    sensitivity: &SensitivityTimeline,
    options: &CarbMapOptions,
) -> Vec<GlucoseEffect> {
    let Some((start, end)) =
        carb_simulation_date_range(entries.iter().map(|e| (e.start_date, e.absorption_time)), from, to, options)
    else {
        return Vec::new();
    };

    let weighted: Vec<(&CarbEntry, f64)> = entries
        .iter()
        .filter_map(|entry| carb_sensitivity(carb_ratio, sensitivity, entry.start_date).map(|csf| (entry, csf)))
        .collect();

    grid(start, end, options.delta)
        .into_iter()
        .map(|date| {
            let value = weighted
                .iter()
                .map(|(entry, csf)| {
                    let absorption_time = entry.absorption_time.unwrap_or(options.default_absorption_time);
                    csf * entry.absorbed_carbs_at(date, absorption_time, options)
                })
                .sum();
            GlucoseEffect::new(date, value)
        })
        .collect()
}

// ============================================================================
// Status Mapping
// ============================================================================

/// Running attribution of observed glucose rise to one carb entry
struct CarbStatusBuilder<'a> {
    entry: &'a CarbEntry,
    /// mg/dL per gram
    carb_sensitivity: f64,
    initial_absorption_time: f64,
    max_absorption_time: f64,
    delay: f64,
    model: &'static dyn CarbAbsorptionComputable,
    adaptive_absorption_rate_enabled: bool,
    adaptive_rate_standby_interval_fraction: f64,
    last_effect_date: DateTime<Utc>,

    observed_effect: f64,
    observed_timeline: Vec<CarbValue>,
    observed_completion_date: Option<DateTime<Utc>>,
}

impl<'a> CarbStatusBuilder<'a> {
    fn entry_effect(&self) -> f64 {
        self.entry.grams * self.carb_sensitivity
    }

    fn remaining_effect(&self) -> f64 {
        (self.entry_effect() - self.observed_effect).max(0.0)
    }

    fn max_end_date(&self) -> DateTime<Utc> {
        self.entry.start_date + time::from_seconds(self.max_absorption_time + self.delay)
    }

    fn is_active_at(&self, date: DateTime<Utc>) -> bool {
        self.entry.start_date <= date && date < self.max_end_date() && self.remaining_effect() > 0.0
    }

    /// Expected absorption rate (mg/dL/s), floored at the rate needed to
    /// finish within the maximum absorption time
    fn absorption_rate_at(&self, date: DateTime<Utc>) -> f64 {
        let time = time::interval(date, self.entry.start_date) - self.delay;
        let modeled = self
            .model
            .absorption_rate(self.entry_effect(), time, self.initial_absorption_time);
        let minimum = self.entry_effect() / self.max_absorption_time;
        modeled.max(minimum)
    }

    fn add_next_effect(&mut self, effect: f64, start: DateTime<Utc>, end: DateTime<Utc>) {
        if start < self.entry.start_date {
            return;
        }

        self.observed_effect += effect;

        if self.observed_completion_date.is_none() {
            self.observed_timeline.push(CarbValue {
                start_date: start,
                end_date: end,
                grams: effect / self.carb_sensitivity,
            });

            if self.observed_effect + f64::from(f32::EPSILON) >= self.entry_effect() {
                self.observed_completion_date = Some(end);
            }
        }
    }

    fn observed_grams(&self) -> f64 {
        self.observed_effect / self.carb_sensitivity
    }

    fn clamped_grams(&self) -> f64 {
        self.observed_grams().min(self.entry.grams)
    }

    /// Seconds of absorption observed so far
    fn observed_time(&self) -> f64 {
        time::interval(self.last_effect_date, self.entry.start_date) - self.delay
    }

    fn min_predicted_grams(&self) -> f64 {
        let time = self.observed_time();
        if time <= 0.0 {
            return 0.0;
        }
        self.model.absorbed_carbs(self.entry.grams, time, self.max_absorption_time)
    }

    fn modeled_absorbed_grams(&self) -> f64 {
        self.min_predicted_grams().max(self.clamped_grams())
    }

    fn percent_absorbed(&self) -> f64 {
        if self.entry.grams > 0.0 {
            self.modeled_absorbed_grams() / self.entry.grams
        } else {
            1.0
        }
    }

    fn dynamic_absorption_time(&self) -> f64 {
        let time = self.observed_time();
        if time <= 0.0 {
            return self.initial_absorption_time;
        }

        let absorption_time = self.model.absorption_time(self.percent_absorbed(), time);
        let standby = self.adaptive_rate_standby_interval_fraction * self.initial_absorption_time;

        if self.adaptive_absorption_rate_enabled && time > standby {
            absorption_time.max(time).min(self.max_absorption_time)
        } else {
            absorption_time.min(self.max_absorption_time).max(self.initial_absorption_time)
        }
    }

    fn time_to_absorb_observed_carbs(&self) -> f64 {
        if self.observed_time() <= 0.0 {
            return 0.0;
        }
        self.model
            .time_to_absorb(self.percent_absorbed(), self.dynamic_absorption_time())
    }

    fn estimated_time_remaining(&self) -> f64 {
        if self.entry.grams <= 0.0 {
            return 0.0;
        }
        if self.observed_time() <= 0.0 {
            return self.initial_absorption_time;
        }
        let remaining = self.dynamic_absorption_time() - self.time_to_absorb_observed_carbs();
        let until_max_end = time::interval(self.max_end_date(), self.last_effect_date);
        remaining.min(until_max_end).max(0.0)
    }

    fn absorption(&self) -> AbsorbedCarbValue {
        let observed_end = self.entry.start_date.max(self.last_effect_date.min(self.max_end_date()));

        AbsorbedCarbValue {
            observed: self.observed_grams(),
            clamped: self.clamped_grams(),
            total: self.entry.grams,
            remaining: (self.entry.grams - self.modeled_absorbed_grams()).max(0.0),
            observed_date: DateInterval::new(self.entry.start_date, observed_end),
            estimated_time_remaining: time::from_seconds(self.estimated_time_remaining()),
            time_to_absorb_observed_carbs: time::from_seconds(self.time_to_absorb_observed_carbs()),
        }
    }

    fn into_status(self) -> CarbStatus {
        let absorption = self.absorption();
        let observed_timeline = if self.clamped_grams() < self.min_predicted_grams() {
            None
        } else {
            Some(self.observed_timeline)
        };

        CarbStatus {
            entry: self.entry.clone(),
            absorption: Some(absorption),
            observed_timeline,
        }
    }
}

/// Attribute insulin counteraction effects to carb entries and estimate each
/// entry's absorption state.
///
/// Every counteraction interval is split among the entries absorbing at its
/// start, in proportion to their expected absorption rates. Any excess beyond
/// what those entries can take is credited to the last of them.
pub fn map_carb_status(
    entries: &[CarbEntry],
    velocities: &[GlucoseEffectVelocity],
    carb_ratio: &CarbRatioTimeline,
    sensitivity: &SensitivityTimeline,
    options: &CarbMapOptions,
) -> Vec<CarbStatus> {
    let delay = time::seconds(options.delay);
    let mut builders: Vec<CarbStatusBuilder> = Vec::with_capacity(entries.len());
    let mut statuses_without_sensitivity = Vec::new();

    for entry in entries {
        let Some(csf) = carb_sensitivity(carb_ratio, sensitivity, entry.start_date) else {
            warn!(
                "No carb ratio or sensitivity covers carb entry at {}, using unobserved absorption",
                entry.start_date
            );
            statuses_without_sensitivity.push(CarbStatus {
                entry: entry.clone(),
                absorption: None,
                observed_timeline: None,
            });
            continue;
        };

        let entry_time = time::seconds(entry.absorption_time.unwrap_or(options.default_absorption_time));
        let last_effect_date = velocities.last().map_or(entry.start_date, |v| v.end_date);

        builders.push(CarbStatusBuilder {
            entry,
            carb_sensitivity: csf,
            initial_absorption_time: entry_time * options.initial_absorption_time_overrun,
            max_absorption_time: entry_time * options.absorption_time_overrun,
            delay,
            model: options.model(),
            adaptive_absorption_rate_enabled: options.adaptive_absorption_rate_enabled,
            adaptive_rate_standby_interval_fraction: options.adaptive_rate_standby_interval_fraction,
            last_effect_date,
            observed_effect: 0.0,
            observed_timeline: Vec::new(),
            observed_completion_date: None,
        });
    }

    for velocity in velocities {
        let active: Vec<usize> = builders
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_active_at(velocity.start_date))
            .map(|(i, _)| i)
            .collect();
        let Some(&last_active) = active.last() else {
            continue;
        };

        let mut total_rate: f64 = active
            .iter()
            .map(|&i| builders[i].absorption_rate_at(velocity.start_date))
            .sum();
        let mut effect = velocity.effect().quantity;

        for &index in &active {
            let builder = &mut builders[index];
            let rate = builder.absorption_rate_at(velocity.start_date);
            let weight = if total_rate > 0.0 { rate / total_rate } else { 0.0 };
            let partial = builder.remaining_effect().min(weight * effect);

            total_rate -= rate;
            effect -= partial;
            builder.add_next_effect(partial, velocity.start_date, velocity.end_date);

            if effect > f64::EPSILON && index == last_active {
                builder.add_next_effect(effect, velocity.start_date, velocity.end_date);
            }
        }
    }

    let mut statuses: Vec<CarbStatus> = builders.into_iter().map(CarbStatusBuilder::into_status).collect();
    statuses.extend(statuses_without_sensitivity);
    statuses.sort_by_key(|s| s.entry.start_date);
    statuses
}

// ============================================================================
// Dynamic Timelines
// ============================================================================

impl CarbStatus {
    fn observation_end(&self) -> Option<DateTime<Utc>> {
        self.observed_timeline.as_ref()?.last().map(|v| v.end_date)
    }

    /// Grams left at `date`, using observation where it exists and the model
    /// beyond it
    pub fn dynamic_carbs_on_board_at(&self, date: DateTime<Utc>, options: &CarbMapOptions) -> f64 {
        let absorption = match self.absorption {
            Some(absorption) if date >= self.entry.start_date - options.delta => absorption,
            _ => return self.entry.carbs_on_board_at(date, options),
        };
        let model = options.model();

        let Some(observation_end) = self.observation_end() else {
            let time = time::interval(date, self.entry.start_date) - time::seconds(options.delay);
            return model.unabsorbed_carbs(absorption.total, time, time::seconds(absorption.estimated_date().duration()));
        };

        if date > observation_end {
            let effective_time =
                time::interval(date, observation_end) + time::seconds(absorption.time_to_absorb_observed_carbs);
            let effective_absorption_time =
                time::seconds(absorption.time_to_absorb_observed_carbs + absorption.estimated_time_remaining);
            return model
                .unabsorbed_carbs(absorption.total, effective_time, effective_absorption_time)
                .max(0.0);
        }

        let observed: f64 = self
            .observed_timeline
            .iter()
            .flatten()
            .filter(|v| v.end_date <= date)
            .map(|v| v.grams)
            .sum();
        (self.entry.grams - observed).max(0.0)
    }

    /// Grams absorbed by `date`, using observation where it exists and the
    /// model beyond it
    pub fn dynamic_absorbed_carbs_at(&self, date: DateTime<Utc>, options: &CarbMapOptions) -> f64 {
        let absorption = match self.absorption {
            Some(absorption) if date >= self.entry.start_date => absorption,
            _ => {
                let absorption_time = self.absorption_time().unwrap_or(options.default_absorption_time);
                return self.entry.absorbed_carbs_at(date, absorption_time, options);
            }
        };
        let model = options.model();

        let Some(observation_end) = self.observation_end() else {
            let time = time::interval(date, self.entry.start_date) - time::seconds(options.delay);
            return model.absorbed_carbs(absorption.total, time, time::seconds(absorption.estimated_date().duration()));
        };

        if date > observation_end {
            let effective_time =
                time::interval(date, observation_end) + time::seconds(absorption.time_to_absorb_observed_carbs);
            let effective_absorption_time =
                time::seconds(absorption.time_to_absorb_observed_carbs + absorption.estimated_time_remaining);
            return model
                .absorbed_carbs(absorption.total, effective_time, effective_absorption_time)
                .min(absorption.total);
        }

        let mut before: Vec<&CarbValue> = self
            .observed_timeline
            .iter()
            .flatten()
            .filter(|v| v.start_date + options.delta <= date)
            .collect();

        // the last observed value may extend past `date`
        let mut sum = 0.0;
        if let Some(last) = before.pop() {
            let observation = DateInterval::new(last.start_date, last.end_date);
            let calculation = DateInterval::new(last.start_date, date);
            if observation.duration() > Duration::zero() {
                if let Some(overlap) = calculation.intersection(&observation) {
                    sum += time::seconds(overlap.duration()) / time::seconds(observation.duration()) * last.grams;
                }
            }
        }
        sum += before.iter().map(|v| v.grams).sum::<f64>();
        sum.min(self.entry.grams)
    }
}

/// Total dynamic carbs on board at `date`
pub fn dynamic_carbs_on_board_at(statuses: &[CarbStatus], date: DateTime<Utc>, options: &CarbMapOptions) -> f64 {
    statuses
        .iter()
        .map(|status| status.dynamic_carbs_on_board_at(date, options))
        .sum()
}

/// Dynamic carbs-on-board timeline
pub fn dynamic_carbs_on_board(
    statuses: &[CarbStatus],
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    options: &CarbMapOptions,
) -> Vec<CarbValue> {
    let Some((start, end)) =
        carb_simulation_date_range(statuses.iter().map(|s| (s.entry.start_date, s.absorption_time())), from, to, options)
    else {
        return Vec::new();
    };

    grid(start, end, options.delta)
        .into_iter()
        .map(|date| CarbValue::at(date, dynamic_carbs_on_board_at(statuses, date, options)))
        .collect()
}

/// Dynamic glucose effect timeline (mg/dL, cumulative)
pub fn dynamic_glucose_effects(
    statuses: &[CarbStatus],
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    carb_ratio: &CarbRatioTimeline,
    sensitivity: &SensitivityTimeline,
    options: &CarbMapOptions,
) -> Vec<GlucoseEffect> {
    let Some((start, end)) =
        carb_simulation_date_range(statuses.iter().map(|s| (s.entry.start_date, s.absorption_time())), from, to, options)
    else {
        return Vec::new();
    };

    let weighted: Vec<(&CarbStatus, f64)> = statuses
        .iter()
        .filter_map(|status| {
            carb_sensitivity(carb_ratio, sensitivity, status.entry.start_date).map(|csf| (status, csf))
        })
        .collect();

    grid(start, end, options.delta)
        .into_iter()
        .map(|date| {
            let value = weighted
                .iter()
                .map(|(status, csf)| csf * status.dynamic_absorbed_carbs_at(date, options))
                .sum();
            GlucoseEffect::new(date, value)
        })
        .collect()
}
