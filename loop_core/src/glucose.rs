//! Glucose history math: counteraction effects, discrepancy sums, momentum
//! and decaying velocity projections.

use crate::time;
use crate::types::{GlucoseChange, GlucoseEffect, GlucoseEffectVelocity, GlucoseSample, GlucoseValue};
use chrono::Duration;

/// Window of recent glucose used for momentum
pub fn momentum_data_interval() -> Duration {
    Duration::minutes(15)
}

/// How far momentum is projected
pub fn momentum_duration() -> Duration {
    Duration::minutes(15)
}

/// Sample pairs closer than this are skipped when computing counteraction
fn minimum_counteraction_interval() -> Duration {
    Duration::minutes(4)
}

/// Observed glucose change not explained by `effects`, as a velocity per
/// sample interval.
///
/// Pairs closer than four minutes are skipped and the start sample kept.
/// Pairs from different sources or involving display-only samples produce
/// nothing. Stops when the effects no longer cover the samples.
pub fn counteraction_effects(samples: &[GlucoseSample], effects: &[GlucoseEffect]) -> Vec<GlucoseEffectVelocity> {
    let Some(mut start_glucose) = samples.first() else {
        return Vec::new();
    };

    let mut velocities = Vec::new();
    let mut effect_index = 0;

    for end_glucose in &samples[1..] {
        let interval = end_glucose.start_date - start_glucose.start_date;
        if interval <= minimum_counteraction_interval() {
            continue;
        }

        let start = std::mem::replace(&mut start_glucose, end_glucose);

        if start.provenance_identifier != end_glucose.provenance_identifier
            || start.is_display_only
            || end_glucose.is_display_only
        {
            continue;
        }

        if effect_index >= effects.len() {
            break;
        }

        let mut start_effect = None;
        let mut end_effect = None;
        for effect in &effects[effect_index..] {
            if start_effect.is_none() && effect.start_date >= start.start_date {
                start_effect = Some(effect);
            } else if end_effect.is_none() && effect.start_date >= end_glucose.start_date {
                end_effect = Some(effect);
                break;
            }
            effect_index += 1;
        }

        let (Some(start_effect), Some(end_effect)) = (start_effect, end_effect) else {
            break;
        };

        let glucose_change = end_glucose.quantity - start.quantity;
        let effect_change = end_effect.quantity - start_effect.quantity;
        let discrepancy = glucose_change - effect_change;

        velocities.push(GlucoseEffectVelocity {
            start_date: start.start_date,
            end_date: end_glucose.start_date,
            mgdl_per_second: discrepancy / time::seconds(interval),
        });
    }

    velocities
}

/// Per-step difference between observed velocities and a cumulative effect
/// timeline, dated at each effect step.
pub fn subtracting(
    velocities: &[GlucoseEffectVelocity],
    effects: &[GlucoseEffect],
    effect_interval: Duration,
) -> Vec<GlucoseEffect> {
    let effects: Vec<&GlucoseEffect> = match velocities.first() {
        Some(first) => effects.iter().filter(|e| e.start_date >= first.end_date).collect(),
        None => effects.iter().collect(),
    };
    let velocities: Vec<&GlucoseEffectVelocity> = match effects.first() {
        Some(first) => velocities.iter().filter(|v| v.end_date >= first.start_date).collect(),
        None => velocities.iter().collect(),
    };

    let Some(first_effect) = effects.first() else {
        return Vec::new();
    };

    let interval = time::seconds(effect_interval);
    let mut previous_effect_value = first_effect.quantity;
    let mut velocity_index = 0;
    let mut subtracted = Vec::new();

    for effect in &effects[1..] {
        let Some(velocity) = velocities.get(velocity_index) else {
            break;
        };

        let effect_change = effect.quantity - previous_effect_value;
        previous_effect_value = effect.quantity;

        subtracted.push(GlucoseEffect::new(
            effect.start_date,
            velocity.mgdl_per_second * interval - effect_change,
        ));

        if velocity.end_date <= effect.start_date {
            velocity_index += 1;
        }
    }

    subtracted
}

/// For each effect, the sum of it and every later effect within `duration`
pub fn combined_sums(effects: &[GlucoseEffect], duration: Duration) -> Vec<GlucoseChange> {
    let mut sums: Vec<GlucoseChange> = Vec::with_capacity(effects.len());
    let mut last_valid_index = 0;

    for effect in effects.iter().rev() {
        sums.push(GlucoseChange {
            start_date: effect.start_date,
            end_date: effect.start_date,
            quantity: effect.quantity,
        });

        let newest = sums.len() - 1;
        for index in last_valid_index..newest {
            if sums[index].end_date <= effect.start_date + duration {
                sums[index].append(effect);
            } else {
                last_valid_index += 1;
            }
        }
    }

    sums.reverse();
    sums
}

/// Change from the first to the last value of a cumulative timeline
pub fn net_effect<G: GlucoseValue>(effects: &[G]) -> Option<GlucoseChange> {
    let first = effects.first()?;
    let last = effects.last()?;
    Some(GlucoseChange {
        start_date: first.start_date(),
        end_date: last.end_date(),
        quantity: last.quantity() - first.quantity(),
    })
}

fn is_continuous(samples: &[GlucoseSample], interval: Duration) -> bool {
    match (samples.first(), samples.last()) {
        (Some(first), Some(last)) => last.start_date - first.start_date < interval * samples.len() as i32,
        _ => false,
    }
}

fn has_single_provenance(samples: &[GlucoseSample]) -> bool {
    samples
        .first()
        .map_or(true, |first| samples.iter().all(|s| s.provenance_identifier == first.provenance_identifier))
}

/// Least-squares slope of `(x, y)` pairs
fn linear_regression_slope(points: &[(f64, f64)]) -> f64 {
    let n = points.len() as f64;
    let (sum_x, sum_y, sum_xy, sum_xx) = points.iter().fold((0.0, 0.0, 0.0, 0.0), |acc, &(x, y)| {
        (acc.0 + x, acc.1 + y, acc.2 + x * y, acc.3 + x * x)
    });
    (n * sum_xy - sum_x * sum_y) / (n * sum_xx - sum_x * sum_x)
}

/// Short-term projection of the recent glucose trend.
///
/// Needs three or more contiguous samples from a single source with no
/// display-only values; otherwise returns nothing.
pub fn linear_momentum_effect(samples: &[GlucoseSample], duration: Duration, delta: Duration) -> Vec<GlucoseEffect> {
    if samples.len() <= 2
        || !is_continuous(samples, delta)
        || samples.iter().any(|s| s.is_display_only)
        || !has_single_provenance(samples)
    {
        return Vec::new();
    }

    let (Some(first), Some(last)) = (samples.first(), samples.last()) else {
        return Vec::new();
    };
    let Some((start, end)) =
        time::simulation_date_range(std::slice::from_ref(last), None, None, duration, Duration::zero(), delta)
    else {
        return Vec::new();
    };

    let points: Vec<(f64, f64)> = samples
        .iter()
        .map(|s| (time::interval(s.start_date, first.start_date), s.quantity))
        .collect();
    let slope = linear_regression_slope(&points);
    if !slope.is_finite() {
        return Vec::new();
    }

    let mut values = Vec::new();
    let mut date = start;
    loop {
        let value = time::interval(date, last.start_date).max(0.0) * slope;
        values.push(GlucoseEffect::new(date, value));
        date += delta;
        if date > end {
            break;
        }
    }
    values
}

/// Glucose path from `glucose` moving at `velocity` (mg/dL/s), with the
/// velocity decaying linearly to zero over `duration`.
pub fn decay_effect<G: GlucoseValue>(
    glucose: &G,
    velocity: f64,
    duration: Duration,
    delta: Duration,
) -> Vec<GlucoseEffect> {
    let start = time::floored(glucose.start_date(), delta);
    let end = time::ceiled(glucose.start_date() + duration, delta);

    let delta_seconds = time::seconds(delta);
    let decay_start = start + delta;
    let slope = -velocity / (time::seconds(duration) - delta_seconds);

    let mut values = vec![GlucoseEffect::new(start, glucose.quantity())];
    let mut value = glucose.quantity();
    let mut date = decay_start;
    loop {
        value += (velocity + slope * time::interval(date, decay_start)) * delta_seconds;
        values.push(GlucoseEffect::new(date, value));
        date += delta;
        if date >= end {
            break;
        }
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn t(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 3, 12, 0, 0).unwrap() + Duration::minutes(min)
    }

    fn sample(min: i64, value: f64) -> GlucoseSample {
        GlucoseSample::new(t(min), value)
    }

    fn flat_effects(from: i64, to: i64) -> Vec<GlucoseEffect> {
        (from..=to).step_by(5).map(|m| GlucoseEffect::new(t(m), 0.0)).collect()
    }

    #[test]
    fn test_counteraction_matches_rise_without_effects() {
        let samples = vec![sample(0, 100.0), sample(5, 110.0), sample(10, 115.0)];
        let velocities = counteraction_effects(&samples, &flat_effects(0, 30));

        assert_eq!(velocities.len(), 2);
        assert!((velocities[0].effect().quantity - 10.0).abs() < 1e-9);
        assert!((velocities[1].effect().quantity - 5.0).abs() < 1e-9);
        assert_eq!(velocities[1].start_date, t(5));
    }

    #[test]
    fn test_counteraction_skips_close_samples_and_mixed_sources() {
        let mut samples = vec![sample(0, 100.0), sample(2, 104.0), sample(5, 110.0), sample(10, 120.0)];
        samples[3].provenance_identifier = "meter".to_string();
        let velocities = counteraction_effects(&samples, &flat_effects(0, 30));

        assert_eq!(velocities.len(), 1);
        assert_eq!(velocities[0].start_date, t(0));
        assert_eq!(velocities[0].end_date, t(5));
    }

    #[test]
    fn test_counteraction_removes_insulin_effect() {
        let samples = vec![sample(0, 100.0), sample(5, 100.0)];
        let effects = vec![GlucoseEffect::new(t(0), 0.0), GlucoseEffect::new(t(5), -3.0)];
        let velocities = counteraction_effects(&samples, &effects);
        assert!((velocities[0].effect().quantity - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_subtracting_carb_effect() {
        let velocities: Vec<GlucoseEffectVelocity> = (0..3)
            .map(|i| GlucoseEffectVelocity {
                start_date: t(i * 5),
                end_date: t(i * 5 + 5),
                mgdl_per_second: 2.0 / 300.0,
            })
            .collect();
        let effects: Vec<GlucoseEffect> = (1..=4).map(|i| GlucoseEffect::new(t(i * 5), i as f64)).collect();
        let discrepancies = subtracting(&velocities, &effects, time::default_delta());

        assert_eq!(discrepancies.len(), 3);
        assert_eq!(discrepancies[0].start_date, t(10));
        assert_eq!(discrepancies[2].start_date, t(20));
        assert!(discrepancies.iter().all(|d| (d.quantity - 1.0).abs() < 1e-9));
    }

    #[test]
    fn test_combined_sums_window() {
        let effects: Vec<GlucoseEffect> = (0..4).map(|i| GlucoseEffect::new(t(i * 10), 1.0)).collect();
        let sums = combined_sums(&effects, Duration::minutes(20));

        assert_eq!(sums.len(), 4);
        assert_eq!(sums[3].quantity, 3.0);
        assert_eq!(sums[3].start_date, t(10));
        assert_eq!(sums[3].end_date, t(30));
        assert_eq!(sums[0].quantity, 1.0);
    }

    #[test]
    fn test_net_effect() {
        let effects = vec![GlucoseEffect::new(t(0), 4.0), GlucoseEffect::new(t(30), -2.0)];
        let change = net_effect(&effects).unwrap();
        assert_eq!(change.quantity, -6.0);
        assert_eq!(change.end_date, t(30));
        assert!(net_effect::<GlucoseEffect>(&[]).is_none());
    }

    #[test]
    fn test_momentum_projects_slope() {
        let samples = vec![sample(-10, 100.0), sample(-5, 105.0), sample(0, 110.0)];
        let effects = linear_momentum_effect(&samples, momentum_duration(), time::default_delta());

        assert_eq!(effects.first().unwrap().start_date, t(0));
        assert_eq!(effects.first().unwrap().quantity, 0.0);
        assert_eq!(effects.last().unwrap().start_date, t(15));
        assert!((effects.last().unwrap().quantity - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_momentum_requires_clean_contiguous_data() {
        let two = vec![sample(-5, 100.0), sample(0, 105.0)];
        assert!(linear_momentum_effect(&two, momentum_duration(), time::default_delta()).is_empty());

        let gap = vec![sample(-30, 100.0), sample(-5, 105.0), sample(0, 110.0)];
        assert!(linear_momentum_effect(&gap, momentum_duration(), time::default_delta()).is_empty());

        let mut calibrated = vec![sample(-10, 100.0), sample(-5, 105.0), sample(0, 110.0)];
        calibrated[1].is_display_only = true;
        assert!(linear_momentum_effect(&calibrated, momentum_duration(), time::default_delta()).is_empty());
    }

    #[test]
    fn test_decay_effect_accumulates_velocity() {
        let start = Utc.with_ymd_and_hms(2015, 7, 13, 12, 2, 37).unwrap();
        let glucose = GlucoseSample::new(start, 100.0);
        let effects = decay_effect(&glucose, 10.0 / 1800.0, Duration::minutes(60), time::default_delta());

        assert_eq!(effects[0].start_date, Utc.with_ymd_and_hms(2015, 7, 13, 12, 0, 0).unwrap());
        assert_eq!(effects[0].quantity, 100.0);
        let last = effects.last().unwrap();
        assert_eq!(last.start_date, Utc.with_ymd_and_hms(2015, 7, 13, 13, 0, 0).unwrap());
        assert!((last.quantity - 110.0).abs() < 1e-9);
    }
}
