#![forbid(unsafe_code)]

//! Glucose forecasting and insulin dose recommendation for closed-loop
//! dosing.
//!
//! This crate provides:
//! - Domain types (glucose samples, doses, carb entries, recommendations)
//! - Insulin math (activity curves, insulin on board, glucose effects)
//! - Carb math (static and observation-driven absorption)
//! - Glucose math (momentum, counteraction, retrospective correction)
//! - Forecasting and dosing policy
//! - JSON scenario fixtures and TOML configuration

pub mod types;
pub mod error;
pub mod time;
pub mod schedule;
pub mod insulin;
pub mod dose;
pub mod reconcile;
pub mod carb;
pub mod glucose;
pub mod retrospective;
pub mod prediction;
pub mod dosing;
pub mod algorithm;
pub mod fixture;
pub mod config;
pub mod logging;

// Re-export commonly used types
pub use error::{AlgorithmError, Error, Result};
pub use types::*;
pub use schedule::{AbsoluteScheduleValue, GlucoseRange};
pub use insulin::{ExponentialInsulinModelPreset, InsulinModel, InsulinModelProvider, PresetInsulinModelProvider};
pub use carb::{CarbAbsorptionModel, CarbMapOptions};
pub use prediction::{AlgorithmEffectsOptions, LoopAlgorithmEffects, LoopPrediction};
pub use dosing::InsulinCorrection;
pub use algorithm::{generate_prediction, run, AlgorithmSettings, LoopAlgorithmInput, LoopAlgorithmOutput};
pub use fixture::{FixtureInput, FixtureOutput};
pub use config::Config;
