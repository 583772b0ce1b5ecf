//! Configuration file support for loop-algorithm.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/loop-algorithm/config.toml`.
//! Scenario inputs may override the `[algorithm]` flags individually.

use crate::algorithm::AlgorithmSettings;
use crate::carb::{
    CarbAbsorptionModel, CarbMapOptions, DEFAULT_ABSORPTION_TIME_OVERRUN,
    DEFAULT_ADAPTIVE_RATE_STANDBY_INTERVAL_FRACTION, DEFAULT_INITIAL_ABSORPTION_TIME_OVERRUN,
};
use crate::dosing::DEFAULT_BOLUS_PARTIAL_APPLICATION_FACTOR;
use crate::insulin::{ExponentialInsulinModelPreset, PresetInsulinModelProvider};
use crate::prediction::AlgorithmEffectsOptions;
use crate::types::{DoseRecommendationType, InsulinType};
use crate::{Error, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub algorithm: AlgorithmConfig,

    #[serde(default)]
    pub carbs: CarbsConfig,

    #[serde(default)]
    pub insulin: InsulinConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Defaults for per-scenario flags
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AlgorithmConfig {
    #[serde(default)]
    pub use_integral_retrospective_correction: bool,

    #[serde(default = "default_true")]
    pub include_positive_velocity_and_rc: bool,

    #[serde(default)]
    pub use_mid_absorption_isf: bool,

    #[serde(default = "default_application_factor")]
    pub automatic_bolus_application_factor: f64,

    #[serde(default = "default_recommendation_type")]
    pub recommendation_type: DoseRecommendationType,

    #[serde(default = "default_recommendation_insulin_type")]
    pub recommendation_insulin_type: InsulinType,

    /// Effects included in the forecast: carbs, insulin, momentum, retrospection
    #[serde(default = "default_effects")]
    pub effects: Vec<String>,
}

impl Default for AlgorithmConfig {
    fn default() -> Self {
        Self {
            use_integral_retrospective_correction: false,
            include_positive_velocity_and_rc: default_true(),
            use_mid_absorption_isf: false,
            automatic_bolus_application_factor: default_application_factor(),
            recommendation_type: default_recommendation_type(),
            recommendation_insulin_type: default_recommendation_insulin_type(),
            effects: default_effects(),
        }
    }
}

/// Carb absorption tuning
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CarbsConfig {
    #[serde(default)]
    pub absorption_model: CarbAbsorptionModel,

    #[serde(default = "default_absorption_time_minutes")]
    pub default_absorption_time_minutes: i64,

    #[serde(default = "default_effect_delay_minutes")]
    pub effect_delay_minutes: i64,

    #[serde(default = "default_initial_overrun")]
    pub initial_absorption_time_overrun: f64,

    #[serde(default = "default_overrun")]
    pub absorption_time_overrun: f64,

    #[serde(default)]
    pub adaptive_absorption_rate_enabled: bool,

    #[serde(default = "default_standby_fraction")]
    pub adaptive_rate_standby_interval_fraction: f64,
}

impl Default for CarbsConfig {
    fn default() -> Self {
        Self {
            absorption_model: CarbAbsorptionModel::default(),
            default_absorption_time_minutes: default_absorption_time_minutes(),
            effect_delay_minutes: default_effect_delay_minutes(),
            initial_absorption_time_overrun: default_initial_overrun(),
            absorption_time_overrun: default_overrun(),
            adaptive_absorption_rate_enabled: false,
            adaptive_rate_standby_interval_fraction: default_standby_fraction(),
        }
    }
}

/// Insulin curve selection
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct InsulinConfig {
    /// Curve for novolog, humalog, apidra and untyped doses
    #[serde(default)]
    pub default_rapid_acting: ExponentialInsulinModelPreset,
}

/// Log output configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_application_factor() -> f64 {
    DEFAULT_BOLUS_PARTIAL_APPLICATION_FACTOR
}

fn default_recommendation_type() -> DoseRecommendationType {
    DoseRecommendationType::AutomaticBolus
}

fn default_recommendation_insulin_type() -> InsulinType {
    InsulinType::Novolog
}

fn default_effects() -> Vec<String> {
    vec![
        "carbs".into(),
        "insulin".into(),
        "momentum".into(),
        "retrospection".into(),
    ]
}

fn default_absorption_time_minutes() -> i64 {
    180
}

fn default_effect_delay_minutes() -> i64 {
    10
}

fn default_initial_overrun() -> f64 {
    DEFAULT_INITIAL_ABSORPTION_TIME_OVERRUN
}

fn default_overrun() -> f64 {
    DEFAULT_ABSORPTION_TIME_OVERRUN
}

fn default_standby_fraction() -> f64 {
    DEFAULT_ADAPTIVE_RATE_STANDBY_INTERVAL_FRACTION
}

fn default_log_level() -> String {
    "warn".into()
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        match Self::default_config_path() {
            Some(config_path) if config_path.exists() => Self::load_from(&config_path),
            config_path => {
                info!("No config file found at {:?}, using defaults", config_path);
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path, if the platform has a config dir
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|base| base.join("loop-algorithm").join("config.toml"))
    }

    /// Save the current configuration to the default path
    pub fn save(&self) -> Result<()> {
        let config_path = Self::default_config_path()
            .ok_or_else(|| Error::Config("No config directory on this platform".into()))?;
        self.save_to(&config_path)
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Engine settings derived from this configuration, validated
    pub fn settings(&self) -> Result<AlgorithmSettings> {
        let carbs = &self.carbs;
        if carbs.default_absorption_time_minutes <= 0 {
            return Err(Error::Config("default_absorption_time_minutes must be positive".into()));
        }
        if carbs.effect_delay_minutes < 0 {
            return Err(Error::Config("effect_delay_minutes must not be negative".into()));
        }
        if carbs.initial_absorption_time_overrun < 1.0 || carbs.absorption_time_overrun < 1.0 {
            return Err(Error::Config("absorption time overruns must be at least 1.0".into()));
        }
        if !(0.0..=1.0).contains(&carbs.adaptive_rate_standby_interval_fraction) {
            return Err(Error::Config(
                "adaptive_rate_standby_interval_fraction must be within 0..=1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.algorithm.automatic_bolus_application_factor) {
            return Err(Error::Config(
                "automatic_bolus_application_factor must be within 0..=1".into(),
            ));
        }

        let effects: AlgorithmEffectsOptions = self
            .algorithm
            .effects
            .join(",")
            .parse()
            .map_err(Error::Config)?;

        Ok(AlgorithmSettings {
            insulin_models: PresetInsulinModelProvider::new(self.insulin.default_rapid_acting),
            carb_options: CarbMapOptions {
                absorption_model: carbs.absorption_model,
                initial_absorption_time_overrun: carbs.initial_absorption_time_overrun,
                absorption_time_overrun: carbs.absorption_time_overrun,
                default_absorption_time: Duration::minutes(carbs.default_absorption_time_minutes),
                delay: Duration::minutes(carbs.effect_delay_minutes),
                adaptive_absorption_rate_enabled: carbs.adaptive_absorption_rate_enabled,
                adaptive_rate_standby_interval_fraction: carbs.adaptive_rate_standby_interval_fraction,
                ..CarbMapOptions::default()
            },
            effects,
        })
    }
}
