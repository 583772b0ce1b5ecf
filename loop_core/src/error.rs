//! Error types for the loop_core library.

use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for loop_core operations outside the engine itself
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Scenario fixture could not be turned into engine input
    #[error("Fixture error: {0}")]
    Fixture(String),

    /// The engine declined to produce a recommendation
    #[error("Algorithm error: {0}")]
    Algorithm(#[from] AlgorithmError),
}

/// Reasons the dosing stage refuses to produce a recommendation.
///
/// These are values, not panics: the prediction is still returned alongside.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AlgorithmError {
    /// No glucose history was supplied
    #[error("no glucose history available")]
    MissingGlucose,

    /// The latest glucose sample is older than the recency interval
    #[error("latest glucose sample is too old")]
    GlucoseTooOld,

    /// No basal segment starts at or before the prediction start
    #[error("basal timeline does not cover prediction start")]
    BasalTimelineIncomplete,

    /// Neither an explicit suspend threshold nor a target range is available
    #[error("suspend threshold could not be resolved")]
    MissingSuspendThreshold,

    /// Sensitivity timeline begins after the first date it is needed
    #[error("sensitivity timeline starts too late")]
    SensitivityTimelineStartsTooLate,

    /// Sensitivity timeline ends before the last date it is needed
    #[error("sensitivity timeline ends too early")]
    SensitivityTimelineEndsTooEarly,

    /// Automated dosing was requested with a basal dose extending into the future
    #[error("basal doses may not extend past prediction start for automated dosing")]
    FutureBasalNotAllowed,
}
