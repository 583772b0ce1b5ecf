//! Integration tests for the loop-algorithm binary.
//!
//! These tests verify end-to-end behavior including:
//! - Fixture parsing from files and stdin
//! - Recommendation output for each dosing mode
//! - Error reporting with a non-zero exit status
//! - Config and effect overrides

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{json, Value};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

/// Helper to get the path to the CLI binary
fn cli() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("loop-algorithm"))
}

/// Rising glucose with no insulin or carb history
fn rising_scenario() -> Value {
    json!({
        "predictionStart": "2024-01-03T12:00:00Z",
        "glucoseHistory": [
            {"date": "2024-01-03T11:41:00Z", "value": 100},
            {"date": "2024-01-03T11:46:00Z", "value": 120},
            {"date": "2024-01-03T11:51:00Z", "value": 140},
            {"date": "2024-01-03T11:56:00Z", "value": 160}
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
        "maxBasalRate": 8
    })
}

fn write_fixture(dir: &TempDir, scenario: &Value) -> PathBuf {
    let path = dir.path().join("scenario.json");
    fs::write(&path, serde_json::to_string_pretty(scenario).unwrap()).unwrap();
    path
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout is JSON")
}

#[test]
fn test_cli_help() {
    cli()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Glucose forecast and insulin dose recommendation"));
}

#[test]
fn test_automatic_bolus_by_default() {
    let dir = TempDir::new().unwrap();
    let path = write_fixture(&dir, &rising_scenario());

    let output = cli().arg(&path).output().unwrap();
    assert!(output.status.success());

    let json = stdout_json(&output);
    assert!(json.get("error").is_none());
    let automatic = &json["recommendation"]["automatic"];
    assert!(automatic.is_object());
    assert!(automatic["bolusUnits"].as_f64().unwrap() >= 0.0);
    assert!(!json["predictedGlucose"].as_array().unwrap().is_empty());
}

#[test]
fn test_temp_basal_from_stdin() {
    let mut scenario = rising_scenario();
    scenario["recommendationType"] = json!("tempBasal");

    let output = cli()
        .arg("-")
        .write_stdin(scenario.to_string())
        .output()
        .unwrap();
    assert!(output.status.success());

    let json = stdout_json(&output);
    let rate = json["recommendation"]["automatic"]["basalAdjustment"]["unitsPerHour"]
        .as_f64()
        .unwrap();
    assert!(rate > 1.0);
    assert!(rate <= 8.0);
    assert_eq!(json["recommendation"]["automatic"]["basalAdjustment"]["duration"], 1800.0);
}

#[test]
fn test_manual_bolus_from_config_default() {
    let dir = TempDir::new().unwrap();
    let path = write_fixture(&dir, &rising_scenario());
    let config_path = dir.path().join("config.toml");
    fs::write(&config_path, "[algorithm]\nrecommendation_type = \"manualBolus\"\n").unwrap();

    let output = cli()
        .arg(&path)
        .arg("--config")
        .arg(&config_path)
        .output()
        .unwrap();
    assert!(output.status.success());

    let json = stdout_json(&output);
    let amount = json["recommendation"]["manual"]["amount"].as_f64().unwrap();
    assert!(amount > 0.0);
    assert!(amount <= 6.0);
}

#[test]
fn test_stale_glucose_fails_with_forecast() {
    let dir = TempDir::new().unwrap();
    let mut scenario = rising_scenario();
    scenario["predictionStart"] = json!("2024-01-03T12:30:00Z");
    let path = write_fixture(&dir, &scenario);

    let output = cli().arg(&path).output().unwrap();
    assert!(!output.status.success());

    let json = stdout_json(&output);
    assert!(json.get("recommendation").is_none());
    assert_eq!(json["error"]["code"], "glucoseTooOld");
    assert!(!json["predictedGlucose"].as_array().unwrap().is_empty());
    assert!(String::from_utf8_lossy(&output.stderr).contains("GlucoseTooOld"));
}

#[test]
fn test_insulin_only_forecast_is_flat_without_doses() {
    let dir = TempDir::new().unwrap();
    let path = write_fixture(&dir, &rising_scenario());

    let output = cli()
        .arg(&path)
        .arg("--effects")
        .arg("insulin")
        .output()
        .unwrap();
    assert!(output.status.success());

    let json = stdout_json(&output);
    let values: Vec<f64> = json["predictedGlucose"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["quantity"].as_f64().unwrap())
        .collect();
    assert!(values.iter().all(|v| (v - 160.0).abs() < 1e-9));
}

#[test]
fn test_prediction_only() {
    let dir = TempDir::new().unwrap();
    let path = write_fixture(&dir, &rising_scenario());

    let output = cli().arg(&path).arg("--prediction-only").output().unwrap();
    assert!(output.status.success());

    let json = stdout_json(&output);
    assert!(json.get("recommendation").is_none());
    assert!(!json["glucose"].as_array().unwrap().is_empty());
    assert!(json["effects"]["momentum"].is_array());
}

#[test]
fn test_unknown_effect_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_fixture(&dir, &rising_scenario());

    cli()
        .arg(&path)
        .arg("--effects")
        .arg("insulin,sugar")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown effect"));
}

#[test]
fn test_invalid_fixture_rejected() {
    let dir = TempDir::new().unwrap();
    let mut scenario = rising_scenario();
    scenario["maxBolus"] = json!(-2);
    let path = write_fixture(&dir, &scenario);

    cli()
        .arg(&path)
        .assert()
        .failure()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("maxBolus"));
}

#[test]
fn test_missing_input_file() {
    let dir = TempDir::new().unwrap();

    cli()
        .arg(dir.path().join("absent.json"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Io"));
}
