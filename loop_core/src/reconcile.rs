//! Pump event history reconciliation.
//!
//! Pump histories record overlapping events: a temp basal is programmed for
//! 30 minutes, then replaced after 10; a suspend interrupts a running basal.
//! [`reconciled`] collapses that into non-overlapping delivery records.

use crate::time;
use crate::types::{InsulinDose, InsulinType, TimelineValue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Kind of pump event
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DoseEntryKind {
    Bolus,
    Basal,
    TempBasal,
    Suspend,
    Resume,
}

/// Unit of a dose entry's programmed value
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DoseUnit {
    Units,
    UnitsPerHour,
}

/// A pump event before reconciliation
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DoseEntry {
    pub kind: DoseEntryKind,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    /// Programmed amount in `unit`
    pub value: f64,
    pub unit: DoseUnit,
    /// Units the pump reports as actually delivered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_units: Option<f64>,
    /// Still in progress; delivery may change
    #[serde(default)]
    pub is_mutable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insulin_type: Option<InsulinType>,
}

impl DoseEntry {
    pub fn new(
        kind: DoseEntryKind,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
        value: f64,
        unit: DoseUnit,
    ) -> Self {
        Self {
            kind,
            start_date,
            end_date,
            value,
            unit,
            delivered_units: None,
            is_mutable: false,
            insulin_type: None,
        }
    }

    /// Units the entry was programmed to deliver
    pub fn programmed_units(&self) -> f64 {
        match self.unit {
            DoseUnit::Units => self.value,
            DoseUnit::UnitsPerHour => self.value * time::hours(self.end_date - self.start_date),
        }
    }

    /// Delivered units when known, else programmed units
    pub fn units(&self) -> f64 {
        self.delivered_units.unwrap_or_else(|| self.programmed_units())
    }

    /// Clip to `[from, to]`, pro-rating units when the entry actually shrinks
    pub fn trimmed(&self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> DoseEntry {
        let original_duration = time::seconds(self.end_date - self.start_date);

        let start_date = from.map_or(self.start_date, |from| from.max(self.start_date));
        let end_date = start_date.max(to.map_or(self.end_date, |to| to.min(self.end_date)));

        let mut trimmed = DoseEntry {
            start_date,
            end_date,
            ..self.clone()
        };

        if original_duration > f64::EPSILON && (start_date > self.start_date || end_date < self.end_date) {
            let fraction = time::interval(end_date, start_date) / original_duration;
            trimmed.delivered_units = self.delivered_units.map(|units| units * fraction);
            if self.unit == DoseUnit::Units {
                trimmed.value = self.value * fraction;
            }
        }

        trimmed
    }

    /// Completed entries without a delivery report are assumed delivered as programmed
    pub fn resolving_delivery(self) -> DoseEntry {
        if self.is_mutable || self.delivered_units.is_some() {
            return self;
        }
        match (self.unit, self.kind) {
            (DoseUnit::Units, _) | (DoseUnit::UnitsPerHour, DoseEntryKind::Basal | DoseEntryKind::TempBasal) => {
                let delivered = self.programmed_units();
                DoseEntry {
                    delivered_units: Some(delivered),
                    ..self
                }
            }
            _ => self,
        }
    }

    /// The delivery record this entry represents; resumes carry no delivery
    pub fn to_insulin_dose(&self) -> Option<InsulinDose> {
        let mut dose = match self.kind {
            DoseEntryKind::Bolus => InsulinDose::bolus(self.start_date, self.end_date, self.units()),
            DoseEntryKind::Basal | DoseEntryKind::TempBasal => {
                InsulinDose::basal(self.start_date, self.end_date, self.units())
            }
            DoseEntryKind::Suspend => InsulinDose::basal(self.start_date, self.end_date, 0.0),
            DoseEntryKind::Resume => return None,
        };
        dose.insulin_type = self.insulin_type;
        Some(dose)
    }

    fn spanning(&self, start_date: DateTime<Utc>, end_date: DateTime<Utc>) -> DoseEntry {
        DoseEntry {
            start_date,
            end_date,
            ..self.clone()
        }
    }
}

impl TimelineValue for DoseEntry {
    fn start_date(&self) -> DateTime<Utc> {
        self.start_date
    }

    fn end_date(&self) -> DateTime<Utc> {
        self.end_date
    }
}

/// Map overlapping pump events to non-overlapping delivery records.
///
/// Basal entries are cut short by whatever follows them, suspends become
/// zero-delivery spans closed by the next resume or basal, and a basal
/// interrupted by a suspend continues after the resume.
pub fn reconciled(entries: &[DoseEntry]) -> Vec<DoseEntry> {
    let mut reconciled = Vec::with_capacity(entries.len());
    let mut last_suspend: Option<DoseEntry> = None;
    let mut last_basal: Option<DoseEntry> = None;

    for dose in entries {
        match dose.kind {
            DoseEntryKind::Bolus => reconciled.push(dose.clone()),
            DoseEntryKind::Basal | DoseEntryKind::TempBasal => {
                match (last_suspend.take(), &last_basal) {
                    (None, Some(last)) => {
                        let end_date = last.end_date.min(dose.start_date);
                        if end_date > last.start_date {
                            reconciled.push(last.trimmed(None, Some(end_date)));
                        }
                    }
                    (Some(suspend), _) => {
                        // basal following a suspend with no resume
                        reconciled.push(suspend.spanning(suspend.start_date, dose.start_date));
                    }
                    (None, None) => {}
                }
                last_basal = Some(dose.clone());
            }
            DoseEntryKind::Resume => {
                if let Some(suspend) = last_suspend.take() {
                    reconciled.push(suspend.spanning(suspend.start_date, dose.start_date));

                    last_basal = last_basal
                        .filter(|last| last.end_date > dose.end_date)
                        .map(|last| last.trimmed(Some(dose.end_date), None));
                }
            }
            DoseEntryKind::Suspend => {
                if let Some(last) = &last_basal {
                    reconciled.push(last.trimmed(None, Some(dose.start_date)));
                    if last.end_date <= dose.start_date {
                        last_basal = None;
                    }
                }
                last_suspend = Some(dose.clone());
            }
        }
    }

    if let Some(suspend) = last_suspend {
        debug!("Open suspend at {}", suspend.start_date);
        reconciled.push(DoseEntry {
            end_date: suspend.start_date,
            is_mutable: true,
            ..suspend
        });
    } else if let Some(last) = last_basal.filter(|last| last.end_date > last.start_date) {
        reconciled.push(last);
    }

    reconciled.into_iter().map(DoseEntry::resolving_delivery).collect()
}

/// Reconcile pump events and convert them to delivery records
pub fn reconciled_insulin_doses(entries: &[DoseEntry]) -> Vec<InsulinDose> {
    reconciled(entries)
        .iter()
        .filter_map(DoseEntry::to_insulin_dose)
        .collect()
}
