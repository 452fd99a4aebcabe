//! Key-normalized diff of two value sets

use std::collections::BTreeMap;

use serde::Serialize;

use crate::dhis::models::DataValue;

/// Join key for a data value; a missing category-option-combo
/// normalizes to `"default"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ValueKey {
    pub data_element: String,
    pub period: String,
    pub org_unit: String,
    pub category_option_combo: String,
}

impl ValueKey {
    pub fn of(value: &DataValue) -> Self {
        Self {
            data_element: value.data_element.clone(),
            period: value.period.clone(),
            org_unit: value.org_unit.clone(),
            category_option_combo: value
                .category_option_combo
                .clone()
                .unwrap_or_else(|| "default".to_string()),
        }
    }
}

/// Index values by key; later duplicates win, mirroring upstream
/// last-write semantics.
pub fn key_map(values: &[DataValue]) -> BTreeMap<ValueKey, String> {
    values
        .iter()
        .map(|value| (ValueKey::of(value), value.value.clone()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    MissingInDestination,
    MissingInSource,
    ValueMismatch,
    MetadataMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Major,
    Minor,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Discrepancy {
    pub data_element: String,
    pub org_unit: String,
    pub period: String,
    pub category_option_combo: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_value: Option<String>,
    pub kind: DiscrepancyKind,
    pub severity: Severity,
}

impl Discrepancy {
    fn at(key: &ValueKey, kind: DiscrepancyKind, severity: Severity) -> Self {
        Self {
            data_element: key.data_element.clone(),
            org_unit: key.org_unit.clone(),
            period: key.period.clone(),
            category_option_combo: key.category_option_combo.clone(),
            source_value: None,
            destination_value: None,
            kind,
            severity,
        }
    }
}

/// Diff two keyed maps. Keys only in the source are missing in the
/// destination (major); keys only in the destination are missing in the
/// source (minor); keys in both with unequal values are mismatches with
/// a numeric severity rule.
pub fn diff(
    source: &BTreeMap<ValueKey, String>,
    destination: &BTreeMap<ValueKey, String>,
) -> Vec<Discrepancy> {
    let mut discrepancies = Vec::new();

    for (key, source_value) in source {
        match destination.get(key) {
            None => {
                let mut discrepancy = Discrepancy::at(
                    key,
                    DiscrepancyKind::MissingInDestination,
                    Severity::Major,
                );
                discrepancy.source_value = Some(source_value.clone());
                discrepancies.push(discrepancy);
            }
            Some(destination_value) if destination_value != source_value => {
                let severity = mismatch_severity(source_value, destination_value);
                let mut discrepancy =
                    Discrepancy::at(key, DiscrepancyKind::ValueMismatch, severity);
                discrepancy.source_value = Some(source_value.clone());
                discrepancy.destination_value = Some(destination_value.clone());
                discrepancies.push(discrepancy);
            }
            Some(_) => {}
        }
    }

    for (key, destination_value) in destination {
        if !source.contains_key(key) {
            let mut discrepancy =
                Discrepancy::at(key, DiscrepancyKind::MissingInSource, Severity::Minor);
            discrepancy.destination_value = Some(destination_value.clone());
            discrepancies.push(discrepancy);
        }
    }

    discrepancies
}

/// Severity rule for mismatching values: a destination exceeding the
/// source is critical, a gap over 100 is major, anything else minor.
/// Flagged for operator confirmation; see DESIGN.md.
fn mismatch_severity(source: &str, destination: &str) -> Severity {
    match (source.trim().parse::<f64>(), destination.trim().parse::<f64>()) {
        (Ok(source_n), Ok(destination_n)) => {
            if destination_n > source_n {
                Severity::Critical
            } else if (destination_n - source_n).abs() > 100.0 {
                Severity::Major
            } else {
                Severity::Minor
            }
        }
        _ => Severity::Minor,
    }
}
