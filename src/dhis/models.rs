//! Wire shapes shared with the upstream instances

use serde::{Deserialize, Serialize};

/// One aggregate data value as served by `analytics/dataValueSet.json`
/// and accepted by `dataValueSets`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataValue {
    pub data_element: String,
    pub period: String,
    pub org_unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_option_combo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute_option_combo: Option<String>,
    pub value: String,
}

impl DataValue {
    /// Values that do not parse as numbers are dropped before upload.
    pub fn is_numeric(&self) -> bool {
        self.value.trim().parse::<f64>().is_ok()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataValueSet {
    #[serde(default)]
    pub data_values: Vec<DataValue>,
}

/// Import strategy for `dataValueSets`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportStrategy {
    CreateAndUpdate,
    Delete,
}

impl ImportStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportStrategy::CreateAndUpdate => "CREATE_AND_UPDATE",
            ImportStrategy::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportCount {
    #[serde(default)]
    pub imported: u64,
    #[serde(default)]
    pub updated: u64,
    #[serde(default)]
    pub ignored: u64,
    #[serde(default)]
    pub deleted: u64,
}

/// Import summary, tolerating both the flat and the `response`-wrapped
/// envelope the upstream emits depending on the endpoint and status.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub import_count: Option<ImportCount>,
    #[serde(default)]
    pub response: Option<ImportSummaryInner>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummaryInner {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub import_count: Option<ImportCount>,
}

impl ImportSummary {
    pub fn counts(&self) -> Option<ImportCount> {
        self.import_count
            .or_else(|| self.response.as_ref().and_then(|inner| inner.import_count))
    }
}

/// A category-option-combo reference: id plus display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComboRef {
    pub id: String,
    pub name: String,
}

/// `dataElements/{id}` fields projection used for combo expansion
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataElementCombos {
    #[serde(default)]
    pub category_combo: Option<CategoryCombo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryCombo {
    #[serde(default)]
    pub category_option_combos: Vec<ComboRef>,
}

/// `categoryOptions/{id}` fields projection used for attribute fan-out
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryOptionDetail {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub categories: Vec<IdRef>,
    #[serde(default)]
    pub category_option_combos: Vec<ComboRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IdRef {
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_filter() {
        let mut value = DataValue {
            data_element: "DE".to_string(),
            period: "202401".to_string(),
            org_unit: "OU".to_string(),
            category_option_combo: None,
            attribute_option_combo: None,
            value: "10".to_string(),
        };
        assert!(value.is_numeric());

        value.value = "10.5".to_string();
        assert!(value.is_numeric());

        value.value = "not-a-number".to_string();
        assert!(!value.is_numeric());

        value.value = "".to_string();
        assert!(!value.is_numeric());
    }

    #[test]
    fn import_summary_reads_both_envelopes() {
        let flat: ImportSummary =
            serde_json::from_str(r#"{"status":"SUCCESS","importCount":{"imported":3,"ignored":1}}"#)
                .unwrap();
        let counts = flat.counts().unwrap();
        assert_eq!(counts.imported, 3);
        assert_eq!(counts.ignored, 1);

        let wrapped: ImportSummary =
            serde_json::from_str(r#"{"response":{"importCount":{"imported":0,"ignored":1}}}"#)
                .unwrap();
        assert_eq!(wrapped.counts().unwrap().ignored, 1);

        let empty: ImportSummary = serde_json::from_str(r#"{"status":"ERROR"}"#).unwrap();
        assert!(empty.counts().is_none());
    }

    #[test]
    fn data_value_serializes_camel_case_without_empty_combos() {
        let value = DataValue {
            data_element: "DE_B".to_string(),
            period: "202401".to_string(),
            org_unit: "OU_X".to_string(),
            category_option_combo: None,
            attribute_option_combo: None,
            value: "10".to_string(),
        };
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json["dataElement"], "DE_B");
        assert!(json.get("categoryOptionCombo").is_none());
    }
}
