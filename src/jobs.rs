//! Jobs carried on the broker
//!
//! Message bodies are UTF-8 JSON with camelCase field names; the `kind`
//! discriminator matches the `x-queue-type` header values used by the
//! failed-queue API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::dhis::models::DataValueSet;

/// Common envelope around every queued unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEnvelope {
    pub config_id: String,
    pub job_id: String,
    #[serde(default)]
    pub retry_count: u32,
    pub queued_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: JobKind,
}

impl JobEnvelope {
    pub fn new(config_id: impl Into<String>, kind: JobKind) -> Self {
        Self {
            config_id: config_id.into(),
            job_id: Uuid::now_v7().to_string(),
            retry_count: 0,
            queued_at: Utc::now(),
            kind,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Where a metadata download reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetadataSource {
    #[serde(rename = "source")]
    Source,
    #[serde(rename = "flexiportal-config")]
    PortalConfig,
}

/// Runtime overrides carried from the request into data jobs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_unit_level: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_org_unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub paginate_by_data: bool,
}

/// Payload origin for uploads: a scratch file on disk or an inline value set
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UploadSource {
    #[serde(rename_all = "camelCase")]
    File { scratch_path: String },
    #[serde(rename_all = "camelCase")]
    Inline { payload: DataValueSet },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum JobKind {
    #[serde(rename = "metadataDownload", rename_all = "camelCase")]
    MetadataDownload {
        metadata_source: MetadataSource,
        #[serde(default)]
        selected_dashboards: Vec<String>,
        #[serde(default)]
        selected_visualizations: Vec<String>,
        #[serde(default)]
        selected_maps: Vec<String>,
    },
    #[serde(rename = "metadataUpload", rename_all = "camelCase")]
    MetadataUpload {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scratch_path: Option<String>,
    },
    #[serde(rename = "dataDownload", rename_all = "camelCase")]
    DataDownload {
        data_item_config_id: String,
        period_id: String,
        #[serde(default)]
        overrides: RuntimeOverrides,
        #[serde(default)]
        is_delete: bool,
    },
    #[serde(rename = "dataUpload", rename_all = "camelCase")]
    DataUpload {
        #[serde(flatten)]
        source: UploadSource,
        #[serde(default)]
        is_delete: bool,
    },
    #[serde(rename = "dataDeletion", rename_all = "camelCase")]
    DataDeletion {
        #[serde(flatten)]
        source: UploadSource,
        #[serde(default)]
        is_delete: bool,
    },
}

impl JobKind {
    /// The process-type label used in `x-queue-type` headers and the
    /// retry API's `processType` parameter.
    pub fn label(&self) -> &'static str {
        match self {
            JobKind::MetadataDownload { .. } => "metadataDownload",
            JobKind::MetadataUpload { .. } => "metadataUpload",
            JobKind::DataDownload { .. } => "dataDownload",
            JobKind::DataUpload { .. } => "dataUpload",
            JobKind::DataDeletion { .. } => "dataDeletion",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dhis::models::DataValue;

    #[test]
    fn envelope_round_trips() {
        let envelope = JobEnvelope::new(
            "cfg1",
            JobKind::DataDownload {
                data_item_config_id: "item-1".to_string(),
                period_id: "202401".to_string(),
                overrides: RuntimeOverrides::default(),
                is_delete: false,
            },
        );

        let bytes = envelope.to_bytes().unwrap();
        let decoded = JobEnvelope::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.config_id, "cfg1");
        assert_eq!(decoded.job_id, envelope.job_id);
        assert_eq!(decoded.kind.label(), "dataDownload");
    }

    #[test]
    fn kind_discriminator_is_on_the_wire() {
        let envelope = JobEnvelope::new(
            "cfg1",
            JobKind::MetadataDownload {
                metadata_source: MetadataSource::Source,
                selected_dashboards: vec!["dash1".to_string()],
                selected_visualizations: Vec::new(),
                selected_maps: Vec::new(),
            },
        );

        let value: Value = serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(value["kind"], "metadataDownload");
        assert_eq!(value["metadataSource"], "source");
        assert_eq!(value["configId"], "cfg1");
    }

    #[test]
    fn upload_source_distinguishes_file_from_inline() {
        let file = JobEnvelope::new(
            "cfg1",
            JobKind::DataUpload {
                source: UploadSource::File {
                    scratch_path: "outputs/cfg1/abc.json".to_string(),
                },
                is_delete: false,
            },
        );
        let value: Value = serde_json::from_slice(&file.to_bytes().unwrap()).unwrap();
        assert_eq!(value["scratchPath"], "outputs/cfg1/abc.json");

        let inline = JobEnvelope::new(
            "cfg1",
            JobKind::DataDeletion {
                source: UploadSource::Inline {
                    payload: DataValueSet {
                        data_values: vec![DataValue {
                            data_element: "DE_B".to_string(),
                            period: "202401".to_string(),
                            org_unit: "OU_X".to_string(),
                            category_option_combo: None,
                            attribute_option_combo: None,
                            value: "10".to_string(),
                        }],
                    },
                },
                is_delete: true,
            },
        );
        let decoded = JobEnvelope::from_bytes(&inline.to_bytes().unwrap()).unwrap();
        match decoded.kind {
            JobKind::DataDeletion {
                source: UploadSource::Inline { payload },
                ..
            } => assert_eq!(payload.data_values.len(), 1),
            other => panic!("unexpected kind: {other:?}"),
        }
    }
}
