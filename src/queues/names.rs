//! Queue family naming
//!
//! Operators depend on these exact patterns; they are part of the wire
//! contract together with the message bodies and headers.

use serde::{Deserialize, Serialize};

/// The five work-queue kinds of a configuration's family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueKind {
    #[serde(rename = "metadataDownload")]
    MetadataDownload,
    #[serde(rename = "metadataUpload")]
    MetadataUpload,
    #[serde(rename = "dataDownload")]
    DataDownload,
    #[serde(rename = "dataUpload")]
    DataUpload,
    #[serde(rename = "dataDeletion")]
    DataDeletion,
}

impl QueueKind {
    pub const ALL: [QueueKind; 5] = [
        QueueKind::MetadataDownload,
        QueueKind::MetadataUpload,
        QueueKind::DataDownload,
        QueueKind::DataUpload,
        QueueKind::DataDeletion,
    ];

    pub fn queue_name(&self, config_id: &str) -> String {
        format!("{}.{config_id}", self.prefix())
    }

    fn prefix(&self) -> &'static str {
        match self {
            QueueKind::MetadataDownload => "metadata.download",
            QueueKind::MetadataUpload => "metadata.upload",
            QueueKind::DataDownload => "data.download",
            QueueKind::DataUpload => "data.upload",
            QueueKind::DataDeletion => "data.delete",
        }
    }

    /// The process-type label used in `x-queue-type` headers and the
    /// retry API. Matches [`crate::jobs::JobKind::label`].
    pub fn label(&self) -> &'static str {
        match self {
            QueueKind::MetadataDownload => "metadataDownload",
            QueueKind::MetadataUpload => "metadataUpload",
            QueueKind::DataDownload => "dataDownload",
            QueueKind::DataUpload => "dataUpload",
            QueueKind::DataDeletion => "dataDeletion",
        }
    }

    pub fn from_label(label: &str) -> Option<QueueKind> {
        QueueKind::ALL.into_iter().find(|kind| kind.label() == label)
    }

    /// Recover `(kind, configId)` from a queue name.
    pub fn parse_queue_name(name: &str) -> Option<(QueueKind, &str)> {
        for kind in QueueKind::ALL {
            let prefix = kind.prefix();
            if let Some(rest) = name.strip_prefix(prefix) {
                if let Some(config_id) = rest.strip_prefix('.') {
                    if !config_id.is_empty() {
                        return Some((kind, config_id));
                    }
                }
            }
        }
        None
    }
}

/// The dead-letter queue shared by a configuration's work queues
pub fn failed_queue(config_id: &str) -> String {
    format!("failed.{config_id}")
}

/// All six names of a configuration's family: the five work queues plus
/// the DLQ, in declaration order.
pub fn family_names(config_id: &str) -> Vec<String> {
    let mut names: Vec<String> = QueueKind::ALL
        .iter()
        .map(|kind| kind.queue_name(config_id))
        .collect();
    names.push(failed_queue(config_id));
    names
}
