//! Scratch files bridging download and upload jobs
//!
//! A scratch file lives under `outputs/{configId}/{uuid}.json` and has
//! exactly one live reference: the upload job naming it. The publishing
//! handler creates it; the consuming handler deletes it on success or on
//! a definitive rejection. The sweeper only touches files old enough
//! that no live message can still name them.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dhis::models::DataValueSet;

#[derive(Debug, Error)]
pub enum ScratchError {
    #[error("scratch file {path} is missing")]
    Missing { path: String },

    #[error("scratch file {path} is malformed: {source}")]
    Malformed {
        path: String,
        source: serde_json::Error,
    },

    #[error("scratch I/O on {path} failed: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

impl ScratchError {
    /// Missing and malformed files are payload defects; plain I/O
    /// faults are worth a retry.
    pub fn is_payload_defect(&self) -> bool {
        matches!(
            self,
            ScratchError::Missing { .. } | ScratchError::Malformed { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct ScratchStore {
    root: PathBuf,
}

impl ScratchStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist a value set and return the path carried by the upload job.
    pub async fn write(
        &self,
        config_id: &str,
        set: &DataValueSet,
    ) -> Result<String, ScratchError> {
        self.write_json(config_id, set).await
    }

    /// Persist any JSON-serializable payload under a fresh UUID name.
    pub async fn write_json<T: Serialize>(
        &self,
        config_id: &str,
        payload: &T,
    ) -> Result<String, ScratchError> {
        let dir = self.root.join(config_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| ScratchError::Io {
                path: dir.display().to_string(),
                source,
            })?;

        let path = dir.join(format!("{}.json", Uuid::new_v4()));
        let bytes = serde_json::to_vec(payload).map_err(|source| ScratchError::Malformed {
            path: path.display().to_string(),
            source,
        })?;

        tokio::fs::write(&path, bytes)
            .await
            .map_err(|source| ScratchError::Io {
                path: path.display().to_string(),
                source,
            })?;

        debug!(path = %path.display(), "scratch file written");
        Ok(path.display().to_string())
    }

    pub async fn read(&self, path: &str) -> Result<DataValueSet, ScratchError> {
        self.read_json(path).await
    }

    pub async fn read_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ScratchError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                return Err(ScratchError::Missing {
                    path: path.to_string(),
                })
            }
            Err(source) => {
                return Err(ScratchError::Io {
                    path: path.to_string(),
                    source,
                })
            }
        };

        serde_json::from_slice(&bytes).map_err(|source| ScratchError::Malformed {
            path: path.to_string(),
            source,
        })
    }

    /// Remove a consumed scratch file. A file already gone is fine.
    pub async fn remove(&self, path: &str) -> Result<(), ScratchError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                debug!(path, "scratch file removed");
                Ok(())
            }
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                warn!(path, "scratch file already gone");
                Ok(())
            }
            Err(source) => Err(ScratchError::Io {
                path: path.to_string(),
                source,
            }),
        }
    }

    /// Delete orphaned scratch files older than `ttl`. Returns how many
    /// were removed.
    pub async fn sweep_older_than(&self, ttl: Duration) -> Result<usize, ScratchError> {
        let cutoff = SystemTime::now()
            .checked_sub(ttl)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0usize;

        let mut config_dirs = match tokio::fs::read_dir(&self.root).await {
            Ok(dirs) => dirs,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(ScratchError::Io {
                    path: self.root.display().to_string(),
                    source,
                })
            }
        };

        while let Ok(Some(config_dir)) = config_dirs.next_entry().await {
            let mut files = match tokio::fs::read_dir(config_dir.path()).await {
                Ok(files) => files,
                Err(_) => continue,
            };

            while let Ok(Some(file)) = files.next_entry().await {
                let path = file.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                    continue;
                }
                let stale = file
                    .metadata()
                    .await
                    .ok()
                    .and_then(|meta| meta.modified().ok())
                    .map(|modified| modified < cutoff)
                    .unwrap_or(false);
                if stale && tokio::fs::remove_file(&path).await.is_ok() {
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            info!(removed, "swept orphaned scratch files");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dhis::models::DataValue;
    use tempfile::TempDir;

    fn value_set() -> DataValueSet {
        DataValueSet {
            data_values: vec![DataValue {
                data_element: "DE_B".to_string(),
                period: "202401".to_string(),
                org_unit: "OU_X".to_string(),
                category_option_combo: None,
                attribute_option_combo: None,
                value: "10".to_string(),
            }],
        }
    }

    #[tokio::test]
    async fn write_read_remove_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = ScratchStore::new(dir.path());

        let path = store.write("cfg1", &value_set()).await.unwrap();
        assert!(path.contains("cfg1"));
        assert!(path.ends_with(".json"));

        let read = store.read(&path).await.unwrap();
        assert_eq!(read, value_set());

        store.remove(&path).await.unwrap();
        assert!(matches!(
            store.read(&path).await,
            Err(ScratchError::Missing { .. })
        ));

        // removing twice is fine
        store.remove(&path).await.unwrap();
    }

    #[tokio::test]
    async fn malformed_file_is_a_payload_defect() {
        let dir = TempDir::new().unwrap();
        let store = ScratchStore::new(dir.path());
        let path = dir.path().join("cfg1").join("bad.json");
        tokio::fs::create_dir_all(path.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&path, b"not json").await.unwrap();

        let err = store.read(&path.display().to_string()).await.unwrap_err();
        assert!(err.is_payload_defect());
    }

    #[tokio::test]
    async fn sweep_only_removes_stale_files() {
        let dir = TempDir::new().unwrap();
        let store = ScratchStore::new(dir.path());
        store.write("cfg1", &value_set()).await.unwrap();

        // a fresh file survives a 1-hour TTL
        let removed = store.sweep_older_than(Duration::from_secs(3_600)).await.unwrap();
        assert_eq!(removed, 0);

        // everything is stale under a zero TTL
        let removed = store.sweep_older_than(Duration::ZERO).await.unwrap();
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn sweep_of_missing_root_is_a_no_op() {
        let store = ScratchStore::new("/nonexistent/outputs");
        assert_eq!(
            store.sweep_older_than(Duration::ZERO).await.unwrap(),
            0
        );
    }
}
