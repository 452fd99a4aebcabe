//! HTTP access to one DHIS2-compatible instance

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use super::models::{
    CategoryOptionDetail, ComboRef, DataElementCombos, DataValueSet, ImportStrategy, ImportSummary,
};
use super::UpstreamError;
use crate::config::InstanceConfig;

/// Client bound to one instance with a default timeout. The underlying
/// `reqwest::Client` is shared; cloning this handle is cheap.
#[derive(Debug, Clone)]
pub struct DhisClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    timeout: Duration,
}

impl DhisClient {
    pub fn new(http: reqwest::Client, instance: &InstanceConfig, timeout: Duration) -> Self {
        Self {
            http,
            base_url: instance.base_url.trim_end_matches('/').to_string(),
            username: instance.username.clone(),
            password: instance.password.clone(),
            timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Path for reading from a remote instance through this instance's
    /// route proxy.
    pub fn routed_path(route_id: &str, path: &str) -> String {
        format!("api/routes/{route_id}/run/{}", path.trim_start_matches('/'))
    }

    /// GET `analytics/dataValueSet.json` with dx/pe/ou dimensions.
    pub async fn analytics_data_values(
        &self,
        data_elements: &[String],
        periods: &[String],
        org_unit_dimension: &str,
        timeout: Duration,
    ) -> Result<DataValueSet, UpstreamError> {
        let query = [
            ("dimension", format!("dx:{}", data_elements.join(";"))),
            ("dimension", format!("pe:{}", periods.join(";"))),
            ("dimension", format!("ou:{org_unit_dimension}")),
        ];
        self.get_json_with_timeout("api/analytics/dataValueSet.json", &query, timeout)
            .await
    }

    /// POST a value set to `dataValueSets` with `async=false`.
    pub async fn post_data_values(
        &self,
        set: &DataValueSet,
        strategy: ImportStrategy,
    ) -> Result<ImportSummary, UpstreamError> {
        let url = self.url("api/dataValueSets.json");
        debug!(url = %url, strategy = strategy.as_str(), values = set.data_values.len(), "posting data values");

        let response = self
            .http
            .post(&url)
            .query(&[
                ("importStrategy", strategy.as_str()),
                ("async", "false"),
            ])
            .basic_auth(&self.username, Some(&self.password))
            .timeout(self.timeout)
            .json(set)
            .send()
            .await
            .map_err(|err| transport_error(&url, err))?;

        read_import_summary(&url, response).await
    }

    /// POST a metadata bundle to the metadata import endpoint.
    pub async fn post_metadata(&self, bundle: &Value) -> Result<ImportSummary, UpstreamError> {
        let url = self.url("api/metadata.json");
        debug!(url = %url, "posting metadata bundle");

        let response = self
            .http
            .post(&url)
            .query(&[("importMode", "COMMIT"), ("atomicMode", "NONE")])
            .basic_auth(&self.username, Some(&self.password))
            .timeout(self.timeout)
            .json(bundle)
            .send()
            .await
            .map_err(|err| transport_error(&url, err))?;

        read_import_summary(&url, response).await
    }

    /// GET a single metadata object with a fields projection.
    pub async fn metadata_object(
        &self,
        path: &str,
        fields: &str,
    ) -> Result<Value, UpstreamError> {
        let query = [("fields", fields.to_string())];
        self.get_json_with_timeout(path, &query, self.timeout).await
    }

    /// GET a metadata collection filtered to a set of ids. `path` may be
    /// route-proxied; `collection` names the array in the response body.
    pub async fn metadata_by_ids(
        &self,
        path: &str,
        collection: &str,
        ids: &[String],
        fields: &str,
    ) -> Result<Vec<Value>, UpstreamError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let query = [
            ("filter", format!("id:in:[{}]", ids.join(","))),
            ("fields", fields.to_string()),
            ("paging", "false".to_string()),
        ];
        let body: Value = self.get_json_with_timeout(path, &query, self.timeout).await?;
        let items = body
            .get(collection)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(items)
    }

    /// Category-option-combos of a data element's category combo.
    pub async fn data_element_combos(&self, id: &str) -> Result<Vec<ComboRef>, UpstreamError> {
        let path = format!("api/dataElements/{id}.json");
        let query = [(
            "fields",
            "categoryCombo[categoryOptionCombos[id,name]]".to_string(),
        )];
        let combos: DataElementCombos = self
            .get_json_with_timeout(&path, &query, self.timeout)
            .await?;
        Ok(combos
            .category_combo
            .map(|combo| combo.category_option_combos)
            .unwrap_or_default())
    }

    /// A category option with its parent categories and combos.
    pub async fn category_option(&self, id: &str) -> Result<CategoryOptionDetail, UpstreamError> {
        let path = format!("api/categoryOptions/{id}.json");
        let query = [(
            "fields",
            "id,categories[id],categoryOptionCombos[id,name]".to_string(),
        )];
        self.get_json_with_timeout(&path, &query, self.timeout).await
    }

    async fn get_json_with_timeout<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        timeout: Duration,
    ) -> Result<T, UpstreamError> {
        let url = self.url(path);
        debug!(url = %url, "upstream GET");

        let response = self
            .http
            .get(&url)
            .query(query)
            .basic_auth(&self.username, Some(&self.password))
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| transport_error(&url, err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(&url, status.as_u16(), body));
        }

        response
            .json::<T>()
            .await
            .map_err(|err| UpstreamError::Decode {
                url: url.clone(),
                reason: err.to_string(),
            })
    }
}

/// Map a reqwest transport failure onto the taxonomy. Timeouts, DNS and
/// connection faults are transient.
fn transport_error(url: &str, err: reqwest::Error) -> UpstreamError {
    let code = if err.is_timeout() {
        "timeout"
    } else if err.is_connect() {
        "connect"
    } else if err.is_request() {
        "request"
    } else {
        "transport"
    };
    UpstreamError::Transient {
        url: url.to_string(),
        reason: err.to_string(),
        status: err.status().map(|status| status.as_u16()),
        code: Some(code.to_string()),
    }
}

/// Map a non-2xx response onto the taxonomy.
fn classify_status(url: &str, status: u16, body: String) -> UpstreamError {
    match status {
        409 => match serde_json::from_str::<ImportSummary>(&body)
            .ok()
            .and_then(|summary| summary.counts())
        {
            Some(counts) => UpstreamError::Conflict {
                url: url.to_string(),
                imported: counts.imported,
                ignored: counts.ignored,
            },
            // a 409 with no import counts is not a partial success
            None => UpstreamError::Fatal {
                url: url.to_string(),
                status,
                body,
            },
        },
        408 | 500..=599 => UpstreamError::Transient {
            url: url.to_string(),
            reason: format!("HTTP {status}"),
            status: Some(status),
            code: None,
        },
        _ => UpstreamError::Fatal {
            url: url.to_string(),
            status,
            body,
        },
    }
}

async fn read_import_summary(
    url: &str,
    response: reqwest::Response,
) -> Result<ImportSummary, UpstreamError> {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    if !status.is_success() {
        return Err(classify_status(url, status.as_u16(), body));
    }

    serde_json::from_str(&body).map_err(|err| UpstreamError::Decode {
        url: url.to_string(),
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routed_path_shape() {
        assert_eq!(
            DhisClient::routed_path("src-route", "api/dashboards/d1.json"),
            "api/routes/src-route/run/api/dashboards/d1.json"
        );
        assert_eq!(
            DhisClient::routed_path("r", "/api/x.json"),
            "api/routes/r/run/api/x.json"
        );
    }

    #[test]
    fn conflict_with_counts_is_partial_success() {
        let err = classify_status(
            "https://x",
            409,
            r#"{"response":{"importCount":{"imported":0,"ignored":1}}}"#.to_string(),
        );
        match err {
            UpstreamError::Conflict {
                imported, ignored, ..
            } => {
                assert_eq!(imported, 0);
                assert_eq!(ignored, 1);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn conflict_without_counts_is_fatal() {
        let err = classify_status("https://x", 409, r#"{"status":"ERROR"}"#.to_string());
        assert!(matches!(err, UpstreamError::Fatal { status: 409, .. }));
    }

    #[test]
    fn gateway_faults_are_transient() {
        for status in [408, 502, 503, 504, 500] {
            let err = classify_status("https://x", status, String::new());
            assert!(err.is_retryable(), "HTTP {status} should be retryable");
        }
        assert!(!classify_status("https://x", 404, String::new()).is_retryable());
        assert!(!classify_status("https://x", 400, String::new()).is_retryable());
    }
}
