use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt; // for `oneshot`

use flexisync::api::{self, AppState};
use flexisync::broker::{MemoryBroker, MessageHeaders, MessageQueue};
use flexisync::config::{
    ConfigStore, DataItemConfig, IdMapping, InstanceConfig, MigrationConfig, ServiceConfig,
};
use flexisync::planner::periods::PeriodType;
use flexisync::worker::ActivityTable;

fn test_migration_config(config_id: &str) -> MigrationConfig {
    let instance = |url: &str| InstanceConfig {
        base_url: url.to_string(),
        username: "sync".to_string(),
        password: "secret".to_string(),
        route_id: None,
    };

    MigrationConfig {
        config_id: config_id.to_string(),
        source: instance("https://source.example.org"),
        destination: instance("https://dest.example.org"),
        data_items: vec![DataItemConfig {
            id: "item-1".to_string(),
            period_type: PeriodType::Monthly,
            parent_org_unit: "OU_ROOT".to_string(),
            org_unit_level: 3,
            mappings: vec![IdMapping {
                source_id: "DE_A".to_string(),
                destination_id: "DE_B".to_string(),
            }],
            attribute_combo: None,
        }],
        portal_metadata: None,
    }
}

/// Builds a test app over an in-memory broker with isolated scratch space
fn build_test_app(config_ids: &[&str]) -> (Router, Arc<MemoryBroker>, TempDir) {
    let temp_dir = TempDir::new().expect("temp dir");

    let mut service_config = ServiceConfig::default();
    service_config.server.outputs_dir = temp_dir.path().join("outputs");

    let store = ConfigStore::from_configs(
        config_ids
            .iter()
            .map(|config_id| test_migration_config(config_id))
            .collect(),
    );

    let broker = Arc::new(MemoryBroker::new());
    let state = AppState::new(
        service_config,
        store,
        broker.clone(),
        Arc::new(ActivityTable::new()),
    );

    (api::router(state), broker, temp_dir)
}

async fn send_json(app: &Router, method: &str, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request");
    send(app, request).await
}

async fn send_empty(app: &Router, method: &str, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .expect("request");
    send(app, request).await
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = http_body_util::BodyExt::collect(response.into_body())
        .await
        .expect("body")
        .to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}

#[tokio::test]
async fn info_reports_the_crate_version() {
    let (app, _broker, _dir) = build_test_app(&["cfg1"]);

    let (status, body) = send_empty(&app, "GET", "/info").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn unknown_config_yields_404_with_failure_shape() {
    let (app, _broker, _dir) = build_test_app(&["cfg1"]);

    let (status, body) = send_empty(&app, "POST", "/queues/unknown").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn queue_family_lifecycle() {
    let (app, broker, _dir) = build_test_app(&["cfg2"]);

    let (status, body) = send_empty(&app, "POST", "/queues/cfg2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    let queues = body["queues"].as_array().expect("queues array");
    assert_eq!(queues.len(), 5);
    assert_eq!(body["failedQueue"], "failed.cfg2");
    assert!(broker.queue_depth("failed.cfg2").await.unwrap().is_some());

    // create is idempotent
    let (status, _body) = send_empty(&app, "POST", "/queues/cfg2").await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send_empty(&app, "DELETE", "/queues/cfg2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deletedQueues"], 6);
    assert!(broker.queue_depth("data.upload.cfg2").await.unwrap().is_none());

    // delete after delete is a no-op
    let (status, body) = send_empty(&app, "DELETE", "/queues/cfg2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["messagesPurged"], 0);
}

#[tokio::test]
async fn metadata_download_is_accepted_and_queued() {
    let (app, broker, _dir) = build_test_app(&["cfg1"]);

    let (status, body) = send_json(
        &app,
        "POST",
        "/metadata-download/cfg1",
        json!({
            "metadataSource": "source",
            "selectedDashboards": ["dash1"],
            "selectedVisualizations": ["viz1", "viz2"],
            "selectedMaps": []
        }),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["success"], true);
    assert_eq!(body["configId"], "cfg1");
    assert_eq!(body["totalItems"], 3);
    assert_eq!(body["status"], "processing");

    assert_eq!(broker.ready_len("metadata.download.cfg1").await, 1);
}

#[tokio::test]
async fn metadata_download_get_variant_parses_encoded_arrays() {
    let (app, broker, _dir) = build_test_app(&["cfg1"]);

    let uri = "/metadata-download/cfg1?metadataSource=source&selectedDashboards=%5B%22dash1%22%5D&selectedVisualizations=%5B%5D&selectedMaps=%5B%5D";
    let (status, body) = send_empty(&app, "GET", uri).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["totalItems"], 1);
    assert_eq!(broker.ready_len("metadata.download.cfg1").await, 1);
}

#[tokio::test]
async fn data_download_plans_one_job_per_period() {
    let (app, broker, _dir) = build_test_app(&["cfg1"]);

    let (status, body) = send_json(
        &app,
        "POST",
        "/data-download/cfg1",
        json!({
            "dataItemsConfigIds": ["item-1"],
            "runtimeConfig": {"periods": ["2024Q1"]}
        }),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["totalItems"], 3); // 2024Q1 expands to three months
    assert_eq!(broker.ready_len("data.download.cfg1").await, 3);
}

#[tokio::test]
async fn data_download_validates_the_request() {
    let (app, _broker, _dir) = build_test_app(&["cfg1"]);

    let (status, body) = send_json(
        &app,
        "POST",
        "/data-download/cfg1",
        json!({"dataItemsConfigIds": [], "runtimeConfig": {"periods": ["202401"]}}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    let (status, _body) = send_json(
        &app,
        "POST",
        "/data-download/cfg1",
        json!({"dataItemsConfigIds": ["item-1"], "runtimeConfig": {"periods": []}}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _body) = send_json(
        &app,
        "POST",
        "/data-download/cfg1",
        json!({"dataItemsConfigIds": ["nope"], "runtimeConfig": {"periods": ["202401"]}}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn data_delete_threads_the_delete_flag() {
    let (app, broker, _dir) = build_test_app(&["cfg1"]);

    let (status, _body) = send_json(
        &app,
        "POST",
        "/data-delete/cfg1",
        json!({
            "dataItemsConfigIds": ["item-1"],
            "runtimeConfig": {"periods": ["202401"]}
        }),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let delivery = broker.fetch("data.download.cfg1").await.unwrap().unwrap();
    let envelope: Value = serde_json::from_slice(&delivery.body).unwrap();
    assert_eq!(envelope["kind"], "dataDownload");
    assert_eq!(envelope["isDelete"], true);
    delivery.ack().await.unwrap();
}

#[tokio::test]
async fn status_reports_queue_states_by_process_type() {
    let (app, broker, _dir) = build_test_app(&["cfg1"]);
    send_empty(&app, "POST", "/queues/cfg1").await;

    let (status, body) = send_empty(&app, "GET", "/status/cfg1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["status"], "IDLE");
    assert!(body["queues"]["dataUpload"].is_object());
    assert_eq!(body["health"]["healthy"], true);
    assert!(body["timestamp"].is_string());

    // a queued message flips the aggregate to QUEUED
    broker
        .publish(
            "data.download.cfg1",
            b"{}".to_vec(),
            MessageHeaders::new(),
        )
        .await
        .unwrap();
    let (_status, body) = send_empty(&app, "GET", "/status/cfg1").await;
    assert_eq!(body["status"], "QUEUED");
    assert_eq!(body["queues"]["dataDownload"]["ready"], 1);
}

fn dead_letter_message(job_id: &str) -> (Vec<u8>, MessageHeaders) {
    let body = json!({
        "configId": "cfg1",
        "jobId": job_id,
        "retryCount": 3,
        "queuedAt": "2024-01-01T00:00:00Z",
        "kind": "dataUpload",
        "scratchPath": "outputs/cfg1/gone.json"
    });

    let mut headers = MessageHeaders::new();
    headers.set_int("x-retry-count", 3);
    headers.set_text("x-queue-type", "dataUpload");
    headers.set_text("x-original-queue", "data.upload.cfg1");
    headers.set_text("x-error-name", "UpstreamTransient");
    headers.set_text("x-error-message", "HTTP 503");
    headers.set_text("x-error-timestamp", "2024-01-01T00:00:10Z");
    (body.to_string().into_bytes(), headers)
}

#[tokio::test]
async fn failed_queue_listing_and_filtering() {
    let (app, broker, _dir) = build_test_app(&["cfg1"]);
    send_empty(&app, "POST", "/queues/cfg1").await;

    let (body, headers) = dead_letter_message("job-failed-1");
    broker.publish("failed.cfg1", body, headers).await.unwrap();

    let (status, listing) = send_empty(&app, "GET", "/failed-queue/cfg1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listing["total"], 1);
    assert_eq!(listing["queues"]["dataUpload"], 1);
    let message = &listing["messages"][0];
    assert_eq!(message["messageId"], "job-failed-1");
    assert_eq!(message["queueType"], "dataUpload");
    assert_eq!(message["retryCount"], 3);
    // bodies are withheld unless asked for
    assert!(message.get("message").is_none());

    // listing must not consume the queue
    assert_eq!(broker.ready_len("failed.cfg1").await, 1);

    let (_status, listing) =
        send_empty(&app, "GET", "/failed-queue/cfg1?includeMessages=true").await;
    assert_eq!(
        listing["messages"][0]["message"]["jobId"],
        "job-failed-1"
    );

    let (_status, listing) =
        send_empty(&app, "GET", "/failed-queue/cfg1?queue=metadataUpload").await;
    assert_eq!(listing["total"], 0);

    let (_status, listing) = send_empty(&app, "GET", "/failed-queue/cfg1?onlyQueues=true").await;
    assert_eq!(listing["queues"]["dataUpload"], 1);
    assert!(listing.get("messages").is_none());
}

#[tokio::test]
async fn retry_by_process_type_republishes_with_reset_counter() {
    let (app, broker, _dir) = build_test_app(&["cfg1"]);
    send_empty(&app, "POST", "/queues/cfg1").await;

    let (body, headers) = dead_letter_message("job-failed-2");
    broker.publish("failed.cfg1", body, headers).await.unwrap();

    let (status, response) = send_empty(
        &app,
        "GET",
        "/retry/cfg1?retryType=process-type&processType=dataUpload&maxRetries=5",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["retried"], 1);

    assert_eq!(broker.ready_len("failed.cfg1").await, 0);
    assert_eq!(broker.ready_len("data.upload.cfg1").await, 1);

    let headers = broker.peek_headers("data.upload.cfg1", 0).await.unwrap();
    assert_eq!(headers.int("x-retry-count"), Some(0));

    // a second replay finds nothing
    let (_status, response) = send_empty(
        &app,
        "GET",
        "/retry/cfg1?processType=dataUpload",
    )
    .await;
    assert_eq!(response["retried"], 0);
}

#[tokio::test]
async fn retry_single_message_by_id() {
    let (app, broker, _dir) = build_test_app(&["cfg1"]);
    send_empty(&app, "POST", "/queues/cfg1").await;

    let (body, headers) = dead_letter_message("job-a");
    broker.publish("failed.cfg1", body, headers).await.unwrap();
    let (body, headers) = dead_letter_message("job-b");
    broker.publish("failed.cfg1", body, headers).await.unwrap();

    let (status, response) =
        send_empty(&app, "POST", "/retry/cfg1/message/job-b").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["retried"], 1);

    // the other message stays dead-lettered
    assert_eq!(broker.ready_len("failed.cfg1").await, 1);
    assert_eq!(broker.ready_len("data.upload.cfg1").await, 1);

    let (status, _response) =
        send_empty(&app, "POST", "/retry/cfg1/message/missing-id").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn failed_queue_purge_empties_the_dlq() {
    let (app, broker, _dir) = build_test_app(&["cfg1"]);
    send_empty(&app, "POST", "/queues/cfg1").await;

    let (body, headers) = dead_letter_message("job-c");
    broker.publish("failed.cfg1", body, headers).await.unwrap();

    let (status, response) = send_empty(&app, "DELETE", "/failed-queue/cfg1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["purged"], 1);
    assert_eq!(broker.ready_len("failed.cfg1").await, 0);
}

#[tokio::test]
async fn validation_run_completes_with_empty_selection() {
    let (app, _broker, _dir) = build_test_app(&["cfg1"]);

    // zero periods: the run completes immediately with no discrepancies
    let (status, body) = send_json(
        &app,
        "POST",
        "/data-validation/cfg1",
        json!({"dataItemConfigIds": ["item-1"], "periods": []}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "processing");
    let session_id = body["sessionId"].as_str().expect("session id").to_string();

    // the session is observable and settles to COMPLETED
    let mut completed = false;
    for _ in 0..50 {
        let (_status, report) = send_empty(&app, "GET", "/data-validation/cfg1").await;
        if report["session"]["status"] == "COMPLETED" {
            assert_eq!(report["session"]["sessionId"], session_id.as_str());
            assert_eq!(report["session"]["progress"]["discrepanciesFound"], 0);
            completed = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(completed, "validation session never completed");
}

#[tokio::test]
async fn configs_and_metrics_are_exposed() {
    let (app, _broker, _dir) = build_test_app(&["cfg1", "cfg2"]);

    let (status, body) = send_empty(&app, "GET", "/configs").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["configs"], json!(["cfg1", "cfg2"]));

    let (status, body) = send_empty(&app, "GET", "/metrics-snapshot").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["metrics"]["jobsPlanned"].is_number());
}
