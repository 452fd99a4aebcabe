//! End-to-end pipeline tests over the in-memory broker
//!
//! These drive the real planner, worker runtime and handlers against a
//! local mock upstream: plan → download queue → analytics fetch →
//! translate → scratch file → upload queue → import at the destination.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::{watch, Mutex};
use tower::ServiceExt;

use flexisync::api::{self, AppState};
use flexisync::broker::MemoryBroker;
use flexisync::config::{
    ConfigStore, DataItemConfig, IdMapping, InstanceConfig, MigrationConfig, ServiceConfig,
};
use flexisync::planner::periods::PeriodType;
use flexisync::worker::{ActivityTable, WorkerRuntime};

/// How the mock destination answers `POST /api/dataValueSets.json`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadMode {
    Success,
    ServerError,
    Conflict,
}

#[derive(Debug)]
struct MockUpstream {
    mode: UploadMode,
    posts: Mutex<Vec<(String, Value)>>,
}

type Mock = Arc<MockUpstream>;

async fn analytics(State(_mock): State<Mock>) -> Json<Value> {
    Json(json!({
        "dataValues": [
            {"dataElement": "DE_A", "period": "202401", "orgUnit": "OU_X", "value": "10"},
            {"dataElement": "DE_A", "period": "202401", "orgUnit": "OU_Y", "value": "not-a-number"}
        ]
    }))
}

async fn data_element_combos() -> Json<Value> {
    // both instances expose one default combo with the same id
    Json(json!({
        "categoryCombo": {
            "categoryOptionCombos": [{"id": "COC_DEFAULT", "name": "default"}]
        }
    }))
}

async fn post_data_values(
    State(mock): State<Mock>,
    Query(params): Query<std::collections::HashMap<String, String>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let strategy = params
        .get("importStrategy")
        .cloned()
        .unwrap_or_default();
    mock.posts.lock().await.push((strategy, body));

    match mock.mode {
        UploadMode::Success => (
            StatusCode::OK,
            Json(json!({
                "status": "SUCCESS",
                "importCount": {"imported": 1, "updated": 0, "ignored": 0, "deleted": 0}
            })),
        ),
        UploadMode::ServerError => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "ERROR"})),
        ),
        UploadMode::Conflict => (
            StatusCode::CONFLICT,
            Json(json!({
                "response": {"importCount": {"imported": 0, "ignored": 1}}
            })),
        ),
    }
}

async fn start_mock_upstream(mode: UploadMode) -> (String, Mock) {
    let mock = Arc::new(MockUpstream {
        mode,
        posts: Mutex::new(Vec::new()),
    });

    let app = Router::new()
        .route("/api/analytics/dataValueSet.json", get(analytics))
        .route("/api/dataElements/{id}", get(data_element_combos))
        .route("/api/dataValueSets.json", post(post_data_values))
        .with_state(mock.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock upstream");
    let addr: SocketAddr = listener.local_addr().expect("mock addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app.into_make_service()).await;
    });

    (format!("http://{addr}"), mock)
}

struct Pipeline {
    app: axum::Router,
    broker: Arc<MemoryBroker>,
    state: AppState,
    _shutdown: watch::Sender<bool>,
    _outputs: TempDir,
}

async fn start_pipeline(mode: UploadMode) -> (Pipeline, Mock) {
    let (base_url, mock) = start_mock_upstream(mode).await;

    let instance = || InstanceConfig {
        base_url: base_url.clone(),
        username: "sync".to_string(),
        password: "secret".to_string(),
        route_id: None,
    };
    let store = ConfigStore::from_configs(vec![MigrationConfig {
        config_id: "cfg1".to_string(),
        source: instance(),
        destination: instance(),
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
    }]);

    let outputs = TempDir::new().expect("outputs dir");
    let mut service_config = ServiceConfig::default();
    service_config.server.outputs_dir = outputs.path().join("outputs");

    let broker = Arc::new(MemoryBroker::new());
    let activity = Arc::new(ActivityTable::new());
    let state = AppState::new(service_config, store, broker.clone(), activity.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runtime = Arc::new(WorkerRuntime::new(
        state.handler_context(),
        activity,
        Duration::from_millis(50),
    ));
    runtime
        .start(shutdown_rx)
        .await
        .expect("worker runtime start");

    (
        Pipeline {
            app: api::router(state.clone()),
            broker,
            state,
            _shutdown: shutdown_tx,
            _outputs: outputs,
        },
        mock,
    )
}

async fn post_download_plan(pipeline: &Pipeline) {
    let request = axum::http::Request::builder()
        .method("POST")
        .uri("/data-download/cfg1")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(
            json!({
                "dataItemsConfigIds": ["item-1"],
                "runtimeConfig": {"periods": ["202401"]}
            })
            .to_string(),
        ))
        .expect("request");
    let response = pipeline
        .app
        .clone()
        .oneshot(request)
        .await
        .expect("plan response");
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

async fn status_of(pipeline: &Pipeline) -> Value {
    let request = axum::http::Request::builder()
        .uri("/status/cfg1")
        .body(axum::body::Body::empty())
        .expect("request");
    let response = pipeline
        .app
        .clone()
        .oneshot(request)
        .await
        .expect("status response");
    let bytes = http_body_util::BodyExt::collect(response.into_body())
        .await
        .expect("body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("status json")
}

fn scratch_files(pipeline: &Pipeline) -> Vec<std::path::PathBuf> {
    let dir = pipeline.state.scratch.root().join("cfg1");
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Poll until `probe` yields true or the deadline passes.
async fn wait_for<F, Fut>(what: &str, deadline: Duration, mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let started = std::time::Instant::now();
    loop {
        if probe().await {
            return;
        }
        if started.elapsed() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn happy_path_data_migration() {
    let (pipeline, mock) = start_pipeline(UploadMode::Success).await;
    post_download_plan(&pipeline).await;

    wait_for("destination import", Duration::from_secs(20), || async {
        !mock.posts.lock().await.is_empty()
    })
    .await;

    let posts = mock.posts.lock().await;
    assert_eq!(posts.len(), 1);
    let (strategy, body) = &posts[0];
    assert_eq!(strategy, "CREATE_AND_UPDATE");
    // the identifier was rewritten and the non-numeric value dropped
    assert_eq!(
        body["dataValues"],
        json!([
            {"dataElement": "DE_B", "period": "202401", "orgUnit": "OU_X", "value": "10"}
        ])
    );
    drop(posts);

    wait_for("scratch cleanup", Duration::from_secs(10), || async {
        scratch_files(&pipeline).is_empty()
    })
    .await;

    wait_for("completed status", Duration::from_secs(10), || async {
        status_of(&pipeline).await["status"] == "COMPLETED"
    })
    .await;
    assert_eq!(pipeline.broker.ready_len("failed.cfg1").await, 0);
}

#[tokio::test]
async fn persistent_upload_failure_dead_letters_after_retries() {
    let (pipeline, mock) = start_pipeline(UploadMode::ServerError).await;
    post_download_plan(&pipeline).await;

    wait_for("dead-lettered upload", Duration::from_secs(60), || async {
        pipeline.broker.ready_len("failed.cfg1").await == 1
    })
    .await;

    let headers = pipeline
        .broker
        .peek_headers("failed.cfg1", 0)
        .await
        .expect("dlq headers");
    assert_eq!(headers.text("x-queue-type"), Some("dataUpload"));
    assert_eq!(headers.text("x-axios-status"), Some("503"));
    assert_eq!(headers.text("x-error-name"), Some("UpstreamTransient"));
    // the counter never exceeds the immediate-requeue limit at DLQ time
    assert_eq!(headers.int("x-retry-count"), Some(2));
    assert!(headers.text("x-failure-reason").is_some());
    assert!(headers.text("x-error-timestamp").is_some());

    // the DLQ'd message still references its scratch file
    assert_eq!(scratch_files(&pipeline).len(), 1);

    // two immediate requeues, each with an inline retry, then give up
    let posts = mock.posts.lock().await;
    assert_eq!(posts.len(), 6);
}

#[tokio::test]
async fn upload_conflict_completes_with_cleanup() {
    let (pipeline, mock) = start_pipeline(UploadMode::Conflict).await;
    post_download_plan(&pipeline).await;

    wait_for("conflicted import", Duration::from_secs(20), || async {
        !mock.posts.lock().await.is_empty()
    })
    .await;

    wait_for("scratch cleanup", Duration::from_secs(10), || async {
        scratch_files(&pipeline).is_empty()
    })
    .await;

    // the message completed: nothing dead-lettered, nothing requeued
    wait_for("settled queues", Duration::from_secs(10), || async {
        let status = status_of(&pipeline).await;
        status["status"] == "COMPLETED"
    })
    .await;
    assert_eq!(pipeline.broker.ready_len("failed.cfg1").await, 0);
    assert_eq!(pipeline.state.metrics.snapshot().uploads_conflicted, 1);

    // a 409 is settled on the first delivery, inline retry included
    assert_eq!(mock.posts.lock().await.len(), 1);
}
