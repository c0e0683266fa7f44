//! HTTP tests for the pool API.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::{json, Value};
use tempfile::TempDir;

use cloudpool_api::{create_router, ApiConfig, ApiState};
use cloudpool_core::{
    CloudPoolMetadata, CloudPoolStatus, Machine, MachinePool, MachineState, PoolSizeSummary,
    ServiceState,
};
use cloudpool_engine::{BaseCloudPool, MockDriver, RecordingAlertSink, SUPPORTED_API_VERSIONS};
use cloudpool_store::RocksStore;

struct TestApp {
    server: TestServer,
    driver: Arc<MockDriver>,
    _dir: TempDir,
}

fn app(machines: Vec<Machine>) -> TestApp {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(RocksStore::open(dir.path()).unwrap());
    let driver = Arc::new(MockDriver::with_machines(machines));
    let pool = Arc::new(BaseCloudPool::new(
        driver.clone(),
        store,
        Arc::new(RecordingAlertSink::new()),
    ));
    let server = TestServer::new(create_router(ApiState::new(pool, ApiConfig::default()))).unwrap();
    TestApp {
        server,
        driver,
        _dir: dir,
    }
}

fn document() -> Value {
    json!({
        "name": "web",
        "cloudApiSettings": {"region": "eu-north-1"},
        "provisioningTemplate": {"size": "small"},
        "poolFetch": {
            "retries": {"maxRetries": 1, "initialBackoffDelay": {"time": 10, "unit": "milliseconds"}},
            "refreshInterval": {"time": 50, "unit": "milliseconds"}
        },
        "poolUpdate": {"updateInterval": {"time": 100, "unit": "milliseconds"}}
    })
}

async fn started(machines: Vec<Machine>) -> TestApp {
    let app = app(machines);
    app.server
        .post("/config")
        .json(&document())
        .await
        .assert_status_ok();
    app.server.post("/start").await.assert_status_ok();
    app
}

/// Poll `GET /pool/size` until `done` holds.
async fn wait_for_size(server: &TestServer, done: impl Fn(&PoolSizeSummary) -> bool) -> PoolSizeSummary {
    for _ in 0..100 {
        let response = server.get("/pool/size").await;
        if response.status_code() == StatusCode::OK {
            let summary: PoolSizeSummary = response.json();
            if done(&summary) {
                return summary;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("pool size never reached the expected state");
}

fn error_code(body: &Value) -> &str {
    body["error"]["code"].as_str().unwrap_or_default()
}

#[tokio::test]
async fn health_follows_pool_condition() {
    let app = app(Vec::new());
    let response = app.server.get("/health").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "idle");
    assert_eq!(body["configured"], false);

    // Started, but the backend never answers
    app.driver.fail_next_lists(u32::MAX);
    app.server
        .post("/config")
        .json(&document())
        .await
        .assert_status_ok();
    app.server.post("/start").await.assert_status_ok();
    let response = app.server.get("/health").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["started"], true);

    app.driver.fail_next_lists(0);
    wait_for_size(&app.server, |_| true).await;
    let body: Value = app.server.get("/health").await.json();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn metadata() {
    let app = app(Vec::new());
    let response = app.server.get("/metadata").await;
    response.assert_status_ok();
    let metadata: CloudPoolMetadata = response.json();
    assert_eq!(metadata.pool_identifier(), "Mock");
    assert_eq!(metadata.supported_api_versions(), SUPPORTED_API_VERSIONS);
}

#[tokio::test]
async fn unconfigured_pool() {
    let app = app(Vec::new());

    let status: CloudPoolStatus = app.server.get("/status").await.json();
    assert_eq!(status, CloudPoolStatus::default());

    let response = app.server.get("/config").await;
    response.assert_status(StatusCode::NOT_FOUND);
    assert_eq!(error_code(&response.json()), "not_found");

    let response = app.server.post("/start").await;
    response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(error_code(&response.json()), "not_ready");
}

#[tokio::test]
async fn configuration_round_trip() {
    let app = app(Vec::new());

    app.server
        .post("/config")
        .json(&document())
        .await
        .assert_status_ok();

    let response = app.server.get("/config").await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>(), document());

    let status: CloudPoolStatus = app.server.get("/status").await.json();
    assert!(status.configured);
    assert!(!status.started);
}

#[tokio::test]
async fn invalid_configuration_is_a_bad_request() {
    let app = app(Vec::new());

    let mut blank = document();
    blank["name"] = json!("  ");
    let response = app.server.post("/config").json(&blank).await;
    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&response.json()), "bad_request");

    let response = app.server.post("/config").text("not json").await;
    response.assert_status(StatusCode::BAD_REQUEST);

    app.server
        .get("/config")
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn pool_requires_start() {
    let app = app(Vec::new());
    app.server
        .post("/config")
        .json(&document())
        .await
        .assert_status_ok();

    let response = app.server.get("/pool").await;
    response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(error_code(&response.json()), "not_ready");
}

#[tokio::test]
async fn scale_up_and_down() {
    let app = started(Vec::new()).await;
    wait_for_size(&app.server, |s| s.desired_size == 0).await;

    app.server
        .post("/pool/size")
        .json(&json!({"desiredSize": 2}))
        .await
        .assert_status_ok();
    let summary = wait_for_size(&app.server, |s| s.allocated == 2).await;
    assert_eq!(summary.desired_size, 2);
    assert_eq!(app.driver.active_count(), 2);

    app.server
        .post("/pool/size")
        .json(&json!({"desiredSize": 0}))
        .await
        .assert_status_ok();
    wait_for_size(&app.server, |s| s.allocated == 0).await;
    assert_eq!(app.driver.active_count(), 0);
}

#[tokio::test]
async fn negative_desired_size() {
    let app = started(Vec::new()).await;
    let response = app
        .server
        .post("/pool/size")
        .json(&json!({"desiredSize": -1}))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn terminate_unknown_machine() {
    let app = started(vec![Machine::new("i-1", MachineState::Running)]).await;
    wait_for_size(&app.server, |s| s.desired_size == 1).await;

    let response = app
        .server
        .post("/pool/terminate")
        .json(&json!({"machineId": "i-404", "decrementDesiredSize": true}))
        .await;
    response.assert_status(StatusCode::NOT_FOUND);
    assert_eq!(error_code(&response.json()), "not_found");

    let response = app
        .server
        .post("/pool/terminate")
        .json(&json!({"decrementDesiredSize": true}))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn terminate_with_decrement() {
    let app = started(vec![
        Machine::new("i-1", MachineState::Running),
        Machine::new("i-2", MachineState::Running),
    ])
    .await;
    wait_for_size(&app.server, |s| s.desired_size == 2).await;

    app.server
        .post("/pool/terminate")
        .json(&json!({"machineId": "i-1", "decrementDesiredSize": true}))
        .await
        .assert_status_ok();

    let summary: PoolSizeSummary = app.server.get("/pool/size").await.json();
    assert_eq!(summary.desired_size, 1);
    assert_eq!(summary.allocated, 1);
    assert_eq!(
        app.driver.machine("i-1").unwrap().machine_state,
        MachineState::Terminated
    );
}

#[tokio::test]
async fn service_state() {
    let app = started(vec![Machine::new("i-1", MachineState::Running)]).await;
    wait_for_size(&app.server, |s| s.desired_size == 1).await;

    let response = app
        .server
        .post("/pool/serviceState")
        .json(&json!({"machineId": "i-1", "serviceState": "SLEEPING"}))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);

    app.server
        .post("/pool/serviceState")
        .json(&json!({"machineId": "i-1", "serviceState": "IN_SERVICE"}))
        .await
        .assert_status_ok();

    let pool: MachinePool = app.server.get("/pool").await.json();
    assert_eq!(
        pool.get("i-1").unwrap().service_state,
        ServiceState::InService
    );
}

#[tokio::test]
async fn attach_and_detach() {
    let app = started(vec![Machine::new("i-1", MachineState::Running)]).await;
    wait_for_size(&app.server, |s| s.desired_size == 1).await;
    app.driver
        .add_detached_machine(Machine::new("i-9", MachineState::Running));

    app.server
        .post("/pool/attach")
        .json(&json!({"machineId": "i-9"}))
        .await
        .assert_status_ok();
    let summary: PoolSizeSummary = app.server.get("/pool/size").await.json();
    assert_eq!(summary.desired_size, 2);

    app.server
        .post("/pool/detach")
        .json(&json!({"machineId": "i-9", "decrementDesiredSize": true}))
        .await
        .assert_status_ok();
    let summary: PoolSizeSummary = app.server.get("/pool/size").await.json();
    assert_eq!(summary.desired_size, 1);

    app.server
        .post("/pool/attach")
        .json(&json!({"machineId": "i-404"}))
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn membership_status() {
    let app = started(vec![Machine::new("i-1", MachineState::Running)]).await;
    wait_for_size(&app.server, |s| s.desired_size == 1).await;

    app.server
        .post("/pool/membershipStatus")
        .json(&json!({
            "machineId": "i-1",
            "membershipStatus": {"active": true, "evictable": false}
        }))
        .await
        .assert_status_ok();

    let pool: MachinePool = app.server.get("/pool").await.json();
    assert!(!pool.get("i-1").unwrap().membership_status.evictable);
}

#[tokio::test]
async fn stop_is_idempotent() {
    let app = started(Vec::new()).await;
    app.server.post("/stop").await.assert_status_ok();
    app.server.post("/stop").await.assert_status_ok();

    let status: CloudPoolStatus = app.server.get("/status").await.json();
    assert!(status.configured);
    assert!(!status.started);
}
