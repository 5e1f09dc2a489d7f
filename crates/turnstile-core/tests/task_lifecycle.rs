mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use common::{Gate, GatedAsync, get, post, send_json, wait_terminal};
use turnstile_core::{
    ApiService, AsyncHandler, HandlerError, RawBody, RoutePolicy, ServiceConfig, StoreConfig,
    TaskContext, TaskStatus,
};

async fn gated_service(gate: Gate) -> ApiService {
    ApiService::builder(ServiceConfig::default())
        .async_route(RoutePolicy::new("/detect", 4), GatedAsync(gate))
        .unwrap()
        .build()
        .await
        .unwrap()
}

#[tokio::test]
async fn task_is_created_immediately_then_reaches_terminal() {
    let gate = Gate::closed();
    let service = gated_service(gate.clone()).await;
    let router = service.router();

    let (status, accepted) = send_json(&router, post("/v1/detect", "image/png", "png")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(accepted["Status"], "created");
    assert_eq!(accepted["Endpoint"], "/v1/detect");
    let task_id = accepted["TaskId"].as_str().unwrap().to_string();

    // handler is parked on the gate: the record exists and is not terminal
    let (status, polled) = send_json(&router, get(&format!("/v1/task/{task_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    let s = polled["Status"].as_str().unwrap();
    assert!(s == "created" || s == "running", "unexpected status {s}");
    assert_eq!(service.registry().current("/v1/detect"), Some(1));

    gate.open();
    let done = wait_terminal(&router, &task_id).await;
    assert_eq!(done["Status"], "completed");
    assert_eq!(done["TaskId"], task_id.as_str());

    tokio::time::timeout(Duration::from_secs(1), service.registry().wait_idle())
        .await
        .unwrap();
}

#[tokio::test]
async fn repeated_gets_are_identical() {
    let gate = Gate::closed();
    gate.open();
    let service = gated_service(gate).await;
    let router = service.router();

    let (_, accepted) = send_json(&router, post("/v1/detect", "image/png", "png")).await;
    let task_id = accepted["TaskId"].as_str().unwrap();
    let done = wait_terminal(&router, task_id).await;

    let (_, first) = send_json(&router, get(&format!("/v1/task/{task_id}"))).await;
    let (_, second) = send_json(&router, get(&format!("/v1/task/{task_id}"))).await;
    assert_eq!(first, done);
    assert_eq!(first, second);
}

struct Sleepy(Duration);

#[async_trait]
impl AsyncHandler for Sleepy {
    type Input = ();

    async fn run(&self, _input: (), task: TaskContext) -> Result<TaskStatus, HandlerError> {
        tokio::time::sleep(self.0).await;
        task.update_status("running late")
            .await
            .map_err(|e| HandlerError::failed(e.to_string()))?;
        Ok(TaskStatus::completed())
    }
}

#[tokio::test]
async fn timed_out_task_is_failed_and_late_updates_are_ignored() {
    let service = ApiService::builder(ServiceConfig::default())
        .async_route(
            RoutePolicy::new("/slow", 2).timeout(Duration::from_millis(30)),
            Sleepy(Duration::from_millis(120)),
        )
        .unwrap()
        .build()
        .await
        .unwrap();
    let router = service.router();

    let (_, accepted) = send_json(&router, post("/v1/slow", "application/json", "{}")).await;
    let task_id = accepted["TaskId"].as_str().unwrap();

    let done = wait_terminal(&router, task_id).await;
    assert_eq!(done["Status"], "failed - timed out after 30 ms");

    // the abandoned handler keeps its slot until it really finishes
    tokio::time::timeout(Duration::from_secs(1), service.registry().wait_idle())
        .await
        .unwrap();
    let (_, after) = send_json(&router, get(&format!("/v1/task/{task_id}"))).await;
    assert_eq!(after["Status"], done["Status"]);
}

struct Panicky;

#[async_trait]
impl AsyncHandler for Panicky {
    type Input = RawBody;

    async fn run(&self, body: RawBody, _task: TaskContext) -> Result<TaskStatus, HandlerError> {
        if body.0.is_empty() {
            panic!("Body is required");
        }
        Ok(TaskStatus::completed())
    }
}

#[tokio::test]
async fn panicking_handler_marks_task_failed() {
    let service = ApiService::builder(ServiceConfig::default())
        .async_route(RoutePolicy::new("/panic", 2), Panicky)
        .unwrap()
        .build()
        .await
        .unwrap();
    let router = service.router();

    let (status, accepted) = send_json(&router, post("/v1/panic", "application/json", "")).await;
    assert_eq!(status, StatusCode::OK);
    let task_id = accepted["TaskId"].as_str().unwrap();

    let done = wait_terminal(&router, task_id).await;
    let s = done["Status"].as_str().unwrap();
    assert!(s.starts_with("failed - "), "unexpected status {s}");
    assert!(s.contains("Body is required"));
    tokio::time::timeout(Duration::from_secs(1), service.registry().wait_idle())
        .await
        .unwrap();
}

async fn file_service(path: &std::path::Path, gate: Gate) -> ApiService {
    let config = ServiceConfig {
        store: StoreConfig::File {
            path: path.to_path_buf(),
        },
        ..ServiceConfig::default()
    };
    ApiService::builder(config)
        .async_route(RoutePolicy::new("/detect", 4), GatedAsync(gate))
        .unwrap()
        .build()
        .await
        .unwrap()
}

#[tokio::test]
async fn file_store_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("task_status.json");
    let gate = Gate::closed();
    gate.open();

    let task_id = {
        let service = file_service(&path, gate.clone()).await;
        let router = service.router();
        let (_, accepted) = send_json(&router, post("/v1/detect", "image/png", "png")).await;
        let task_id = accepted["TaskId"].as_str().unwrap().to_string();
        wait_terminal(&router, &task_id).await;
        task_id
    };

    let restarted = file_service(&path, gate).await;
    let (status, json) =
        send_json(&restarted.router(), get(&format!("/v1/task/{task_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["Status"], "completed");
}

#[tokio::test]
async fn corrupt_store_reports_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("task_status.json");
    let service = file_service(&path, Gate::closed()).await;
    std::fs::write(&path, b"[{\"TaskId\": ").unwrap();

    let (status, json) = send_json(
        &service.router(),
        get("/v1/task/01ARZ3NDEKTSV4RRFFQ69G5FAV"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["Status"], TaskStatus::NOT_FOUND);
    assert_eq!(json["Endpoint"], "");
}

#[tokio::test]
async fn unknown_task_id_never_errors() {
    let service = gated_service(Gate::closed()).await;
    let router = service.router();

    for id in ["01ARZ3NDEKTSV4RRFFQ69G5FAV", "garbage", "0"] {
        let (status, json) = send_json(&router, get(&format!("/v1/task/{id}"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["Status"], TaskStatus::NOT_FOUND);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shared_store_sees_tasks_from_both_services() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("task_status.json");
    let gate = Gate::closed();
    gate.open();

    let a = Arc::new(file_service(&path, gate.clone()).await);
    let b = Arc::new(file_service(&path, gate).await);
    let (_, from_a) = send_json(&a.router(), post("/v1/detect", "image/png", "a")).await;
    let (_, from_b) = send_json(&b.router(), post("/v1/detect", "image/png", "b")).await;

    for id in [&from_a["TaskId"], &from_b["TaskId"]] {
        let id = id.as_str().unwrap();
        wait_terminal(&a.router(), id).await;
        wait_terminal(&b.router(), id).await;
    }
}
