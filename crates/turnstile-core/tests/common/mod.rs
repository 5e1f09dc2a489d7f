#![allow(dead_code)]

use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use tokio::sync::watch;
use tower::ServiceExt;
use turnstile_core::{
    AsyncHandler, HandlerError, RawBody, Reply, SyncHandler, TaskContext, TaskStatus,
};

/// Handlers wait until the gate opens.
#[derive(Clone)]
pub struct Gate {
    tx: std::sync::Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Gate {
    pub fn closed() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    pub async fn wait(&self) -> Result<(), HandlerError> {
        let mut rx = self.rx.clone();
        rx.wait_for(|open| *open)
            .await
            .map(|_| ())
            .map_err(|_| HandlerError::failed("gate dropped"))
    }
}

/// Sync handler answering `done` once the gate opens.
pub struct GatedSync(pub Gate);

#[async_trait]
impl SyncHandler for GatedSync {
    type Input = ();

    async fn call(&self, _input: ()) -> Result<Reply, HandlerError> {
        self.0.wait().await?;
        Ok(Reply::Text("done".to_string()))
    }
}

/// Async handler: `running`, wait for the gate, then `completed`.
pub struct GatedAsync(pub Gate);

#[async_trait]
impl AsyncHandler for GatedAsync {
    type Input = RawBody;

    async fn run(&self, _body: RawBody, task: TaskContext) -> Result<TaskStatus, HandlerError> {
        task.update_status(TaskStatus::RUNNING)
            .await
            .map_err(|e| HandlerError::failed(e.to_string()))?;
        self.0.wait().await?;
        Ok(TaskStatus::completed())
    }
}

pub async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), 10_000_000)
        .await
        .unwrap();
    (status, body.to_vec())
}

pub async fn send_json(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let (status, body) = send(router, request).await;
    (status, serde_json::from_slice(&body).unwrap())
}

pub fn post(uri: &str, content_type: &str, body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", content_type)
        .body(body.into())
        .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

/// Poll the task route until the status is terminal.
pub async fn wait_terminal(router: &Router, task_id: &str) -> serde_json::Value {
    for _ in 0..400 {
        let (status, json) = send_json(router, get(&format!("/v1/task/{task_id}"))).await;
        assert_eq!(status, StatusCode::OK);
        let s = json["Status"].as_str().unwrap().to_ascii_lowercase();
        if s.starts_with("completed") || s.starts_with("failed") {
            return json;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("task {task_id} never finished");
}
