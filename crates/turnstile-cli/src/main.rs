//! turnstile demo server
//!
//! ```text
//! turnstile-cli [config.toml]
//! ```
//!
//! - `POST {prefix}/` 非同期: 指定秒数スリープして status を更新
//! - `GET {prefix}/echo/:text` 同期: そのまま返す
//! - `GET {prefix}/task/:task_id` task の照会

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::net::TcpListener;
use turnstile_core::{
    ApiService, AsyncHandler, HandlerError, HttpMethod, JsonBody, PathParams, Reply, RoutePolicy,
    ServiceConfig, SyncHandler, TaskContext, TaskStatus, TurnstileError,
};

#[derive(Debug, Deserialize)]
struct SleepRequest {
    #[serde(default = "default_seconds")]
    seconds: u64,
    message: String,
}

fn default_seconds() -> u64 {
    5
}

/// 非同期ルートのデモ: 受付直後に task id を返し、裏で sleep する
struct SleepHandler;

#[async_trait]
impl AsyncHandler for SleepHandler {
    type Input = JsonBody<SleepRequest>;

    async fn run(
        &self,
        JsonBody(req): JsonBody<SleepRequest>,
        task: TaskContext,
    ) -> Result<TaskStatus, HandlerError> {
        if req.message.is_empty() {
            return Err(HandlerError::failed("message is required"));
        }
        task.update_status(TaskStatus::RUNNING)
            .await
            .map_err(|e| HandlerError::failed(e.to_string()))?;

        tokio::time::sleep(Duration::from_secs(req.seconds)).await;
        tracing::info!(task_id = %task.task_id(), message = %req.message, "sleep finished");

        Ok(TaskStatus::new(format!("completed - {}", req.message)))
    }
}

struct EchoHandler;

#[async_trait]
impl SyncHandler for EchoHandler {
    type Input = PathParams;

    async fn call(&self, params: PathParams) -> Result<Reply, HandlerError> {
        let text = params.get("text").unwrap_or_default();
        Ok(Reply::Json(serde_json::json!({ "echo": text })))
    }
}

#[tokio::main]
async fn main() -> Result<(), TurnstileError> {
    if let Err(e) = turnstile_core::init_tracing() {
        eprintln!("tracing already initialised: {e}");
    }

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = ServiceConfig::resolve(config_path.as_deref())?;
    tracing::info!(?config, "configuration loaded");

    let listener = TcpListener::bind(&config.bind_addr).await?;
    let service = ApiService::builder(config)
        .async_route(
            RoutePolicy::new("/", 4)
                .content_type("application/json")
                .max_content_length(64 * 1024)
                .trace_name("sleep")
                .timeout(Duration::from_secs(600)),
            SleepHandler,
        )?
        .sync_route(
            RoutePolicy::new("/echo/:text", 32)
                .methods(&[HttpMethod::Get])
                .trace_name("echo"),
            EchoHandler,
        )?
        .build()
        .await?;

    service.serve(listener).await
}
