//! Handler traits - ルートに登録する型付きハンドラ
//!
//! # 二層構造
//! - **表層（Typed）**: `SyncHandler` / `AsyncHandler`。`Input: Extract` で
//!   リクエストから取り出すフィールドを宣言する
//! - **内部（Dyn）**: `DynSyncHandler` / `DynAsyncHandler`。object-safe な
//!   type erasure で `HashMap<String, RouteHandler>` に格納できる
//!
//! 抽出（`Extract::extract`）はリクエスト処理中に同期的に行われるので、
//! 不正なリクエストは task を作る前に 400 で返る。抽出中の panic は
//! そのリクエストだけの `Panicked`（500）になる。

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;

use super::dispatcher::{Job, TaskContext, panic_message};
use crate::domain::{HandlerError, HttpMethod, TaskStatus};

/// Everything the core knows about one inbound request.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: HttpMethod,
    /// Registered route template, e.g. `/v1/echo/:text`.
    pub route: String,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub path_params: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub body: Bytes,
}

impl InboundRequest {
    pub fn new(method: HttpMethod, route: impl Into<String>) -> Self {
        Self {
            method,
            route: route.into(),
            content_type: None,
            content_length: None,
            path_params: HashMap::new(),
            query: HashMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        self.content_type = Some(content_type.to_string());
        self.content_length = Some(body.len() as u64);
        self.body = body;
        self
    }

    pub fn with_path_param(mut self, name: &str, value: &str) -> Self {
        self.path_params.insert(name.to_string(), value.to_string());
        self
    }
}

/// Request preprocessing: turn an [`InboundRequest`] into a handler's input.
///
/// Implement this on your own type to declare exactly which fields a route
/// extracts. Failures become `400 Bad Request`.
pub trait Extract: Sized + Send + 'static {
    fn extract(request: &InboundRequest) -> Result<Self, HandlerError>;
}

impl Extract for () {
    fn extract(_request: &InboundRequest) -> Result<Self, HandlerError> {
        Ok(())
    }
}

impl Extract for InboundRequest {
    fn extract(request: &InboundRequest) -> Result<Self, HandlerError> {
        Ok(request.clone())
    }
}

/// The raw request body.
#[derive(Debug, Clone)]
pub struct RawBody(pub Bytes);

impl Extract for RawBody {
    fn extract(request: &InboundRequest) -> Result<Self, HandlerError> {
        Ok(RawBody(request.body.clone()))
    }
}

/// The request body decoded as JSON.
#[derive(Debug, Clone)]
pub struct JsonBody<T>(pub T);

impl<T: DeserializeOwned + Send + 'static> Extract for JsonBody<T> {
    fn extract(request: &InboundRequest) -> Result<Self, HandlerError> {
        if request.body.is_empty() {
            return Err(HandlerError::BadRequest("a JSON body is required".to_string()));
        }
        serde_json::from_slice(&request.body)
            .map(JsonBody)
            .map_err(|e| HandlerError::BadRequest(format!("unable to parse the request body: {e}")))
    }
}

/// Path parameters captured by the route template.
#[derive(Debug, Clone, Default)]
pub struct PathParams(pub HashMap<String, String>);

impl PathParams {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

impl Extract for PathParams {
    fn extract(request: &InboundRequest) -> Result<Self, HandlerError> {
        Ok(PathParams(request.path_params.clone()))
    }
}

/// Body of a synchronous response.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Text(String),
    Json(serde_json::Value),
    Bytes { content_type: String, body: Bytes },
}

/// Handler that runs inline and answers the caller directly.
#[async_trait]
pub trait SyncHandler: Send + Sync + 'static {
    type Input: Extract;

    async fn call(&self, input: Self::Input) -> Result<Reply, HandlerError>;
}

/// Handler that runs on a detached worker after the caller got its task id.
///
/// `Ok(status)` becomes the terminal status (usually starting with
/// `completed`); `Err` becomes `failed - <cause>`. Intermediate progress is
/// published through [`TaskContext::update_status`].
#[async_trait]
pub trait AsyncHandler: Send + Sync + 'static {
    type Input: Extract;

    async fn run(&self, input: Self::Input, task: TaskContext) -> Result<TaskStatus, HandlerError>;
}

pub type SyncJob = BoxFuture<'static, Result<Reply, HandlerError>>;
pub type AsyncJob =
    Box<dyn FnOnce(TaskContext) -> BoxFuture<'static, Result<TaskStatus, HandlerError>> + Send>;

/// Object-safe view of a [`SyncHandler`].
pub trait DynSyncHandler: Send + Sync {
    /// Extract the input and return the ready-to-run handler future.
    fn prepare(&self, request: &InboundRequest) -> Result<SyncJob, HandlerError>;
}

/// Object-safe view of an [`AsyncHandler`].
pub trait DynAsyncHandler: Send + Sync {
    fn prepare(&self, request: &InboundRequest) -> Result<AsyncJob, HandlerError>;
}

struct TypedSyncHandler<H> {
    handler: Arc<H>,
}

impl<H: SyncHandler> DynSyncHandler for TypedSyncHandler<H> {
    fn prepare(&self, request: &InboundRequest) -> Result<SyncJob, HandlerError> {
        let input = H::Input::extract(request)?;
        let handler = Arc::clone(&self.handler);
        Ok(Box::pin(async move { handler.call(input).await }))
    }
}

struct TypedAsyncHandler<H> {
    handler: Arc<H>,
}

impl<H: AsyncHandler> DynAsyncHandler for TypedAsyncHandler<H> {
    fn prepare(&self, request: &InboundRequest) -> Result<AsyncJob, HandlerError> {
        let input = H::Input::extract(request)?;
        let handler = Arc::clone(&self.handler);
        Ok(Box::new(move |task: TaskContext| -> BoxFuture<'static, _> {
            Box::pin(async move { handler.run(input, task).await })
        }))
    }
}

/// A registered handler, sync or async.
#[derive(Clone)]
pub enum RouteHandler {
    Sync(Arc<dyn DynSyncHandler>),
    Async(Arc<dyn DynAsyncHandler>),
}

impl RouteHandler {
    pub fn sync<H: SyncHandler>(handler: H) -> Self {
        RouteHandler::Sync(Arc::new(TypedSyncHandler {
            handler: Arc::new(handler),
        }))
    }

    pub fn asynchronous<H: AsyncHandler>(handler: H) -> Self {
        RouteHandler::Async(Arc::new(TypedAsyncHandler {
            handler: Arc::new(handler),
        }))
    }

    pub fn is_async(&self) -> bool {
        matches!(self, RouteHandler::Async(_))
    }

    /// Extract the input and produce the job the dispatcher will run.
    pub fn prepare(&self, request: &InboundRequest) -> Result<Job, HandlerError> {
        let prepared = std::panic::catch_unwind(AssertUnwindSafe(|| match self {
            RouteHandler::Sync(h) => h.prepare(request).map(Job::Sync),
            RouteHandler::Async(h) => h.prepare(request).map(Job::Async),
        }));
        prepared.unwrap_or_else(|payload| {
            let message = panic_message(payload.as_ref());
            tracing::error!(route = %request.route, panic = %message, "input extraction panicked");
            Err(HandlerError::Panicked(message))
        })
    }
}
