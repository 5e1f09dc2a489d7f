//! ApiService - axum ルーターと HTTP へのマッピング
//!
//! # リクエスト処理の流れ
//! 1. メソッド確認（405）
//! 2. ヘッダーで admission（503 / 415 / 413）
//! 3. body をストリームで読み、上限を超えた時点で 413（読み取りエラーは 400）
//! 4. `Extract` で入力を取り出す（400）
//! 5. dispatch: sync はそのまま返答、async は `created` レコードを返す
//!
//! 組み込みルート: `GET /`（health）と `GET {prefix}/task/:task_id`。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::{Body, Bytes};
use futures::StreamExt;
use axum::extract::{MatchedPath, Path, Query, RawPathParams, Request, State};
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use super::admission::AdmissionRegistry;
use super::builder::{ApiServiceBuilder, HEALTH_PATH};
use super::dispatcher::{DispatchError, DispatchOutcome, Dispatcher};
use super::handler::{InboundRequest, Reply, RouteHandler};
use super::shutdown;
use crate::config::ServiceConfig;
use crate::domain::{
    AdmissionRejection, HandlerError, HttpMethod, StoreError, TaskId, TaskLookup, TaskStatus,
    TurnstileError,
};
use crate::ports::{Clock, TaskStore};

/// Error returned to an HTTP caller.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Rejected(#[from] AdmissionRejection),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::Handler(e) => ApiError::Handler(e),
            DispatchError::Store(e) => ApiError::Store(e),
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Rejected(r) => match r {
                AdmissionRejection::Draining | AdmissionRejection::Busy { .. } => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                AdmissionRejection::UnsupportedMediaType { .. } => {
                    StatusCode::UNSUPPORTED_MEDIA_TYPE
                }
                AdmissionRejection::PayloadTooLarge { .. }
                | AdmissionRejection::BodyOverLimit { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                AdmissionRejection::UnknownRoute(_) => StatusCode::NOT_FOUND,
                AdmissionRejection::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            },
            ApiError::Handler(h) => match h {
                HandlerError::BadRequest(_) => StatusCode::BAD_REQUEST,
                HandlerError::TimedOut(_) => StatusCode::GATEWAY_TIMEOUT,
                HandlerError::Failed(_) | HandlerError::Panicked(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        // handler and store details stay in the logs
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "internal server error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

struct ServiceState {
    registry: Arc<AdmissionRegistry>,
    handlers: HashMap<String, RouteHandler>,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
    max_body_bytes: usize,
}

/// An assembled service: routes, admission registry, dispatcher and store.
pub struct ApiService {
    config: ServiceConfig,
    state: Arc<ServiceState>,
}

impl ApiService {
    pub fn builder(config: ServiceConfig) -> ApiServiceBuilder {
        ApiServiceBuilder::new(config)
    }

    pub(crate) fn new(
        config: ServiceConfig,
        registry: Arc<AdmissionRegistry>,
        handlers: HashMap<String, RouteHandler>,
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let state = ServiceState {
            registry,
            handlers,
            dispatcher: Dispatcher::new(store, config.worker_pool_size),
            clock,
            max_body_bytes: config.max_body_bytes,
        };
        Self {
            config,
            state: Arc::new(state),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AdmissionRegistry> {
        &self.state.registry
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        self.state.dispatcher.store()
    }

    /// Start draining and wait up to `drain_timeout` for in-flight work.
    pub async fn drain(&self) -> bool {
        shutdown::drain(&self.state.registry, self.config.drain_timeout()).await
    }

    pub fn router(&self) -> Router {
        let mut router = Router::new().route(HEALTH_PATH, get(health));
        for path in self.state.handlers.keys() {
            router = router.route(path, any(route_request));
        }
        router
            .route(
                &format!("{}/task/:task_id", self.config.api_prefix),
                get(task_status),
            )
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.state))
    }

    /// Serve until an OS termination signal arrives, then drain.
    pub async fn serve(self, listener: TcpListener) -> Result<(), TurnstileError> {
        let registry = Arc::clone(&self.state.registry);
        let timeout = self.config.drain_timeout();
        self.serve_with_shutdown(listener, shutdown::drain_on_signal(registry, timeout))
            .await
    }

    /// Serve until `shutdown` resolves.
    ///
    /// The listener closes when `shutdown` completes; to reject new work
    /// first, make `shutdown` drain (as [`ApiService::serve`] does).
    pub async fn serve_with_shutdown<F>(
        self,
        listener: TcpListener,
        shutdown: F,
    ) -> Result<(), TurnstileError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!(
            %addr,
            prefix = %self.config.api_prefix,
            routes = self.state.handlers.len(),
            "turnstile listening"
        );

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("server stopped");
        Ok(())
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn route_request(
    State(state): State<Arc<ServiceState>>,
    matched: MatchedPath,
    params: RawPathParams,
    request: Request,
) -> Result<Response, ApiError> {
    let route = matched.as_str();
    let method = http_method(request.method()).ok_or_else(|| AdmissionRejection::MethodNotAllowed {
        method: request.method().to_string(),
        path: route.to_string(),
    })?;
    let (policy, handler) = match (state.registry.policy(route), state.handlers.get(route)) {
        (Some(policy), Some(handler)) => (policy, handler),
        _ => return Err(AdmissionRejection::UnknownRoute(route.to_string()).into()),
    };
    if !policy.allows_method(method) {
        return Err(AdmissionRejection::MethodNotAllowed {
            method: method.to_string(),
            path: route.to_string(),
        }
        .into());
    }

    let (parts, body) = request.into_parts();
    let content_type = header_str(&parts.headers, header::CONTENT_TYPE);
    let declared_length =
        header_str(&parts.headers, header::CONTENT_LENGTH).and_then(|v| v.parse::<u64>().ok());

    let admission = state
        .registry
        .admit(route, content_type.as_deref(), declared_length)?;

    let allowed = policy
        .max_content_length
        .map_or(state.max_body_bytes as u64, |limit| limit.min(state.max_body_bytes as u64));
    let body = read_body(body, allowed).await.inspect_err(|e| {
        tracing::debug!(route, error = %e, "request body rejected while reading");
    })?;
    let observed = body.len() as u64;

    let query = Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
        .map(|Query(q)| q)
        .map_err(|e| HandlerError::BadRequest(e.body_text()))?;
    let inbound = InboundRequest {
        method,
        route: route.to_string(),
        content_type,
        content_length: Some(observed),
        path_params: params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        query,
        body,
    };

    let job = handler.prepare(&inbound)?;
    match state.dispatcher.dispatch(admission, job).await? {
        DispatchOutcome::Reply(reply) => Ok(reply_response(reply)),
        DispatchOutcome::Accepted(record) => Ok(Json(record).into_response()),
    }
}

/// Collect the body, stopping as soon as it grows past `allowed` bytes.
async fn read_body(body: Body, allowed: u64) -> Result<Bytes, ApiError> {
    let mut stream = body.into_data_stream();
    let mut collected = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            HandlerError::BadRequest(format!("unable to read the request body: {e}"))
        })?;
        if (collected.len() + chunk.len()) as u64 > allowed {
            return Err(AdmissionRejection::BodyOverLimit { allowed }.into());
        }
        collected.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(collected))
}

async fn task_status(
    State(state): State<Arc<ServiceState>>,
    Path(raw_id): Path<String>,
) -> Response {
    let Ok(task_id) = raw_id.parse::<TaskId>() else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "TaskId": raw_id,
                "Status": TaskStatus::NOT_FOUND,
                "Timestamp": state.clock.now(),
                "Endpoint": "",
            })),
        )
            .into_response();
    };

    match state.dispatcher.store().get(task_id).await {
        Ok(TaskLookup::Found(record)) => Json(record).into_response(),
        Ok(TaskLookup::NotFound(placeholder)) => {
            (StatusCode::NOT_FOUND, Json(placeholder)).into_response()
        }
        Err(e @ StoreError::Corrupt { .. }) => {
            tracing::error!(task_id = %task_id, error = %e, "task store is corrupt; reporting task as not found");
            let placeholder = TaskLookup::not_found(task_id, state.clock.now()).into_record();
            (StatusCode::NOT_FOUND, Json(placeholder)).into_response()
        }
        Err(e) => {
            tracing::error!(task_id = %task_id, error = %e, "task lookup failed");
            ApiError::Store(e).into_response()
        }
    }
}

fn reply_response(reply: Reply) -> Response {
    match reply {
        Reply::Text(text) => text.into_response(),
        Reply::Json(value) => Json(value).into_response(),
        Reply::Bytes { content_type, body } => {
            ([(header::CONTENT_TYPE, content_type)], body).into_response()
        }
    }
}

fn http_method(method: &Method) -> Option<HttpMethod> {
    match *method {
        Method::GET => Some(HttpMethod::Get),
        Method::POST => Some(HttpMethod::Post),
        Method::PUT => Some(HttpMethod::Put),
        Method::DELETE => Some(HttpMethod::Delete),
        _ => None,
    }
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::dispatcher::TaskContext;
    use crate::app::handler::{AsyncHandler, JsonBody, PathParams, SyncHandler};
    use crate::domain::RoutePolicy;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use rstest::rstest;
    use serde::Deserialize;
    use tower::ServiceExt;

    struct Echo;

    #[async_trait]
    impl SyncHandler for Echo {
        type Input = PathParams;

        async fn call(&self, input: PathParams) -> Result<Reply, HandlerError> {
            Ok(Reply::Text(format!("Echo: {}", input.get("text").unwrap_or_default())))
        }
    }

    #[derive(Deserialize)]
    struct Threshold {
        threshold: f64,
    }

    struct Detect;

    #[async_trait]
    impl AsyncHandler for Detect {
        type Input = JsonBody<Threshold>;

        async fn run(
            &self,
            JsonBody(input): JsonBody<Threshold>,
            _task: TaskContext,
        ) -> Result<TaskStatus, HandlerError> {
            Ok(TaskStatus::new(format!("completed - threshold {}", input.threshold)))
        }
    }

    async fn service() -> ApiService {
        ApiService::builder(ServiceConfig::default())
            .sync_route(
                RoutePolicy::new("/echo/:text", 4).methods(&[HttpMethod::Get]),
                Echo,
            )
            .unwrap()
            .async_route(
                RoutePolicy::new("/detect", 4).content_type("application/json"),
                Detect,
            )
            .unwrap()
            .build()
            .await
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_000_000)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_returns_ok() {
        let app = service().await.router();
        let response = app
            .oneshot(HttpRequest::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 100).await.unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_sync_route_replies_inline() {
        let app = service().await.router();
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/v1/echo/hello")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 100).await.unwrap();
        assert_eq!(&body[..], b"Echo: hello");
    }

    #[tokio::test]
    async fn test_wrong_method_is_405() {
        let app = service().await.router();
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/v1/echo/hello")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert!(body_json(response).await["error"].is_string());
    }

    #[tokio::test]
    async fn test_async_route_returns_created_record() {
        let service = service().await;
        let response = service
            .router()
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/v1/detect")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"threshold": 0.5}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["Endpoint"], "/v1/detect");
        assert!(json["TaskId"].is_string());
    }

    #[tokio::test]
    async fn test_bad_json_is_400_and_creates_no_task() {
        let service = service().await;
        let response = service
            .router()
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/v1/detect")
                    .header("content-type", "application/json")
                    .body(Body::from("{"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(service.registry().current("/v1/detect"), Some(0));
    }

    #[rstest]
    #[case("not-a-ulid")]
    #[case("01ARZ3NDEKTSV4RRFFQ69G5FAV")]
    #[tokio::test]
    async fn test_unknown_task_is_404_placeholder(#[case] id: &str) {
        let app = service().await.router();
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri(format!("/v1/task/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert_eq!(json["Status"], TaskStatus::NOT_FOUND);
        assert_eq!(json["Endpoint"], "");
        assert_eq!(json["TaskId"], id);
    }

    struct Upload;

    #[async_trait]
    impl SyncHandler for Upload {
        type Input = crate::app::handler::RawBody;

        async fn call(&self, input: crate::app::handler::RawBody) -> Result<Reply, HandlerError> {
            Ok(Reply::Text(input.0.len().to_string()))
        }
    }

    struct Exploding;

    impl crate::app::handler::Extract for Exploding {
        fn extract(
            _request: &crate::app::handler::InboundRequest,
        ) -> Result<Self, HandlerError> {
            panic!("extractor blew up")
        }
    }

    struct Unreached;

    #[async_trait]
    impl SyncHandler for Unreached {
        type Input = Exploding;

        async fn call(&self, _input: Exploding) -> Result<Reply, HandlerError> {
            Ok(Reply::Text("unreached".to_string()))
        }
    }

    async fn upload_service() -> ApiService {
        ApiService::builder(ServiceConfig::default())
            .sync_route(RoutePolicy::new("/upload", 2).max_content_length(1000), Upload)
            .unwrap()
            .sync_route(RoutePolicy::new("/explode", 2), Unreached)
            .unwrap()
            .build()
            .await
            .unwrap()
    }

    fn post_body(uri: &str, body: Body) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("POST")
            .uri(uri)
            .body(body)
            .unwrap()
    }

    #[tokio::test]
    async fn streamed_oversized_body_reports_only_the_limit() {
        let service = upload_service().await;
        let chunks: Vec<Result<Bytes, std::io::Error>> =
            (0..5).map(|_| Ok(Bytes::from(vec![b'a'; 1000]))).collect();
        let response = service
            .router()
            .oneshot(post_body("/v1/upload", Body::from_stream(futures::stream::iter(chunks))))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let message = body_json(response).await["error"].as_str().unwrap().to_string();
        assert!(message.contains("1000"));
        assert!(!message.contains("1001"));
        assert!(!message.contains("5000"));
        assert_eq!(service.registry().current("/v1/upload"), Some(0));
    }

    #[tokio::test]
    async fn body_at_the_limit_is_read_in_full() {
        let service = upload_service().await;
        let chunks: Vec<Result<Bytes, std::io::Error>> =
            (0..4).map(|_| Ok(Bytes::from(vec![b'a'; 250]))).collect();
        let response = service
            .router()
            .oneshot(post_body("/v1/upload", Body::from_stream(futures::stream::iter(chunks))))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 100).await.unwrap();
        assert_eq!(&body[..], b"1000");
    }

    #[tokio::test]
    async fn broken_body_stream_is_400() {
        let service = upload_service().await;
        let chunks = vec![
            Ok::<_, std::io::Error>(Bytes::from("ab")),
            Err(std::io::Error::other("client went away")),
        ];
        let response = service
            .router()
            .oneshot(post_body("/v1/upload", Body::from_stream(futures::stream::iter(chunks))))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(
            body_json(response).await["error"]
                .as_str()
                .unwrap()
                .contains("unable to read the request body")
        );
        assert_eq!(service.registry().current("/v1/upload"), Some(0));
    }

    #[tokio::test]
    async fn panicking_extract_is_500_and_releases_the_slot() {
        let service = upload_service().await;
        let response = service
            .router()
            .oneshot(post_body("/v1/explode", Body::empty()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({ "error": "internal server error" })
        );
        assert_eq!(service.registry().current("/v1/explode"), Some(0));
    }

    #[rstest]
    #[case(ApiError::Rejected(AdmissionRejection::Draining), StatusCode::SERVICE_UNAVAILABLE)]
    #[case(
        ApiError::Rejected(AdmissionRejection::BodyOverLimit { allowed: 1 }),
        StatusCode::PAYLOAD_TOO_LARGE
    )]
    #[case(
        ApiError::Rejected(AdmissionRejection::PayloadTooLarge { observed: 2, allowed: 1 }),
        StatusCode::PAYLOAD_TOO_LARGE
    )]
    #[case(ApiError::Handler(HandlerError::failed("boom")), StatusCode::INTERNAL_SERVER_ERROR)]
    #[case(
        ApiError::Handler(HandlerError::TimedOut(std::time::Duration::from_millis(5))),
        StatusCode::GATEWAY_TIMEOUT
    )]
    fn test_error_status_mapping(#[case] error: ApiError, #[case] expected: StatusCode) {
        assert_eq!(error.status(), expected);
    }
}
