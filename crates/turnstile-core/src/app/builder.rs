//! ApiServiceBuilder - ルート登録とワイヤリング
//!
//! # 起動時検証（Fail-fast）
//! - 同じパスの二重登録は `DuplicateRoute`
//! - 上限 0 やメソッドなしのポリシーは `InvalidPolicy`
//! - health (`/`) や task 照会ルートと衝突するパスは `ReservedPath`
//!
//! どれも `build()` を待たず、登録した時点でエラーになる。

use std::collections::HashMap;
use std::sync::Arc;

use super::admission::AdmissionRegistry;
use super::handler::{AsyncHandler, RouteHandler, SyncHandler};
use super::service::ApiService;
use crate::config::{ServiceConfig, StoreConfig};
use crate::domain::{RoutePolicy, StoreError};
use crate::impls::{InMemoryTaskStore, JsonFileTaskStore};
use crate::ports::{Clock, SystemClock, TaskStore};

/// BuildError はサービス構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("route {0} is already registered")]
    DuplicateRoute(String),

    #[error("invalid policy for {path}: {reason}")]
    InvalidPolicy { path: String, reason: String },

    #[error("route {0} collides with a built-in route")]
    ReservedPath(String),

    #[error("could not open task store: {0}")]
    Store(#[from] StoreError),
}

/// Builds an [`ApiService`].
///
/// # 使用例
/// ```ignore
/// let service = ApiServiceBuilder::new(config)
///     .async_route(RoutePolicy::new("/detect", 4).content_type("image/png"), Detect)?
///     .sync_route(RoutePolicy::new("/echo/:text", 8).methods(&[HttpMethod::Get]), Echo)?
///     .build()
///     .await?;
/// ```
///
/// Route paths are relative to `config.api_prefix`.
pub struct ApiServiceBuilder {
    config: ServiceConfig,
    store: Option<Arc<dyn TaskStore>>,
    clock: Arc<dyn Clock>,
    registry: AdmissionRegistry,
    handlers: HashMap<String, RouteHandler>,
}

impl ApiServiceBuilder {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            store: None,
            clock: Arc::new(SystemClock),
            registry: AdmissionRegistry::new(),
            handlers: HashMap::new(),
        }
    }

    /// Use this store instead of the one described by `config.store`.
    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Clock used for not-found placeholders.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn sync_route<H: SyncHandler>(
        self,
        policy: RoutePolicy,
        handler: H,
    ) -> Result<Self, BuildError> {
        self.route(policy, RouteHandler::sync(handler))
    }

    pub fn async_route<H: AsyncHandler>(
        self,
        policy: RoutePolicy,
        handler: H,
    ) -> Result<Self, BuildError> {
        self.route(policy, RouteHandler::asynchronous(handler))
    }

    /// Register an already type-erased handler.
    pub fn route(mut self, mut policy: RoutePolicy, handler: RouteHandler) -> Result<Self, BuildError> {
        if !policy.path.starts_with('/') {
            return Err(BuildError::InvalidPolicy {
                path: policy.path,
                reason: "path must start with '/'".to_string(),
            });
        }

        let full_path = join_prefix(&self.config.api_prefix, &policy.path);
        if full_path == HEALTH_PATH || full_path.starts_with(&task_prefix(&self.config.api_prefix)) {
            return Err(BuildError::ReservedPath(full_path));
        }
        policy.path = full_path;

        let policy = self.registry.register(policy)?;
        tracing::debug!(
            route = %policy.path,
            limit = policy.max_concurrent_requests,
            asynchronous = handler.is_async(),
            "registered route"
        );
        self.handlers.insert(policy.path.clone(), handler);
        Ok(self)
    }

    /// Open the task store (unless one was supplied) and assemble the service.
    pub async fn build(self) -> Result<ApiService, BuildError> {
        let store: Arc<dyn TaskStore> = match self.store {
            Some(store) => store,
            None => match &self.config.store {
                StoreConfig::Memory => Arc::new(InMemoryTaskStore::new()),
                StoreConfig::File { path } => Arc::new(JsonFileTaskStore::open(path.clone()).await?),
            },
        };

        Ok(ApiService::new(
            self.config,
            Arc::new(self.registry),
            self.handlers,
            store,
            self.clock,
        ))
    }
}

pub(crate) const HEALTH_PATH: &str = "/";

/// `{prefix}/task/` - everything below it belongs to the task query route.
pub(crate) fn task_prefix(api_prefix: &str) -> String {
    format!("{api_prefix}/task/")
}

/// `"/v1"` + `"/"` is `"/v1"`; `"/v1"` + `"/detect"` is `"/v1/detect"`.
pub(crate) fn join_prefix(prefix: &str, path: &str) -> String {
    if path == "/" && !prefix.is_empty() {
        prefix.to_string()
    } else {
        format!("{prefix}{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::handler::{PathParams, Reply};
    use crate::app::dispatcher::TaskContext;
    use crate::domain::{HandlerError, HttpMethod, TaskStatus};
    use async_trait::async_trait;
    use rstest::rstest;

    struct Echo;

    #[async_trait]
    impl SyncHandler for Echo {
        type Input = PathParams;

        async fn call(&self, input: PathParams) -> Result<Reply, HandlerError> {
            Ok(Reply::Text(input.get("text").unwrap_or_default().to_string()))
        }
    }

    struct Detect;

    #[async_trait]
    impl AsyncHandler for Detect {
        type Input = ();

        async fn run(&self, _input: (), _task: TaskContext) -> Result<TaskStatus, HandlerError> {
            Ok(TaskStatus::completed())
        }
    }

    #[rstest]
    #[case("/v1", "/", "/v1")]
    #[case("/v1", "/detect", "/v1/detect")]
    #[case("", "/detect", "/detect")]
    #[case("", "/", "/")]
    fn prefix_joining(#[case] prefix: &str, #[case] path: &str, #[case] expected: &str) {
        assert_eq!(join_prefix(prefix, path), expected);
    }

    #[tokio::test]
    async fn test_build_success() {
        let service = ApiServiceBuilder::new(ServiceConfig::default())
            .async_route(RoutePolicy::new("/", 2), Detect)
            .unwrap()
            .sync_route(
                RoutePolicy::new("/echo/:text", 2).methods(&[HttpMethod::Get]),
                Echo,
            )
            .unwrap()
            .build()
            .await
            .unwrap();

        let mut paths: Vec<_> = service.registry().paths().collect();
        paths.sort();
        assert_eq!(paths, vec!["/v1", "/v1/echo/:text"]);
    }

    #[test]
    fn test_duplicate_route() {
        let result = ApiServiceBuilder::new(ServiceConfig::default())
            .async_route(RoutePolicy::new("/detect", 2), Detect)
            .unwrap()
            .async_route(RoutePolicy::new("/detect", 2), Detect);
        assert!(matches!(result, Err(BuildError::DuplicateRoute(p)) if p == "/v1/detect"));
    }

    #[rstest]
    #[case("/v1", "/task/:id")]
    #[case("", "/")]
    fn test_reserved_paths(#[case] prefix: &str, #[case] path: &str) {
        let config = ServiceConfig {
            api_prefix: prefix.to_string(),
            ..ServiceConfig::default()
        };
        let result = ApiServiceBuilder::new(config).async_route(RoutePolicy::new(path, 1), Detect);
        assert!(matches!(result, Err(BuildError::ReservedPath(_))));
    }

    #[test]
    fn test_relative_path_is_invalid() {
        let result = ApiServiceBuilder::new(ServiceConfig::default())
            .async_route(RoutePolicy::new("detect", 1), Detect);
        assert!(matches!(result, Err(BuildError::InvalidPolicy { .. })));
    }

    #[tokio::test]
    async fn test_file_store_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServiceConfig {
            store: StoreConfig::File {
                path: dir.path().join("nested").join("task_status.json"),
            },
            ..ServiceConfig::default()
        };
        let service = ApiServiceBuilder::new(config).build().await.unwrap();

        let record = service.store().create("/v1").await.unwrap();
        assert!(service.store().get(record.task_id).await.unwrap().is_found());
        assert!(dir.path().join("nested").join("task_status.json").exists());
    }
}
