//! turnstile-core
//!
//! Request admission and asynchronous task lifecycle for model-serving HTTP
//! APIs.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, policy, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, Clock, IdGenerator）
//! - **impls**: 実装（InMemoryTaskStore, JsonFileTaskStore）
//! - **app**: アプリケーションロジック（admission, dispatcher, service, shutdown）
//! - **config**: サービス設定（TOML + 環境変数）
//! - **observability**: tracing の初期化

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;

pub use app::{
    ApiService, ApiServiceBuilder, AsyncHandler, BuildError, Extract, InboundRequest, JsonBody,
    PathParams, RawBody, Reply, SyncHandler, TaskContext,
};
pub use config::{ServiceConfig, StoreConfig};
pub use domain::{
    AdmissionRejection, HandlerError, HttpMethod, RoutePolicy, StoreError, TaskId, TaskLookup,
    TaskRecord, TaskStatus, TurnstileError,
};
pub use observability::init_tracing;
