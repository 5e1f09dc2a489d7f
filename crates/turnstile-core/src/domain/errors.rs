//! Errors - エラー型と分類
//!
//! - `AdmissionRejection`: ハンドラ実行前の拒否（呼び出し元にそのまま返す）
//! - `HandlerError`: ハンドラの失敗（sync は 500、async は failed レコード）
//! - `StoreError`: TaskStore の失敗（Corrupt はその lookup だけを失敗させる）

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use super::TaskId;

/// Why a request was turned away before its handler ran.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionRejection {
    #[error("service is draining and not accepting new requests")]
    Draining,

    #[error("too many concurrent requests on {path} (limit {limit}); retry later")]
    Busy { path: String, limit: usize },

    #[error("unsupported media type {declared:?}; accepted: {}", accepted.join(", "))]
    UnsupportedMediaType {
        declared: Option<String>,
        accepted: Vec<String>,
    },

    #[error("payload of {observed} bytes exceeds the limit of {allowed} bytes")]
    PayloadTooLarge { observed: u64, allowed: u64 },

    /// The body ran past the limit while streaming; its full size is unknown.
    #[error("payload is larger than the limit of {allowed} bytes")]
    BodyOverLimit { allowed: u64 },

    #[error("no route registered for {0}")]
    UnknownRoute(String),

    #[error("method {method} not allowed on {path}")]
    MethodNotAllowed { method: String, path: String },
}

impl AdmissionRejection {
    /// Draining and over-capacity share the same busy/unavailable signal.
    pub fn is_service_busy(&self) -> bool {
        matches!(
            self,
            AdmissionRejection::Draining | AdmissionRejection::Busy { .. }
        )
    }
}

/// Failure raised by (or around) a route handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Request could not be turned into the handler's declared input.
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("{0}")]
    Failed(String),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("timed out after {} ms", .0.as_millis())]
    TimedOut(Duration),
}

impl HandlerError {
    pub fn failed(cause: impl Into<String>) -> Self {
        HandlerError::Failed(cause.into())
    }
}

/// Task store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task store document {path} is unreadable: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("timed out waiting for task store lock {path}")]
    LockTimeout { path: PathBuf },

    #[error("task store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task store serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Umbrella error for service bootstrap and serving.
#[derive(Debug, Error)]
pub enum TurnstileError {
    #[error(transparent)]
    Admission(#[from] AdmissionRejection),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Build(#[from] crate::app::BuildError),

    #[error("server io error: {0}")]
    Io(#[from] std::io::Error),
}
