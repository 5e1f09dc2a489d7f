//! Config - サービス設定
//!
//! ## Responsibility
//! Define the service configuration schema, load it from TOML and layer
//! environment overrides on top.
//!
//! ## Guarantees
//! - `ServiceConfig::default()` is a runnable in-memory configuration
//! - A config returned by [`ServiceConfig::resolve`] has been validated
//!   after overrides were applied
//!
//! ## NOT Responsible For
//! - Per-route policies (those are registered in code through
//!   [`crate::app::ApiServiceBuilder`])

pub mod loader;
pub mod validation;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use self::loader::{apply_env_overrides, apply_overrides_from, load_from_file, load_from_str};
pub use self::validation::{ConfigError, validate};

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_api_prefix() -> String {
    "/v1".to_string()
}

fn default_worker_pool_size() -> usize {
    16
}

/// Default drain timeout: 30 seconds.
fn default_drain_timeout_ms() -> u64 {
    30_000
}

/// Default body read limit: 64 MiB.
fn default_max_body_bytes() -> usize {
    64 * 1024 * 1024
}

/// Root configuration of a turnstile server.
///
/// ```toml
/// bind_addr = "127.0.0.1:8080"
/// api_prefix = "/v1"
/// worker_pool_size = 8
///
/// [store]
/// kind = "file"
/// path = "/var/lib/turnstile/task_status.json"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Prefix prepended to every registered route path.
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,

    /// Maximum number of async handlers running at once.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// How long shutdown waits for in-flight work after draining starts.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    /// Hard cap on bytes read from any request body.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            api_prefix: default_api_prefix(),
            worker_pool_size: default_worker_pool_size(),
            drain_timeout_ms: default_drain_timeout_ms(),
            max_body_bytes: default_max_body_bytes(),
            store: StoreConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Load `path` if given (defaults otherwise), apply environment
    /// overrides and validate the result.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => load_from_file(path)?,
            None => Self::default(),
        };
        let config = apply_env_overrides(config)?;
        validation::validate(&config).map_err(ConfigError::from_all)?;
        Ok(config)
    }
}

/// Where task records live.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Process-local; records are lost on restart.
    #[default]
    Memory,
    /// One JSON document shared by every process pointing at `path`.
    File { path: PathBuf },
}
