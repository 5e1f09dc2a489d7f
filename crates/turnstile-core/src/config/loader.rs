//! Configuration file loading and environment overrides.
//!
//! ## Responsibility
//! Read a TOML file into a [`ServiceConfig`], validate it, and apply the
//! deployment environment variables on top.
//!
//! ## Guarantees
//! - I/O, parse and validation errors are distinguished in the error type
//! - File path is included in every error message
//! - Unset environment variables leave the config untouched

use std::path::{Path, PathBuf};

use super::validation::{self, ConfigError};
use super::{ServiceConfig, StoreConfig};

pub const ENV_BIND_ADDR: &str = "TURNSTILE_BIND_ADDR";
pub const ENV_API_PREFIX: &str = "API_PREFIX";
pub const ENV_WORKERS: &str = "TURNSTILE_WORKERS";
/// Setting this selects the file store at the given path.
pub const ENV_TASK_STORE_PATH: &str = "TASK_STORE_PATH";

/// Load a [`ServiceConfig`] from a TOML file.
///
/// # Returns
///
/// - `Err(ConfigError::Io)` if the file cannot be read.
/// - `Err(ConfigError::Parse)` if the TOML is malformed.
/// - `Err(ConfigError::Validation)` if semantic constraints are violated.
pub fn load_from_file(path: &Path) -> Result<ServiceConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        file: path.display().to_string(),
        source: e,
    })?;

    load_from_str(&content, &path.display().to_string())
}

/// Load a [`ServiceConfig`] from a TOML string.
///
/// `source_name` identifies the source in error messages.
pub fn load_from_str(content: &str, source_name: &str) -> Result<ServiceConfig, ConfigError> {
    let config: ServiceConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
        file: source_name.to_string(),
        source: e,
    })?;

    validation::validate(&config).map_err(ConfigError::from_all)?;

    Ok(config)
}

/// Apply overrides from the process environment.
pub fn apply_env_overrides(config: ServiceConfig) -> Result<ServiceConfig, ConfigError> {
    apply_overrides_from(config, |key| std::env::var(key).ok())
}

/// Apply overrides from an arbitrary lookup (the environment in production).
///
/// Empty values count as unset.
pub fn apply_overrides_from(
    mut config: ServiceConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<ServiceConfig, ConfigError> {
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(addr) = get(ENV_BIND_ADDR) {
        config.bind_addr = addr;
    }
    if let Some(prefix) = get(ENV_API_PREFIX) {
        config.api_prefix = prefix;
    }
    if let Some(workers) = get(ENV_WORKERS) {
        config.worker_pool_size = workers.trim().parse().map_err(|_| ConfigError::Env {
            var: ENV_WORKERS.to_string(),
            value: workers.clone(),
            reason: "expected a positive integer".to_string(),
        })?;
    }
    if let Some(path) = get(ENV_TASK_STORE_PATH) {
        config.store = StoreConfig::File {
            path: PathBuf::from(path),
        };
    }

    Ok(config)
}
