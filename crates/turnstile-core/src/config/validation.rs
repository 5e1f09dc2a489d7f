//! Configuration validation.
//!
//! Validation collects *all* errors before returning.

use super::{ServiceConfig, StoreConfig};

/// Errors arising from configuration parsing, validation, or I/O.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Parse error in {file}: {source}")]
    Parse {
        file: String,
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Field '{field}' has invalid value {value:?}: {reason}")]
    InvalidField {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Environment variable {var}={value:?} is invalid: {reason}")]
    Env {
        var: String,
        value: String,
        reason: String,
    },

    #[error("IO error reading {file}: {source}")]
    Io {
        file: String,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    /// Fold every violation into one `Validation` error.
    pub fn from_all(errors: Vec<ConfigError>) -> Self {
        ConfigError::Validation(
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }
}

/// Validate all semantic constraints on a [`ServiceConfig`].
pub fn validate(config: &ServiceConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    if config.bind_addr.parse::<std::net::SocketAddr>().is_err() {
        errors.push(ConfigError::InvalidField {
            field: "bind_addr".into(),
            value: config.bind_addr.clone(),
            reason: "must be a socket address such as 0.0.0.0:8080".into(),
        });
    }

    let prefix = config.api_prefix.as_str();
    if !prefix.is_empty() && (!prefix.starts_with('/') || prefix.ends_with('/')) {
        errors.push(ConfigError::InvalidField {
            field: "api_prefix".into(),
            value: prefix.to_string(),
            reason: "must be empty or start with '/' and not end with '/'".into(),
        });
    }

    if config.worker_pool_size == 0 {
        errors.push(ConfigError::InvalidField {
            field: "worker_pool_size".into(),
            value: "0".into(),
            reason: "must be at least 1".into(),
        });
    }

    if config.max_body_bytes == 0 {
        errors.push(ConfigError::InvalidField {
            field: "max_body_bytes".into(),
            value: "0".into(),
            reason: "must be at least 1".into(),
        });
    }

    if let StoreConfig::File { path } = &config.store
        && path.as_os_str().is_empty()
    {
        errors.push(ConfigError::InvalidField {
            field: "store.path".into(),
            value: String::new(),
            reason: "file store needs a path".into(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
