//! Observability - tracing subscriber の初期化
//!
//! - `RUST_LOG` でフィルタ（未設定なら `info`）
//! - `LOG_FORMAT=json` で JSON 行、それ以外は pretty

use tracing_subscriber::EnvFilter;

pub const ENV_LOG_FORMAT: &str = "LOG_FORMAT";

/// Install the global subscriber.
///
/// Returns an error instead of panicking when a subscriber is already set.
pub fn init_tracing() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let format = std::env::var(ENV_LOG_FORMAT).unwrap_or_else(|_| "pretty".to_string());
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(filter())
            .try_init(),
    }
}
