//! Shutdown - シグナル → drain → in-flight ゼロ待ち
//!
//! ## Unix
//! SIGINT / SIGTERM / SIGQUIT と `ctrl_c` のどれかで drain を開始する。
//!
//! ## Windows
//! `ctrl_c` のみ。
//!
//! drain は新規受付を止めるだけで、実行中の処理は何もキャンセルしない。

use std::sync::Arc;
use std::time::Duration;

use super::admission::AdmissionRegistry;

#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv()  => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// Set the drain flag and wait (at most `timeout`) until nothing is in flight.
///
/// Returns `true` if the service went idle in time.
pub async fn drain(registry: &AdmissionRegistry, timeout: Duration) -> bool {
    if registry.start_draining() {
        tracing::warn!(
            in_flight = registry.total_in_flight(),
            "drain started; rejecting new requests"
        );
    }

    match tokio::time::timeout(timeout, registry.wait_idle()).await {
        Ok(()) => {
            tracing::info!("drain complete; no requests in flight");
            true
        }
        Err(_) => {
            tracing::warn!(
                in_flight = registry.total_in_flight(),
                timeout_ms = timeout.as_millis() as u64,
                "drain timed out with requests still in flight"
            );
            false
        }
    }
}

/// Wait for an OS termination signal, then [`drain`].
///
/// If the signal handlers cannot be installed the service keeps running
/// and never drains on its own.
pub async fn drain_on_signal(registry: Arc<AdmissionRegistry>, timeout: Duration) {
    if let Err(e) = wait_for_shutdown_signal().await {
        tracing::error!(error = %e, "failed to install shutdown signal handlers");
        std::future::pending::<()>().await;
    }
    tracing::warn!("shutdown signal received");
    drain(&registry, timeout).await;
}
