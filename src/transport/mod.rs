pub mod http;
pub mod stdio;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::obfuscate::obfuscate;
use crate::services::ConnectionManager;

const INIT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Resolves on SIGINT or SIGTERM.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                log::warn!("failed to install SIGTERM handler: {e}");
                let _ = ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

/// Initialize the connection manager in the background, retrying every few
/// seconds. The protocol listener stays responsive before the database is
/// reachable; with trust-on-first-use, the known_hosts file may be written
/// fresh between attempts.
pub(crate) fn spawn_init_retry(manager: Arc<ConnectionManager>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        loop {
            match manager.initialize().await {
                Ok(()) => break,
                Err(e) => {
                    log::error!(
                        "database initialization failed, retrying in {}s: {}",
                        INIT_RETRY_INTERVAL.as_secs(),
                        obfuscate(&format!("{e:#}"))
                    );
                    manager.close().await;
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(INIT_RETRY_INTERVAL) => {}
                    }
                }
            }
        }
    });
}
