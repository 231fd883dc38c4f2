//! Termination signals as a cooperative abort.
//!
//! SIGINT and SIGTERM cancel a [`CancellationToken`] instead of killing the
//! process; coordinators check the token between messages so files that are
//! already running can still report.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Stops listening for signals when dropped.
#[derive(Debug)]
pub struct SignalGuard {
    task: JoinHandle<()>,
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Cancels `token` on the first SIGINT or SIGTERM.
///
/// Must be called from within a tokio runtime.
pub fn watch(token: CancellationToken) -> SignalGuard {
    let task = tokio::spawn(async move {
        wait_for_signal().await;
        warn!("Interrupted, finishing files in progress");
        token.cancel();
    });
    SignalGuard { task }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!("Failed to set up SIGTERM handler: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to set up SIGINT handler: {}", e);
                std::future::pending::<()>().await;
            }
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to set up SIGINT handler: {}", e);
                sigterm.recv().await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to set up Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
}
