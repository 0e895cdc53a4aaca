//! OS signal handling
//!
//! SIGINT or SIGTERM starts a graceful drain; a second one forces
//! termination.

use super::shutdown::{Phase, Shutdown};
use tokio::task::JoinHandle;

/// Listen for termination signals until the server terminates
pub fn spawn_signal_listener(shutdown: Shutdown) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut signal = shutdown.subscribe();
        loop {
            tokio::select! {
                received = wait_for_signal() => {
                    if let Err(e) = received {
                        tracing::error!(error = %e, "failed to listen for shutdown signals");
                        return;
                    }
                }
                _ = signal.terminated() => return,
            }

            if shutdown.phase() == Phase::Running {
                tracing::info!("shutdown signal received, draining connections");
                shutdown.drain();
            } else {
                tracing::warn!("second shutdown signal received, terminating");
                shutdown.terminate();
                return;
            }
        }
    })
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
