use tokio::signal::unix::{signal, SignalKind};

use crate::error::Result;

/// Block until SIGTERM or SIGINT arrives. The caller then drains the worker
/// pool and stops the reclaimer before exiting.
pub async fn wait_for_signal() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT, initiating graceful shutdown");
        }
    }
    Ok(())
}
