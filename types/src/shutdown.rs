//! Termination signalling for the workspace binaries.
//!
//! Both processes drive their subsystems from one cancellation token;
//! this module owns the bridge from OS signals to that token.

use anyhow::Result as AnyResult;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[cfg(unix)]
async fn termination_signal() -> AnyResult<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let sigint = signal(SignalKind::interrupt())?;
    let sigterm = signal(SignalKind::terminate())?;
    tokio::pin!(sigint);
    tokio::pin!(sigterm);
    tokio::select! {
        _ = sigint.recv() => { info!("SIGINT received, shutting down"); }
        _ = sigterm.recv() => { info!("SIGTERM received, shutting down"); }
    };
    Ok(())
}

#[cfg(not(unix))]
async fn termination_signal() -> AnyResult<()> {
    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received");
    Ok(())
}

/// Return a token that is cancelled when the process receives a
/// termination signal. Subsystems watch child tokens of it, so one
/// signal drains the whole process.
#[must_use]
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let guard = token.clone();
    tokio::spawn(async move {
        if let Err(error) = termination_signal().await {
            error!(?error, "failed to listen for termination signals");
            return;
        }
        guard.cancel();
    });
    token
}
