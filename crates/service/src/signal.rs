//! Termination signals mapped onto the halt token.

use std::io;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Cancel `shutdown_token` on SIGHUP, SIGINT or SIGTERM (ctrl-c elsewhere).
///
/// # Errors
///
/// Returns an error if a signal handler cannot be installed.
#[cfg(unix)]
pub fn spawn_signal_listener(shutdown_token: CancellationToken) -> io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            () = shutdown_token.cancelled() => return,
            _ = sighup.recv() => info!("received SIGHUP"),
            _ = sigint.recv() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }

        shutdown_token.cancel();
    }))
}

/// Cancel `shutdown_token` on ctrl-c.
///
/// # Errors
///
/// Never fails on this platform.
#[cfg(not(unix))]
pub fn spawn_signal_listener(shutdown_token: CancellationToken) -> io::Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        tokio::select! {
            () = shutdown_token.cancelled() => return,
            _ = tokio::signal::ctrl_c() => info!("received interrupt signal"),
        }

        shutdown_token.cancel();
    }))
}
