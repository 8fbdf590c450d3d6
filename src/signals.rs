//! Translate process signals into control commands.
//!
//! SIGHUP reloads the backend set instead of terminating, so the switcher
//! survives its controlling terminal going away. SIGINT and SIGTERM shut it
//! down gracefully.

use std::io;

use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use crate::ipc::ControlClient;

/// Install the handlers and forward signals to `control` until shutdown has
/// been requested or the server is gone.
///
/// Handlers are registered before this returns, so no signal delivered after
/// the call is lost.
pub fn spawn_signal_bridge(control: ControlClient) -> io::Result<tokio::task::JoinHandle<()>> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = hangup.recv() => {
                    info!("Received SIGHUP");
                    let control = control.clone();
                    tokio::spawn(async move {
                        if let Err(e) = control.reload().await {
                            warn!(error = %e, "Reload failed");
                        }
                    });
                }
                _ = interrupt.recv() => {
                    info!("Received SIGINT");
                    break;
                }
                _ = terminate.recv() => {
                    info!("Received SIGTERM");
                    break;
                }
            }
        }

        if let Err(e) = control.shutdown().await {
            warn!(error = %e, "Shutdown request failed");
        }
    }))
}
