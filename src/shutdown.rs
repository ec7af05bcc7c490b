use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel `token` on the first SIGTERM or SIGINT.
///
/// The scheduler loop, local worker heartbeats and the API server all watch
/// the same token, so one signal drains the whole node.
///
/// # Errors
///
/// Returns an error if the signal handlers cannot be registered.
pub fn install_shutdown_handler(token: CancellationToken) -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
            _ = token.cancelled() => return,
        };
        tracing::info!(signal = name, "Received shutdown signal, draining");
        token.cancel();
    });

    Ok(())
}
