use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel `token` when the process receives SIGTERM or SIGINT.
///
/// Background loops (dispatcher, liveness monitor, heartbeat, status
/// reporter) and the HTTP servers all watch the same token, so one signal
/// stops the whole manager or node.
pub fn cancel_on_signal(token: CancellationToken) -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!(signal = "SIGTERM", "Shutting down");
            }
            _ = sigint.recv() => {
                tracing::info!(signal = "SIGINT", "Shutting down");
            }
            _ = token.cancelled() => return,
        }

        token.cancel();
    });

    Ok(())
}
