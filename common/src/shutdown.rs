use tokio::signal::unix::{SignalKind, signal};

/// Resolves once either `SIGINT` or `SIGTERM` is received. Callers typically
/// spawn this alongside a [`tokio_util::sync::CancellationToken`] and cancel
/// the token when it resolves, so every suspended task downstream observes
/// the same shutdown signal.
pub async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}
