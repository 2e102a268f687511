use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Token cancelled on the first SIGTERM or SIGINT.
///
/// `bsp-node detector` stops its summary loop, the dashboard's graceful
/// shutdown and then the UDP receive loop off this token; `bsp-node
/// heartbeat` stops sending.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    let trigger = token.clone();
    tokio::spawn(async move {
        let received = tokio::select! {
            _ = terminate.recv() => "SIGTERM",
            _ = interrupt.recv() => "SIGINT",
        };
        tracing::info!(signal = received, "Shutdown signal received, stopping node");
        trigger.cancel();
    });

    Ok(token)
}
