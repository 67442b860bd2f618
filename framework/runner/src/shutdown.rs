use anyhow::Context;
use iopup_core::prelude::ShutdownHandle;
use tokio::signal;

/// Request a shutdown when the process receives Ctrl-C or, on Unix, `SIGTERM`.
pub(crate) fn start_shutdown_listener(
    runtime: &tokio::runtime::Runtime,
) -> anyhow::Result<ShutdownHandle> {
    let handle = ShutdownHandle::default();

    #[cfg(unix)]
    let mut terminate = {
        let _guard = runtime.enter();
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to listen for SIGTERM")?
    };

    let listener_handle = handle.clone();
    runtime.spawn(async move {
        #[cfg(unix)]
        let terminated = terminate.recv();
        #[cfg(not(unix))]
        let terminated = std::future::pending::<Option<()>>();

        tokio::select! {
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    log::error!("Failed to receive Ctrl-C signal: {e}");
                    return;
                }
            }
            _ = terminated => {}
        }

        log::warn!("Received shutdown signal, stopping the campaign...");
        listener_handle.shutdown();
    });

    Ok(handle)
}
