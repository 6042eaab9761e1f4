//! OS signal handling.
//!
//! # Responsibilities
//! - Wait for SIGINT (Ctrl-C) or SIGTERM
//! - Translate the first signal into cancellation of in-flight calls
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - Cancellation is cooperative: retry waits stop, running attempts finish

use tokio::task::JoinHandle;

use crate::lifecycle::cancel::CancelToken;

/// Resolve on the first SIGINT or SIGTERM.
pub async fn wait_for_shutdown() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res,
            _ = term.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

/// Cancel `token` when a shutdown signal arrives.
pub fn cancel_on_shutdown(token: CancelToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        match wait_for_shutdown().await {
            Ok(()) => {
                tracing::info!("Shutdown signal received, cancelling in-flight calls");
                token.cancel();
            }
            Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signals"),
        }
    })
}
