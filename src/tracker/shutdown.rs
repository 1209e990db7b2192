use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Cancels `cancellation` on ctrl-c. Returns early when something else cancelled it first.
pub async fn detect_shutdown(cancellation: CancellationToken) {
    select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received ctrl-c, shutting down");
            cancellation.cancel();
        },
        _ = cancellation.cancelled() => {}
    };
}
