//! The supervisor (component H): owns the root cancellation token and
//! drains every listener/cloud-client task on shutdown.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Spawns a task that cancels `shutdown` on SIGINT (or the platform
/// equivalent).
pub fn install_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received interrupt, shutting down");
            shutdown.cancel();
        }
    });
}

/// Awaits every listener/cloud-client task, logging (but not propagating)
/// individual task failures so that one misbehaving component cannot
/// prevent the others from draining cleanly.
pub async fn drain(tasks: Vec<JoinHandle<anyhow::Result<()>>>) {
    for task in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::error!(error = %err, "component exited with an error"),
            Err(join_err) => tracing::error!(error = %join_err, "component task panicked"),
        }
    }
}
