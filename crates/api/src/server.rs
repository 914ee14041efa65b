//! Process runtime helpers shared by the binaries.

use tokio_util::sync::CancellationToken;
use tracing::info;

use hookrelay_infra::WorkerHandle;

/// Resolve on Ctrl-C (or SIGTERM on unix), then cancel `token`.
///
/// Workers only ever see the token; signal handling lives here.
pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    info!("shutdown requested");
    token.cancel();
}

/// Wait for every worker to finish its in-flight attempt.
pub async fn drain_workers(workers: Vec<WorkerHandle>) {
    let count = workers.len();
    for worker in workers {
        worker.join().await;
    }
    if count > 0 {
        info!(count, "workers stopped");
    }
}
