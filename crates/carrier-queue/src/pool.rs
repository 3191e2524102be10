//! Worker pool management with supervised tasks and graceful shutdown.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    error::{QueueError, Result},
    worker::Worker,
};

/// Pool of supervised dispatch worker tasks.
///
/// Spawns the configured workers, tracks their join handles, and shuts
/// them down cooperatively via a shared cancellation token. Dropping a
/// pool with live workers cancels them to avoid orphaned tasks.
pub struct WorkerPool {
    workers: Vec<Worker>,
    handles: Vec<JoinHandle<Result<()>>>,
    cancellation_token: CancellationToken,
}

impl WorkerPool {
    /// Creates a pool over prepared workers sharing `cancellation_token`.
    pub fn new(workers: Vec<Worker>, cancellation_token: CancellationToken) -> Self {
        Self { workers, handles: Vec::new(), cancellation_token }
    }

    /// Spawns every worker task. Returns immediately.
    pub fn spawn_workers(&mut self) {
        info!(worker_count = self.workers.len(), "spawning dispatch workers");

        for (worker_id, worker) in self.workers.iter().cloned().enumerate() {
            let handle = tokio::spawn(async move {
                let result = worker.run().await;

                if let Err(ref error) = result {
                    error!(worker_id, error = %error, "dispatch worker terminated with error");
                }

                result
            });

            self.handles.push(handle);
        }
    }

    /// Number of workers still running.
    pub fn active_workers(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    /// Cancels all workers and waits for them to finish their in-flight
    /// requests, bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns a shutdown timeout error when workers do not finish in
    /// time.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.handles.len(),
            timeout_secs = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();

        let join_all = async {
            for (worker_id, handle) in std::mem::take(&mut self.handles).into_iter().enumerate() {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(worker_id, error = %error, "worker completed with error during shutdown");
                    },
                    Err(join_error) => {
                        error!(worker_id, error = %join_error, "worker task panicked during shutdown");
                    },
                }
            }
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(()) => {
                info!("worker pool shutdown completed");
                Ok(())
            },
            Err(_) => {
                error!(
                    timeout_secs = timeout.as_secs(),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(QueueError::ShutdownTimeout { timeout })
            },
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active = self.handles.iter().filter(|h| !h.is_finished()).count();

        if active > 0 && !self.cancellation_token.is_cancelled() {
            error!(
                active_workers = active,
                "WorkerPool dropped with active workers, forcing cancellation"
            );
            self.cancellation_token.cancel();
        }
    }
}
