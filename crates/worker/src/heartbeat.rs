use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info, warn};

use jobq_core::{models::Worker, traits::WorkerRepository};

/// Aggregate counters shared between the worker loop and the
/// heartbeat writer.
#[derive(Default)]
pub struct WorkerStats {
    tasks_run: AtomicI64,
    tasks_failed: AtomicI64,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) {
        self.tasks_run.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.tasks_run.fetch_add(1, Ordering::Relaxed);
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (i64, i64) {
        (
            self.tasks_run.load(Ordering::Relaxed),
            self.tasks_failed.load(Ordering::Relaxed),
        )
    }
}

/// Liveness reporter running on its own task.
///
/// The loop is fully independent of task execution, so a slow or
/// wedged task can never starve liveness reporting. If the worker
/// row disappears (operator cleanup, recovery pass), the next beat
/// re-registers it.
pub struct HeartbeatManager {
    worker_name: String,
    group_names: Vec<String>,
    worker_repo: Arc<dyn WorkerRepository>,
    interval_seconds: u64,
    stats: Arc<WorkerStats>,
}

impl HeartbeatManager {
    pub fn new(
        worker_name: String,
        group_names: Vec<String>,
        worker_repo: Arc<dyn WorkerRepository>,
        interval_seconds: u64,
        stats: Arc<WorkerStats>,
    ) -> Self {
        Self {
            worker_name,
            group_names,
            worker_repo,
            interval_seconds,
            stats,
        }
    }

    pub fn spawn(&self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let worker_name = self.worker_name.clone();
        let group_names = self.group_names.clone();
        let worker_repo = Arc::clone(&self.worker_repo);
        let stats = Arc::clone(&self.stats);
        let mut beat = interval(Duration::from_secs(self.interval_seconds));

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = beat.tick() => {
                        let (tasks_run, tasks_failed) = stats.snapshot();
                        match worker_repo
                            .heartbeat(&worker_name, Utc::now(), tasks_run, tasks_failed)
                            .await
                        {
                            Ok(true) => {}
                            Ok(false) => {
                                warn!("Worker row for {} is gone, re-registering", worker_name);
                                let worker = Worker::new(&worker_name, group_names.clone());
                                if let Err(e) = worker_repo.register(&worker).await {
                                    error!("Failed to re-register worker {}: {}", worker_name, e);
                                }
                            }
                            Err(e) => {
                                error!("Failed to send heartbeat for {}: {}", worker_name, e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Heartbeat loop for {} shutting down", worker_name);
                        break;
                    }
                }
            }
        })
    }
}
