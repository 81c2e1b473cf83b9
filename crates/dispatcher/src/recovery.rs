//! 失活Worker的任务回收
//!
//! 心跳超过阈值的Worker被视为死亡：其名下RUNNING的运行记录收尾
//! 为FAILED，持有的任务重置回QUEUED（重试配额耗尽的降级为FAILED），
//! 最后删除Worker行。对死掉的Worker本身不做任何通知。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use jobq_core::{
    models::{RunStatus, TaskStatus},
    traits::{RunRepository, TaskRepository, WorkerRepository},
    SchedulerResult,
};

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// 心跳超过该秒数即判定失活
    pub stale_after_seconds: i64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            stale_after_seconds: 9,
        }
    }
}

/// 一轮回收的结果
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub requeued: Vec<i64>,
    pub failed: Vec<i64>,
    pub removed_workers: Vec<String>,
}

pub struct RecoveryService {
    task_repo: Arc<dyn TaskRepository>,
    run_repo: Arc<dyn RunRepository>,
    worker_repo: Arc<dyn WorkerRepository>,
    config: RecoveryConfig,
}

impl RecoveryService {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        run_repo: Arc<dyn RunRepository>,
        worker_repo: Arc<dyn WorkerRepository>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            task_repo,
            run_repo,
            worker_repo,
            config,
        }
    }

    /// 回收所有失活Worker持有的任务
    pub async fn reclaim_stale_workers(&self, now: DateTime<Utc>) -> SchedulerResult<RecoveryReport> {
        let stale = self
            .worker_repo
            .list_stale(now, self.config.stale_after_seconds)
            .await?;
        let mut report = RecoveryReport::default();

        for worker in stale {
            warn!(
                "检测到失活Worker: {} (上次心跳: {})",
                worker.name,
                worker.last_heartbeat.format("%Y-%m-%d %H:%M:%S UTC")
            );

            // 孤儿运行记录收尾，Run一旦完成便不再变化
            for run in self.run_repo.get_running_by_worker(&worker.name).await? {
                self.run_repo
                    .finish(
                        run.id,
                        RunStatus::Failed,
                        now,
                        None,
                        None,
                        Some("Worker心跳超时，任务被回收"),
                    )
                    .await?;
            }

            // 条件更新回收任务，times_failed已在回收时加一
            let reclaimed = self.task_repo.reclaim_from_worker(&worker.name, now).await?;
            for task in reclaimed {
                if task.times_failed > task.retry_failed {
                    // 重试配额耗尽，降级为FAILED
                    if self
                        .task_repo
                        .try_transition(task.id, TaskStatus::Queued, TaskStatus::Failed)
                        .await?
                    {
                        report.failed.push(task.id);
                    }
                } else {
                    debug!("任务 {} 重新入队等待分配", task.id);
                    report.requeued.push(task.id);
                }
            }

            self.worker_repo.unregister(&worker.name).await?;
            report.removed_workers.push(worker.name);
        }

        if !report.removed_workers.is_empty() {
            info!(
                "回收完成: 清除{}个Worker，重新入队{}个任务，{}个任务标记失败",
                report.removed_workers.len(),
                report.requeued.len(),
                report.failed.len()
            );
        }
        Ok(report)
    }
}
