//! Worker主循环
//!
//! 每个轮询周期：先读自己的Worker行响应控制命令，再认领一个
//! ASSIGNED任务（ASSIGNED→RUNNING条件更新），子进程执行完毕后
//! 写Run记录并做任务簿记（重试、周期重排或进入终止态）。一次只
//! 执行一个任务，TERMINATE因此天然具备"跑完当前任务再退出"的
//! 语义。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use jobq_core::{
    models::{Run, RunStatus, Task, TaskStatus, Worker, WorkerStatus},
    traits::{RunRepository, TaskRepository, WorkerRepository},
    SchedulerError, SchedulerResult,
};

use crate::executor::SubprocessExecutor;
use crate::heartbeat::WorkerStats;

/// 生成默认Worker名：主机名-pid-短id
pub fn default_worker_name() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    let short_id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", host, std::process::id(), &short_id[..8])
}

/// 一次执行结束后的任务簿记
///
/// 成功：times_run加一、连续失败清零；repeats耗尽或@reboot任务
/// 进入COMPLETED终止态，否则按cron/period重排回QUEUED。
/// 失败/超时：连续失败计数在retry_failed配额内立即重新入队重试，
/// 配额耗尽后停在FAILED/TIMEOUT等待操作员处理。
/// 被操作员终止的任务停在STOPPED。
pub fn plan_after_run(task: &mut Task, outcome: RunStatus, now: DateTime<Utc>) {
    task.assigned_worker = None;
    task.last_run_time = Some(now);

    match outcome {
        RunStatus::Completed => {
            task.times_run += 1;
            task.times_failed = 0;
            if task.is_reboot() || task.repeats_exhausted() {
                task.status = TaskStatus::Completed;
            } else {
                task.status = TaskStatus::Queued;
                task.next_run_time = task.compute_next_run(now).unwrap_or(now);
            }
        }
        RunStatus::Failed | RunStatus::Timeout => {
            task.times_failed += 1;
            if task.times_failed <= task.retry_failed {
                // 用相同参数立即重试
                task.status = TaskStatus::Queued;
                task.next_run_time = now;
            } else if outcome == RunStatus::Timeout {
                task.status = TaskStatus::Timeout;
            } else {
                task.status = TaskStatus::Failed;
            }
        }
        RunStatus::Stopped => {
            task.status = TaskStatus::Stopped;
        }
        RunStatus::Running => {}
    }
}

pub enum LoopControl {
    Continue,
    Exit,
}

pub struct WorkerService {
    name: String,
    task_repo: Arc<dyn TaskRepository>,
    run_repo: Arc<dyn RunRepository>,
    worker_repo: Arc<dyn WorkerRepository>,
    executor: Arc<SubprocessExecutor>,
    group_names: Vec<String>,
    poll_interval_seconds: u64,
    stats: Arc<WorkerStats>,
}

impl WorkerService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        task_repo: Arc<dyn TaskRepository>,
        run_repo: Arc<dyn RunRepository>,
        worker_repo: Arc<dyn WorkerRepository>,
        executor: Arc<SubprocessExecutor>,
        group_names: Vec<String>,
        poll_interval_seconds: u64,
        stats: Arc<WorkerStats>,
    ) -> Self {
        Self {
            name,
            task_repo,
            run_repo,
            worker_repo,
            executor,
            group_names,
            poll_interval_seconds,
            stats,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 注册本Worker
    pub async fn register(&self) -> SchedulerResult<()> {
        let worker = Worker::new(&self.name, self.group_names.clone());
        self.worker_repo.register(&worker).await?;
        info!("Worker {} 注册成功，分组: {:?}", self.name, self.group_names);
        Ok(())
    }

    /// 主循环，直到收到关闭信号或控制命令退出
    pub async fn run_loop(&self, mut shutdown_rx: broadcast::Receiver<()>) -> SchedulerResult<()> {
        let mut poll = interval(Duration::from_secs(self.poll_interval_seconds));

        loop {
            tokio::select! {
                _ = poll.tick() => {}
                _ = shutdown_rx.recv() => {
                    info!("Worker {} 收到关闭信号", self.name);
                    break;
                }
            }

            // 轮询间隙响应控制命令
            match self.worker_repo.get_by_name(&self.name).await {
                Ok(None) => {
                    warn!("Worker {} 的记录丢失，重新注册", self.name);
                    if let Err(e) = self.register().await {
                        error!("重新注册失败: {}", e);
                    }
                    continue;
                }
                Ok(Some(me)) => match me.status {
                    WorkerStatus::Terminate => {
                        info!("Worker {} 收到TERMINATE，优雅退出", self.name);
                        break;
                    }
                    WorkerStatus::Kill => {
                        info!("Worker {} 收到KILL，立即退出", self.name);
                        // 不注销：行与任务留给同伴按心跳超时回收
                        return Ok(());
                    }
                    WorkerStatus::Disabled => {
                        debug!("Worker {} 处于DISABLED，跳过认领", self.name);
                        continue;
                    }
                    WorkerStatus::StopTask => {
                        // 没有执行中的任务，命令已无目标，复位
                        if let Err(e) = self
                            .worker_repo
                            .update_status(&self.name, WorkerStatus::Active)
                            .await
                        {
                            error!("复位STOP_TASK状态失败: {}", e);
                        }
                    }
                    WorkerStatus::Active => {}
                },
                Err(e) => {
                    error!("读取Worker {} 状态失败: {}", self.name, e);
                    continue;
                }
            }

            match self.claim_and_execute_once().await {
                Ok(Some(LoopControl::Exit)) => return Ok(()),
                Ok(_) => {}
                Err(e) => error!("Worker {} 执行任务出错: {}", self.name, e),
            }
        }

        // 优雅退出：清掉自己的注册行
        self.worker_repo.unregister(&self.name).await?;
        info!("Worker {} 已退出", self.name);
        Ok(())
    }

    /// 认领并执行一个任务；没有待执行任务时返回None
    pub async fn claim_and_execute_once(&self) -> SchedulerResult<Option<LoopControl>> {
        let task = match self.claim_next().await? {
            Some(task) => task,
            None => return Ok(None),
        };
        let control = self.execute_claimed(task).await?;
        Ok(Some(control))
    }

    async fn claim_next(&self) -> SchedulerResult<Option<Task>> {
        let assigned = self.task_repo.get_by_worker(&self.name).await?;
        for task in assigned {
            if task.status == TaskStatus::Assigned
                && self.task_repo.try_start(task.id, &self.name).await?
            {
                debug!("Worker {} 认领任务 {}", self.name, task.id);
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    async fn execute_claimed(&self, task: Task) -> SchedulerResult<LoopControl> {
        let started_at = Utc::now();
        let run = self
            .run_repo
            .create(&Run::started(task.id, &self.name, started_at))
            .await?;
        info!(
            "开始执行任务 {} ({}) 运行 {}，超时 {}秒",
            task.id, task.function_name, run.id, task.timeout_seconds
        );

        let execution = self.executor.execute(run.id, &task);
        tokio::pin!(execution);
        let mut control_poll = interval(Duration::from_secs(self.poll_interval_seconds.max(1)));
        control_poll.tick().await;

        let mut stop_requested = false;
        let mut kill_requested = false;
        let outcome = loop {
            tokio::select! {
                outcome = &mut execution => break outcome,
                _ = control_poll.tick() => {
                    // 执行期间继续响应STOP_TASK与KILL
                    if let Ok(Some(me)) = self.worker_repo.get_by_name(&self.name).await {
                        match me.status {
                            WorkerStatus::StopTask => {
                                warn!("Worker {} 收到STOP_TASK，终止任务 {}", self.name, task.id);
                                stop_requested = true;
                                self.executor.cancel(run.id).await;
                                if let Err(e) = self
                                    .worker_repo
                                    .update_status(&self.name, WorkerStatus::Active)
                                    .await
                                {
                                    error!("复位STOP_TASK状态失败: {}", e);
                                }
                            }
                            WorkerStatus::Kill => {
                                warn!("Worker {} 执行期间收到KILL，放弃任务 {}", self.name, task.id);
                                kill_requested = true;
                                self.executor.cancel(run.id).await;
                            }
                            _ => {}
                        }
                    }
                }
            }
        };

        if kill_requested {
            // 任务行与运行记录保持RUNNING，由同伴按心跳超时回收
            return Ok(LoopControl::Exit);
        }

        let finished_at = Utc::now();
        let final_status = if stop_requested {
            RunStatus::Stopped
        } else {
            outcome.status
        };
        let error_message = if stop_requested {
            Some("任务被操作员终止".to_string())
        } else {
            outcome.error_message.clone()
        };

        self.run_repo
            .finish(
                run.id,
                final_status,
                finished_at,
                outcome.output.as_deref(),
                outcome.result.as_ref(),
                error_message.as_deref(),
            )
            .await?;

        match final_status {
            RunStatus::Completed => self.stats.record_success(),
            RunStatus::Failed | RunStatus::Timeout => self.stats.record_failure(),
            _ => {}
        }

        let mut updated = self
            .task_repo
            .get_by_id(task.id)
            .await?
            .ok_or(SchedulerError::TaskNotFound { id: task.id })?;
        plan_after_run(&mut updated, final_status, finished_at);
        self.task_repo.update(&updated).await?;

        info!(
            "任务 {} 执行结束: {:?} (运行 {}，耗时 {}ms)",
            task.id,
            final_status,
            run.id,
            (finished_at - started_at).num_milliseconds()
        );
        Ok(LoopControl::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use jobq_core::models::QueueOptions;

    fn due_task(options: QueueOptions) -> Task {
        let now = Utc::now();
        let mut task = Task::new("t", "noop", options);
        task.start_time = now - Duration::minutes(5);
        task.next_run_time = now - Duration::minutes(1);
        task.assigned_worker = Some("w1".to_string());
        task.status = TaskStatus::Running;
        task
    }

    #[test]
    fn test_success_requeues_recurring_task() {
        let mut task = due_task(QueueOptions {
            repeats: 0,
            period_seconds: 60,
            ..Default::default()
        });
        let now = Utc::now();
        plan_after_run(&mut task, RunStatus::Completed, now);

        // repeats=0 永不自停
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.times_run, 1);
        assert_eq!(task.next_run_time, now + Duration::seconds(60));
        assert!(task.assigned_worker.is_none());
    }

    #[test]
    fn test_repeats_exhaustion_completes_task() {
        let mut task = due_task(QueueOptions {
            repeats: 3,
            ..Default::default()
        });
        task.times_run = 2;
        plan_after_run(&mut task, RunStatus::Completed, Utc::now());

        assert_eq!(task.times_run, 3);
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[test]
    fn test_failure_retries_within_quota_then_sticks() {
        let mut task = due_task(QueueOptions {
            retry_failed: 2,
            ..Default::default()
        });
        let now = Utc::now();

        plan_after_run(&mut task, RunStatus::Failed, now);
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.times_failed, 1);

        task.status = TaskStatus::Running;
        plan_after_run(&mut task, RunStatus::Failed, now);
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.times_failed, 2);

        task.status = TaskStatus::Running;
        plan_after_run(&mut task, RunStatus::Failed, now);
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.times_failed, 3);
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let mut task = due_task(QueueOptions {
            repeats: 0,
            retry_failed: 2,
            ..Default::default()
        });
        task.times_failed = 2;
        plan_after_run(&mut task, RunStatus::Completed, Utc::now());
        assert_eq!(task.times_failed, 0);
    }

    #[test]
    fn test_timeout_sticks_as_timeout_after_quota() {
        let mut task = due_task(QueueOptions::default());
        plan_after_run(&mut task, RunStatus::Timeout, Utc::now());
        // retry_failed默认为0，直接停在TIMEOUT
        assert_eq!(task.status, TaskStatus::Timeout);
    }

    #[test]
    fn test_stopped_task_sticks() {
        let mut task = due_task(QueueOptions::default());
        plan_after_run(&mut task, RunStatus::Stopped, Utc::now());
        assert_eq!(task.status, TaskStatus::Stopped);
    }

    #[test]
    fn test_reboot_task_never_requeued() {
        let mut task = due_task(QueueOptions {
            cronline: Some("@reboot".to_string()),
            repeats: 0,
            ..Default::default()
        });
        plan_after_run(&mut task, RunStatus::Completed, Utc::now());
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[test]
    fn test_cron_task_requeued_at_next_fire_time() {
        let mut task = due_task(QueueOptions {
            repeats: 0,
            cronline: Some("0 * * * *".to_string()),
            ..Default::default()
        });
        let now = Utc::now();
        plan_after_run(&mut task, RunStatus::Completed, now);
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.next_run_time > now);
    }
}
