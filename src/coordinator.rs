//! 调度协调器门面
//!
//! 对外的控制面：入队、查询、停止、启停任务与Worker、声明依赖。
//! 未知函数名与非法CRON表达式在入队时即被拒绝，不会进入队列。

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use jobq_core::{
    cron::CronLine,
    models::{QueueOptions, Run, Task, TaskStatus, Worker, WorkerStatus},
    registry::FunctionRegistry,
    traits::{JobGraphRepository, RunRepository, TaskRepository, WorkerRepository},
    SchedulerError, SchedulerResult,
};
use jobq_dispatcher::DependencyChecker;

/// 任务当前状态与最近一次运行
#[derive(Debug, Clone)]
pub struct TaskStatusView {
    pub task: Task,
    pub latest_run: Option<Run>,
}

pub struct Coordinator {
    registry: Arc<FunctionRegistry>,
    task_repo: Arc<dyn TaskRepository>,
    run_repo: Arc<dyn RunRepository>,
    worker_repo: Arc<dyn WorkerRepository>,
    checker: DependencyChecker,
}

impl Coordinator {
    pub fn new(
        registry: Arc<FunctionRegistry>,
        task_repo: Arc<dyn TaskRepository>,
        run_repo: Arc<dyn RunRepository>,
        worker_repo: Arc<dyn WorkerRepository>,
        graph_repo: Arc<dyn JobGraphRepository>,
    ) -> Self {
        let checker = DependencyChecker::new(graph_repo, run_repo.clone());
        Self {
            registry,
            task_repo,
            run_repo,
            worker_repo,
            checker,
        }
    }

    /// 入队新任务
    ///
    /// 函数名必须在注册表中；CRON表达式在此解析，普通表达式还要求
    /// 能算出下一次触发时间。返回带ID的任务行。
    pub async fn queue_task(
        &self,
        name: &str,
        function_name: &str,
        args: Vec<serde_json::Value>,
        vars: serde_json::Map<String, serde_json::Value>,
        options: QueueOptions,
    ) -> SchedulerResult<Task> {
        if !self.registry.contains(function_name) {
            return Err(SchedulerError::UnknownFunction(function_name.to_string()));
        }

        let mut task = Task::new(name, function_name, options);
        task.args = serde_json::Value::Array(args);
        task.vars = serde_json::Value::Object(vars);

        if let Some(expr) = task.cronline.clone() {
            match CronLine::parse(&expr)? {
                CronLine::Reboot => {
                    // 停在哨兵时间，等Ticker启动时武装
                }
                CronLine::Schedule(schedule) => {
                    task.next_run_time = schedule.next_after(task.start_time).ok_or_else(|| {
                        SchedulerError::InvalidCron {
                            expr,
                            message: "无法计算下一次触发时间".to_string(),
                        }
                    })?;
                }
            }
        }

        let created = self.task_repo.create(&task).await?;
        info!(
            "任务入队: {} (ID: {}, 函数: {})",
            created.name, created.id, created.function_name
        );
        Ok(created)
    }

    /// 任务当前状态与最近一次运行
    pub async fn task_status(&self, task_id: i64) -> SchedulerResult<TaskStatusView> {
        let task = self
            .task_repo
            .get_by_id(task_id)
            .await?
            .ok_or(SchedulerError::TaskNotFound { id: task_id })?;
        let latest_run = self.run_repo.get_latest_for_task(task_id).await?;
        Ok(TaskStatusView { task, latest_run })
    }

    /// 停止任务
    ///
    /// RUNNING的任务通过持有Worker的STOP_TASK信号终止；
    /// 还在排队或已分配未开跑的直接置STOPPED。
    pub async fn stop_task(&self, task_id: i64) -> SchedulerResult<()> {
        let task = self
            .task_repo
            .get_by_id(task_id)
            .await?
            .ok_or(SchedulerError::TaskNotFound { id: task_id })?;

        match task.status {
            TaskStatus::Running => {
                if let Some(worker_name) = &task.assigned_worker {
                    info!("通知Worker {} 终止任务 {}", worker_name, task_id);
                    self.worker_repo
                        .update_status(worker_name, WorkerStatus::StopTask)
                        .await?;
                }
                Ok(())
            }
            TaskStatus::Queued | TaskStatus::Assigned => {
                self.task_repo
                    .try_transition(task_id, task.status, TaskStatus::Stopped)
                    .await?;
                Ok(())
            }
            // 已在终止态，无事可做
            _ => Ok(()),
        }
    }

    pub async fn enable(&self, task_id: i64) -> SchedulerResult<()> {
        self.task_repo.set_enabled(task_id, true).await
    }

    pub async fn disable(&self, task_id: i64) -> SchedulerResult<()> {
        self.task_repo.set_enabled(task_id, false).await
    }

    /// 操作员把终止态任务重新入队
    pub async fn requeue(&self, task_id: i64) -> SchedulerResult<()> {
        let mut task = self
            .task_repo
            .get_by_id(task_id)
            .await?
            .ok_or(SchedulerError::TaskNotFound { id: task_id })?;
        task.status = TaskStatus::Queued;
        task.times_failed = 0;
        task.assigned_worker = None;
        task.next_run_time = Utc::now();
        self.task_repo.update(&task).await?;
        info!("任务 {} 已重新入队", task_id);
        Ok(())
    }

    /// 声明依赖边：child等parent最近一次运行COMPLETED后才可分配
    pub async fn add_deps(&self, parent_task_id: i64, child_task_id: i64) -> SchedulerResult<()> {
        for id in [parent_task_id, child_task_id] {
            if self.task_repo.get_by_id(id).await?.is_none() {
                return Err(SchedulerError::TaskNotFound { id });
            }
        }
        self.checker.add_deps(parent_task_id, child_task_id).await?;
        Ok(())
    }

    pub async fn list_workers(&self) -> SchedulerResult<Vec<Worker>> {
        self.worker_repo.list().await
    }

    /// 优雅终止Worker：跑完当前任务后退出
    pub async fn terminate_worker(&self, name: &str) -> SchedulerResult<()> {
        self.worker_repo
            .update_status(name, WorkerStatus::Terminate)
            .await
    }

    /// 立即终止Worker，在途任务由同伴回收
    pub async fn kill_worker(&self, name: &str) -> SchedulerResult<()> {
        self.worker_repo.update_status(name, WorkerStatus::Kill).await
    }
}
