//! Ticker：选举出的单一分配者
//!
//! 每个Worker进程都在周期性竞选；当选者在每个周期内完成
//! 过期处理、失活回收、到期扫描、依赖过滤与批量分配。选举与
//! 分配全部走仓储的条件更新，旧Ticker短暂"复活"时写不赢任何行。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use jobq_core::{
    config::TickerConfig,
    traits::{JobGraphRepository, RunRepository, TaskRepository, WorkerRepository},
    SchedulerResult,
};

use crate::graph::DependencyChecker;
use crate::recovery::{RecoveryConfig, RecoveryReport, RecoveryService};
use crate::strategies::{AssignStrategy, CandidateWorker};

/// 每多少个周期触发一次运行记录清理
const CLEANUP_EVERY_CYCLES: u64 = 720;

/// 一个调度周期的结果
#[derive(Debug, Default)]
pub struct TickReport {
    pub expired: u64,
    pub assigned: Vec<i64>,
    pub recovery: RecoveryReport,
}

pub struct Ticker {
    worker_name: String,
    task_repo: Arc<dyn TaskRepository>,
    run_repo: Arc<dyn RunRepository>,
    worker_repo: Arc<dyn WorkerRepository>,
    checker: DependencyChecker,
    recovery: RecoveryService,
    strategy: Arc<dyn AssignStrategy>,
    config: TickerConfig,
    stale_after_seconds: i64,
    cycles: AtomicU64,
    reboot_armed: AtomicBool,
}

impl Ticker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_name: String,
        task_repo: Arc<dyn TaskRepository>,
        run_repo: Arc<dyn RunRepository>,
        worker_repo: Arc<dyn WorkerRepository>,
        graph_repo: Arc<dyn JobGraphRepository>,
        strategy: Arc<dyn AssignStrategy>,
        config: TickerConfig,
        stale_after_seconds: i64,
    ) -> Self {
        let checker = DependencyChecker::new(graph_repo, run_repo.clone());
        let recovery = RecoveryService::new(
            task_repo.clone(),
            run_repo.clone(),
            worker_repo.clone(),
            RecoveryConfig { stale_after_seconds },
        );
        Self {
            worker_name,
            task_repo,
            run_repo,
            worker_repo,
            checker,
            recovery,
            strategy,
            config,
            stale_after_seconds,
            cycles: AtomicU64::new(0),
            reboot_armed: AtomicBool::new(false),
        }
    }

    /// 竞选Ticker身份
    ///
    /// 对已持有者幂等；本进程首次当选时武装@reboot任务，
    /// times_run=0的守卫保证已消费的任务不会跨启动重复触发。
    pub async fn try_elect(&self, now: DateTime<Utc>) -> SchedulerResult<bool> {
        let elected = self
            .worker_repo
            .try_acquire_ticker(&self.worker_name, now, self.stale_after_seconds)
            .await?;

        if elected && !self.reboot_armed.swap(true, Ordering::SeqCst) {
            info!("Worker {} 当选Ticker", self.worker_name);
            let armed = self.task_repo.arm_reboot_tasks(now).await?;
            if armed > 0 {
                info!("武装了 {} 个@reboot任务", armed);
            }
        }
        Ok(elected)
    }

    /// 执行一个调度周期，只应在当选后调用
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> SchedulerResult<TickReport> {
        let mut report = TickReport {
            // 1. 超过stop_time的任务直接过期，不再执行
            expired: self.task_repo.expire_overdue(now).await?,
            // 2. 回收失活Worker持有的任务
            recovery: self.recovery.reclaim_stale_workers(now).await?,
            assigned: Vec::new(),
        };

        // 3. 拉取存活且可接收任务的Worker与当前负载
        let workers: Vec<_> = self
            .worker_repo
            .list_alive(now, self.stale_after_seconds)
            .await?
            .into_iter()
            .filter(|w| w.accepts_tasks())
            .collect();
        let mut loads = self.task_repo.assigned_counts().await?;

        // 4. 到期任务按 next_run_time, id 确定性排序，分配数量有上限
        let due = self
            .task_repo
            .get_due_tasks(now, self.config.assign_batch_size as i64)
            .await?;

        for task in due {
            if report.assigned.len() >= self.config.assign_batch_size {
                break;
            }
            // 5. 依赖未满足的任务跳过，等父任务COMPLETED
            if self.checker.is_blocked(task.id).await? {
                continue;
            }
            let candidates: Vec<CandidateWorker> = workers
                .iter()
                .filter(|w| w.serves_any_group(&task.group_name))
                .map(|w| CandidateWorker {
                    name: w.name.clone(),
                    active_tasks: *loads.get(&w.name).unwrap_or(&0),
                })
                .collect();

            match self.strategy.select_worker(&task, &candidates).await? {
                Some(worker_name) => {
                    // 6. 单条条件更新，并发选举竞争下只有一个写入者胜出
                    if self.task_repo.try_assign(task.id, &worker_name, now).await? {
                        debug!("任务 {} 分配给Worker {}", task.id, worker_name);
                        *loads.entry(worker_name).or_insert(0) += 1;
                        report.assigned.push(task.id);
                    } else {
                        debug!("任务 {} 分配竞争失败，下个周期重试", task.id);
                    }
                }
                None => {
                    debug!("任务 {} 本周期没有可用Worker", task.id);
                }
            }
        }

        // 低频清理过期运行记录
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed);
        if cycle % CLEANUP_EVERY_CYCLES == 0 {
            let removed = self
                .run_repo
                .cleanup_old_runs(self.config.run_retention_days)
                .await?;
            if removed > 0 {
                info!("清理了 {} 条过期运行记录", removed);
            }
        }

        if !report.assigned.is_empty() {
            info!("本周期分配了 {} 个任务", report.assigned.len());
        }
        Ok(report)
    }

    /// 主循环：每个tick先竞选再调度，落选者空转等待下次竞选
    pub async fn run_loop(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        // 随机起始延迟，避免同批启动的Worker同时竞选
        let jitter_ms = rand::rng().random_range(0..500);
        tokio::time::sleep(std::time::Duration::from_millis(jitter_ms)).await;

        let mut tick = tokio::time::interval(std::time::Duration::from_secs(
            self.config.tick_interval_seconds,
        ));

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown_rx.recv() => {
                    info!("Ticker循环收到关闭信号");
                    break;
                }
            }

            let now = Utc::now();
            match self.try_elect(now).await {
                Ok(true) => {
                    if let Err(e) = self.run_cycle(now).await {
                        error!("调度周期执行失败: {}", e);
                    }
                }
                Ok(false) => {
                    debug!("Worker {} 未持有Ticker身份，等待下次竞选", self.worker_name);
                }
                Err(e) => {
                    error!("Ticker竞选失败: {}", e);
                }
            }
        }

        // 退出时尽力让出身份，失败也无妨，心跳过期后会被接管
        if let Err(e) = self.worker_repo.relinquish_ticker(&self.worker_name).await {
            error!("让出Ticker身份失败: {}", e);
        }
    }
}
