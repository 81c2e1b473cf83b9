use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{error, info};

use jobq_core::{AppConfig, FunctionRegistry};
use jobq_dispatcher::{strategy_from_name, Ticker};
use jobq_infrastructure::{
    create_pool, PostgresJobGraphRepository, PostgresRunRepository, PostgresTaskRepository,
    PostgresWorkerRepository,
};
use jobq_worker::{default_worker_name, HeartbeatManager, SubprocessExecutor, WorkerService, WorkerStats};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// Worker + Ticker竞选（默认）
    All,
    /// 仅Worker，不参与Ticker竞选
    Worker,
}

/// 主应用程序：装配仓储、Worker、心跳与Ticker
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    registry: Arc<FunctionRegistry>,
}

impl Application {
    pub fn new(config: AppConfig, mode: AppMode, registry: Arc<FunctionRegistry>) -> Self {
        Self {
            config,
            mode,
            registry,
        }
    }

    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("初始化应用程序，模式: {:?}", self.mode);
        if self.registry.is_empty() {
            info!("注册表为空，任何入队请求都会被拒绝");
        }

        let pool = create_pool(&self.config.database)
            .await
            .context("连接数据库失败")?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("运行数据库迁移失败")?;

        let task_repo = Arc::new(PostgresTaskRepository::new(pool.clone()));
        let run_repo = Arc::new(PostgresRunRepository::new(pool.clone()));
        let worker_repo = Arc::new(PostgresWorkerRepository::new(pool.clone()));
        let graph_repo = Arc::new(PostgresJobGraphRepository::new(pool.clone()));

        let worker_name = self
            .config
            .worker
            .name
            .clone()
            .unwrap_or_else(default_worker_name);
        let stats = Arc::new(WorkerStats::new());
        let executor = Arc::new(SubprocessExecutor::current_exe()?);

        let worker_service = Arc::new(WorkerService::new(
            worker_name.clone(),
            task_repo.clone(),
            run_repo.clone(),
            worker_repo.clone(),
            executor,
            self.config.worker.group_names.clone(),
            self.config.worker.poll_interval_seconds,
            stats.clone(),
        ));
        worker_service.register().await?;

        // 心跳独立于任务执行，慢任务不会饿死存活上报
        let heartbeat = HeartbeatManager::new(
            worker_name.clone(),
            self.config.worker.group_names.clone(),
            worker_repo.clone(),
            self.config.worker.heartbeat_interval_seconds,
            stats.clone(),
        );
        let heartbeat_handle = heartbeat.spawn(shutdown_rx.resubscribe());

        let mut handles = vec![heartbeat_handle];

        if self.mode == AppMode::All {
            let strategy = strategy_from_name(&self.config.ticker.strategy)
                .context("无效的分配策略")?;
            let ticker = Ticker::new(
                worker_name.clone(),
                task_repo.clone(),
                run_repo.clone(),
                worker_repo.clone(),
                graph_repo.clone(),
                strategy,
                self.config.ticker.clone(),
                self.config.stale_after_seconds(),
            );
            let ticker_rx = shutdown_rx.resubscribe();
            handles.push(tokio::spawn(async move {
                ticker.run_loop(ticker_rx).await;
            }));
        }

        let worker_rx = shutdown_rx.resubscribe();
        let worker = Arc::clone(&worker_service);
        handles.push(tokio::spawn(async move {
            if let Err(e) = worker.run_loop(worker_rx).await {
                error!("Worker主循环退出异常: {}", e);
            }
        }));

        info!("Worker {} 已启动", worker_name);
        for handle in handles {
            let _ = handle.await;
        }
        info!("所有组件已停止");
        Ok(())
    }
}
