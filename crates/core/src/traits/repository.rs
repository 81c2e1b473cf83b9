//! 数据仓储层接口定义
//!
//! 仓储是整个集群唯一的权威状态；进程内存里的任何副本都只是
//! 缓存，每个轮询周期重新拉取。跨Worker的每一次状态流转都必须
//! 是"带前置状态校验的单条条件更新"：两个并发写入者中只有一个
//! 能命中行，输掉的一方在下个周期重试即可，不产生错误。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{JobEdge, Run, RunStatus, Task, TaskFilter, TaskStatus, Worker, WorkerStatus};
use crate::SchedulerResult;

/// 任务仓储接口
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// 创建任务并返回带数据库生成ID的实例
    async fn create(&self, task: &Task) -> SchedulerResult<Task>;

    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<Task>>;

    /// 整行更新，只应由当前持有任务的一方调用
    async fn update(&self, task: &Task) -> SchedulerResult<()>;

    async fn delete(&self, id: i64) -> SchedulerResult<()>;

    async fn list(&self, filter: &TaskFilter) -> SchedulerResult<Vec<Task>>;

    /// 到期可分配的任务
    ///
    /// 条件：QUEUED、enabled、窗口内、next_run_time <= now、
    /// repeats未耗尽。排序固定为 next_run_time ASC, id ASC，
    /// 同时到期时先入队者先被分配。
    async fn get_due_tasks(&self, now: DateTime<Utc>, limit: i64) -> SchedulerResult<Vec<Task>>;

    /// 绑定在指定Worker上的ASSIGNED/RUNNING任务
    async fn get_by_worker(&self, worker_name: &str) -> SchedulerResult<Vec<Task>>;

    /// 按Worker统计当前ASSIGNED/RUNNING任务数，供负载均衡
    async fn assigned_counts(&self) -> SchedulerResult<HashMap<String, i64>>;

    /// QUEUED→ASSIGNED并绑定Worker，竞争失败返回false
    async fn try_assign(
        &self,
        task_id: i64,
        worker_name: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    /// ASSIGNED→RUNNING，只有被绑定的Worker能赢得该行
    async fn try_start(&self, task_id: i64, worker_name: &str) -> SchedulerResult<bool>;

    /// 简单条件流转（如QUEUED→STOPPED），命中返回true
    async fn try_transition(
        &self,
        task_id: i64,
        from: TaskStatus,
        to: TaskStatus,
    ) -> SchedulerResult<bool>;

    /// 回收指定Worker持有的ASSIGNED/RUNNING任务
    ///
    /// 单条条件更新：重置为QUEUED、解除绑定、times_failed加一、
    /// next_run_time设为now，返回被回收的任务。重试配额是否耗尽
    /// 由调用方（恢复服务）检查并降级为FAILED。
    async fn reclaim_from_worker(
        &self,
        worker_name: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<Task>>;

    /// 把stop_time已过的QUEUED/ASSIGNED任务置为EXPIRED，返回影响行数
    async fn expire_overdue(&self, now: DateTime<Utc>) -> SchedulerResult<u64>;

    /// 武装尚未消费的@reboot任务（times_run=0）使其立即到期
    ///
    /// 只在协调器启动、Ticker首次当选时调用一次。
    async fn arm_reboot_tasks(&self, now: DateTime<Utc>) -> SchedulerResult<u64>;

    async fn set_enabled(&self, task_id: i64, enabled: bool) -> SchedulerResult<()>;
}

/// 运行记录仓储接口
#[async_trait]
pub trait RunRepository: Send + Sync {
    /// 记录一次执行的开始
    async fn create(&self, run: &Run) -> SchedulerResult<Run>;

    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<Run>>;

    /// 一次性写入完成信息，此后记录不再变化
    async fn finish(
        &self,
        id: i64,
        status: RunStatus,
        stop_time: DateTime<Utc>,
        output: Option<&str>,
        result: Option<&serde_json::Value>,
        error_message: Option<&str>,
    ) -> SchedulerResult<()>;

    /// 任务最近一次运行，依赖检查以此为准
    async fn get_latest_for_task(&self, task_id: i64) -> SchedulerResult<Option<Run>>;

    async fn get_recent_runs(&self, task_id: i64, limit: i64) -> SchedulerResult<Vec<Run>>;

    /// 指定Worker名下仍处于RUNNING的记录，回收时收尾用
    async fn get_running_by_worker(&self, worker_name: &str) -> SchedulerResult<Vec<Run>>;

    /// 清理已完成且超过保留天数的记录，返回删除数量
    async fn cleanup_old_runs(&self, days: i64) -> SchedulerResult<u64>;
}

/// Worker仓储接口
#[async_trait]
pub trait WorkerRepository: Send + Sync {
    /// 注册（或重新注册）本进程的Worker行
    async fn register(&self, worker: &Worker) -> SchedulerResult<()>;

    async fn unregister(&self, name: &str) -> SchedulerResult<()>;

    async fn get_by_name(&self, name: &str) -> SchedulerResult<Option<Worker>>;

    async fn list(&self) -> SchedulerResult<Vec<Worker>>;

    /// 心跳仍然新鲜的Worker
    async fn list_alive(
        &self,
        now: DateTime<Utc>,
        stale_after_seconds: i64,
    ) -> SchedulerResult<Vec<Worker>>;

    /// 心跳已超过阈值的Worker
    async fn list_stale(
        &self,
        now: DateTime<Utc>,
        stale_after_seconds: i64,
    ) -> SchedulerResult<Vec<Worker>>;

    /// 刷新心跳与累计统计；行不存在时返回false，调用方应重新注册
    async fn heartbeat(
        &self,
        name: &str,
        now: DateTime<Utc>,
        tasks_run: i64,
        tasks_failed: i64,
    ) -> SchedulerResult<bool>;

    /// 更新状态字段，也是操作员下发控制命令的通道
    async fn update_status(&self, name: &str, status: WorkerStatus) -> SchedulerResult<()>;

    /// Ticker选举：原子条件更新
    ///
    /// 先降级心跳过期的旧Ticker，再在"不存在其他存活Ticker"的
    /// 条件下抢占标志位，两步在同一事务内。返回本Worker当前是否
    /// 持有Ticker身份；对已持有者重复调用保持身份，天然幂等。
    async fn try_acquire_ticker(
        &self,
        name: &str,
        now: DateTime<Utc>,
        stale_after_seconds: i64,
    ) -> SchedulerResult<bool>;

    /// 主动让出Ticker身份
    async fn relinquish_ticker(&self, name: &str) -> SchedulerResult<()>;
}

/// 任务依赖边仓储接口
///
/// 环检测在插入前由依赖校验器完成，这里只负责边集合的存取。
#[async_trait]
pub trait JobGraphRepository: Send + Sync {
    async fn add_edge(&self, parent_task_id: i64, child_task_id: i64) -> SchedulerResult<JobEdge>;

    async fn remove_edge(&self, parent_task_id: i64, child_task_id: i64) -> SchedulerResult<bool>;

    async fn list_edges(&self) -> SchedulerResult<Vec<JobEdge>>;

    /// 指定任务的全部直接父任务ID
    async fn parents_of(&self, task_id: i64) -> SchedulerResult<Vec<i64>>;
}
