use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use jobq_core::{models::Task, SchedulerResult};

/// 候选Worker及其当前负载
#[derive(Debug, Clone)]
pub struct CandidateWorker {
    pub name: String,
    /// 当前ASSIGNED/RUNNING的任务数
    pub active_tasks: i64,
}

/// 任务分配策略
///
/// 候选列表已按分组交集过滤，策略只负责在其中挑选一个，
/// 避免任何单个Worker被饿死。
#[async_trait]
pub trait AssignStrategy: Send + Sync {
    async fn select_worker(
        &self,
        task: &Task,
        candidates: &[CandidateWorker],
    ) -> SchedulerResult<Option<String>>;

    fn name(&self) -> &str;
}

pub struct RoundRobinStrategy {
    counter: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AssignStrategy for RoundRobinStrategy {
    async fn select_worker(
        &self,
        task: &Task,
        candidates: &[CandidateWorker],
    ) -> SchedulerResult<Option<String>> {
        if candidates.is_empty() {
            debug!("任务 {} 没有分组匹配的可用Worker", task.id);
            return Ok(None);
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        let selected = &candidates[index];

        debug!(
            "轮询策略选择Worker: {} (索引: {}/{})",
            selected.name,
            index,
            candidates.len()
        );
        Ok(Some(selected.name.clone()))
    }

    fn name(&self) -> &str {
        "round_robin"
    }
}

pub struct LeastLoadedStrategy;

impl LeastLoadedStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LeastLoadedStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AssignStrategy for LeastLoadedStrategy {
    async fn select_worker(
        &self,
        task: &Task,
        candidates: &[CandidateWorker],
    ) -> SchedulerResult<Option<String>> {
        if candidates.is_empty() {
            debug!("任务 {} 没有分组匹配的可用Worker", task.id);
            return Ok(None);
        }
        // 负载相同按名称取先，保持确定性
        let selected = candidates
            .iter()
            .min_by(|a, b| a.active_tasks.cmp(&b.active_tasks).then(a.name.cmp(&b.name)))
            .unwrap();

        debug!(
            "最小负载策略选择Worker: {} (负载: {})",
            selected.name, selected.active_tasks
        );
        Ok(Some(selected.name.clone()))
    }

    fn name(&self) -> &str {
        "least_loaded"
    }
}

/// 按配置名构造策略
pub fn strategy_from_name(name: &str) -> Option<Arc<dyn AssignStrategy>> {
    match name {
        "round_robin" => Some(Arc::new(RoundRobinStrategy::new())),
        "least_loaded" => Some(Arc::new(LeastLoadedStrategy::new())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobq_core::models::QueueOptions;

    fn candidates(loads: &[(&str, i64)]) -> Vec<CandidateWorker> {
        loads
            .iter()
            .map(|(name, active_tasks)| CandidateWorker {
                name: name.to_string(),
                active_tasks: *active_tasks,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_round_robin_cycles_through_workers() {
        let strategy = RoundRobinStrategy::new();
        let task = Task::new("t", "noop", QueueOptions::default());
        let pool = candidates(&[("w1", 0), ("w2", 0), ("w3", 0)]);

        let mut picked = Vec::new();
        for _ in 0..6 {
            picked.push(strategy.select_worker(&task, &pool).await.unwrap().unwrap());
        }
        assert_eq!(picked, vec!["w1", "w2", "w3", "w1", "w2", "w3"]);
    }

    #[tokio::test]
    async fn test_least_loaded_picks_minimum() {
        let strategy = LeastLoadedStrategy::new();
        let task = Task::new("t", "noop", QueueOptions::default());
        let pool = candidates(&[("w1", 3), ("w2", 1), ("w3", 2)]);

        let picked = strategy.select_worker(&task, &pool).await.unwrap();
        assert_eq!(picked.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn test_empty_candidates() {
        let strategy = RoundRobinStrategy::new();
        let task = Task::new("t", "noop", QueueOptions::default());
        assert_eq!(strategy.select_worker(&task, &[]).await.unwrap(), None);
    }

    #[test]
    fn test_strategy_from_name() {
        assert!(strategy_from_name("round_robin").is_some());
        assert!(strategy_from_name("least_loaded").is_some());
        assert!(strategy_from_name("priority").is_none());
    }
}
