//! 任务依赖图校验
//!
//! 边的含义：child必须等parent最近一次运行COMPLETED之后才可分配。
//! 环检测发生在插边之前：从候选child沿既有边做深度优先遍历，能走
//! 回候选parent即说明新边会闭合成环，拒绝且不落任何变更。

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use jobq_core::{
    models::JobEdge,
    traits::{JobGraphRepository, RunRepository},
    SchedulerError, SchedulerResult,
};

/// 内存中的依赖图快照，parent → children邻接表
#[derive(Debug, Default)]
pub struct JobGraph {
    children: HashMap<i64, Vec<i64>>,
}

impl JobGraph {
    pub fn from_edges(edges: &[JobEdge]) -> Self {
        let mut children: HashMap<i64, Vec<i64>> = HashMap::new();
        for edge in edges {
            children
                .entry(edge.parent_task_id)
                .or_default()
                .push(edge.child_task_id);
        }
        Self { children }
    }

    /// 深度优先查找from到to的路径
    pub fn find_path(&self, from: i64, to: i64) -> Option<Vec<i64>> {
        let mut path = vec![from];
        if self.dfs_path(from, to, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn dfs_path(&self, current: i64, target: i64, path: &mut Vec<i64>) -> bool {
        if current == target {
            return true;
        }
        if let Some(next_nodes) = self.children.get(&current) {
            for &next in next_nodes {
                if path.contains(&next) {
                    continue;
                }
                path.push(next);
                if self.dfs_path(next, target, path) {
                    return true;
                }
                path.pop();
            }
        }
        false
    }

    /// 校验整个图无环，发现环时报出具体路径
    pub fn validate(&self) -> SchedulerResult<()> {
        for &start in self.children.keys() {
            let mut path = vec![start];
            if let Some(cycle) = self.find_cycle_from(start, &mut path) {
                return Err(SchedulerError::CircularDependency(describe_cycle(&cycle)));
            }
        }
        Ok(())
    }

    fn find_cycle_from(&self, current: i64, path: &mut Vec<i64>) -> Option<Vec<i64>> {
        if let Some(next_nodes) = self.children.get(&current) {
            for &next in next_nodes {
                if let Some(position) = path.iter().position(|&n| n == next) {
                    let mut cycle = path[position..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                path.push(next);
                if let Some(cycle) = self.find_cycle_from(next, path) {
                    return Some(cycle);
                }
                path.pop();
            }
        }
        None
    }
}

fn describe_cycle(cycle: &[i64]) -> String {
    cycle
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// 依赖校验器
///
/// 插边前做环检测；分配前检查任务的全部父任务是否都已COMPLETED。
pub struct DependencyChecker {
    graph_repo: Arc<dyn JobGraphRepository>,
    run_repo: Arc<dyn RunRepository>,
}

impl DependencyChecker {
    pub fn new(graph_repo: Arc<dyn JobGraphRepository>, run_repo: Arc<dyn RunRepository>) -> Self {
        Self {
            graph_repo,
            run_repo,
        }
    }

    /// 插入依赖边，成环时拒绝且不产生任何变更
    pub async fn add_deps(&self, parent_task_id: i64, child_task_id: i64) -> SchedulerResult<JobEdge> {
        if parent_task_id == child_task_id {
            return Err(SchedulerError::CircularDependency(format!(
                "{parent_task_id} -> {parent_task_id}"
            )));
        }

        let edges = self.graph_repo.list_edges().await?;
        let graph = JobGraph::from_edges(&edges);
        // 候选child沿既有边能走回候选parent，则新边parent→child闭环
        if let Some(mut path) = graph.find_path(child_task_id, parent_task_id) {
            path.push(child_task_id);
            let cycle = describe_cycle(&path);
            warn!(
                "拒绝依赖边 {} -> {}，将形成环: {}",
                parent_task_id, child_task_id, cycle
            );
            return Err(SchedulerError::CircularDependency(cycle));
        }

        self.graph_repo.add_edge(parent_task_id, child_task_id).await
    }

    /// 校验已持久化的边集合无环
    pub async fn validate(&self) -> SchedulerResult<()> {
        let edges = self.graph_repo.list_edges().await?;
        JobGraph::from_edges(&edges).validate()
    }

    /// 任务是否被未满足的依赖阻塞
    ///
    /// 父任务从未运行或最近一次运行非COMPLETED都算阻塞；
    /// FAILED的父任务会无限期阻塞子任务，直到操作员介入。
    pub async fn is_blocked(&self, task_id: i64) -> SchedulerResult<bool> {
        let parents = self.graph_repo.parents_of(task_id).await?;
        for parent_id in parents {
            match self.run_repo.get_latest_for_task(parent_id).await? {
                Some(run) if run.is_successful() => continue,
                Some(run) => {
                    debug!(
                        "任务 {} 被父任务 {} 阻塞（最近运行状态 {:?}）",
                        task_id, parent_id, run.status
                    );
                    return Ok(true);
                }
                None => {
                    debug!("任务 {} 被从未运行的父任务 {} 阻塞", task_id, parent_id);
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}
