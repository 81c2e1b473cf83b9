//! 内存仓储实现
//!
//! 与PostgreSQL实现语义一致的进程内后端，用于嵌入式单进程运行
//! 和测试。条件更新在互斥锁内完成，保持"单写者胜出"的语义。

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use jobq_core::{
    models::{JobEdge, Run, RunStatus, Task, TaskFilter, TaskStatus, Worker, WorkerStatus},
    traits::{JobGraphRepository, RunRepository, TaskRepository, WorkerRepository},
    SchedulerError, SchedulerResult,
};

pub struct MemoryTaskRepository {
    tasks: Mutex<HashMap<i64, Task>>,
    next_id: AtomicI64,
}

impl MemoryTaskRepository {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }
}

#[async_trait]
impl TaskRepository for MemoryTaskRepository {
    async fn create(&self, task: &Task) -> SchedulerResult<Task> {
        let mut tasks = self.tasks.lock().unwrap();
        let mut created = task.clone();
        created.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        tasks.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<Task>> {
        Ok(self.tasks.lock().unwrap().get(&id).cloned())
    }

    async fn update(&self, task: &Task) -> SchedulerResult<()> {
        let mut tasks = self.tasks.lock().unwrap();
        if !tasks.contains_key(&task.id) {
            return Err(SchedulerError::TaskNotFound { id: task.id });
        }
        let mut updated = task.clone();
        updated.updated_at = Utc::now();
        tasks.insert(task.id, updated);
        Ok(())
    }

    async fn delete(&self, id: i64) -> SchedulerResult<()> {
        let mut tasks = self.tasks.lock().unwrap();
        tasks
            .remove(&id)
            .map(|_| ())
            .ok_or(SchedulerError::TaskNotFound { id })
    }

    async fn list(&self, filter: &TaskFilter) -> SchedulerResult<Vec<Task>> {
        let tasks = self.tasks.lock().unwrap();
        let mut selected: Vec<Task> = tasks
            .values()
            .filter(|t| filter.status.map_or(true, |s| t.status == s))
            .filter(|t| filter.enabled.map_or(true, |e| t.enabled == e))
            .filter(|t| {
                filter
                    .group
                    .as_ref()
                    .map_or(true, |g| t.group_name.contains(g))
            })
            .cloned()
            .collect();
        selected.sort_by_key(|t| t.id);
        if let Some(limit) = filter.limit {
            selected.truncate(limit as usize);
        }
        Ok(selected)
    }

    async fn get_due_tasks(&self, now: DateTime<Utc>, limit: i64) -> SchedulerResult<Vec<Task>> {
        let tasks = self.tasks.lock().unwrap();
        let mut due: Vec<Task> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Queued && t.enabled)
            .filter(|t| t.next_run_time <= now && t.start_time <= now)
            .filter(|t| t.stop_time.map_or(true, |stop| stop >= now))
            .filter(|t| !t.repeats_exhausted())
            .cloned()
            .collect();
        due.sort_by_key(|t| (t.next_run_time, t.id));
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn get_by_worker(&self, worker_name: &str) -> SchedulerResult<Vec<Task>> {
        let tasks = self.tasks.lock().unwrap();
        let mut held: Vec<Task> = tasks
            .values()
            .filter(|t| t.assigned_worker.as_deref() == Some(worker_name))
            .filter(|t| matches!(t.status, TaskStatus::Assigned | TaskStatus::Running))
            .cloned()
            .collect();
        held.sort_by_key(|t| t.id);
        Ok(held)
    }

    async fn assigned_counts(&self) -> SchedulerResult<HashMap<String, i64>> {
        let tasks = self.tasks.lock().unwrap();
        let mut counts = HashMap::new();
        for task in tasks.values() {
            if matches!(task.status, TaskStatus::Assigned | TaskStatus::Running) {
                if let Some(worker) = &task.assigned_worker {
                    *counts.entry(worker.clone()).or_insert(0) += 1;
                }
            }
        }
        Ok(counts)
    }

    async fn try_assign(
        &self,
        task_id: i64,
        worker_name: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let mut tasks = self.tasks.lock().unwrap();
        match tasks.get_mut(&task_id) {
            Some(task) if task.status == TaskStatus::Queued => {
                task.status = TaskStatus::Assigned;
                task.assigned_worker = Some(worker_name.to_string());
                task.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn try_start(&self, task_id: i64, worker_name: &str) -> SchedulerResult<bool> {
        let mut tasks = self.tasks.lock().unwrap();
        match tasks.get_mut(&task_id) {
            Some(task)
                if task.status == TaskStatus::Assigned
                    && task.assigned_worker.as_deref() == Some(worker_name) =>
            {
                task.status = TaskStatus::Running;
                task.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn try_transition(
        &self,
        task_id: i64,
        from: TaskStatus,
        to: TaskStatus,
    ) -> SchedulerResult<bool> {
        let mut tasks = self.tasks.lock().unwrap();
        match tasks.get_mut(&task_id) {
            Some(task) if task.status == from => {
                task.status = to;
                task.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reclaim_from_worker(
        &self,
        worker_name: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<Task>> {
        let mut tasks = self.tasks.lock().unwrap();
        let mut reclaimed = Vec::new();
        for task in tasks.values_mut() {
            if task.assigned_worker.as_deref() == Some(worker_name)
                && matches!(task.status, TaskStatus::Assigned | TaskStatus::Running)
            {
                task.status = TaskStatus::Queued;
                task.assigned_worker = None;
                task.times_failed += 1;
                task.next_run_time = now;
                task.updated_at = now;
                reclaimed.push(task.clone());
            }
        }
        reclaimed.sort_by_key(|t| t.id);
        Ok(reclaimed)
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> SchedulerResult<u64> {
        let mut tasks = self.tasks.lock().unwrap();
        let mut expired = 0;
        for task in tasks.values_mut() {
            if matches!(task.status, TaskStatus::Queued | TaskStatus::Assigned)
                && task.stop_time.is_some_and(|stop| stop < now)
            {
                task.status = TaskStatus::Expired;
                task.assigned_worker = None;
                task.updated_at = now;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn arm_reboot_tasks(&self, now: DateTime<Utc>) -> SchedulerResult<u64> {
        let mut tasks = self.tasks.lock().unwrap();
        let mut armed = 0;
        for task in tasks.values_mut() {
            if task.is_reboot()
                && task.status == TaskStatus::Queued
                && task.times_run == 0
                && task.enabled
            {
                task.next_run_time = now;
                task.updated_at = now;
                armed += 1;
            }
        }
        Ok(armed)
    }

    async fn set_enabled(&self, task_id: i64, enabled: bool) -> SchedulerResult<()> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(SchedulerError::TaskNotFound { id: task_id })?;
        task.enabled = enabled;
        task.updated_at = Utc::now();
        Ok(())
    }
}

pub struct MemoryRunRepository {
    runs: Mutex<HashMap<i64, Run>>,
    next_id: AtomicI64,
}

impl MemoryRunRepository {
    pub fn new() -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }
}

#[async_trait]
impl RunRepository for MemoryRunRepository {
    async fn create(&self, run: &Run) -> SchedulerResult<Run> {
        let mut runs = self.runs.lock().unwrap();
        let mut created = run.clone();
        created.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        runs.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<Run>> {
        Ok(self.runs.lock().unwrap().get(&id).cloned())
    }

    async fn finish(
        &self,
        id: i64,
        status: RunStatus,
        stop_time: DateTime<Utc>,
        output: Option<&str>,
        result: Option<&serde_json::Value>,
        error_message: Option<&str>,
    ) -> SchedulerResult<()> {
        let mut runs = self.runs.lock().unwrap();
        let run = runs.get_mut(&id).ok_or(SchedulerError::RunNotFound { id })?;
        run.status = status;
        run.stop_time = Some(stop_time);
        run.output = output.map(|s| s.to_string());
        run.result = result.cloned();
        run.error_message = error_message.map(|s| s.to_string());
        Ok(())
    }

    async fn get_latest_for_task(&self, task_id: i64) -> SchedulerResult<Option<Run>> {
        let runs = self.runs.lock().unwrap();
        Ok(runs
            .values()
            .filter(|r| r.task_id == task_id)
            .max_by_key(|r| r.id)
            .cloned())
    }

    async fn get_recent_runs(&self, task_id: i64, limit: i64) -> SchedulerResult<Vec<Run>> {
        let runs = self.runs.lock().unwrap();
        let mut recent: Vec<Run> = runs.values().filter(|r| r.task_id == task_id).cloned().collect();
        recent.sort_by_key(|r| std::cmp::Reverse(r.id));
        recent.truncate(limit as usize);
        Ok(recent)
    }

    async fn get_running_by_worker(&self, worker_name: &str) -> SchedulerResult<Vec<Run>> {
        let runs = self.runs.lock().unwrap();
        let mut running: Vec<Run> = runs
            .values()
            .filter(|r| r.worker_name == worker_name && r.status == RunStatus::Running)
            .cloned()
            .collect();
        running.sort_by_key(|r| r.id);
        Ok(running)
    }

    async fn cleanup_old_runs(&self, days: i64) -> SchedulerResult<u64> {
        let cutoff = Utc::now() - Duration::days(days);
        let mut runs = self.runs.lock().unwrap();
        let before = runs.len();
        runs.retain(|_, r| {
            r.status == RunStatus::Running || r.stop_time.map_or(true, |stop| stop >= cutoff)
        });
        Ok((before - runs.len()) as u64)
    }
}

#[derive(Default)]
pub struct MemoryWorkerRepository {
    workers: Mutex<HashMap<String, Worker>>,
}

impl MemoryWorkerRepository {
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl WorkerRepository for MemoryWorkerRepository {
    async fn register(&self, worker: &Worker) -> SchedulerResult<()> {
        let mut workers = self.workers.lock().unwrap();
        match workers.get_mut(&worker.name) {
            Some(existing) => {
                existing.group_names = worker.group_names.clone();
                existing.status = worker.status;
                existing.last_heartbeat = worker.last_heartbeat;
            }
            None => {
                workers.insert(worker.name.clone(), worker.clone());
            }
        }
        Ok(())
    }

    async fn unregister(&self, name: &str) -> SchedulerResult<()> {
        self.workers.lock().unwrap().remove(name);
        Ok(())
    }

    async fn get_by_name(&self, name: &str) -> SchedulerResult<Option<Worker>> {
        Ok(self.workers.lock().unwrap().get(name).cloned())
    }

    async fn list(&self) -> SchedulerResult<Vec<Worker>> {
        let workers = self.workers.lock().unwrap();
        let mut all: Vec<Worker> = workers.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    async fn list_alive(
        &self,
        now: DateTime<Utc>,
        stale_after_seconds: i64,
    ) -> SchedulerResult<Vec<Worker>> {
        let workers = self.workers.lock().unwrap();
        let mut alive: Vec<Worker> = workers
            .values()
            .filter(|w| !w.is_stale(now, stale_after_seconds))
            .cloned()
            .collect();
        alive.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(alive)
    }

    async fn list_stale(
        &self,
        now: DateTime<Utc>,
        stale_after_seconds: i64,
    ) -> SchedulerResult<Vec<Worker>> {
        let workers = self.workers.lock().unwrap();
        let mut stale: Vec<Worker> = workers
            .values()
            .filter(|w| w.is_stale(now, stale_after_seconds))
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(stale)
    }

    async fn heartbeat(
        &self,
        name: &str,
        now: DateTime<Utc>,
        tasks_run: i64,
        tasks_failed: i64,
    ) -> SchedulerResult<bool> {
        let mut workers = self.workers.lock().unwrap();
        match workers.get_mut(name) {
            Some(worker) => {
                worker.last_heartbeat = now;
                worker.tasks_run = tasks_run;
                worker.tasks_failed = tasks_failed;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update_status(&self, name: &str, status: WorkerStatus) -> SchedulerResult<()> {
        let mut workers = self.workers.lock().unwrap();
        let worker = workers.get_mut(name).ok_or_else(|| SchedulerError::WorkerNotFound {
            name: name.to_string(),
        })?;
        worker.status = status;
        Ok(())
    }

    async fn try_acquire_ticker(
        &self,
        name: &str,
        now: DateTime<Utc>,
        stale_after_seconds: i64,
    ) -> SchedulerResult<bool> {
        let mut workers = self.workers.lock().unwrap();

        // 降级心跳过期的旧Ticker
        for worker in workers.values_mut() {
            if worker.is_ticker && worker.is_stale(now, stale_after_seconds) {
                worker.is_ticker = false;
            }
        }

        let other_live_ticker = workers
            .values()
            .any(|w| w.is_ticker && w.name != name && !w.is_stale(now, stale_after_seconds));
        if other_live_ticker {
            return Ok(false);
        }

        match workers.get_mut(name) {
            Some(worker) => {
                worker.is_ticker = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn relinquish_ticker(&self, name: &str) -> SchedulerResult<()> {
        let mut workers = self.workers.lock().unwrap();
        if let Some(worker) = workers.get_mut(name) {
            worker.is_ticker = false;
        }
        Ok(())
    }
}

pub struct MemoryJobGraphRepository {
    edges: Mutex<Vec<JobEdge>>,
    next_id: AtomicI64,
}

impl MemoryJobGraphRepository {
    pub fn new() -> Self {
        Self {
            edges: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
        }
    }
}

#[async_trait]
impl JobGraphRepository for MemoryJobGraphRepository {
    async fn add_edge(&self, parent_task_id: i64, child_task_id: i64) -> SchedulerResult<JobEdge> {
        let mut edges = self.edges.lock().unwrap();
        if let Some(existing) = edges
            .iter()
            .find(|e| e.parent_task_id == parent_task_id && e.child_task_id == child_task_id)
        {
            return Ok(existing.clone());
        }
        let mut edge = JobEdge::new(parent_task_id, child_task_id);
        edge.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        edges.push(edge.clone());
        Ok(edge)
    }

    async fn remove_edge(&self, parent_task_id: i64, child_task_id: i64) -> SchedulerResult<bool> {
        let mut edges = self.edges.lock().unwrap();
        let before = edges.len();
        edges.retain(|e| !(e.parent_task_id == parent_task_id && e.child_task_id == child_task_id));
        Ok(edges.len() < before)
    }

    async fn list_edges(&self) -> SchedulerResult<Vec<JobEdge>> {
        Ok(self.edges.lock().unwrap().clone())
    }

    async fn parents_of(&self, task_id: i64) -> SchedulerResult<Vec<i64>> {
        let edges = self.edges.lock().unwrap();
        let mut parents: Vec<i64> = edges
            .iter()
            .filter(|e| e.child_task_id == task_id)
            .map(|e| e.parent_task_id)
            .collect();
        parents.sort_unstable();
        Ok(parents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobq_core::models::QueueOptions;

    #[tokio::test]
    async fn test_try_assign_single_winner() {
        let repo = MemoryTaskRepository::new();
        let task = repo
            .create(&Task::new("t", "noop", QueueOptions::default()))
            .await
            .unwrap();
        let now = Utc::now();

        assert!(repo.try_assign(task.id, "w1", now).await.unwrap());
        // 第二个竞争者必须输掉
        assert!(!repo.try_assign(task.id, "w2", now).await.unwrap());

        let stored = repo.get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Assigned);
        assert_eq!(stored.assigned_worker.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_due_tasks_deterministic_order() {
        let repo = MemoryTaskRepository::new();
        let now = Utc::now();
        for _ in 0..3 {
            let mut t = Task::new("t", "noop", QueueOptions::default());
            t.start_time = now - Duration::minutes(5);
            t.next_run_time = now - Duration::minutes(1);
            repo.create(&t).await.unwrap();
        }
        let due = repo.get_due_tasks(now, 10).await.unwrap();
        let ids: Vec<i64> = due.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_reclaim_increments_times_failed() {
        let repo = MemoryTaskRepository::new();
        let now = Utc::now();
        let task = repo
            .create(&Task::new("t", "noop", QueueOptions::default()))
            .await
            .unwrap();
        repo.try_assign(task.id, "w1", now).await.unwrap();
        repo.try_start(task.id, "w1").await.unwrap();

        let reclaimed = repo.reclaim_from_worker("w1", now).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].status, TaskStatus::Queued);
        assert_eq!(reclaimed[0].times_failed, 1);
        assert!(reclaimed[0].assigned_worker.is_none());
    }

    #[tokio::test]
    async fn test_ticker_election_exclusive() {
        let repo = MemoryWorkerRepository::new();
        let now = Utc::now();
        repo.register(&Worker::new("w1", vec!["main".to_string()]))
            .await
            .unwrap();
        repo.register(&Worker::new("w2", vec!["main".to_string()]))
            .await
            .unwrap();

        assert!(repo.try_acquire_ticker("w1", now, 9).await.unwrap());
        assert!(!repo.try_acquire_ticker("w2", now, 9).await.unwrap());
        // 已持有者重复抢占保持身份
        assert!(repo.try_acquire_ticker("w1", now, 9).await.unwrap());

        let tickers: Vec<String> = repo
            .list()
            .await
            .unwrap()
            .into_iter()
            .filter(|w| w.is_ticker)
            .map(|w| w.name)
            .collect();
        assert_eq!(tickers, vec!["w1"]);
    }

    #[tokio::test]
    async fn test_stale_ticker_superseded() {
        let repo = MemoryWorkerRepository::new();
        let now = Utc::now();
        let mut old = Worker::new("old", vec!["main".to_string()]);
        old.last_heartbeat = now - Duration::seconds(60);
        repo.register(&old).await.unwrap();
        // register保留调用方的last_heartbeat
        assert!(repo.try_acquire_ticker("old", now - Duration::seconds(55), 9).await.unwrap());

        repo.register(&Worker::new("fresh", vec!["main".to_string()]))
            .await
            .unwrap();
        // 旧Ticker心跳已过期，新Worker应当接管
        assert!(repo.try_acquire_ticker("fresh", now, 9).await.unwrap());
        let old_row = repo.get_by_name("old").await.unwrap().unwrap();
        assert!(!old_row.is_ticker);
    }
}
