use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration, Utc};

use jobq_core::{
    models::{QueueOptions, RunStatus, Task, TaskStatus, Worker},
    traits::{RunRepository, TaskRepository, WorkerRepository},
};
use jobq_infrastructure::{MemoryRunRepository, MemoryTaskRepository, MemoryWorkerRepository};
use jobq_worker::{SubprocessExecutor, WorkerService, WorkerStats};

struct Harness {
    task_repo: Arc<MemoryTaskRepository>,
    run_repo: Arc<MemoryRunRepository>,
    worker_repo: Arc<MemoryWorkerRepository>,
    stats: Arc<WorkerStats>,
}

impl Harness {
    fn new() -> Self {
        Self {
            task_repo: Arc::new(MemoryTaskRepository::new()),
            run_repo: Arc::new(MemoryRunRepository::new()),
            worker_repo: Arc::new(MemoryWorkerRepository::new()),
            stats: Arc::new(WorkerStats::new()),
        }
    }

    /// 用固定shell命令替代runner子进程
    fn service(&self, script: &str) -> WorkerService {
        let executor = Arc::new(SubprocessExecutor::new(
            PathBuf::from("/bin/sh"),
            vec!["-c".to_string(), script.to_string()],
        ));
        WorkerService::new(
            "w1".to_string(),
            self.task_repo.clone(),
            self.run_repo.clone(),
            self.worker_repo.clone(),
            executor,
            vec!["main".to_string()],
            1,
            self.stats.clone(),
        )
    }

    async fn queue_task(&self, options: QueueOptions) -> Task {
        let now = Utc::now();
        let mut task = Task::new("t", "noop", options);
        task.start_time = now - Duration::minutes(5);
        task.next_run_time = now - Duration::minutes(1);
        self.task_repo.create(&task).await.unwrap()
    }

    async fn assign(&self, task_id: i64) {
        assert!(self
            .task_repo
            .try_assign(task_id, "w1", Utc::now())
            .await
            .unwrap());
    }
}

#[tokio::test]
async fn test_no_assigned_task_is_noop() {
    let h = Harness::new();
    let service = h.service("true");
    assert!(service.claim_and_execute_once().await.unwrap().is_none());
}

#[tokio::test]
async fn test_claimed_task_runs_and_records() {
    let h = Harness::new();
    h.worker_repo
        .register(&Worker::new("w1", vec!["main".to_string()]))
        .await
        .unwrap();
    let task = h
        .queue_task(QueueOptions {
            repeats: 1,
            ..Default::default()
        })
        .await;
    h.assign(task.id).await;

    let service = h.service("echo done");
    assert!(service.claim_and_execute_once().await.unwrap().is_some());

    // 运行记录完整收尾
    let run = h.run_repo.get_latest_for_task(task.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.worker_name, "w1");
    assert!(run.stop_time.is_some());
    assert!(run.output.unwrap().contains("done"));

    // repeats=1：一次成功即进入终止态
    let stored = h.task_repo.get_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert_eq!(stored.times_run, 1);
    assert!(stored.assigned_worker.is_none());
    assert_eq!(h.stats.snapshot(), (1, 0));
}

#[tokio::test]
async fn test_period_task_runs_three_times_then_stops() {
    let h = Harness::new();
    h.worker_repo
        .register(&Worker::new("w1", vec!["main".to_string()]))
        .await
        .unwrap();
    let task = h
        .queue_task(QueueOptions {
            period_seconds: 60,
            repeats: 3,
            ..Default::default()
        })
        .await;

    let service = h.service("echo ok");
    for round in 1..=3 {
        h.assign(task.id).await;
        service.claim_and_execute_once().await.unwrap().unwrap();
        let stored = h.task_repo.get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(stored.times_run, round);
        if round < 3 {
            // 周期任务按period重排回队列
            assert_eq!(stored.status, TaskStatus::Queued);
            assert!(stored.next_run_time > Utc::now() + Duration::seconds(30));
        }
    }

    // 第三次成功后任务不再被分配
    let stored = h.task_repo.get_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert_eq!(stored.times_run, 3);
    assert!(!h
        .task_repo
        .try_assign(task.id, "w1", Utc::now())
        .await
        .unwrap());
    assert_eq!(h.stats.snapshot(), (3, 0));
}

#[tokio::test]
async fn test_failure_retried_then_marked_failed() {
    let h = Harness::new();
    h.worker_repo
        .register(&Worker::new("w1", vec!["main".to_string()]))
        .await
        .unwrap();
    let task = h
        .queue_task(QueueOptions {
            retry_failed: 1,
            ..Default::default()
        })
        .await;

    let service = h.service("echo nope >&2; exit 1");

    // 第一次失败：还在重试配额内，重新入队
    h.assign(task.id).await;
    service.claim_and_execute_once().await.unwrap().unwrap();
    let stored = h.task_repo.get_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Queued);
    assert_eq!(stored.times_failed, 1);

    // 第二次失败：配额耗尽，停在FAILED
    h.assign(task.id).await;
    service.claim_and_execute_once().await.unwrap().unwrap();
    let stored = h.task_repo.get_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.times_failed, 2);

    let run = h.run_repo.get_latest_for_task(task.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.output.unwrap().contains("nope"));
    assert_eq!(h.stats.snapshot(), (2, 2));
}

#[tokio::test]
async fn test_timeout_recorded_on_run() {
    let h = Harness::new();
    h.worker_repo
        .register(&Worker::new("w1", vec!["main".to_string()]))
        .await
        .unwrap();
    let task = h
        .queue_task(QueueOptions {
            timeout_seconds: 1,
            ..Default::default()
        })
        .await;
    h.assign(task.id).await;

    let service = h.service("sleep 30");
    service.claim_and_execute_once().await.unwrap().unwrap();

    let run = h.run_repo.get_latest_for_task(task.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Timeout);
    let stored = h.task_repo.get_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Timeout);
}
