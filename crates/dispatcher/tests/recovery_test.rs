use std::sync::Arc;

use chrono::{Duration, Utc};

use jobq_core::{
    models::{QueueOptions, Run, RunStatus, Task, TaskStatus, Worker},
    traits::{RunRepository, TaskRepository, WorkerRepository},
};
use jobq_dispatcher::{RecoveryConfig, RecoveryService};
use jobq_infrastructure::{MemoryRunRepository, MemoryTaskRepository, MemoryWorkerRepository};

const STALE_AFTER: i64 = 9;

fn recovery(
    task_repo: &Arc<MemoryTaskRepository>,
    run_repo: &Arc<MemoryRunRepository>,
    worker_repo: &Arc<MemoryWorkerRepository>,
) -> RecoveryService {
    RecoveryService::new(
        task_repo.clone(),
        run_repo.clone(),
        worker_repo.clone(),
        RecoveryConfig {
            stale_after_seconds: STALE_AFTER,
        },
    )
}

async fn running_task_on(
    task_repo: &Arc<MemoryTaskRepository>,
    worker_name: &str,
    retry_failed: i32,
) -> Task {
    let now = Utc::now();
    let options = QueueOptions {
        retry_failed,
        ..Default::default()
    };
    let mut task = Task::new("t", "noop", options);
    task.start_time = now - Duration::minutes(5);
    task.next_run_time = now - Duration::minutes(1);
    let task = task_repo.create(&task).await.unwrap();
    task_repo.try_assign(task.id, worker_name, now).await.unwrap();
    task_repo.try_start(task.id, worker_name).await.unwrap();
    task_repo.get_by_id(task.id).await.unwrap().unwrap()
}

#[tokio::test]
async fn test_stale_worker_task_requeued() {
    let task_repo = Arc::new(MemoryTaskRepository::new());
    let run_repo = Arc::new(MemoryRunRepository::new());
    let worker_repo = Arc::new(MemoryWorkerRepository::new());

    let now = Utc::now();
    let mut dead = Worker::new("dead", vec!["main".to_string()]);
    dead.last_heartbeat = now - Duration::seconds(STALE_AFTER + 30);
    worker_repo.register(&dead).await.unwrap();

    let task = running_task_on(&task_repo, "dead", 3).await;
    let run = run_repo
        .create(&Run::started(task.id, "dead", now - Duration::minutes(1)))
        .await
        .unwrap();

    let service = recovery(&task_repo, &run_repo, &worker_repo);
    let report = service.reclaim_stale_workers(now).await.unwrap();

    assert_eq!(report.requeued, vec![task.id]);
    assert!(report.failed.is_empty());
    assert_eq!(report.removed_workers, vec!["dead"]);

    // 任务回到QUEUED，失败计数加一
    let stored = task_repo.get_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Queued);
    assert_eq!(stored.times_failed, 1);
    assert!(stored.assigned_worker.is_none());

    // 孤儿运行记录收尾为FAILED，不会永远停在RUNNING
    let stored_run = run_repo.get_by_id(run.id).await.unwrap().unwrap();
    assert_eq!(stored_run.status, RunStatus::Failed);
    assert!(stored_run.stop_time.is_some());

    // Worker行被清除
    assert!(worker_repo.get_by_name("dead").await.unwrap().is_none());
}

#[tokio::test]
async fn test_retry_quota_exhausted_marks_failed() {
    let task_repo = Arc::new(MemoryTaskRepository::new());
    let run_repo = Arc::new(MemoryRunRepository::new());
    let worker_repo = Arc::new(MemoryWorkerRepository::new());

    let now = Utc::now();
    let mut dead = Worker::new("dead", vec!["main".to_string()]);
    dead.last_heartbeat = now - Duration::seconds(STALE_AFTER + 30);
    worker_repo.register(&dead).await.unwrap();

    // retry_failed=0：回收即耗尽配额
    let task = running_task_on(&task_repo, "dead", 0).await;

    let service = recovery(&task_repo, &run_repo, &worker_repo);
    let report = service.reclaim_stale_workers(now).await.unwrap();

    assert!(report.requeued.is_empty());
    assert_eq!(report.failed, vec![task.id]);

    let stored = task_repo.get_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
}

#[tokio::test]
async fn test_fresh_worker_left_alone() {
    let task_repo = Arc::new(MemoryTaskRepository::new());
    let run_repo = Arc::new(MemoryRunRepository::new());
    let worker_repo = Arc::new(MemoryWorkerRepository::new());

    let now = Utc::now();
    worker_repo
        .register(&Worker::new("alive", vec!["main".to_string()]))
        .await
        .unwrap();
    let task = running_task_on(&task_repo, "alive", 3).await;

    let service = recovery(&task_repo, &run_repo, &worker_repo);
    let report = service.reclaim_stale_workers(now).await.unwrap();

    assert!(report.removed_workers.is_empty());
    let stored = task_repo.get_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Running);
    assert_eq!(stored.assigned_worker.as_deref(), Some("alive"));
}
