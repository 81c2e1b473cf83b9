use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use jobq::Coordinator;
use jobq_core::{
    models::{QueueOptions, Run, RunStatus, TaskStatus, Worker, WorkerStatus},
    reboot_sentinel,
    registry::{FunctionCall, FunctionRegistry},
    traits::{RunRepository, TaskRepository, WorkerRepository},
    SchedulerError,
};
use jobq_infrastructure::{
    MemoryJobGraphRepository, MemoryRunRepository, MemoryTaskRepository, MemoryWorkerRepository,
};

struct Harness {
    coordinator: Coordinator,
    task_repo: Arc<MemoryTaskRepository>,
    run_repo: Arc<MemoryRunRepository>,
    worker_repo: Arc<MemoryWorkerRepository>,
}

fn harness() -> Harness {
    let mut registry = FunctionRegistry::new();
    registry
        .register("send_email", |call: &FunctionCall| {
            Ok(json!({ "sent": call.vars.get("to") }))
        })
        .unwrap();
    registry
        .register("noop", |_: &FunctionCall| Ok(json!(null)))
        .unwrap();

    let task_repo = Arc::new(MemoryTaskRepository::new());
    let run_repo = Arc::new(MemoryRunRepository::new());
    let worker_repo = Arc::new(MemoryWorkerRepository::new());
    let graph_repo = Arc::new(MemoryJobGraphRepository::new());

    let coordinator = Coordinator::new(
        Arc::new(registry),
        task_repo.clone(),
        run_repo.clone(),
        worker_repo.clone(),
        graph_repo.clone(),
    );
    Harness {
        coordinator,
        task_repo,
        run_repo,
        worker_repo,
    }
}

fn email_vars() -> serde_json::Map<String, serde_json::Value> {
    let mut vars = serde_json::Map::new();
    vars.insert("to".to_string(), json!("a@x.com"));
    vars
}

#[tokio::test]
async fn test_queue_task_with_known_function() {
    let h = harness();
    let options = QueueOptions {
        period_seconds: 60,
        repeats: 3,
        ..Default::default()
    };
    let task = h
        .coordinator
        .queue_task("mail", "send_email", vec![], email_vars(), options)
        .await
        .unwrap();

    assert!(task.id > 0);
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.repeats, 3);
    assert_eq!(task.vars["to"], json!("a@x.com"));
}

#[tokio::test]
async fn test_unknown_function_rejected_at_enqueue() {
    let h = harness();
    let result = h
        .coordinator
        .queue_task("x", "not_registered", vec![], Default::default(), Default::default())
        .await;
    assert!(matches!(result, Err(SchedulerError::UnknownFunction(_))));
    // 队列里不应出现任何东西
    assert!(h
        .task_repo
        .list(&Default::default())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_malformed_cron_rejected_at_enqueue() {
    let h = harness();
    let options = QueueOptions {
        cronline: Some("61 * * * *".to_string()),
        ..Default::default()
    };
    let result = h
        .coordinator
        .queue_task("x", "noop", vec![], Default::default(), options)
        .await;
    assert!(matches!(result, Err(SchedulerError::InvalidCron { .. })));
    assert!(h
        .task_repo
        .list(&Default::default())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_cron_task_scheduled_at_next_fire_time() {
    let h = harness();
    let options = QueueOptions {
        cronline: Some("0 0 * * *".to_string()),
        ..Default::default()
    };
    let before = Utc::now();
    let task = h
        .coordinator
        .queue_task("nightly", "noop", vec![], Default::default(), options)
        .await
        .unwrap();

    assert!(task.next_run_time > before);
    assert_eq!(task.next_run_time.time().to_string(), "00:00:00");
}

#[tokio::test]
async fn test_reboot_task_parked_until_startup() {
    let h = harness();
    let options = QueueOptions {
        cronline: Some("@reboot".to_string()),
        ..Default::default()
    };
    let task = h
        .coordinator
        .queue_task("boot", "noop", vec![], Default::default(), options)
        .await
        .unwrap();
    assert_eq!(task.next_run_time, reboot_sentinel());
}

#[tokio::test]
async fn test_task_status_includes_latest_run() {
    let h = harness();
    let task = h
        .coordinator
        .queue_task("t", "noop", vec![], Default::default(), Default::default())
        .await
        .unwrap();

    let view = h.coordinator.task_status(task.id).await.unwrap();
    assert!(view.latest_run.is_none());

    let now = Utc::now();
    let run = h
        .run_repo
        .create(&Run::started(task.id, "w1", now))
        .await
        .unwrap();
    h.run_repo
        .finish(run.id, RunStatus::Completed, now, Some("ok"), None, None)
        .await
        .unwrap();

    let view = h.coordinator.task_status(task.id).await.unwrap();
    let latest = view.latest_run.unwrap();
    assert_eq!(latest.id, run.id);
    assert_eq!(latest.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_stop_queued_task() {
    let h = harness();
    let task = h
        .coordinator
        .queue_task("t", "noop", vec![], Default::default(), Default::default())
        .await
        .unwrap();

    h.coordinator.stop_task(task.id).await.unwrap();
    let stored = h.task_repo.get_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Stopped);
}

#[tokio::test]
async fn test_stop_running_task_signals_worker() {
    let h = harness();
    h.worker_repo
        .register(&Worker::new("w1", vec!["main".to_string()]))
        .await
        .unwrap();
    let task = h
        .coordinator
        .queue_task("t", "noop", vec![], Default::default(), Default::default())
        .await
        .unwrap();
    h.task_repo.try_assign(task.id, "w1", Utc::now()).await.unwrap();
    h.task_repo.try_start(task.id, "w1").await.unwrap();

    h.coordinator.stop_task(task.id).await.unwrap();

    let worker = h.worker_repo.get_by_name("w1").await.unwrap().unwrap();
    assert_eq!(worker.status, WorkerStatus::StopTask);
}

#[tokio::test]
async fn test_dependency_cycle_rejected_via_facade() {
    let h = harness();
    let a = h
        .coordinator
        .queue_task("a", "noop", vec![], Default::default(), Default::default())
        .await
        .unwrap();
    let b = h
        .coordinator
        .queue_task("b", "noop", vec![], Default::default(), Default::default())
        .await
        .unwrap();

    h.coordinator.add_deps(a.id, b.id).await.unwrap();
    let result = h.coordinator.add_deps(b.id, a.id).await;
    assert!(matches!(
        result,
        Err(SchedulerError::CircularDependency(_))
    ));
}

#[tokio::test]
async fn test_add_deps_requires_existing_tasks() {
    let h = harness();
    let result = h.coordinator.add_deps(100, 200).await;
    assert!(matches!(result, Err(SchedulerError::TaskNotFound { .. })));
}

#[tokio::test]
async fn test_disable_enable_roundtrip() {
    let h = harness();
    let task = h
        .coordinator
        .queue_task("t", "noop", vec![], Default::default(), Default::default())
        .await
        .unwrap();

    h.coordinator.disable(task.id).await.unwrap();
    assert!(!h.task_repo.get_by_id(task.id).await.unwrap().unwrap().enabled);
    h.coordinator.enable(task.id).await.unwrap();
    assert!(h.task_repo.get_by_id(task.id).await.unwrap().unwrap().enabled);
}

#[tokio::test]
async fn test_requeue_resets_failed_task() {
    let h = harness();
    let task = h
        .coordinator
        .queue_task("t", "noop", vec![], Default::default(), Default::default())
        .await
        .unwrap();
    let mut failed = h.task_repo.get_by_id(task.id).await.unwrap().unwrap();
    failed.status = TaskStatus::Failed;
    failed.times_failed = 5;
    h.task_repo.update(&failed).await.unwrap();

    h.coordinator.requeue(task.id).await.unwrap();
    let stored = h.task_repo.get_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Queued);
    assert_eq!(stored.times_failed, 0);
    assert!(stored.next_run_time <= Utc::now());
}

#[tokio::test]
async fn test_worker_control_surface() {
    let h = harness();
    h.worker_repo
        .register(&Worker::new("w1", vec!["main".to_string()]))
        .await
        .unwrap();

    let workers = h.coordinator.list_workers().await.unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].name, "w1");

    h.coordinator.terminate_worker("w1").await.unwrap();
    assert_eq!(
        h.worker_repo.get_by_name("w1").await.unwrap().unwrap().status,
        WorkerStatus::Terminate
    );

    h.coordinator.kill_worker("w1").await.unwrap();
    assert_eq!(
        h.worker_repo.get_by_name("w1").await.unwrap().unwrap().status,
        WorkerStatus::Kill
    );

    assert!(matches!(
        h.coordinator.terminate_worker("ghost").await,
        Err(SchedulerError::WorkerNotFound { .. })
    ));
}
