use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::debug;

use jobq_core::{
    models::{Task, TaskFilter, TaskStatus},
    traits::TaskRepository,
    SchedulerError, SchedulerResult,
};

const TASK_COLUMNS: &str = "id, name, function_name, args, vars, group_name, enabled, status, \
     start_time, stop_time, next_run_time, period_seconds, cronline, repeats, retry_failed, \
     timeout_seconds, times_run, times_failed, assigned_worker, last_run_time, created_at, updated_at";

pub struct PostgresTaskRepository {
    pool: PgPool,
}

impl PostgresTaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &sqlx::postgres::PgRow) -> SchedulerResult<Task> {
        Ok(Task {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            function_name: row.try_get("function_name")?,
            args: row.try_get("args")?,
            vars: row.try_get("vars")?,
            group_name: row.try_get("group_name")?,
            enabled: row.try_get("enabled")?,
            status: row.try_get("status")?,
            start_time: row.try_get("start_time")?,
            stop_time: row.try_get("stop_time")?,
            next_run_time: row.try_get("next_run_time")?,
            period_seconds: row.try_get("period_seconds")?,
            cronline: row.try_get("cronline")?,
            repeats: row.try_get("repeats")?,
            retry_failed: row.try_get("retry_failed")?,
            timeout_seconds: row.try_get("timeout_seconds")?,
            times_run: row.try_get("times_run")?,
            times_failed: row.try_get("times_failed")?,
            assigned_worker: row.try_get("assigned_worker")?,
            last_run_time: row.try_get("last_run_time")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl TaskRepository for PostgresTaskRepository {
    async fn create(&self, task: &Task) -> SchedulerResult<Task> {
        let query = format!(
            "INSERT INTO tasks (name, function_name, args, vars, group_name, enabled, status, \
             start_time, stop_time, next_run_time, period_seconds, cronline, repeats, \
             retry_failed, timeout_seconds, times_run, times_failed, assigned_worker, last_run_time) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19) \
             RETURNING {TASK_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(&task.name)
            .bind(&task.function_name)
            .bind(&task.args)
            .bind(&task.vars)
            .bind(&task.group_name)
            .bind(task.enabled)
            .bind(task.status)
            .bind(task.start_time)
            .bind(task.stop_time)
            .bind(task.next_run_time)
            .bind(task.period_seconds)
            .bind(&task.cronline)
            .bind(task.repeats)
            .bind(task.retry_failed)
            .bind(task.timeout_seconds)
            .bind(task.times_run)
            .bind(task.times_failed)
            .bind(&task.assigned_worker)
            .bind(task.last_run_time)
            .fetch_one(&self.pool)
            .await?;

        let created = Self::row_to_task(&row)?;
        debug!("创建任务成功: {} (ID: {})", created.name, created.id);
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<Task>> {
        let query = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn update(&self, task: &Task) -> SchedulerResult<()> {
        let result = sqlx::query(
            "UPDATE tasks SET name = $2, function_name = $3, args = $4, vars = $5, \
             group_name = $6, enabled = $7, status = $8, start_time = $9, stop_time = $10, \
             next_run_time = $11, period_seconds = $12, cronline = $13, repeats = $14, \
             retry_failed = $15, timeout_seconds = $16, times_run = $17, times_failed = $18, \
             assigned_worker = $19, last_run_time = $20, updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(task.id)
        .bind(&task.name)
        .bind(&task.function_name)
        .bind(&task.args)
        .bind(&task.vars)
        .bind(&task.group_name)
        .bind(task.enabled)
        .bind(task.status)
        .bind(task.start_time)
        .bind(task.stop_time)
        .bind(task.next_run_time)
        .bind(task.period_seconds)
        .bind(&task.cronline)
        .bind(task.repeats)
        .bind(task.retry_failed)
        .bind(task.timeout_seconds)
        .bind(task.times_run)
        .bind(task.times_failed)
        .bind(&task.assigned_worker)
        .bind(task.last_run_time)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::TaskNotFound { id: task.id });
        }
        Ok(())
    }

    async fn delete(&self, id: i64) -> SchedulerResult<()> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(SchedulerError::TaskNotFound { id });
        }
        Ok(())
    }

    async fn list(&self, filter: &TaskFilter) -> SchedulerResult<Vec<Task>> {
        // LIMIT NULL 等价于不限制
        let query = format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE ($1::varchar IS NULL OR status = $1) \
             AND ($2::boolean IS NULL OR enabled = $2) \
             AND ($3::varchar IS NULL OR $3 = ANY(group_name)) \
             ORDER BY id ASC LIMIT $4"
        );
        let rows = sqlx::query(&query)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.enabled)
            .bind(filter.group.as_deref())
            .bind(filter.limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn get_due_tasks(&self, now: DateTime<Utc>, limit: i64) -> SchedulerResult<Vec<Task>> {
        // 同时到期的任务按 next_run_time, id 确定性排序
        let query = format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE status = 'QUEUED' AND enabled AND next_run_time <= $1 AND start_time <= $1 \
             AND (stop_time IS NULL OR stop_time >= $1) \
             AND (repeats = 0 OR times_run < repeats) \
             ORDER BY next_run_time ASC, id ASC LIMIT $2"
        );
        let rows = sqlx::query(&query)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn get_by_worker(&self, worker_name: &str) -> SchedulerResult<Vec<Task>> {
        let query = format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE assigned_worker = $1 AND status IN ('ASSIGNED', 'RUNNING') ORDER BY id ASC"
        );
        let rows = sqlx::query(&query)
            .bind(worker_name)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn assigned_counts(&self) -> SchedulerResult<HashMap<String, i64>> {
        let rows = sqlx::query(
            "SELECT assigned_worker, COUNT(*) AS task_count FROM tasks \
             WHERE status IN ('ASSIGNED', 'RUNNING') AND assigned_worker IS NOT NULL \
             GROUP BY assigned_worker",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let worker: String = row.try_get("assigned_worker")?;
            let count: i64 = row.try_get("task_count")?;
            counts.insert(worker, count);
        }
        Ok(counts)
    }

    async fn try_assign(
        &self,
        task_id: i64,
        worker_name: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'ASSIGNED', assigned_worker = $2, updated_at = $3 \
             WHERE id = $1 AND status = 'QUEUED'",
        )
        .bind(task_id)
        .bind(worker_name)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn try_start(&self, task_id: i64, worker_name: &str) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'RUNNING', updated_at = NOW() \
             WHERE id = $1 AND status = 'ASSIGNED' AND assigned_worker = $2",
        )
        .bind(task_id)
        .bind(worker_name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn try_transition(
        &self,
        task_id: i64,
        from: TaskStatus,
        to: TaskStatus,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE tasks SET status = $3, updated_at = NOW() WHERE id = $1 AND status = $2",
        )
        .bind(task_id)
        .bind(from)
        .bind(to)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn reclaim_from_worker(
        &self,
        worker_name: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<Task>> {
        let query = format!(
            "UPDATE tasks SET status = 'QUEUED', assigned_worker = NULL, \
             times_failed = times_failed + 1, next_run_time = $2, updated_at = NOW() \
             WHERE assigned_worker = $1 AND status IN ('ASSIGNED', 'RUNNING') \
             RETURNING {TASK_COLUMNS}"
        );
        let rows = sqlx::query(&query)
            .bind(worker_name)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'EXPIRED', assigned_worker = NULL, updated_at = NOW() \
             WHERE status IN ('QUEUED', 'ASSIGNED') AND stop_time IS NOT NULL AND stop_time < $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn arm_reboot_tasks(&self, now: DateTime<Utc>) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "UPDATE tasks SET next_run_time = $1, updated_at = NOW() \
             WHERE cronline = '@reboot' AND status = 'QUEUED' AND times_run = 0 AND enabled",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn set_enabled(&self, task_id: i64, enabled: bool) -> SchedulerResult<()> {
        let result =
            sqlx::query("UPDATE tasks SET enabled = $2, updated_at = NOW() WHERE id = $1")
                .bind(task_id)
                .bind(enabled)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(SchedulerError::TaskNotFound { id: task_id });
        }
        Ok(())
    }
}
