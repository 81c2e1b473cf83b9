use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Row};
use tracing::debug;

use jobq_core::{
    models::{Run, RunStatus},
    traits::RunRepository,
    SchedulerError, SchedulerResult,
};

const RUN_COLUMNS: &str =
    "id, task_id, status, worker_name, start_time, stop_time, output, result, error_message, created_at";

pub struct PostgresRunRepository {
    pool: PgPool,
}

impl PostgresRunRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_run(row: &sqlx::postgres::PgRow) -> SchedulerResult<Run> {
        Ok(Run {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            status: row.try_get("status")?,
            worker_name: row.try_get("worker_name")?,
            start_time: row.try_get("start_time")?,
            stop_time: row.try_get("stop_time")?,
            output: row.try_get("output")?,
            result: row.try_get("result")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl RunRepository for PostgresRunRepository {
    async fn create(&self, run: &Run) -> SchedulerResult<Run> {
        let query = format!(
            "INSERT INTO runs (task_id, status, worker_name, start_time, stop_time, output, result, error_message) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING {RUN_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(run.task_id)
            .bind(run.status)
            .bind(&run.worker_name)
            .bind(run.start_time)
            .bind(run.stop_time)
            .bind(&run.output)
            .bind(&run.result)
            .bind(&run.error_message)
            .fetch_one(&self.pool)
            .await?;

        let created = Self::row_to_run(&row)?;
        debug!("创建运行记录: 任务 {} 运行 {}", created.task_id, created.id);
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<Run>> {
        let query = format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_run).transpose()
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
        let affected = sqlx::query(
            "UPDATE runs SET status = $2, stop_time = $3, output = $4, result = $5, \
             error_message = $6 WHERE id = $1",
        )
        .bind(id)
        .bind(status)
        .bind(stop_time)
        .bind(output)
        .bind(result)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        if affected.rows_affected() == 0 {
            return Err(SchedulerError::RunNotFound { id });
        }
        Ok(())
    }

    async fn get_latest_for_task(&self, task_id: i64) -> SchedulerResult<Option<Run>> {
        let query =
            format!("SELECT {RUN_COLUMNS} FROM runs WHERE task_id = $1 ORDER BY id DESC LIMIT 1");
        let row = sqlx::query(&query)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_run).transpose()
    }

    async fn get_recent_runs(&self, task_id: i64, limit: i64) -> SchedulerResult<Vec<Run>> {
        let query =
            format!("SELECT {RUN_COLUMNS} FROM runs WHERE task_id = $1 ORDER BY id DESC LIMIT $2");
        let rows = sqlx::query(&query)
            .bind(task_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_run).collect()
    }

    async fn get_running_by_worker(&self, worker_name: &str) -> SchedulerResult<Vec<Run>> {
        let query = format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE worker_name = $1 AND status = 'RUNNING' \
             ORDER BY id ASC"
        );
        let rows = sqlx::query(&query)
            .bind(worker_name)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_run).collect()
    }

    async fn cleanup_old_runs(&self, days: i64) -> SchedulerResult<u64> {
        let cutoff = Utc::now() - Duration::days(days);
        let result =
            sqlx::query("DELETE FROM runs WHERE status <> 'RUNNING' AND stop_time < $1")
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}
