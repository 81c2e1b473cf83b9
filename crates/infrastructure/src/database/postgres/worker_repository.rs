use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Row};
use tracing::debug;

use jobq_core::{
    models::{Worker, WorkerStatus},
    traits::WorkerRepository,
    SchedulerError, SchedulerResult,
};

const WORKER_COLUMNS: &str =
    "name, group_names, status, is_ticker, first_heartbeat, last_heartbeat, tasks_run, tasks_failed";

pub struct PostgresWorkerRepository {
    pool: PgPool,
}

impl PostgresWorkerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_worker(row: &sqlx::postgres::PgRow) -> SchedulerResult<Worker> {
        Ok(Worker {
            name: row.try_get("name")?,
            group_names: row.try_get("group_names")?,
            status: row.try_get("status")?,
            is_ticker: row.try_get("is_ticker")?,
            first_heartbeat: row.try_get("first_heartbeat")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            tasks_run: row.try_get("tasks_run")?,
            tasks_failed: row.try_get("tasks_failed")?,
        })
    }
}

#[async_trait]
impl WorkerRepository for PostgresWorkerRepository {
    async fn register(&self, worker: &Worker) -> SchedulerResult<()> {
        // 重复注册保留first_heartbeat与累计统计
        sqlx::query(
            "INSERT INTO workers (name, group_names, status, is_ticker, first_heartbeat, \
             last_heartbeat, tasks_run, tasks_failed) \
             VALUES ($1, $2, $3, FALSE, $4, $5, $6, $7) \
             ON CONFLICT (name) DO UPDATE SET group_names = EXCLUDED.group_names, \
             status = EXCLUDED.status, last_heartbeat = EXCLUDED.last_heartbeat",
        )
        .bind(&worker.name)
        .bind(&worker.group_names)
        .bind(worker.status)
        .bind(worker.first_heartbeat)
        .bind(worker.last_heartbeat)
        .bind(worker.tasks_run)
        .bind(worker.tasks_failed)
        .execute(&self.pool)
        .await?;

        debug!("Worker注册成功: {}", worker.name);
        Ok(())
    }

    async fn unregister(&self, name: &str) -> SchedulerResult<()> {
        sqlx::query("DELETE FROM workers WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_by_name(&self, name: &str) -> SchedulerResult<Option<Worker>> {
        let query = format!("SELECT {WORKER_COLUMNS} FROM workers WHERE name = $1");
        let row = sqlx::query(&query)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_worker).transpose()
    }

    async fn list(&self) -> SchedulerResult<Vec<Worker>> {
        let query = format!("SELECT {WORKER_COLUMNS} FROM workers ORDER BY name ASC");
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_worker).collect()
    }

    async fn list_alive(
        &self,
        now: DateTime<Utc>,
        stale_after_seconds: i64,
    ) -> SchedulerResult<Vec<Worker>> {
        let cutoff = now - Duration::seconds(stale_after_seconds);
        let query = format!(
            "SELECT {WORKER_COLUMNS} FROM workers WHERE last_heartbeat >= $1 ORDER BY name ASC"
        );
        let rows = sqlx::query(&query).bind(cutoff).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_worker).collect()
    }

    async fn list_stale(
        &self,
        now: DateTime<Utc>,
        stale_after_seconds: i64,
    ) -> SchedulerResult<Vec<Worker>> {
        let cutoff = now - Duration::seconds(stale_after_seconds);
        let query = format!(
            "SELECT {WORKER_COLUMNS} FROM workers WHERE last_heartbeat < $1 ORDER BY name ASC"
        );
        let rows = sqlx::query(&query).bind(cutoff).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_worker).collect()
    }

    async fn heartbeat(
        &self,
        name: &str,
        now: DateTime<Utc>,
        tasks_run: i64,
        tasks_failed: i64,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE workers SET last_heartbeat = $2, tasks_run = $3, tasks_failed = $4 \
             WHERE name = $1",
        )
        .bind(name)
        .bind(now)
        .bind(tasks_run)
        .bind(tasks_failed)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_status(&self, name: &str, status: WorkerStatus) -> SchedulerResult<()> {
        let result = sqlx::query("UPDATE workers SET status = $2 WHERE name = $1")
            .bind(name)
            .bind(status)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(SchedulerError::WorkerNotFound {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    async fn try_acquire_ticker(
        &self,
        name: &str,
        now: DateTime<Utc>,
        stale_after_seconds: i64,
    ) -> SchedulerResult<bool> {
        let cutoff = now - Duration::seconds(stale_after_seconds);
        let mut tx = self.pool.begin().await?;

        // 先降级心跳过期的旧Ticker
        sqlx::query("UPDATE workers SET is_ticker = FALSE WHERE is_ticker AND last_heartbeat < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;

        // 不存在其他存活Ticker时抢占；对已持有者幂等
        let result = sqlx::query(
            "UPDATE workers SET is_ticker = TRUE WHERE name = $1 AND NOT EXISTS ( \
             SELECT 1 FROM workers w WHERE w.is_ticker AND w.name <> $1 \
             AND w.last_heartbeat >= $2)",
        )
        .bind(name)
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected() == 1)
    }

    async fn relinquish_ticker(&self, name: &str) -> SchedulerResult<()> {
        sqlx::query("UPDATE workers SET is_ticker = FALSE WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
