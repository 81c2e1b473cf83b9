use async_trait::async_trait;
use sqlx::{PgPool, Row};

use jobq_core::{models::JobEdge, traits::JobGraphRepository, SchedulerResult};

const EDGE_COLUMNS: &str = "id, parent_task_id, child_task_id, created_at";

pub struct PostgresJobGraphRepository {
    pool: PgPool,
}

impl PostgresJobGraphRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_edge(row: &sqlx::postgres::PgRow) -> SchedulerResult<JobEdge> {
        Ok(JobEdge {
            id: row.try_get("id")?,
            parent_task_id: row.try_get("parent_task_id")?,
            child_task_id: row.try_get("child_task_id")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl JobGraphRepository for PostgresJobGraphRepository {
    async fn add_edge(&self, parent_task_id: i64, child_task_id: i64) -> SchedulerResult<JobEdge> {
        // 重复插入返回已有的边
        let query = format!(
            "INSERT INTO job_edges (parent_task_id, child_task_id) VALUES ($1, $2) \
             ON CONFLICT (parent_task_id, child_task_id) \
             DO UPDATE SET parent_task_id = EXCLUDED.parent_task_id \
             RETURNING {EDGE_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(parent_task_id)
            .bind(child_task_id)
            .fetch_one(&self.pool)
            .await?;
        Self::row_to_edge(&row)
    }

    async fn remove_edge(&self, parent_task_id: i64, child_task_id: i64) -> SchedulerResult<bool> {
        let result =
            sqlx::query("DELETE FROM job_edges WHERE parent_task_id = $1 AND child_task_id = $2")
                .bind(parent_task_id)
                .bind(child_task_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_edges(&self) -> SchedulerResult<Vec<JobEdge>> {
        let query = format!("SELECT {EDGE_COLUMNS} FROM job_edges ORDER BY id ASC");
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_edge).collect()
    }

    async fn parents_of(&self, task_id: i64) -> SchedulerResult<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT parent_task_id FROM job_edges WHERE child_task_id = $1 ORDER BY parent_task_id",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get("parent_task_id").map_err(Into::into))
            .collect()
    }
}
