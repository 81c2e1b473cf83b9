pub mod postgres;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use jobq_core::{DatabaseConfig, SchedulerResult};

/// 按配置创建数据库连接池
pub async fn create_pool(config: &DatabaseConfig) -> SchedulerResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(std::time::Duration::from_secs(config.connect_timeout_seconds))
        .idle_timeout(std::time::Duration::from_secs(config.idle_timeout_seconds))
        .connect(&config.url)
        .await?;

    info!("数据库连接成功");
    Ok(pool)
}
