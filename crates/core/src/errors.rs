use thiserror::Error;

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("任务未找到: {id}")]
    TaskNotFound { id: i64 },

    #[error("运行记录未找到: {id}")]
    RunNotFound { id: i64 },

    #[error("Worker未找到: {name}")]
    WorkerNotFound { name: String },

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("未注册的任务函数: {0}")]
    UnknownFunction(String),

    #[error("检测到循环依赖: {0}")]
    CircularDependency(String),

    #[error("任务执行错误: {0}")]
    TaskExecution(String),

    #[error("无效的任务参数: {0}")]
    InvalidTaskParams(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
