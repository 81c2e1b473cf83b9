use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 一次执行记录
///
/// 每次实际执行产生一条Run，落盘后除完成时写入的
/// stop_time/status/output/result/error_message外不再变化。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub task_id: i64,
    pub status: RunStatus,
    pub worker_name: String,
    pub start_time: DateTime<Utc>,
    pub stop_time: Option<DateTime<Utc>>,
    /// 捕获的子进程标准输出与标准错误
    pub output: Option<String>,
    /// 任务函数的结构化返回值
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// 运行状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RunStatus {
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "TIMEOUT")]
    Timeout,
    #[serde(rename = "STOPPED")]
    Stopped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::Timeout => "TIMEOUT",
            RunStatus::Stopped => "STOPPED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(RunStatus::Running),
            "COMPLETED" => Some(RunStatus::Completed),
            "FAILED" => Some(RunStatus::Failed),
            "TIMEOUT" => Some(RunStatus::Timeout),
            "STOPPED" => Some(RunStatus::Stopped),
            _ => None,
        }
    }
}

impl sqlx::Type<sqlx::Postgres> for RunStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for RunStatus {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        RunStatus::parse(s).ok_or_else(|| format!("Invalid run status: {s}").into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for RunStatus {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

impl Run {
    /// 创建开始执行时的初始记录，ID由数据库生成
    pub fn started(task_id: i64, worker_name: &str, start_time: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            task_id,
            status: RunStatus::Running,
            worker_name: worker_name.to_string(),
            start_time,
            stop_time: None,
            output: None,
            result: None,
            error_message: None,
            created_at: start_time,
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self.status, RunStatus::Running)
    }

    pub fn is_successful(&self) -> bool {
        matches!(self.status, RunStatus::Completed)
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.stop_time
            .map(|stop| (stop - self.start_time).num_milliseconds())
    }
}
