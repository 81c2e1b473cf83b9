use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Worker节点信息
///
/// 每个Worker进程启动时注册一行，之后由心跳循环定期刷新
/// last_heartbeat与累计统计。status字段兼作操作员的控制信道：
/// 写入TERMINATE/KILL/STOP_TASK，Worker在轮询间隙读取并执行。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub name: String,
    pub group_names: Vec<String>,
    pub status: WorkerStatus,
    /// 同一存活集群中至多一个Worker为true
    pub is_ticker: bool,
    pub first_heartbeat: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub tasks_run: i64,
    pub tasks_failed: i64,
}

/// Worker状态与控制命令
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkerStatus {
    #[serde(rename = "ACTIVE")]
    Active,
    #[serde(rename = "DISABLED")]
    Disabled,
    /// 优雅退出：跑完当前任务后退出
    #[serde(rename = "TERMINATE")]
    Terminate,
    /// 立即退出，当前任务由其他节点回收
    #[serde(rename = "KILL")]
    Kill,
    /// 终止当前正在执行的任务，Worker本身继续服务
    #[serde(rename = "STOP_TASK")]
    StopTask,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Active => "ACTIVE",
            WorkerStatus::Disabled => "DISABLED",
            WorkerStatus::Terminate => "TERMINATE",
            WorkerStatus::Kill => "KILL",
            WorkerStatus::StopTask => "STOP_TASK",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(WorkerStatus::Active),
            "DISABLED" => Some(WorkerStatus::Disabled),
            "TERMINATE" => Some(WorkerStatus::Terminate),
            "KILL" => Some(WorkerStatus::Kill),
            "STOP_TASK" => Some(WorkerStatus::StopTask),
            _ => None,
        }
    }
}

impl sqlx::Type<sqlx::Postgres> for WorkerStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for WorkerStatus {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        WorkerStatus::parse(s).ok_or_else(|| format!("Invalid worker status: {s}").into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for WorkerStatus {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

impl Worker {
    /// 注册新Worker
    pub fn new(name: &str, group_names: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            group_names,
            status: WorkerStatus::Active,
            is_ticker: false,
            first_heartbeat: now,
            last_heartbeat: now,
            tasks_run: 0,
            tasks_failed: 0,
        }
    }

    /// 心跳是否已超过存活阈值
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after_seconds: i64) -> bool {
        (now - self.last_heartbeat).num_seconds() > stale_after_seconds
    }

    /// 是否可以接收新任务
    pub fn accepts_tasks(&self) -> bool {
        matches!(self.status, WorkerStatus::Active | WorkerStatus::StopTask)
    }

    /// 分组是否与任务的分组有交集
    pub fn serves_any_group(&self, groups: &[String]) -> bool {
        self.group_names.iter().any(|g| groups.contains(g))
    }
}
