use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::cron::CronLine;

/// 任务定义
///
/// 表示一个可调度的工作单元。任务引用宿主应用注册表中的函数名，
/// 从不携带任意代码；调度参数（周期、CRON表达式、有效窗口、重复
/// 次数、重试次数、超时）全部落在任务行上，仓储是唯一权威状态。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub name: String,
    /// 注册表中的函数名，入队时校验
    pub function_name: String,
    /// 位置参数，JSON数组
    pub args: serde_json::Value,
    /// 关键字参数，JSON对象
    pub vars: serde_json::Value,
    /// 允许执行该任务的Worker分组
    pub group_name: Vec<String>,
    pub enabled: bool,
    pub status: TaskStatus,
    /// 有效窗口起点
    pub start_time: DateTime<Utc>,
    /// 有效窗口终点，过期的QUEUED任务转为EXPIRED
    pub stop_time: Option<DateTime<Utc>>,
    /// 下次应当执行的时间，由Ticker扫描
    pub next_run_time: DateTime<Utc>,
    /// 周期秒数，存在cronline时以cronline为准
    pub period_seconds: i64,
    pub cronline: Option<String>,
    /// 0表示不限次数，N表示成功N次后停止
    pub repeats: i32,
    /// 失败后自动重试的次数
    pub retry_failed: i32,
    pub timeout_seconds: i32,
    pub times_run: i32,
    /// 连续失败计数，成功后清零
    pub times_failed: i32,
    pub assigned_worker: Option<String>,
    pub last_run_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 任务状态机
///
/// QUEUED → ASSIGNED → RUNNING → {COMPLETED, FAILED, TIMEOUT, STOPPED, EXPIRED}
///
/// QUEUED→ASSIGNED只由Ticker驱动，ASSIGNED之后的流转只由持有
/// 任务的Worker驱动。周期任务从终止态重新入队为QUEUED。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    #[serde(rename = "QUEUED")]
    Queued,
    #[serde(rename = "ASSIGNED")]
    Assigned,
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
    #[serde(rename = "EXPIRED")]
    Expired,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Assigned => "ASSIGNED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Timeout => "TIMEOUT",
            TaskStatus::Stopped => "STOPPED",
            TaskStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(TaskStatus::Queued),
            "ASSIGNED" => Some(TaskStatus::Assigned),
            "RUNNING" => Some(TaskStatus::Running),
            "COMPLETED" => Some(TaskStatus::Completed),
            "FAILED" => Some(TaskStatus::Failed),
            "TIMEOUT" => Some(TaskStatus::Timeout),
            "STOPPED" => Some(TaskStatus::Stopped),
            "EXPIRED" => Some(TaskStatus::Expired),
            _ => None,
        }
    }

    /// 是否为终止态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::Timeout
                | TaskStatus::Stopped
                | TaskStatus::Expired
        )
    }
}

impl sqlx::Type<sqlx::Postgres> for TaskStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for TaskStatus {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        TaskStatus::parse(s).ok_or_else(|| format!("Invalid task status: {s}").into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for TaskStatus {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

/// 入队选项
///
/// `queue_task`的调度参数，未设置的字段使用默认值。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueOptions {
    pub group_name: Vec<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub stop_time: Option<DateTime<Utc>>,
    pub period_seconds: i64,
    pub cronline: Option<String>,
    pub repeats: i32,
    pub retry_failed: i32,
    pub timeout_seconds: i32,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            group_name: vec!["main".to_string()],
            start_time: None,
            stop_time: None,
            period_seconds: 60,
            cronline: None,
            repeats: 1,
            retry_failed: 0,
            timeout_seconds: 60,
        }
    }
}

/// 任务查询过滤器
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub enabled: Option<bool>,
    pub group: Option<String>,
    pub limit: Option<i64>,
}

/// 未触发的@reboot任务停泊的哨兵时间，Ticker启动时才会武装
pub fn reboot_sentinel() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 12, 31, 0, 0, 0).unwrap()
}

impl Task {
    /// 根据入队选项构造新任务，ID由数据库生成
    pub fn new(name: &str, function_name: &str, options: QueueOptions) -> Self {
        let now = Utc::now();
        let start_time = options.start_time.unwrap_or(now);
        let next_run_time = if options.cronline.as_deref() == Some("@reboot") {
            reboot_sentinel()
        } else {
            start_time
        };
        Self {
            id: 0,
            name: name.to_string(),
            function_name: function_name.to_string(),
            args: serde_json::Value::Array(Vec::new()),
            vars: serde_json::Value::Object(serde_json::Map::new()),
            group_name: options.group_name,
            enabled: true,
            status: TaskStatus::Queued,
            start_time,
            stop_time: options.stop_time,
            next_run_time,
            period_seconds: options.period_seconds,
            cronline: options.cronline,
            repeats: options.repeats,
            retry_failed: options.retry_failed,
            timeout_seconds: options.timeout_seconds,
            times_run: 0,
            times_failed: 0,
            assigned_worker: None,
            last_run_time: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 是否为@reboot任务
    pub fn is_reboot(&self) -> bool {
        self.cronline.as_deref() == Some("@reboot")
    }

    /// 成功次数是否已耗尽repeats配额
    pub fn repeats_exhausted(&self) -> bool {
        self.repeats > 0 && self.times_run >= self.repeats
    }

    /// 是否会在终止态后重新入队
    pub fn is_recurring(&self) -> bool {
        !self.is_reboot() && !self.repeats_exhausted()
    }

    /// 当前时间是否在有效窗口内
    pub fn in_window(&self, now: DateTime<Utc>) -> bool {
        if now < self.start_time {
            return false;
        }
        match self.stop_time {
            Some(stop) => now <= stop,
            None => true,
        }
    }

    /// 计算下一次执行时间，cron优先于period
    pub fn compute_next_run(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.cronline {
            Some(expr) => match CronLine::parse(expr) {
                Ok(CronLine::Reboot) => None,
                Ok(CronLine::Schedule(schedule)) => schedule.next_after(after),
                Err(_) => None,
            },
            None => Some(after + chrono::Duration::seconds(self.period_seconds.max(1))),
        }
    }
}
