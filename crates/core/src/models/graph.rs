use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 任务依赖边
///
/// 表示child_task_id必须等parent_task_id最近一次运行COMPLETED
/// 之后才有资格被分配。边集合在入队前经过环检测。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobEdge {
    pub id: i64,
    pub parent_task_id: i64,
    pub child_task_id: i64,
    pub created_at: DateTime<Utc>,
}

impl JobEdge {
    pub fn new(parent_task_id: i64, child_task_id: i64) -> Self {
        Self {
            id: 0,
            parent_task_id,
            child_task_id,
            created_at: Utc::now(),
        }
    }
}
