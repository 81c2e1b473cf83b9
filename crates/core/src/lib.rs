pub mod config;
pub mod cron;
pub mod errors;
pub mod models;
pub mod registry;
pub mod traits;

pub use config::{AppConfig, DatabaseConfig, TickerConfig, WorkerConfig};
pub use cron::{CronLine, CronSchedule};
pub use errors::{SchedulerError, SchedulerResult};
pub use models::{
    reboot_sentinel, JobEdge, QueueOptions, Run, RunStatus, Task, TaskFilter, TaskStatus, Worker,
    WorkerStatus,
};
pub use registry::{FunctionCall, FunctionRegistry, TaskFunction};
pub use traits::{JobGraphRepository, RunRepository, TaskRepository, WorkerRepository};
