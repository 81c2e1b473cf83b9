pub mod database;
pub mod memory;

pub use database::create_pool;
pub use database::postgres::{
    PostgresJobGraphRepository, PostgresRunRepository, PostgresTaskRepository,
    PostgresWorkerRepository,
};
pub use memory::{
    MemoryJobGraphRepository, MemoryRunRepository, MemoryTaskRepository, MemoryWorkerRepository,
};
