mod job_graph_repository;
mod run_repository;
mod task_repository;
mod worker_repository;

pub use job_graph_repository::PostgresJobGraphRepository;
pub use run_repository::PostgresRunRepository;
pub use task_repository::PostgresTaskRepository;
pub use worker_repository::PostgresWorkerRepository;
