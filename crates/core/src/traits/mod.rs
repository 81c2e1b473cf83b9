pub mod repository;

pub use repository::{JobGraphRepository, RunRepository, TaskRepository, WorkerRepository};
