pub mod app;
pub mod coordinator;
pub mod shutdown;

pub use app::{AppMode, Application};
pub use coordinator::{Coordinator, TaskStatusView};
pub use shutdown::ShutdownManager;
