pub mod graph;
pub mod recovery;
pub mod strategies;
pub mod ticker;

pub use graph::{DependencyChecker, JobGraph};
pub use recovery::{RecoveryConfig, RecoveryReport, RecoveryService};
pub use strategies::{
    strategy_from_name, AssignStrategy, CandidateWorker, LeastLoadedStrategy, RoundRobinStrategy,
};
pub use ticker::{TickReport, Ticker};
