//! Partitioning a fixed pool of ranks into nested levels of servers and scheduling
//! jobs over them.

pub mod comm;
pub mod config;
pub mod context;
pub mod executors;
pub mod partition;
pub mod schedule;
pub mod tagging;

pub use context::{LevelScope, ParallelConfiguration, SchedulingContext};
pub use partition::{resolve_and_build, ParallelLevel};
pub use schedule::{run_jobs, Job, JobResult, Payload};
