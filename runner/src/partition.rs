//! Sizing and materializing process partitions.
//!
//! The resolver turns operator hints into a [`PartitionPlan`] without any
//! communication, the builder splits a parent group along a plan and yields the
//! [`ParallelLevel`] seen by the calling process.

mod builder;
mod group;
mod level;
mod resolver;


pub use builder::{assign, build, Assignment};
pub use group::{ProcessGroup, Rank};
pub use level::{Link, ParallelLevel, Role};
pub use resolver::{resolve, Advisory, PartitionPlan, Scheduling};

use crate::{comm::CommError, config::ConcurrencyHints};
use thiserror::Error;

/// An operator request that is inconsistent or can't be satisfied by the available
/// processors. Always fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("No processors available")]
    NoProcessors,
    #[error("{0} must be at least 1")]
    ZeroRequest(&'static str),
    #[error("min_procs_per_server ({min}) exceeds max_procs_per_server ({max})")]
    InvertedBounds { min: usize, max: usize },
    #[error("{requested} servers requested but only {available} processors available")]
    ServersExceedAvailable { requested: usize, available: usize },
    #[error("{requested} processors per server requested but only {available} available")]
    ProcsPerServerExceedAvailable { requested: usize, available: usize },
    #[error("{num_servers} servers of {procs_per_server} processors exceed the {available} available")]
    ProductExceedsAvailable {
        num_servers: usize,
        procs_per_server: usize,
        available: usize,
    },
    #[error("{requested} processors per server is outside of [{min}, {max}]")]
    ProcsPerServerOutOfBounds {
        requested: usize,
        min: usize,
        max: usize,
    },
    #[error("{available} processors can't give {num_servers} servers {min} processors each")]
    BelowMinimum {
        num_servers: usize,
        min: usize,
        available: usize,
    },
    #[error("Plan needs {required} processors but the parent group has {available}")]
    PlanExceedsGroup { required: usize, available: usize },
    #[error("No configuration {index}, {count} exist")]
    UnknownConfiguration { index: usize, count: usize },
}

#[derive(Error, Debug)]
pub enum PartitionError {
    #[error("Invalid partition request")]
    Configuration(#[from] ConfigurationError),
    #[error("Failed to split process group")]
    Comm(#[from] CommError),
    #[error("Split did not yield a group for rank {rank}")]
    MissingGroup { rank: Rank },
}

/// Resolve `hints` against the calling process's group in `parent` and build the
/// child level.
///
/// Idle processes and the master of `parent` take no part in deeper levels. They get
/// an idle child level right away, `hints` are neither resolved nor checked for them.
pub fn resolve_and_build(
    parent: &ParallelLevel,
    hints: &ConcurrencyHints,
) -> Result<ParallelLevel, PartitionError> {
    let group = parent.group();

    if parent.is_idle() || parent.is_master() {
        let plan = PartitionPlan::single(group.size());
        return Ok(ParallelLevel::idle(group.clone(), plan));
    }

    let plan = resolve(group.size(), hints)?;
    build(group, plan)
}
