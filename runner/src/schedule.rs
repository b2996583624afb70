//! Distributing one round of jobs over a partition.
//!
//! Levels with a dedicated master are self-scheduled: the master hands a job to
//! whichever server finished first. Peer levels are statically scheduled, every server
//! runs a fixed stride of the jobs and server 1 gathers the results.

mod master;
mod peer;
mod serve;

#[cfg(test)]
mod schedule_test;

pub use peer::owner;

use crate::{
    comm::{CommError, Packet, Tag},
    executors::{ExecutorError, JobExecutor},
    partition::{ParallelLevel, Role},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument};

/// Job id telling a server to leave its serve loop
pub const TERMINATE: Tag = 0;

/// Opaque bytes carried by jobs and results, never interpreted by the scheduler
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload(Vec<u8>);

impl Payload {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// serialize `value` into a payload
    pub fn pack<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_vec(value).map(Self)
    }

    pub fn unpack<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self(text.into_bytes())
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self(text.as_bytes().to_vec())
    }
}

/// Unit of schedulable work, `index` is its position in the round's job set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub index: usize,
    pub params: Payload,
}

impl Job {
    pub fn new(index: usize, params: impl Into<Payload>) -> Self {
        Self {
            index,
            params: params.into(),
        }
    }

    /// Build a job set from parameters in index order
    pub fn set<P: Into<Payload>>(params: impl IntoIterator<Item = P>) -> Vec<Job> {
        params
            .into_iter()
            .enumerate()
            .map(|(index, params)| Job::new(index, params))
            .collect()
    }

    /// wire tag of the job, 0 is reserved for `TERMINATE`
    pub fn tag(&self) -> Tag {
        self.index as Tag + 1
    }

    /// Job carried by `packet` out of a set of `count`, any tag but `TERMINATE`
    fn from_packet(packet: Packet, count: usize) -> Result<Self, ProtocolViolation> {
        let index = usize::try_from(packet.tag.saturating_sub(1)).unwrap_or(usize::MAX);
        if packet.tag == TERMINATE || index >= count {
            return Err(ProtocolViolation::JobOutOfRange { index, count });
        }

        Ok(Self::new(index, packet.body))
    }

    fn to_packet(&self) -> Packet {
        Packet::new(self.tag(), self.params.as_bytes().to_vec())
    }
}

/// Result of one job as collected by the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub index: usize,
    // server that executed the job
    pub server: usize,
    pub payload: Payload,
}

/// The scheduling exchange went wrong in a way no operator input can cause
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("Job {index} is outside of a job set of {count}")]
    JobOutOfRange { index: usize, count: usize },
    #[error("Result for job {index} arrived twice")]
    DuplicateResult { index: usize },
    #[error("No result for job {index}")]
    MissingResult { index: usize },
    #[error("Job {index} was reported by server {server}, which doesn't own it")]
    UnexpectedOwner { index: usize, server: usize },
    #[error("The scheduler has no links to its servers")]
    NotLinked,
    #[error("Leader of server {server} has no link to the scheduler")]
    MissingLink { server: usize },
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Termination protocol violated")]
    TerminationProtocol(#[from] ProtocolViolation),
    #[error("Failed to exchange jobs")]
    Comm(#[from] CommError),
    #[error("Job execution failed")]
    Executor(#[from] ExecutorError),
    #[error("Failed to encode partial results")]
    Codec(#[from] serde_json::Error),
    #[error("Job at position {position} has index {index}")]
    InvalidJobSet { position: usize, index: usize },
}

/// Results of one round keyed by job index, filled in any order
struct ResultSet {
    slots: Vec<Option<JobResult>>,
}

impl ResultSet {
    fn new(count: usize) -> Self {
        Self {
            slots: (0..count).map(|_| None).collect(),
        }
    }

    fn insert(&mut self, result: JobResult) -> Result<(), ProtocolViolation> {
        let count = self.slots.len();
        let index = result.index;
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(ProtocolViolation::JobOutOfRange { index, count })?;

        if slot.is_some() {
            return Err(ProtocolViolation::DuplicateResult { index });
        }

        *slot = Some(result);
        Ok(())
    }

    fn complete(self) -> Result<Vec<JobResult>, ProtocolViolation> {
        self.slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| slot.ok_or(ProtocolViolation::MissingResult { index }))
            .collect()
    }
}

/// Run one scheduling round over `level` and block until every job has a result.
///
/// Every process of the level calls this with the same job set. The protocol follows
/// from the level: self-scheduling with a dedicated master, static scheduling
/// otherwise. The complete result set, ordered by job index, is returned on the
/// scheduler only, every other process gets `None`.
#[instrument(skip_all, level = "debug", fields(server = level.server_id(), jobs = jobs.len()))]
pub fn run_jobs<E>(
    level: &ParallelLevel,
    jobs: &[Job],
    executor: &mut E,
) -> Result<Option<Vec<JobResult>>, SchedulerError>
where
    E: JobExecutor + ?Sized,
{
    if let Some((position, job)) = jobs
        .iter()
        .enumerate()
        .find(|(position, job)| job.index != *position)
    {
        return Err(SchedulerError::InvalidJobSet {
            position,
            index: job.index,
        });
    }

    let results = match level.role() {
        Role::Idle => None,
        Role::Master => Some(master::self_schedule(level, jobs)?),
        Role::Server { .. } if level.dedicated_master() => {
            serve::serve(level, jobs.len(), executor)?;
            None
        }
        Role::Server { .. } => peer::static_schedule(level, jobs, executor)?,
    };

    if let Some(results) = results.as_ref() {
        info!(
            servers = level.num_servers(),
            master = level.dedicated_master(),
            "Completed {} jobs",
            results.len()
        );
    }

    Ok(results)
}
