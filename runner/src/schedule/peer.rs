use super::{Job, JobResult, ProtocolViolation, ResultSet, SchedulerError};
use crate::{
    comm::{Packet, Tag},
    executors::JobExecutor,
    partition::ParallelLevel,
};
use tracing::debug;

/// Server owning job `index` under static scheduling over `num_servers` servers
pub fn owner(index: usize, num_servers: usize) -> usize {
    index % num_servers + 1
}

/// Run the stride of `jobs` owned by this process's server, then gather the partial
/// results at the leader of server 1.
pub(super) fn static_schedule<E>(
    level: &ParallelLevel,
    jobs: &[Job],
    executor: &mut E,
) -> Result<Option<Vec<JobResult>>, SchedulerError>
where
    E: JobExecutor + ?Sized,
{
    let server = level.server_id();
    let num_servers = level.num_servers();

    let mut local = Vec::new();
    for job in jobs.iter().filter(|job| owner(job.index, num_servers) == server) {
        debug!(server, job = job.index, "Executing job");
        let payload = executor.execute(level.group(), job)?;

        local.push(JobResult {
            index: job.index,
            server,
            payload,
        });
    }

    if !level.group().is_leader() {
        return Ok(None);
    }

    if level.is_scheduler() {
        gather(level, jobs.len(), local).map(Some)
    } else {
        let uplink = level
            .uplink()
            .ok_or(ProtocolViolation::MissingLink { server })?;
        uplink.send(Packet::new(server as Tag, serde_json::to_vec(&local)?))?;

        Ok(None)
    }
}

fn gather(
    level: &ParallelLevel,
    count: usize,
    local: Vec<JobResult>,
) -> Result<Vec<JobResult>, SchedulerError> {
    let num_servers = level.num_servers();
    let mut results = ResultSet::new(count);

    for result in local {
        results.insert(result)?;
    }

    // the first link points back at server 1 itself
    for (position, link) in level.server_links().iter().enumerate().skip(1) {
        let server = position + 1;
        let packet = link.recv_tagged(server as Tag)?;
        let partial: Vec<JobResult> = serde_json::from_slice(&packet.body)?;

        debug!(server, results = partial.len(), "Gathered partial results");

        for result in partial {
            if result.server != server || owner(result.index, num_servers) != server {
                return Err(ProtocolViolation::UnexpectedOwner {
                    index: result.index,
                    server,
                }
                .into());
            }

            results.insert(result)?;
        }
    }

    Ok(results.complete()?)
}
