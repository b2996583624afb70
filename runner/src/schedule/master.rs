use super::{Job, JobResult, ProtocolViolation, ResultSet, SchedulerError, TERMINATE};
use crate::{
    comm::{Packet, Request},
    partition::{Link, ParallelLevel},
};
use itertools::Itertools;
use tracing::{debug, trace};

/// a job handed to a server whose result is still outstanding
struct InFlight {
    server: usize,
    index: usize,
    request: Request,
}

fn dispatch(server: usize, link: &Link, job: &Job) -> Result<InFlight, SchedulerError> {
    debug!(server, job = job.index, "Dispatching job");
    link.send(job.to_packet())?;

    Ok(InFlight {
        server,
        index: job.index,
        request: link.post(job.tag()),
    })
}

fn terminate(server: usize, link: &Link) -> Result<(), SchedulerError> {
    trace!(server, "Releasing server");
    link.send(Packet::empty(TERMINATE))?;

    Ok(())
}

/// Self-schedule `jobs` onto the servers linked to the master.
///
/// The first batch goes out in index order, one job per server. From then on every
/// completed job frees its server for the next unsent one. A server is released with
/// `TERMINATE` as soon as no job is left for it.
pub(super) fn self_schedule(
    level: &ParallelLevel,
    jobs: &[Job],
) -> Result<Vec<JobResult>, SchedulerError> {
    let links = level.server_links();
    let leaders = level.leaders().ok_or(ProtocolViolation::NotLinked)?;
    if links.is_empty() {
        return Err(ProtocolViolation::NotLinked.into());
    }

    let mut pending = jobs.iter();
    let mut in_flight = Vec::with_capacity(links.len());
    let mut results = ResultSet::new(jobs.len());

    for (position, link) in links.iter().enumerate() {
        let server = position + 1;

        match pending.next() {
            Some(job) => in_flight.push(dispatch(server, link, job)?),
            None => terminate(server, link)?,
        }
    }

    while !in_flight.is_empty() {
        let requests = in_flight.iter().map(|flight| flight.request).collect_vec();
        let (position, packet) = leaders.wait_any(&requests)?;
        let InFlight { server, index, .. } = in_flight.swap_remove(position);

        debug!(server, job = index, "Collected result");
        results.insert(JobResult {
            index,
            server,
            payload: packet.body.into(),
        })?;

        let link = &links[server - 1];
        match pending.next() {
            Some(job) => in_flight.push(dispatch(server, link, job)?),
            None => terminate(server, link)?,
        }
    }

    Ok(results.complete()?)
}
