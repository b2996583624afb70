use super::{Job, ProtocolViolation, SchedulerError, TERMINATE};
use crate::{comm::Packet, executors::JobExecutor, partition::ParallelLevel};
use tracing::{debug, trace};

/// Serve jobs from the master until it sends `TERMINATE`.
///
/// The server leader receives every job and shares it with the rest of the server, so
/// all members execute the same job together. Only the leader replies. A job outside
/// of the `count` jobs of the round is a protocol violation. Returns the number of jobs
/// served.
pub(super) fn serve<E>(
    level: &ParallelLevel,
    count: usize,
    executor: &mut E,
) -> Result<usize, SchedulerError>
where
    E: JobExecutor + ?Sized,
{
    let server = level.server_id();
    let uplink = if level.group().is_leader() {
        Some(
            level
                .uplink()
                .ok_or(ProtocolViolation::MissingLink { server })?,
        )
    } else {
        None
    };

    let mut served = 0;

    loop {
        let packet = uplink.map(|uplink| uplink.recv()).transpose()?;
        let packet = level.broadcast_in_server(packet)?;

        if packet.tag == TERMINATE {
            trace!(server, served, "Terminated");
            return Ok(served);
        }

        let job = Job::from_packet(packet, count)?;

        debug!(server, job = job.index, "Executing job");
        let payload = executor.execute(level.group(), &job)?;

        if let Some(uplink) = uplink {
            uplink.send(Packet::new(job.tag(), payload.into_bytes()))?;
        }

        served += 1;
    }
}
