//! In-process message passing substrate.
//!
//! Every rank holds its end of two per-pair channel meshes, one for point-to-point
//! traffic and one for collectives. A collective therefore never consumes a packet
//! that belongs to a scheduling exchange, and per-pair ordering is FIFO in both.

mod collective;
mod universe;

pub use universe::Universe;

use crossbeam::channel::{unbounded, Receiver, Select, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::trace;

/// Message tag, matched against posted receives
pub type Tag = u64;

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    pub tag: Tag,
    pub body: Vec<u8>,
}

impl Packet {
    pub fn new(tag: Tag, body: Vec<u8>) -> Self {
        Self { tag, body }
    }

    pub fn empty(tag: Tag) -> Self {
        Self {
            tag,
            body: Vec::new(),
        }
    }
}

/// A posted receive, completed by `Communicator::wait_any` once `source` delivers a
/// packet. The delivered packet must carry `tag`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub source: usize,
    pub tag: Tag,
}

#[derive(Error, Debug)]
pub enum CommError {
    #[error("Rank {rank} is outside of a communicator of size {size}")]
    InvalidRank { rank: usize, size: usize },
    #[error("Rank {peer} disconnected")]
    Disconnected { peer: usize },
    #[error("Expected tag {expected} from rank {peer}, received {found}")]
    TagMismatch { peer: usize, expected: Tag, found: Tag },
    #[error("Unexpected message from rank {peer} during {operation}")]
    Collective { peer: usize, operation: &'static str },
    #[error("The root of a broadcast has to provide a packet")]
    MissingRootPacket,
    #[error("Nothing to wait for")]
    NoRequests,
    #[error("A universe needs at least one rank")]
    EmptyUniverse,
    #[error("Failed to build the rank thread pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Traffic on the collective mesh
#[derive(Debug)]
enum Control {
    Split { color: Option<usize>, key: usize },
    Assigned(Option<Communicator>),
    Data(Packet),
    Arrived,
    Release,
}

/// One rank's handle on a group of ranks.
///
/// Clones share the underlying channels and may only be used from the thread owning
/// the rank.
#[derive(Debug, Clone)]
pub struct Communicator {
    context: u64,
    rank: usize,
    outbox: Vec<Sender<Packet>>,
    inbox: Vec<Receiver<Packet>>,
    control_out: Vec<Sender<Control>>,
    control_in: Vec<Receiver<Control>>,
}

/// create fully connected handles for `size` ranks, index i belongs to rank i
fn mesh(size: usize) -> Vec<Communicator> {
    let context = NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed);
    let mut handles = (0..size)
        .map(|rank| Communicator {
            context,
            rank,
            outbox: Vec::with_capacity(size),
            inbox: Vec::with_capacity(size),
            control_out: Vec::with_capacity(size),
            control_in: Vec::with_capacity(size),
        })
        .collect::<Vec<_>>();

    // outer loop over senders keeps inbox[i] == channel from rank i
    for from in 0..size {
        for to in 0..size {
            let (sender, receiver) = unbounded();
            handles[from].outbox.push(sender);
            handles[to].inbox.push(receiver);

            let (sender, receiver) = unbounded();
            handles[from].control_out.push(sender);
            handles[to].control_in.push(receiver);
        }
    }

    handles
}

impl Communicator {
    /// A communicator containing only the calling rank. Needs no collective.
    pub fn solo() -> Self {
        mesh(1).remove(0)
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.outbox.len()
    }

    /// Identifier shared by all handles created by the same mesh, used in logs
    pub fn context(&self) -> u64 {
        self.context
    }

    fn check(&self, rank: usize) -> Result<(), CommError> {
        if rank < self.size() {
            Ok(())
        } else {
            Err(CommError::InvalidRank {
                rank,
                size: self.size(),
            })
        }
    }

    pub fn send(&self, dest: usize, packet: Packet) -> Result<(), CommError> {
        self.check(dest)?;
        trace!(
            context = self.context,
            from = self.rank,
            to = dest,
            tag = packet.tag,
            "send"
        );

        self.outbox[dest]
            .send(packet)
            .map_err(|_| CommError::Disconnected { peer: dest })
    }

    /// blocking receive of the next packet from `source`
    pub fn recv(&self, source: usize) -> Result<Packet, CommError> {
        self.check(source)?;

        self.inbox[source]
            .recv()
            .map_err(|_| CommError::Disconnected { peer: source })
    }

    /// blocking receive that requires the next packet from `source` to carry `tag`
    pub fn recv_tagged(&self, source: usize, tag: Tag) -> Result<Packet, CommError> {
        let packet = self.recv(source)?;

        if packet.tag == tag {
            Ok(packet)
        } else {
            Err(CommError::TagMismatch {
                peer: source,
                expected: tag,
                found: packet.tag,
            })
        }
    }

    /// Block until any of the posted receives completes.
    ///
    /// Returns the position of the completed request within `requests` and its packet.
    pub fn wait_any(&self, requests: &[Request]) -> Result<(usize, Packet), CommError> {
        if requests.is_empty() {
            return Err(CommError::NoRequests);
        }

        let inboxes = requests
            .iter()
            .map(|request| {
                self.check(request.source)
                    .map(|_| &self.inbox[request.source])
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut select = Select::new();
        for inbox in inboxes.iter() {
            select.recv(inbox);
        }

        let operation = select.select();
        let position = operation.index();
        let request = requests[position];
        let packet = operation
            .recv(inboxes[position])
            .map_err(|_| CommError::Disconnected {
                peer: request.source,
            })?;

        if packet.tag != request.tag {
            return Err(CommError::TagMismatch {
                peer: request.source,
                expected: request.tag,
                found: packet.tag,
            });
        }

        Ok((position, packet))
    }

    fn control_send(&self, dest: usize, control: Control) -> Result<(), CommError> {
        self.control_out[dest]
            .send(control)
            .map_err(|_| CommError::Disconnected { peer: dest })
    }

    fn control_recv(&self, source: usize) -> Result<Control, CommError> {
        self.control_in[source]
            .recv()
            .map_err(|_| CommError::Disconnected { peer: source })
    }
}
