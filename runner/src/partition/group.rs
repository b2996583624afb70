use crate::comm::{CommError, Communicator, Packet, Request, Tag};
use std::fmt;

/// Rank of a process within one `ProcessGroup`.
///
/// Only handed out by a group, so it is always valid for the group it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rank(usize);

impl Rank {
    pub const LEADER: Rank = Rank(0);

    pub fn index(self) -> usize {
        self.0
    }

    pub fn is_leader(self) -> bool {
        self == Self::LEADER
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A set of processes able to communicate among themselves
#[derive(Debug, Clone)]
pub struct ProcessGroup {
    comm: Communicator,
}

impl ProcessGroup {
    pub fn new(comm: Communicator) -> Self {
        Self { comm }
    }

    /// group made up of the calling process only
    pub fn solo() -> Self {
        Self::new(Communicator::solo())
    }

    pub fn rank(&self) -> Rank {
        Rank(self.comm.rank())
    }

    pub fn size(&self) -> usize {
        self.comm.size()
    }

    pub fn is_leader(&self) -> bool {
        self.rank().is_leader()
    }

    /// the member at position `index`, if the group is large enough
    pub fn member(&self, index: usize) -> Option<Rank> {
        (index < self.size()).then_some(Rank(index))
    }

    pub fn members(&self) -> impl Iterator<Item = Rank> {
        (0..self.size()).map(Rank)
    }

    pub fn communicator(&self) -> &Communicator {
        &self.comm
    }

    pub fn send(&self, to: Rank, packet: Packet) -> Result<(), CommError> {
        self.comm.send(to.0, packet)
    }

    pub fn recv(&self, from: Rank) -> Result<Packet, CommError> {
        self.comm.recv(from.0)
    }

    pub fn recv_tagged(&self, from: Rank, tag: Tag) -> Result<Packet, CommError> {
        self.comm.recv_tagged(from.0, tag)
    }

    /// post a receive for a packet from `from` carrying `tag`
    pub fn post(&self, from: Rank, tag: Tag) -> Request {
        Request {
            source: from.0,
            tag,
        }
    }

    pub fn wait_any(&self, requests: &[Request]) -> Result<(usize, Packet), CommError> {
        self.comm.wait_any(requests)
    }

    pub fn bcast(&self, root: Rank, packet: Option<Packet>) -> Result<Packet, CommError> {
        self.comm.bcast(root.0, packet)
    }

    pub fn barrier(&self) -> Result<(), CommError> {
        self.comm.barrier()
    }

    pub(crate) fn split(&self, color: Option<usize>, key: usize) -> Result<Option<Self>, CommError> {
        Ok(self.comm.split(color, key)?.map(Self::new))
    }
}
