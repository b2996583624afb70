use super::{PartitionPlan, ProcessGroup, Rank};
use crate::comm::{CommError, Packet, Request, Tag};

/// What a process does within one level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// dedicated master, schedules but never executes jobs
    Master,
    /// member of server `id`, counted from 1
    Server { id: usize },
    /// left over, takes no jobs at this level or below
    Idle,
}

/// Point-to-point link between the scheduler of a level and one server leader
#[derive(Debug, Clone)]
pub struct Link {
    group: ProcessGroup,
    remote: Rank,
}

impl Link {
    pub(super) fn new(group: ProcessGroup, remote: Rank) -> Self {
        Self { group, remote }
    }

    pub fn remote(&self) -> Rank {
        self.remote
    }

    pub fn send(&self, packet: Packet) -> Result<(), CommError> {
        self.group.send(self.remote, packet)
    }

    pub fn recv(&self) -> Result<Packet, CommError> {
        self.group.recv(self.remote)
    }

    pub fn recv_tagged(&self, tag: Tag) -> Result<Packet, CommError> {
        self.group.recv_tagged(self.remote, tag)
    }

    /// post a receive for the reply carrying `tag`
    pub fn post(&self, tag: Tag) -> Request {
        self.group.post(self.remote, tag)
    }
}

/// One nesting level of partitioning as seen by the calling process.
#[derive(Debug, Clone)]
pub struct ParallelLevel {
    pub(super) plan: PartitionPlan,
    pub(super) parent_size: usize,
    pub(super) role: Role,
    // own sub-group: the server, the master alone, or the idle processes
    pub(super) group: ProcessGroup,
    // scheduler plus every server leader, only present on those
    pub(super) leaders: Option<ProcessGroup>,
    // scheduler side, one link per server in server order
    pub(super) server_links: Vec<Link>,
    // server leader side, link back to the scheduler
    pub(super) uplink: Option<Link>,
}

impl ParallelLevel {
    /// The root level: the whole group is a single peer server.
    pub fn world(group: ProcessGroup) -> Self {
        let plan = PartitionPlan::single(group.size());
        let leaders = group.is_leader().then(ProcessGroup::solo);
        let server_links = leaders
            .iter()
            .map(|leaders| Link::new(leaders.clone(), Rank::LEADER))
            .collect();

        Self {
            plan,
            parent_size: group.size(),
            role: Role::Server { id: 1 },
            group,
            leaders,
            server_links,
            uplink: None,
        }
    }

    /// A level below an idle process, it never communicates
    pub(crate) fn idle(group: ProcessGroup, plan: PartitionPlan) -> Self {
        Self {
            parent_size: group.size(),
            plan,
            role: Role::Idle,
            group,
            leaders: None,
            server_links: Vec::new(),
            uplink: None,
        }
    }

    pub fn plan(&self) -> &PartitionPlan {
        &self.plan
    }

    pub fn num_servers(&self) -> usize {
        self.plan.num_servers
    }

    pub fn procs_per_server(&self) -> usize {
        self.plan.procs_per_server
    }

    pub fn proc_remainder(&self) -> usize {
        self.plan.proc_remainder
    }

    pub fn dedicated_master(&self) -> bool {
        self.plan.dedicated_master
    }

    /// true if some processes of the parent group take no part in this level
    pub fn idle_partition(&self) -> bool {
        self.plan.idle_procs > 0
    }

    pub fn parent_size(&self) -> usize {
        self.parent_size
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// 0 for the master, 1..=num_servers for servers, num_servers + 1 when idle
    pub fn server_id(&self) -> usize {
        match self.role {
            Role::Master => 0,
            Role::Server { id } => id,
            Role::Idle => self.plan.num_servers + 1,
        }
    }

    pub fn group(&self) -> &ProcessGroup {
        &self.group
    }

    pub fn group_rank(&self) -> Rank {
        self.group.rank()
    }

    pub fn group_size(&self) -> usize {
        self.group.size()
    }

    pub fn is_group_leader(&self) -> bool {
        matches!(self.role, Role::Server { .. }) && self.group.is_leader()
    }

    pub fn is_master(&self) -> bool {
        self.role == Role::Master
    }

    pub fn is_idle(&self) -> bool {
        self.role == Role::Idle
    }

    /// true on the process distributing jobs and collecting results: the master, or the
    /// leader of server 1 in a peer partition
    pub fn is_scheduler(&self) -> bool {
        match self.role {
            Role::Master => true,
            Role::Server { id: 1 } => !self.plan.dedicated_master && self.group.is_leader(),
            _ => false,
        }
    }

    /// Rank of the scheduler within the parent group. The master and the leader of
    /// server 1 are both laid out at the front.
    pub fn scheduler_rank(&self) -> Rank {
        Rank::LEADER
    }

    /// true iff jobs have to cross sub-group boundaries at this level
    pub fn message_pass(&self) -> bool {
        self.plan.dedicated_master || self.plan.num_servers > 1
    }

    pub fn leaders(&self) -> Option<&ProcessGroup> {
        self.leaders.as_ref()
    }

    pub fn server_links(&self) -> &[Link] {
        &self.server_links
    }

    pub fn server_link(&self, id: usize) -> Option<&Link> {
        id.checked_sub(1)
            .and_then(|index| self.server_links.get(index))
    }

    pub fn uplink(&self) -> Option<&Link> {
        self.uplink.as_ref()
    }

    /// Broadcast configuration data from the scheduler to every server leader.
    ///
    /// Returns `None` on processes outside of the leaders group, which take no part.
    pub fn broadcast_to_leaders(&self, packet: Option<Packet>) -> Result<Option<Packet>, CommError> {
        self.leaders
            .as_ref()
            .map(|leaders| leaders.bcast(Rank::LEADER, packet))
            .transpose()
    }

    /// Broadcast from the server leader to the rest of the server
    pub fn broadcast_in_server(&self, packet: Option<Packet>) -> Result<Packet, CommError> {
        self.group.bcast(Rank::LEADER, packet)
    }
}
