use super::{
    ConfigurationError, Link, ParallelLevel, PartitionError, PartitionPlan, ProcessGroup, Rank,
    Role,
};
use tracing::{debug, info, instrument};

/// Placement of one parent process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub role: Role,
    // position within the sub-group
    pub local_rank: usize,
}

/// Lay out `plan` over a parent group of `parent_size` processes.
///
/// The master, if any, takes parent rank 0. Servers follow as contiguous rank ranges in
/// server order, the first `proc_remainder` of them one process larger. Whatever is left
/// at the end is idle.
pub fn assign(plan: &PartitionPlan, parent_size: usize) -> Result<Vec<Assignment>, ConfigurationError> {
    let required = plan.allocated();
    if required > parent_size || plan.num_servers == 0 || plan.procs_per_server == 0 {
        return Err(ConfigurationError::PlanExceedsGroup {
            required,
            available: parent_size,
        });
    }

    let mut layout = Vec::with_capacity(parent_size);

    if plan.dedicated_master {
        layout.push(Assignment {
            role: Role::Master,
            local_rank: 0,
        });
    }

    for id in 1..=plan.num_servers {
        layout.extend((0..plan.server_size(id)).map(|local_rank| Assignment {
            role: Role::Server { id },
            local_rank,
        }));
    }

    let idle = parent_size - layout.len();
    layout.extend((0..idle).map(|local_rank| Assignment {
        role: Role::Idle,
        local_rank,
    }));

    Ok(layout)
}

/// Materialize `plan` over `parent`. Collective over the whole parent group, idle
/// processes included.
#[instrument(skip_all, level = "debug", fields(servers = plan.num_servers, procs_per_server = plan.procs_per_server))]
pub fn build(parent: &ProcessGroup, plan: PartitionPlan) -> Result<ParallelLevel, PartitionError> {
    let layout = assign(&plan, parent.size())?;
    let fully_allocated = layout.len() == plan.allocated();
    let own = layout[parent.rank().index()];

    let level = if !plan.dedicated_master && plan.num_servers == 1 && fully_allocated {
        alias(parent, plan)
    } else if plan.procs_per_server == 1 && plan.proc_remainder == 0 && fully_allocated {
        direct(parent, plan, own)?
    } else {
        split(parent, plan, own)?
    };

    if parent.is_leader() {
        info!(
            servers = level.num_servers(),
            procs_per_server = level.procs_per_server(),
            remainder = level.proc_remainder(),
            master = level.dedicated_master(),
            idle = level.plan.idle_procs,
            "Partitioned {} processors",
            parent.size()
        );
    }

    Ok(level)
}

/// single peer server covering the parent, the parent group is reused as is
fn alias(parent: &ProcessGroup, plan: PartitionPlan) -> ParallelLevel {
    debug!("Single server level, reusing parent group");

    ParallelLevel::world(parent.clone()).with_plan(plan)
}

/// one process per server, ranks map straight onto server ids without a split
fn direct(
    parent: &ProcessGroup,
    plan: PartitionPlan,
    own: Assignment,
) -> Result<ParallelLevel, PartitionError> {
    debug!("Single process servers, skipping group split");

    let offset = usize::from(!plan.dedicated_master);
    let scheduler = parent.is_leader();
    let server_links = if scheduler {
        links_to_servers(parent, &plan, offset)?
    } else {
        Vec::new()
    };
    let uplink = (!scheduler).then(|| Link::new(parent.clone(), Rank::LEADER));

    Ok(ParallelLevel {
        parent_size: parent.size(),
        role: own.role,
        group: ProcessGroup::solo(),
        leaders: Some(parent.clone()),
        server_links,
        uplink,
        plan,
    })
}

fn split(
    parent: &ProcessGroup,
    plan: PartitionPlan,
    own: Assignment,
) -> Result<ParallelLevel, PartitionError> {
    let color = match own.role {
        Role::Master => 0,
        Role::Server { id } => id,
        Role::Idle => plan.num_servers + 1,
    };

    // idle processes get a group of their own so they still take part in the split
    let group = parent
        .split(Some(color), own.local_rank)?
        .ok_or(PartitionError::MissingGroup {
            rank: parent.rank(),
        })?;

    // leaders ordered by server id put the scheduler at rank 0
    let leading = match own.role {
        Role::Master => true,
        Role::Server { .. } => own.local_rank == 0,
        Role::Idle => false,
    };
    let leaders = parent.split(leading.then_some(0), color)?;

    let offset = usize::from(!plan.dedicated_master);
    let mut server_links = Vec::new();
    let mut uplink = None;

    if let Some(leaders) = leaders.as_ref() {
        if leaders.is_leader() {
            server_links = links_to_servers(leaders, &plan, offset)?;
        } else {
            uplink = Some(Link::new(leaders.clone(), Rank::LEADER));
        }
    }

    debug!(
        color,
        group_rank = %group.rank(),
        group_size = group.size(),
        leader = leading,
        "Joined sub-group"
    );

    Ok(ParallelLevel {
        parent_size: parent.size(),
        role: own.role,
        group,
        leaders,
        server_links,
        uplink,
        plan,
    })
}

/// links from the scheduler to the leader of every server, in server order
fn links_to_servers(
    leaders: &ProcessGroup,
    plan: &PartitionPlan,
    offset: usize,
) -> Result<Vec<Link>, PartitionError> {
    (1..=plan.num_servers)
        .map(|id| {
            let remote = leaders
                .member(id - offset)
                .ok_or(PartitionError::MissingGroup {
                    rank: leaders.rank(),
                })?;

            Ok(Link::new(leaders.clone(), remote))
        })
        .collect()
}

impl ParallelLevel {
    fn with_plan(mut self, plan: PartitionPlan) -> Self {
        self.plan = plan;
        self
    }
}
