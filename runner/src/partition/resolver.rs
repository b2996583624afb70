use super::ConfigurationError;
use crate::config::{ConcurrencyHints, DefaultBias, SchedulingOverride};
use std::fmt;
use tracing::{debug, warn};

/// Scheduling protocol a partition is realized with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduling {
    /// one process set aside to self-schedule jobs onto the servers
    Master,
    /// no master, servers own a static slice of the jobs
    Peer,
}

/// Non-fatal notices emitted while resolving a partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advisory {
    SchedulingOverridden {
        requested: SchedulingOverride,
        realized: Scheduling,
        reason: &'static str,
    },
    IdleProcessors {
        count: usize,
    },
}

impl fmt::Display for Advisory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SchedulingOverridden {
                requested,
                realized,
                reason,
            } => write!(
                f,
                "{requested} scheduling requested but {realized:?} scheduling is used: {reason}"
            ),
            Self::IdleProcessors { count } => {
                write!(f, "{count} processors remain idle in this partition")
            }
        }
    }
}

/// Resolved shape of a partition.
///
/// `num_servers * procs_per_server + proc_remainder + master + idle_procs` always equals
/// the processors the plan was resolved for. The first `proc_remainder` servers get one
/// extra processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    pub num_servers: usize,
    pub procs_per_server: usize,
    pub proc_remainder: usize,
    pub dedicated_master: bool,
    pub idle_procs: usize,
    pub advisories: Vec<Advisory>,
}

impl PartitionPlan {
    /// a single peer server spanning `procs` processors
    pub fn single(procs: usize) -> Self {
        Self::peer(1, procs, 0)
    }

    fn peer(num_servers: usize, procs_per_server: usize, proc_remainder: usize) -> Self {
        Self {
            num_servers,
            procs_per_server,
            proc_remainder,
            dedicated_master: false,
            idle_procs: 0,
            advisories: Vec::new(),
        }
    }

    fn master(num_servers: usize, procs_per_server: usize, proc_remainder: usize) -> Self {
        Self {
            dedicated_master: true,
            ..Self::peer(num_servers, procs_per_server, proc_remainder)
        }
    }

    fn with_master(dedicated_master: bool, num_servers: usize, procs_per_server: usize) -> Self {
        if dedicated_master {
            Self::master(num_servers, procs_per_server, 0)
        } else {
            Self::peer(num_servers, procs_per_server, 0)
        }
    }

    fn advise(mut self, advisory: Option<Advisory>) -> Self {
        self.advisories.extend(advisory);
        self
    }

    pub fn scheduling(&self) -> Scheduling {
        if self.dedicated_master {
            Scheduling::Master
        } else {
            Scheduling::Peer
        }
    }

    /// processors assigned to servers or the master
    pub fn allocated(&self) -> usize {
        self.num_servers * self.procs_per_server
            + self.proc_remainder
            + usize::from(self.dedicated_master)
    }

    pub fn total(&self) -> usize {
        self.allocated() + self.idle_procs
    }

    /// size of server `id`, counted from 1
    pub fn server_size(&self, id: usize) -> usize {
        if id == 0 || id > self.num_servers {
            0
        } else {
            self.procs_per_server + usize::from(id <= self.proc_remainder)
        }
    }

    fn settle(mut self, available: usize) -> Self {
        self.idle_procs = available.saturating_sub(self.allocated());

        if self.idle_procs > 0 {
            self.advisories.push(Advisory::IdleProcessors {
                count: self.idle_procs,
            });
        }

        self
    }
}

/// validated bounds on the processors per server, `max` never exceeds the processors
/// available
#[derive(Debug, Clone, Copy)]
struct Bounds {
    min: usize,
    max: usize,
}

impl Bounds {
    fn validate(available: usize, hints: &ConcurrencyHints) -> Result<Self, ConfigurationError> {
        let min = hints.min_procs_per_server;

        if min == 0 {
            return Err(ConfigurationError::ZeroRequest("min_procs_per_server"));
        }

        if let Some(max) = hints.max_procs_per_server {
            if max == 0 {
                return Err(ConfigurationError::ZeroRequest("max_procs_per_server"));
            }
            if min > max {
                return Err(ConfigurationError::InvertedBounds { min, max });
            }
        }

        if available == 0 {
            return Err(ConfigurationError::NoProcessors);
        }

        if hints.num_servers == Some(0) {
            return Err(ConfigurationError::ZeroRequest("num_servers"));
        }
        if hints.procs_per_server == Some(0) {
            return Err(ConfigurationError::ZeroRequest("procs_per_server"));
        }

        if let Some(requested) = hints.num_servers.filter(|requested| *requested > available) {
            return Err(ConfigurationError::ServersExceedAvailable {
                requested,
                available,
            });
        }

        if let Some(requested) = hints.procs_per_server {
            if requested > available {
                return Err(ConfigurationError::ProcsPerServerExceedAvailable {
                    requested,
                    available,
                });
            }

            if let Some(num_servers) = hints.num_servers {
                if num_servers * requested > available {
                    return Err(ConfigurationError::ProductExceedsAvailable {
                        num_servers,
                        procs_per_server: requested,
                        available,
                    });
                }
            }

            let max = hints.max_procs_per_server.unwrap_or(available);
            if requested < min || requested > max {
                return Err(ConfigurationError::ProcsPerServerOutOfBounds {
                    requested,
                    min,
                    max,
                });
            }
        }

        Ok(Self {
            min,
            max: hints
                .max_procs_per_server
                .unwrap_or(available)
                .min(available),
        })
    }

    /// Spread `pool` processors over `num_servers`, truncating at `max` instead of
    /// growing past it. Returns processors per server and the remainder handed out one
    /// by one to the first servers.
    fn fill(&self, pool: usize, num_servers: usize) -> (usize, usize) {
        let procs_per_server = pool / num_servers;

        if procs_per_server >= self.max {
            (self.max, 0)
        } else {
            (procs_per_server, pool % num_servers)
        }
    }
}

fn overridden(
    hints: &ConcurrencyHints,
    realized: Scheduling,
    reason: &'static str,
) -> Option<Advisory> {
    let conflicting = match realized {
        Scheduling::Master => SchedulingOverride::Peer,
        Scheduling::Peer => SchedulingOverride::Master,
    };

    (hints.scheduling == conflicting).then_some(Advisory::SchedulingOverridden {
        requested: hints.scheduling,
        realized,
        reason,
    })
}

/// Size a partition of `available` processors according to `hints`.
///
/// Hard requests (server count, server size) are honored exactly or rejected, soft
/// preferences (scheduling style, bias) are relaxed with an [`Advisory`]. Every
/// advisory is logged as a warning.
pub fn resolve(
    available: usize,
    hints: &ConcurrencyHints,
) -> Result<PartitionPlan, ConfigurationError> {
    let bounds = Bounds::validate(available, hints)?;

    let plan = if available == 1 {
        PartitionPlan::single(1).advise(overridden(
            hints,
            Scheduling::Peer,
            "a single processor can't host a master",
        ))
    } else {
        match (hints.num_servers, hints.procs_per_server) {
            (Some(num_servers), Some(procs_per_server)) => {
                fixed(available, num_servers, procs_per_server, hints)
            }
            (Some(num_servers), None) => servers_only(available, num_servers, bounds, hints)?,
            (None, Some(procs_per_server)) => size_only(available, procs_per_server, hints),
            (None, None) => match hints.default_bias {
                DefaultBias::PushDown => push_down(available, bounds, hints)?,
                DefaultBias::PushUp => push_up(available, bounds, hints)?,
            },
        }
    };
    let plan = plan.settle(available);

    for advisory in plan.advisories.iter() {
        warn!("{advisory}");
    }

    debug!(
        available,
        servers = plan.num_servers,
        procs_per_server = plan.procs_per_server,
        remainder = plan.proc_remainder,
        master = plan.dedicated_master,
        idle = plan.idle_procs,
        "Resolved partition"
    );

    Ok(plan)
}

/// both the server count and the server size are given
fn fixed(
    available: usize,
    num_servers: usize,
    procs_per_server: usize,
    hints: &ConcurrencyHints,
) -> PartitionPlan {
    if num_servers * procs_per_server == available {
        PartitionPlan::peer(num_servers, procs_per_server, 0).advise(overridden(
            hints,
            Scheduling::Peer,
            "the requested servers occupy every processor",
        ))
    } else if hints.scheduling == SchedulingOverride::Peer {
        PartitionPlan::peer(num_servers, procs_per_server, 0)
    } else {
        PartitionPlan::master(num_servers, procs_per_server, 0)
    }
}

fn servers_only(
    available: usize,
    num_servers: usize,
    bounds: Bounds,
    hints: &ConcurrencyHints,
) -> Result<PartitionPlan, ConfigurationError> {
    let capacity = hints.capacity_multiplier.max(1);
    let wants_master = match hints.scheduling {
        SchedulingOverride::Peer => false,
        SchedulingOverride::Master => true,
        SchedulingOverride::Default => {
            num_servers > 1 && hints.max_concurrency > num_servers * capacity
        }
    };

    let mut advisory = None;
    let dedicated_master = if wants_master && (available - 1) / num_servers < bounds.min {
        advisory = overridden(
            hints,
            Scheduling::Peer,
            "a master would leave servers below their minimum size",
        );
        false
    } else {
        wants_master
    };

    let pool = available - usize::from(dedicated_master);
    if pool / num_servers < bounds.min {
        return Err(ConfigurationError::BelowMinimum {
            num_servers,
            min: bounds.min,
            available,
        });
    }

    let (procs_per_server, proc_remainder) = bounds.fill(pool, num_servers);
    let plan = if dedicated_master {
        PartitionPlan::master(num_servers, procs_per_server, proc_remainder)
    } else {
        PartitionPlan::peer(num_servers, procs_per_server, proc_remainder)
    };

    Ok(plan.advise(advisory))
}

fn size_only(available: usize, procs_per_server: usize, hints: &ConcurrencyHints) -> PartitionPlan {
    if procs_per_server == available {
        return PartitionPlan::single(available).advise(overridden(
            hints,
            Scheduling::Peer,
            "a single server occupies every processor",
        ));
    }

    let capacity = hints.capacity_multiplier.max(1);
    let peer_servers = available / procs_per_server;
    let master_servers = (available - 1) / procs_per_server;

    let dedicated_master = match hints.scheduling {
        SchedulingOverride::Peer => false,
        // procs_per_server < available, so at least one server fits next to a master
        SchedulingOverride::Master => true,
        SchedulingOverride::Default => {
            let master_idle = (available - 1) % procs_per_server;
            let wasteful =
                master_idle as f64 > hints.wasteful_master_fraction * available as f64;

            master_servers > 1 && hints.max_concurrency > master_servers * capacity && !wasteful
        }
    };

    let num_servers = if dedicated_master {
        master_servers
    } else {
        peer_servers
    };

    PartitionPlan::with_master(dedicated_master, num_servers, procs_per_server)
}

fn push_down(
    available: usize,
    bounds: Bounds,
    hints: &ConcurrencyHints,
) -> Result<PartitionPlan, ConfigurationError> {
    let mut advisory = None;
    let dedicated_master = match hints.scheduling {
        SchedulingOverride::Master if available - 1 >= bounds.min => true,
        SchedulingOverride::Master => {
            advisory = overridden(
                hints,
                Scheduling::Peer,
                "a master would leave the server below its minimum size",
            );
            false
        }
        _ => false,
    };

    let pool = available - usize::from(dedicated_master);
    if pool < bounds.min {
        return Err(ConfigurationError::BelowMinimum {
            num_servers: 1,
            min: bounds.min,
            available,
        });
    }

    let procs_per_server = bounds.max.min(pool);
    let num_servers = pool / procs_per_server;

    Ok(PartitionPlan::with_master(dedicated_master, num_servers, procs_per_server).advise(advisory))
}

fn push_up(
    available: usize,
    bounds: Bounds,
    hints: &ConcurrencyHints,
) -> Result<PartitionPlan, ConfigurationError> {
    let capacity = hints.capacity_multiplier.max(1);
    let concurrency = hints.max_concurrency.max(1);
    let wanted = (concurrency + capacity - 1) / capacity;
    let limit = available / bounds.min;

    if limit == 0 {
        return Err(ConfigurationError::BelowMinimum {
            num_servers: 1,
            min: bounds.min,
            available,
        });
    }

    let mut num_servers = wanted.min(limit);
    let wants_master = match hints.scheduling {
        SchedulingOverride::Peer => false,
        SchedulingOverride::Master => true,
        SchedulingOverride::Default => {
            num_servers > 1 && concurrency > num_servers * capacity
        }
    };

    let mut advisory = None;
    let mut dedicated_master = false;

    if wants_master {
        let with_master = ((available - 1) / bounds.min).min(num_servers);
        let worthwhile = match hints.scheduling {
            SchedulingOverride::Master => with_master >= 1,
            _ => with_master > 1,
        };

        if worthwhile {
            dedicated_master = true;
            num_servers = with_master;
        } else {
            advisory = overridden(
                hints,
                Scheduling::Peer,
                "a master would leave no server of minimum size",
            );
        }
    }

    let pool = available - usize::from(dedicated_master);
    let (procs_per_server, proc_remainder) = bounds.fill(pool, num_servers);

    let plan = if dedicated_master {
        PartitionPlan::master(num_servers, procs_per_server, proc_remainder)
    } else {
        PartitionPlan::peer(num_servers, procs_per_server, proc_remainder)
    };

    Ok(plan.advise(advisory))
}
