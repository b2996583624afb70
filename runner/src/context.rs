//! Partition nesting of a run.
//!
//! A [`SchedulingContext`] is handed through every scheduling call instead of living
//! in global state. Levels are entered through [`LevelScope`] handles, which pop their
//! level when dropped, so levels always leave in reverse order of entry.

use crate::{
    comm::Communicator,
    config::ConcurrencyHints,
    executors::JobExecutor,
    partition::{self, ConfigurationError, ParallelLevel, PartitionError, ProcessGroup},
    schedule::{self, Job, JobResult, SchedulerError},
};
use serde::Serialize;
use std::{
    fmt,
    ops::{Deref, DerefMut},
};
use tracing::{debug, info};

/// Shape of one level as reported in the configuration summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LevelSummary {
    pub num_servers: usize,
    pub procs_per_server: usize,
    pub proc_remainder: usize,
    pub dedicated_master: bool,
    pub idle_procs: usize,
    pub message_pass: bool,
}

impl From<&ParallelLevel> for LevelSummary {
    fn from(level: &ParallelLevel) -> Self {
        Self {
            num_servers: level.num_servers(),
            procs_per_server: level.procs_per_server(),
            proc_remainder: level.proc_remainder(),
            dedicated_master: level.dedicated_master(),
            idle_procs: level.plan().idle_procs,
            message_pass: level.message_pass(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigurationReport {
    pub levels: Vec<LevelSummary>,
    // levels that actually distribute jobs
    pub depth: usize,
}

impl fmt::Display for ConfigurationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let yes_no = |flag: bool| if flag { "yes" } else { "no" };

        for (index, level) in self.levels.iter().enumerate() {
            writeln!(
                f,
                "Level {index}: {} servers x {} procs, remainder {}, master {}, idle {}, message passing {}",
                level.num_servers,
                level.procs_per_server,
                level.proc_remainder,
                yes_no(level.dedicated_master),
                level.idle_procs,
                yes_no(level.message_pass),
            )?;
        }

        write!(f, "Meaningful parallelism depth: {}", self.depth)
    }
}

/// Stack of levels of one run, rooted at the whole world
#[derive(Debug, Clone)]
pub struct ParallelConfiguration {
    levels: Vec<ParallelLevel>,
    depth: usize,
}

impl ParallelConfiguration {
    fn new(world: ParallelLevel) -> Self {
        Self {
            levels: vec![world],
            depth: 0,
        }
    }

    pub fn levels(&self) -> &[ParallelLevel] {
        &self.levels
    }

    /// the innermost level, the world level if nothing was pushed
    pub fn top(&self) -> &ParallelLevel {
        // the world level is never popped
        &self.levels[self.levels.len() - 1]
    }

    /// number of pushed levels that span more than one sub-group
    pub fn depth(&self) -> usize {
        self.depth
    }

    fn push(&mut self, level: ParallelLevel) {
        if level.message_pass() {
            self.depth += 1;
        }

        self.levels.push(level);
    }

    fn pop(&mut self) -> Option<ParallelLevel> {
        if self.levels.len() == 1 {
            return None;
        }

        let level = self.levels.pop()?;
        if level.message_pass() {
            self.depth -= 1;
        }

        Some(level)
    }

    pub fn report(&self) -> ConfigurationReport {
        ConfigurationReport {
            levels: self.levels.iter().map(LevelSummary::from).collect(),
            depth: self.depth,
        }
    }
}

/// Entry point for callers: owns the configurations of a run and the current one.
#[derive(Debug)]
pub struct SchedulingContext {
    world: ProcessGroup,
    configurations: Vec<ParallelConfiguration>,
    current: usize,
}

impl SchedulingContext {
    pub fn new(world: Communicator) -> Self {
        let world = ProcessGroup::new(world);
        let root = ParallelConfiguration::new(ParallelLevel::world(world.clone()));

        Self {
            world,
            configurations: vec![root],
            current: 0,
        }
    }

    pub fn world(&self) -> &ProcessGroup {
        &self.world
    }

    /// index of the current configuration
    pub fn current(&self) -> usize {
        self.current
    }

    pub fn configuration(&self) -> &ParallelConfiguration {
        &self.configurations[self.current]
    }

    /// the innermost level of the current configuration
    pub fn level(&self) -> &ParallelLevel {
        self.configuration().top()
    }

    /// Size and build a child of the innermost level without entering it
    pub fn resolve_and_build(
        &self,
        hints: &ConcurrencyHints,
    ) -> Result<ParallelLevel, PartitionError> {
        partition::resolve_and_build(self.level(), hints)
    }

    /// Push an already built level, it stays current until the scope is dropped
    pub fn push(&mut self, level: ParallelLevel) -> LevelScope<'_> {
        let configuration = self.current;
        self.configurations[configuration].push(level);

        debug!(
            configuration,
            levels = self.configurations[configuration].levels().len(),
            "Entered level"
        );

        LevelScope {
            context: self,
            configuration,
        }
    }

    /// Resolve, build and push a child of the innermost level. Collective over the
    /// innermost level's group.
    pub fn enter(&mut self, hints: &ConcurrencyHints) -> Result<LevelScope<'_>, PartitionError> {
        let level = self.resolve_and_build(hints)?;

        Ok(self.push(level))
    }

    /// Run one round of jobs on the innermost level, see [`schedule::run_jobs`]
    pub fn run_jobs<E>(
        &self,
        jobs: &[Job],
        executor: &mut E,
    ) -> Result<Option<Vec<JobResult>>, SchedulerError>
    where
        E: JobExecutor + ?Sized,
    {
        schedule::run_jobs(self.level(), jobs, executor)
    }

    /// true on the master and on server leaders of the innermost level
    pub fn is_leader(&self) -> bool {
        let level = self.level();

        level.is_master() || level.is_group_leader()
    }

    pub fn is_idle(&self) -> bool {
        self.level().is_idle()
    }

    /// Start a new configuration rooted at the world and return its index. The current
    /// configuration is left unchanged.
    pub fn add_configuration(&mut self) -> usize {
        let world = ParallelLevel::world(self.world.clone());
        self.configurations.push(ParallelConfiguration::new(world));

        self.configurations.len() - 1
    }

    pub fn switch_configuration(&mut self, index: usize) -> Result<(), ConfigurationError> {
        if index >= self.configurations.len() {
            return Err(ConfigurationError::UnknownConfiguration {
                index,
                count: self.configurations.len(),
            });
        }

        debug!(from = self.current, to = index, "Switching configuration");
        self.current = index;

        Ok(())
    }

    /// Log the summary of the current configuration, on the world leader only
    pub fn log_configuration(&self) {
        if self.world.is_leader() {
            info!(
                "Parallel configuration {}:\n{}",
                self.current,
                self.configuration().report()
            );
        }
    }
}

/// A level entered on a [`SchedulingContext`], popped again on drop.
///
/// Dereferences to the context, so nested levels are entered through the scope.
#[derive(Debug)]
pub struct LevelScope<'a> {
    context: &'a mut SchedulingContext,
    configuration: usize,
}

impl Deref for LevelScope<'_> {
    type Target = SchedulingContext;

    fn deref(&self) -> &Self::Target {
        self.context
    }
}

impl DerefMut for LevelScope<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.context
    }
}

impl Drop for LevelScope<'_> {
    fn drop(&mut self) {
        let configuration = &mut self.context.configurations[self.configuration];

        if configuration.pop().is_some() {
            debug!(
                configuration = self.configuration,
                levels = configuration.levels().len(),
                "Left level"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{comm::Universe, executors::EchoExecutor, schedule::Payload};

    #[test]
    fn scopes_pop_in_reverse_order() {
        let depths = Universe::launch(4, |world| {
            let mut context = SchedulingContext::new(world);
            let shape = |context: &SchedulingContext| {
                let configuration = context.configuration();
                (configuration.levels().len(), configuration.depth())
            };
            let mut seen = vec![shape(&context)];

            {
                let mut outer = context
                    .enter(&ConcurrencyHints::default().servers(2))
                    .unwrap();
                seen.push(shape(&*outer));

                {
                    let inner = outer.enter(&ConcurrencyHints::default()).unwrap();
                    seen.push(shape(&*inner));
                    assert_eq!(inner.level().group_size(), 2);
                }

                seen.push(shape(&*outer));
            }

            seen.push(shape(&context));
            seen
        })
        .unwrap();

        for seen in depths {
            assert_eq!(seen, vec![(1, 0), (2, 1), (3, 1), (2, 1), (1, 0)]);
        }
    }

    #[test]
    fn configurations_switch_explicitly() {
        let mut context = SchedulingContext::new(Communicator::solo());

        assert_eq!(
            context.switch_configuration(1),
            Err(ConfigurationError::UnknownConfiguration { index: 1, count: 1 })
        );

        {
            let _scope = context.enter(&ConcurrencyHints::default()).unwrap();
        }

        let second = context.add_configuration();
        assert_eq!(second, 1);
        assert_eq!(context.current(), 0);

        context.switch_configuration(second).unwrap();
        assert_eq!(context.current(), 1);
        assert_eq!(context.configuration().levels().len(), 1);
    }

    #[test]
    fn report_lists_every_level() {
        let reports = Universe::launch(5, |world| {
            let mut context = SchedulingContext::new(world);
            let scope = context
                .enter(&ConcurrencyHints::default().servers(2).procs_per_server(2))
                .unwrap();

            scope.log_configuration();
            scope.configuration().report()
        })
        .unwrap();

        let report = &reports[0];
        assert_eq!(report.depth, 1);
        assert_eq!(
            report.levels[1],
            LevelSummary {
                num_servers: 2,
                procs_per_server: 2,
                proc_remainder: 0,
                dedicated_master: true,
                idle_procs: 0,
                message_pass: true,
            }
        );
        assert_eq!(
            report.to_string().lines().last(),
            Some("Meaningful parallelism depth: 1")
        );
    }

    #[test]
    fn jobs_run_on_the_innermost_level() {
        let outcomes = Universe::launch(3, |world| {
            let mut context = SchedulingContext::new(world);
            let scope = context
                .enter(&ConcurrencyHints::default().servers(2).procs_per_server(1))
                .unwrap();

            let jobs = Job::set(["a", "b", "c"]);
            let results = scope.run_jobs(&jobs, &mut EchoExecutor).unwrap();

            (scope.is_leader(), scope.is_idle(), results)
        })
        .unwrap();

        let (leader, idle, results) = &outcomes[0];
        assert!(leader);
        assert!(!idle);
        assert_eq!(
            results
                .as_ref()
                .unwrap()
                .iter()
                .map(|result| result.payload.clone())
                .collect::<Vec<_>>(),
            vec![Payload::from("a"), Payload::from("b"), Payload::from("c")]
        );
        assert!(outcomes[1..].iter().all(|(_, _, results)| results.is_none()));
    }
}
