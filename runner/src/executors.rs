mod local;

pub use local::CommandExecutor;

use crate::{
    config::{ConfigErrors, ExecutorConfig},
    partition::ProcessGroup,
    schedule::{Job, Payload},
};
use std::{io, time::Duration};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to spawn job {index}")]
    Spawn { index: usize, source: io::Error },
    #[error("Job {index} did not finish within {timeout:?}")]
    Timeout { index: usize, timeout: Duration },
    #[error("Job {index} failed: {reason}")]
    Failed { index: usize, reason: String },
    #[error("Failed to exchange data with job {index}")]
    Io { index: usize, source: io::Error },
}

/// Evaluates a single job.
///
/// Every member of the server executing the job is called with the server's group, so
/// an implementation may open nested levels on it or leave the work to the leader.
pub trait JobExecutor {
    fn execute(&mut self, group: &ProcessGroup, job: &Job) -> Result<Payload, ExecutorError>;
}

/// Executor backed by a closure
pub struct FnExecutor<F>(pub F);

impl<F> JobExecutor for FnExecutor<F>
where
    F: FnMut(&ProcessGroup, &Job) -> Result<Payload, ExecutorError>,
{
    fn execute(&mut self, group: &ProcessGroup, job: &Job) -> Result<Payload, ExecutorError> {
        (self.0)(group, job)
    }
}

/// Returns the job parameters as result
#[derive(Clone, Debug, Default)]
pub struct EchoExecutor;

impl JobExecutor for EchoExecutor {
    fn execute(&mut self, _group: &ProcessGroup, job: &Job) -> Result<Payload, ExecutorError> {
        Ok(job.params.clone())
    }
}

#[derive(Clone, Debug)]
pub enum Executors {
    Echo(EchoExecutor),
    Command(CommandExecutor),
}

impl Executors {
    pub fn load(config: &ExecutorConfig) -> Result<Self, ConfigErrors> {
        match config.name.to_lowercase().as_str() {
            "echo" => Ok(Self::Echo(EchoExecutor)),
            "command" => Ok(Self::Command(CommandExecutor::load(config)?)),
            _ => Err(ConfigErrors::UnsupportedExecutor(config.name.clone())),
        }
    }
}

impl JobExecutor for Executors {
    fn execute(&mut self, group: &ProcessGroup, job: &Job) -> Result<Payload, ExecutorError> {
        match self {
            Self::Echo(executor) => executor.execute(group, job),
            Self::Command(executor) => executor.execute(group, job),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor_config(name: &str, parameter: &str) -> ExecutorConfig {
        ExecutorConfig {
            name: name.into(),
            parameter: serde_yaml::from_str(parameter).unwrap(),
        }
    }

    #[test]
    fn echo_returns_the_parameters() {
        let mut executor = Executors::load(&executor_config("Echo", "{}")).unwrap();
        let result = executor
            .execute(&ProcessGroup::solo(), &Job::new(3, "x=1"))
            .unwrap();

        assert_eq!(result, Payload::from("x=1"));
    }

    #[test]
    fn unknown_executor_is_rejected() {
        assert!(matches!(
            Executors::load(&executor_config("slurm", "{}")),
            Err(ConfigErrors::UnsupportedExecutor(name)) if name == "slurm"
        ));
    }

    #[test]
    fn closures_see_the_job() {
        let mut seen = Vec::new();
        let mut executor = FnExecutor(|group: &ProcessGroup, job: &Job| {
            seen.push((group.size(), job.index));
            Ok::<_, ExecutorError>(Payload::default())
        });

        executor
            .execute(&ProcessGroup::solo(), &Job::new(7, ""))
            .unwrap();
        drop(executor);

        assert_eq!(seen, vec![(1, 7)]);
    }
}
