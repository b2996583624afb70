use super::{ExecutorError, JobExecutor};
use crate::{
    config::{ConfigErrors, ExecutorConfig},
    partition::ProcessGroup,
    schedule::{Job, Payload},
};
use std::{
    ffi::OsString,
    io::{Read, Write},
    process::{Command, Stdio},
    time::{Duration, Instant},
};
use tracing::{debug, error, instrument, trace, warn};
use wait_timeout::ChildExt;

const DEFAULT_TIMEOUT_MS: u64 = 60_000;

/// Runs an external command per job on the server leader.
///
/// Job parameters are passed as the last argument, or on stdin if `stdin` is set. The
/// captured stdout is the job result. Other members of the server return an empty
/// payload.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    exec: OsString,
    params: Vec<OsString>,
    timeout: Duration,
    stdin: bool,
}

impl CommandExecutor {
    pub fn new(exec: impl Into<OsString>, timeout: Duration) -> Self {
        Self {
            exec: exec.into(),
            params: Vec::new(),
            timeout,
            stdin: false,
        }
    }

    pub fn params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    pub fn stdin(mut self, stdin: bool) -> Self {
        self.stdin = stdin;
        self
    }

    pub fn load(config: &ExecutorConfig) -> Result<Self, ConfigErrors> {
        let Some(exec) = config.parameter.get("exec").and_then(|exec| exec.as_str()) else {
            error!("The command executor requires executor.parameter.exec to be a str pointing to the job command");

            return Err(ConfigErrors::InvalidParameter("exec"));
        };

        let timeout = Duration::from_millis(match config.parameter.get("timeout") {
            Some(value) => match value.as_u64() {
                Some(value) => value,
                None => {
                    warn!("Executor timeout must be a natural number of milliseconds");
                    return Err(ConfigErrors::InvalidParameter("timeout"));
                }
            },
            None => DEFAULT_TIMEOUT_MS,
        });

        // either a single string split at whitespace or a list of arguments
        let params = match config.parameter.get("params") {
            None => Vec::new(),
            Some(serde_yaml::Value::String(params)) => {
                params.split_whitespace().map(String::from).collect()
            }
            Some(serde_yaml::Value::Sequence(params)) => params
                .iter()
                .map(|param| param.as_str().map(String::from))
                .collect::<Option<Vec<_>>>()
                .ok_or(ConfigErrors::InvalidParameter("params"))?,
            Some(_) => {
                warn!("Executor params must be a string or a list of strings");
                return Err(ConfigErrors::InvalidParameter("params"));
            }
        };

        let stdin = match config.parameter.get("stdin") {
            Some(value) => value
                .as_bool()
                .ok_or(ConfigErrors::InvalidParameter("stdin"))?,
            None => false,
        };

        Ok(Self::new(exec, timeout).params(params).stdin(stdin))
    }

    #[instrument(skip_all, level = "debug", fields(job = job.index))]
    fn run(&self, job: &Job) -> Result<Payload, ExecutorError> {
        let index = job.index;
        let mut command = Command::new(&self.exec);
        command
            .args(self.params.iter())
            .env("PARSCHED_JOB", index.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if self.stdin {
            command.stdin(Stdio::piped());
        } else {
            command.stdin(Stdio::null());
            if !job.params.is_empty() {
                command.arg(String::from_utf8_lossy(job.params.as_bytes()).into_owned());
            }
        }

        let start = Instant::now();
        let mut child = command
            .spawn()
            .map_err(|source| ExecutorError::Spawn { index, source })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(job.params.as_bytes())
                .map_err(|source| ExecutorError::Io { index, source })?;
            // closing stdin gives the command a clear end of input
            drop(stdin);
        }

        let status = match child
            .wait_timeout(self.timeout)
            .map_err(|source| ExecutorError::Io { index, source })?
        {
            Some(status) => status,
            None => {
                // child hasn't exited yet
                debug!("Job ran into timeout, killing {}", child.id());
                child
                    .kill()
                    .and_then(|_| child.wait())
                    .map_err(|source| ExecutorError::Io { index, source })?;

                return Err(ExecutorError::Timeout {
                    index,
                    timeout: self.timeout,
                });
            }
        };

        debug!(
            "Finished in {} ms | status: {}",
            start.elapsed().as_millis(),
            status.success()
        );

        if !status.success() {
            let mut stderr_buffer = String::new();
            if let Some(mut stderr) = child.stderr.take() {
                stderr
                    .read_to_string(&mut stderr_buffer)
                    .map_err(|source| ExecutorError::Io { index, source })?;
            }

            return Err(ExecutorError::Failed {
                index,
                reason: format!("{status}: {}", stderr_buffer.trim_end()),
            });
        }

        let mut output = Vec::new();
        if let Some(mut stdout) = child.stdout.take() {
            stdout
                .read_to_end(&mut output)
                .map_err(|source| ExecutorError::Io { index, source })?;
        }

        trace!("Output: {}", String::from_utf8_lossy(&output));

        Ok(output.into())
    }
}

impl JobExecutor for CommandExecutor {
    fn execute(&mut self, group: &ProcessGroup, job: &Job) -> Result<Payload, ExecutorError> {
        if group.is_leader() {
            self.run(job)
        } else {
            Ok(Payload::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(parameter: &str) -> ExecutorConfig {
        ExecutorConfig {
            name: "command".into(),
            parameter: serde_yaml::from_str(parameter).unwrap(),
        }
    }

    #[test]
    fn load_reads_parameters() {
        let executor =
            CommandExecutor::load(&config("{exec: /bin/echo, params: [-n, a], timeout: 500}"))
                .unwrap();

        assert_eq!(executor.exec, OsString::from("/bin/echo"));
        assert_eq!(executor.params, vec![OsString::from("-n"), OsString::from("a")]);
        assert_eq!(executor.timeout, Duration::from_millis(500));
        assert!(!executor.stdin);
    }

    #[test]
    fn load_requires_exec() {
        assert!(matches!(
            CommandExecutor::load(&config("{params: -v}")),
            Err(ConfigErrors::InvalidParameter("exec"))
        ));
        assert!(matches!(
            CommandExecutor::load(&config("{exec: cat, timeout: soon}")),
            Err(ConfigErrors::InvalidParameter("timeout"))
        ));
    }

    #[test]
    fn params_are_passed_as_argument() {
        let mut executor = CommandExecutor::new("echo", Duration::from_secs(5)).params(["-n"]);
        let result = executor
            .execute(&ProcessGroup::solo(), &Job::new(0, "x=4"))
            .unwrap();

        assert_eq!(result, Payload::from("x=4"));
    }

    #[test]
    fn params_are_passed_on_stdin() {
        let mut executor = CommandExecutor::new("cat", Duration::from_secs(5)).stdin(true);
        let result = executor
            .execute(&ProcessGroup::solo(), &Job::new(2, "line\n"))
            .unwrap();

        assert_eq!(result, Payload::from("line\n"));
    }

    #[test]
    fn slow_jobs_time_out() {
        let mut executor = CommandExecutor::new("sleep", Duration::from_millis(100));
        let result = executor.execute(&ProcessGroup::solo(), &Job::new(1, "5"));

        assert!(matches!(result, Err(ExecutorError::Timeout { index: 1, .. })));
    }

    #[test]
    fn failing_jobs_report_their_status() {
        let mut executor = CommandExecutor::new("false", Duration::from_secs(5));
        let result = executor.execute(&ProcessGroup::solo(), &Job::new(0, ""));

        assert!(matches!(result, Err(ExecutorError::Failed { index: 0, .. })));
    }

    #[test]
    fn missing_commands_fail_to_spawn() {
        let mut executor = CommandExecutor::new("/nonexistent/job", Duration::from_secs(1));
        let result = executor.execute(&ProcessGroup::solo(), &Job::new(0, ""));

        assert!(matches!(result, Err(ExecutorError::Spawn { index: 0, .. })));
    }
}
