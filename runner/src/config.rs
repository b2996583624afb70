use crate::partition::resolve;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    fs::File,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to open run file")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse run file")]
    Parse(#[from] serde_yaml::Error),
    #[error("Executor {0} not supported")]
    UnsupportedExecutor(String),
    #[error("Executor parameter {0} is missing or malformed")]
    InvalidParameter(&'static str),
    #[error("Failed to retrieve hostname")]
    Hostname(#[from] nix::Error),
}

/// How the resolver sizes a partition when neither a server count nor a server size
/// was requested
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DefaultBias {
    /// as many servers as the concurrency can use
    #[default]
    PushUp,
    /// as many processors per server as the bounds allow
    PushDown,
}

/// Scheduling style requested by the operator
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingOverride {
    #[default]
    Default,
    Master,
    Peer,
}

impl fmt::Display for SchedulingOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Master => write!(f, "master"),
            Self::Peer => write!(f, "peer"),
        }
    }
}

/// Operator requests for a single concurrency scope.
///
/// Absent values leave the decision to the resolver.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct ConcurrencyHints {
    pub num_servers: Option<usize>,
    pub procs_per_server: Option<usize>,
    pub min_procs_per_server: usize,
    pub max_procs_per_server: Option<usize>,
    // estimated number of concurrent jobs the scope will generate
    pub max_concurrency: usize,
    // jobs a single server can absorb per scheduling pass
    pub capacity_multiplier: usize,
    pub default_bias: DefaultBias,
    pub scheduling: SchedulingOverride,
    // a master is not dedicated if it idles more than this share of the processors
    pub wasteful_master_fraction: f64,
}

impl Default for ConcurrencyHints {
    fn default() -> Self {
        Self {
            num_servers: None,
            procs_per_server: None,
            min_procs_per_server: 1,
            max_procs_per_server: None,
            max_concurrency: 1,
            capacity_multiplier: 1,
            default_bias: DefaultBias::PushUp,
            scheduling: SchedulingOverride::Default,
            wasteful_master_fraction: 0.1,
        }
    }
}

impl ConcurrencyHints {
    pub fn servers(mut self, num_servers: usize) -> Self {
        self.num_servers = Some(num_servers);
        self
    }

    pub fn procs_per_server(mut self, procs_per_server: usize) -> Self {
        self.procs_per_server = Some(procs_per_server);
        self
    }

    pub fn bounds(mut self, min: usize, max: Option<usize>) -> Self {
        self.min_procs_per_server = min;
        self.max_procs_per_server = max;
        self
    }

    pub fn concurrency(mut self, max_concurrency: usize, capacity_multiplier: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self.capacity_multiplier = capacity_multiplier;
        self
    }

    pub fn bias(mut self, default_bias: DefaultBias) -> Self {
        self.default_bias = default_bias;
        self
    }

    pub fn scheduling(mut self, scheduling: SchedulingOverride) -> Self {
        self.scheduling = scheduling;
        self
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    #[serde(default = "default_world_size")]
    pub world_size: usize,
    // nested concurrency scopes, outermost first
    #[serde(default)]
    pub scopes: Vec<ScopeConfig>,
    // jobs per scheduling round in the innermost scope
    pub jobs: usize,
    pub executor: ExecutorConfig,
    pub output: Option<OutputConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ScopeConfig {
    pub name: String,
    #[serde(default)]
    pub hints: ConcurrencyHints,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    // Name of the selected executor, see Executors::load for the selection proccess
    pub name: String,
    // parameters for the executor that apply to every job
    #[serde(default)]
    pub parameter: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    pub output: PathBuf,
    pub restart: PathBuf,
    #[serde(default)]
    pub node_local: bool,
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let file = File::open(path)?;

        Ok(serde_yaml::from_reader(file)?)
    }

    /// Check the whole run file and report every problem found, returns true if any
    /// check failed.
    ///
    /// Scopes are resolved against the size of the first server of their parent, which
    /// is the largest one whenever the processors don't divide evenly.
    pub fn preflight_checks(&self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.world_size == 0 {
            error!("world_size must be at least 1");
            contains_error = true;
        }

        if self.jobs == 0 {
            warn!("jobs is 0, every scheduling round will be empty");
        }

        if self.scopes.is_empty() {
            warn!("No scopes were defined, jobs run on the whole world as a single server");
        }

        let mut available = self.world_size.max(1);
        for scope in self.scopes.iter() {
            match resolve(available, &scope.hints) {
                Ok(plan) => available = plan.server_size(1),
                Err(e) => {
                    error!(
                        "scopes.{} can't be partitioned over {available} processors: {e}",
                        scope.name
                    );
                    contains_error = true;
                }
            }
        }

        match self.executor.name.to_lowercase().as_str() {
            "echo" => {}
            "command" => {
                if self
                    .executor
                    .parameter
                    .get("exec")
                    .and_then(|value| value.as_str())
                    .is_none()
                {
                    error!("executor.parameter.exec must be the path of the job command");
                    contains_error = true;
                }
            }
            name => {
                error!("executor.name ({name}) is not supported, please use `command` or `echo`");
                contains_error = true;
            }
        }

        contains_error
    }
}

fn default_world_size() -> usize {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUN_FILE: &str = "
world_size: 9
jobs: 12
scopes:
  - name: iterators
    hints:
      num_servers: 2
  - name: evaluations
    hints:
      max_concurrency: 8
      scheduling: master
executor:
  name: command
  parameter:
    exec: /bin/cat
    stdin: true
";

    #[test]
    fn run_file_parses() {
        let config: RunConfig = serde_yaml::from_str(RUN_FILE).unwrap();

        assert_eq!(config.world_size, 9);
        assert_eq!(config.scopes.len(), 2);
        assert_eq!(config.scopes[0].hints.num_servers, Some(2));
        assert_eq!(config.scopes[0].hints.min_procs_per_server, 1);
        assert_eq!(
            config.scopes[1].hints.scheduling,
            SchedulingOverride::Master
        );
        assert!(!config.preflight_checks());
    }

    #[test]
    fn unknown_hint_fields_are_rejected() {
        let result = serde_yaml::from_str::<ConcurrencyHints>("num_server: 3");

        assert!(result.is_err());
    }

    #[test]
    fn preflight_reports_unsatisfiable_scopes() {
        let mut config: RunConfig = serde_yaml::from_str(RUN_FILE).unwrap();
        config.scopes[1].hints.min_procs_per_server = 5;
        config.scopes[1].hints.max_procs_per_server = Some(3);

        assert!(config.preflight_checks());
    }

    #[test]
    fn preflight_reports_unknown_executor() {
        let mut config: RunConfig = serde_yaml::from_str(RUN_FILE).unwrap();
        config.executor.name = "slurm".into();

        assert!(config.preflight_checks());
    }
}
