use clap::Parser;
use parsched_runner::{
    comm::{Communicator, Universe},
    config::{ConfigErrors, RunConfig, ScopeConfig},
    executors::Executors,
    partition::PartitionError,
    schedule::SchedulerError,
    tagging::{OutputTagger, OutputTags, ServerTagger},
    Job, JobResult, SchedulingContext,
};
use std::{fs::File, io::BufWriter, path::PathBuf, process::ExitCode};
use thiserror::Error;
use tracing::{debug, error, info};
use tracing_unwrap::ResultExt;

/// Partition a pool of ranks along nested concurrency scopes and run jobs on the
/// innermost one.
#[derive(Parser, Debug)]
#[command(name = "parsched", version, about)]
struct Cli {
    /// Path to the YAML run file
    run_file: PathBuf,

    /// Number of ranks, overrides world_size of the run file
    #[arg(long)]
    world_size: Option<usize>,

    /// Jobs per round, overrides jobs of the run file
    #[arg(long)]
    jobs: Option<usize>,
}

#[derive(Error, Debug)]
enum RunError {
    #[error("Failed to partition")]
    Partition(#[from] PartitionError),
    #[error("Failed to schedule jobs")]
    Scheduler(#[from] SchedulerError),
    #[error("Failed to tag output")]
    Tagging(#[from] ConfigErrors),
    #[error("Failed to write results")]
    Output(#[from] std::io::Error),
    #[error("Failed to encode results")]
    Encode(#[from] serde_json::Error),
}

/// results collected by one scheduler of the innermost level
struct Round {
    tags: Option<OutputTags>,
    results: Vec<JobResult>,
}

fn run_scopes(
    context: &mut SchedulingContext,
    scopes: &[ScopeConfig],
    jobs: &[Job],
    executor: &mut Executors,
    tagger: &ServerTagger,
    tags: Option<OutputTags>,
) -> Result<Option<Round>, RunError> {
    let Some((scope, inner)) = scopes.split_first() else {
        context.log_configuration();

        return Ok(context
            .run_jobs(jobs, executor)?
            .map(|results| Round { tags, results }));
    };

    let mut level = context.enter(&scope.hints)?;
    debug!(
        scope = %scope.name,
        server = level.level().server_id(),
        idle = level.is_idle(),
        "Entered scope"
    );

    let tags = match tags {
        Some(base) => tagger.tag(level.level(), &base)?,
        None => None,
    };

    run_scopes(&mut level, inner, jobs, executor, tagger, tags)
}

fn run_rank(
    world: Communicator,
    config: &RunConfig,
    mut executor: Executors,
) -> Result<Option<Round>, RunError> {
    let mut context = SchedulingContext::new(world);
    let jobs = Job::set((0..config.jobs).map(|index| index.to_string()));
    let tagger = ServerTagger {
        node_local: config
            .output
            .as_ref()
            .map(|output| output.node_local)
            .unwrap_or(false),
    };
    let tags = config
        .output
        .as_ref()
        .map(|output| OutputTags::new(&output.output, &output.restart));

    run_scopes(
        &mut context,
        &config.scopes,
        &jobs,
        &mut executor,
        &tagger,
        tags,
    )
}

fn report(round: &Round) -> Result<(), RunError> {
    match round.tags.as_ref() {
        Some(tags) => {
            let file = BufWriter::new(File::create(&tags.output)?);
            serde_json::to_writer_pretty(file, &round.results)?;

            info!(
                output = ?tags.output,
                restart = ?tags.restart,
                "Wrote {} results",
                round.results.len()
            );
        }
        None => {
            for result in round.results.iter() {
                println!(
                    "job {} (server {}): {}",
                    result.index,
                    result.server,
                    String::from_utf8_lossy(result.payload.as_bytes()).trim_end()
                );
            }
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = RunConfig::load(&cli.run_file).unwrap_or_log();

    if let Some(world_size) = cli.world_size {
        config.world_size = world_size;
    }
    if let Some(jobs) = cli.jobs {
        config.jobs = jobs;
    }

    if config.preflight_checks() {
        error!("Run file contains errors, please fix them before starting a run");
        return ExitCode::FAILURE;
    }

    let executor = Executors::load(&config.executor).unwrap_or_log();

    info!(
        world_size = config.world_size,
        scopes = config.scopes.len(),
        jobs = config.jobs,
        "Starting run"
    );

    let outcomes = Universe::launch(config.world_size, |world| {
        run_rank(world, &config, executor.clone())
    })
    .unwrap_or_log();

    let mut failed = false;
    for (rank, outcome) in outcomes.into_iter().enumerate() {
        match outcome.and_then(|round| round.as_ref().map(report).transpose()) {
            Ok(_) => {}
            Err(e) => {
                error!(rank, "Rank failed: {e:?}");
                failed = true;
            }
        }
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
