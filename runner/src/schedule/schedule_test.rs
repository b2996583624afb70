use super::{owner, run_jobs, Job, JobResult, Payload, ProtocolViolation, SchedulerError};
use crate::{
    comm::{Packet, Universe},
    config::{ConcurrencyHints, SchedulingOverride},
    executors::{ExecutorError, FnExecutor},
    partition::{resolve_and_build, ParallelLevel, ProcessGroup},
};
use itertools::Itertools;
use std::{thread, time::Duration};

/// Results at the scheduler (if this rank is one) and the jobs this rank executed
type Outcome = (Option<Vec<JobResult>>, Vec<usize>);

fn square(job: &Job) -> Result<Payload, ExecutorError> {
    let value: u64 = job.params.unpack().unwrap();
    Ok(Payload::pack(&(value * value)).unwrap())
}

fn numbers(count: u64) -> Vec<Job> {
    Job::set((0..count).map(|value| Payload::pack(&value).unwrap()))
}

fn run(size: usize, hints: ConcurrencyHints, jobs: Vec<Job>, delay: fn(&Job) -> u64) -> Vec<Outcome> {
    Universe::launch(size, |world| {
        let world = ParallelLevel::world(ProcessGroup::new(world));
        let level = resolve_and_build(&world, &hints).unwrap();

        let mut executed = Vec::new();
        let mut executor = FnExecutor(|_group: &ProcessGroup, job: &Job| {
            thread::sleep(Duration::from_millis(delay(job)));
            executed.push(job.index);
            square(job)
        });

        let results = run_jobs(&level, &jobs, &mut executor).unwrap();
        drop(executor);

        (results, executed)
    })
    .unwrap()
}

fn uniform(_job: &Job) -> u64 {
    0
}

fn assert_squares(results: &[JobResult], count: usize) {
    assert_eq!(results.len(), count);

    for (index, result) in results.iter().enumerate() {
        assert_eq!(result.index, index);
        let value: u64 = result.payload.unpack().unwrap();
        assert_eq!(value, (index * index) as u64);
    }
}

#[test]
fn owner_is_strided() {
    assert_eq!((0..6).map(|index| owner(index, 3)).collect_vec(), vec![1, 2, 3, 1, 2, 3]);
    assert_eq!(owner(5, 1), 1);
}

#[test]
fn self_scheduling_dispatches_every_job_once() {
    let hints = ConcurrencyHints::default().servers(3).procs_per_server(1);
    let outcomes = run(4, hints, numbers(10), uniform);

    let (results, executed) = &outcomes[0];
    assert!(executed.is_empty());
    let results = results.as_ref().unwrap();
    assert_squares(results, 10);

    // the first batch goes out in index order, one job per server
    for server in 1..=3 {
        assert_eq!(outcomes[server].1.first(), Some(&(server - 1)));
        assert!(outcomes[server].0.is_none());
    }

    let all = outcomes[1..]
        .iter()
        .flat_map(|(_, executed)| executed.iter().copied())
        .sorted()
        .collect_vec();
    assert_eq!(all, (0..10).collect_vec());

    for result in results {
        assert!(outcomes[result.server].1.contains(&result.index));
    }
}

#[test]
fn self_scheduling_balances_slow_jobs() {
    fn slow_first(job: &Job) -> u64 {
        if job.index == 0 {
            500
        } else {
            0
        }
    }

    let hints = ConcurrencyHints::default().servers(3).procs_per_server(1);
    let outcomes = run(4, hints, numbers(10), slow_first);

    assert_squares(outcomes[0].0.as_ref().unwrap(), 10);
    assert_eq!(outcomes[1].1, vec![0]);
    assert_eq!(outcomes[2].1.len() + outcomes[3].1.len(), 9);
}

#[test]
fn self_scheduling_with_fewer_jobs_than_servers() {
    let hints = ConcurrencyHints::default().servers(3).procs_per_server(1);
    let outcomes = run(4, hints.clone(), numbers(2), uniform);

    assert_squares(outcomes[0].0.as_ref().unwrap(), 2);
    assert_eq!(outcomes[1].1, vec![0]);
    assert_eq!(outcomes[2].1, vec![1]);
    assert!(outcomes[3].1.is_empty());

    let outcomes = run(4, hints, Vec::new(), uniform);
    assert_eq!(outcomes[0].0, Some(Vec::new()));
}

#[test]
fn self_scheduling_runs_jobs_on_every_member() {
    // master, two servers of two and one idle process
    let hints = ConcurrencyHints::default().servers(2).procs_per_server(2);
    let outcomes = run(6, hints, numbers(7), uniform);

    assert_squares(outcomes[0].0.as_ref().unwrap(), 7);
    assert_eq!(outcomes[1].1, outcomes[2].1);
    assert_eq!(outcomes[3].1, outcomes[4].1);
    assert_eq!(outcomes[1].1.len() + outcomes[3].1.len(), 7);
    assert_eq!(outcomes[5], (None, Vec::new()));
}

#[test]
fn static_scheduling_follows_the_stride() {
    let outcomes = run(3, ConcurrencyHints::default().servers(3), numbers(9), uniform);

    assert_squares(outcomes[0].0.as_ref().unwrap(), 9);
    assert_eq!(outcomes[0].1, vec![0, 3, 6]);
    assert_eq!(outcomes[1], (None, vec![1, 4, 7]));
    assert_eq!(outcomes[2], (None, vec![2, 5, 8]));

    let servers = outcomes[0].0.as_ref().unwrap().iter().map(|r| r.server).collect_vec();
    assert_eq!(servers, vec![1, 2, 3, 1, 2, 3, 1, 2, 3]);
}

#[test]
fn static_scheduling_over_larger_servers() {
    let outcomes = run(7, ConcurrencyHints::default().servers(3), numbers(9), uniform);

    assert_squares(outcomes[0].0.as_ref().unwrap(), 9);
    // servers of 3, 2 and 2 processes
    for rank in 0..3 {
        assert_eq!(outcomes[rank].1, vec![0, 3, 6]);
    }
    for rank in 3..5 {
        assert_eq!(outcomes[rank].1, vec![1, 4, 7]);
    }
    for rank in 5..7 {
        assert_eq!(outcomes[rank].1, vec![2, 5, 8]);
    }
    assert!(outcomes[1..].iter().all(|(results, _)| results.is_none()));
}

#[test]
fn single_server_runs_everything() {
    let outcomes = run(2, ConcurrencyHints::default(), numbers(4), uniform);

    assert_squares(outcomes[0].0.as_ref().unwrap(), 4);
    assert_eq!(outcomes[1], (None, vec![0, 1, 2, 3]));
}

#[test]
fn servers_reject_jobs_outside_the_set() {
    let hints = ConcurrencyHints::default()
        .servers(1)
        .scheduling(SchedulingOverride::Master);

    let outcomes = Universe::launch(2, |world| {
        let world = ParallelLevel::world(ProcessGroup::new(world));
        let level = resolve_and_build(&world, &hints).unwrap();

        if level.is_master() {
            let link = level.server_link(1).unwrap();
            link.send(Packet::new(100, Vec::new())).unwrap();
            return None;
        }

        let mut executed = Vec::new();
        let mut executor = FnExecutor(|_: &ProcessGroup, job: &Job| {
            executed.push(job.index);
            Ok::<_, ExecutorError>(job.params.clone())
        });
        let outcome = run_jobs(&level, &Job::set(["a", "b"]), &mut executor);
        drop(executor);

        Some((outcome.map(|_| ()), executed))
    })
    .unwrap();

    let (outcome, executed) = outcomes[1].as_ref().unwrap();
    assert!(matches!(
        outcome,
        Err(SchedulerError::TerminationProtocol(ProtocolViolation::JobOutOfRange {
            index: 99,
            count: 2
        }))
    ));
    assert!(executed.is_empty());
}

#[test]
fn job_sets_must_be_indexed_in_order() {
    let level = ParallelLevel::world(ProcessGroup::solo());
    let jobs = vec![Job::new(0, "a"), Job::new(2, "b")];
    let mut executor =
        FnExecutor(|_: &ProcessGroup, job: &Job| Ok::<_, ExecutorError>(job.params.clone()));

    assert!(matches!(
        run_jobs(&level, &jobs, &mut executor),
        Err(SchedulerError::InvalidJobSet {
            position: 1,
            index: 2
        })
    ));
}

#[test]
fn executor_failures_surface() {
    let level = ParallelLevel::world(ProcessGroup::solo());
    let mut executor = FnExecutor(|_: &ProcessGroup, job: &Job| {
        Err::<Payload, _>(ExecutorError::Failed {
            index: job.index,
            reason: "diverged".into(),
        })
    });

    assert!(matches!(
        run_jobs(&level, &Job::set(["x"]), &mut executor),
        Err(SchedulerError::Executor(ExecutorError::Failed { index: 0, .. }))
    ));
}

#[test]
fn payloads_pack_structured_values() {
    let payload = Payload::pack(&("x", vec![1.5, 2.0])).unwrap();
    let (name, values): (String, Vec<f64>) = payload.unpack().unwrap();

    assert_eq!(name, "x");
    assert_eq!(values, vec![1.5, 2.0]);
}
