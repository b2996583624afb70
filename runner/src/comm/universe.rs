use super::{mesh, CommError, Communicator};
use parking_lot::Mutex;
use rayon::ThreadPoolBuilder;
use tracing::{debug, instrument};

/// A fixed pool of ranks, each running on a dedicated thread.
pub struct Universe;

impl Universe {
    /// Run `f` once per rank with that rank's world communicator and collect the
    /// return values in rank order. Blocks until every rank returned.
    #[instrument(skip(f), level = "debug")]
    pub fn launch<F, R>(size: usize, f: F) -> Result<Vec<R>, CommError>
    where
        F: Fn(Communicator) -> R + Sync,
        R: Send,
    {
        if size == 0 {
            return Err(CommError::EmptyUniverse);
        }

        // every rank blocks on its peers, so each needs its own thread
        let pool = ThreadPoolBuilder::new()
            .num_threads(size)
            .thread_name(|index| format!("rank-{index}"))
            .build()?;
        let slots = Mutex::new(mesh(size).into_iter().map(Some).collect::<Vec<_>>());

        debug!("Starting universe with {size} ranks");

        pool.broadcast(|context| {
            let world = slots.lock()[context.index()].take();
            world.map(&f)
        })
        .into_iter()
        .enumerate()
        .map(|(rank, result)| result.ok_or(CommError::Disconnected { peer: rank }))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranks_are_returned_in_order() {
        let ranks = Universe::launch(5, |world| (world.rank(), world.size())).unwrap();

        assert_eq!(ranks, (0..5).map(|rank| (rank, 5)).collect::<Vec<_>>());
    }

    #[test]
    fn empty_universe_is_rejected() {
        assert!(matches!(
            Universe::launch(0, |world| world.rank()),
            Err(CommError::EmptyUniverse)
        ));
    }
}
