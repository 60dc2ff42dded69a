//! Thread-per-rank launcher.

use std::panic::{self, AssertUnwindSafe};
use std::thread;
use tracing::{error, info_span};

use super::comm::{CommError, World};
use crate::error::{Result, SparseError};

/// Run `f(rank, world)` on one scoped thread per rank of a fresh world.
///
/// # Errors
///
/// See [`spawn_on`].
pub fn spawn_world<T, F>(size: usize, f: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(usize, &World) -> Result<T> + Sync,
{
    spawn_on(World::new(size)?, f)
}

/// Run `f(rank, world)` on one scoped thread per rank of `world`,
/// returning the per-rank results in rank order.
///
/// A worker that fails or panics aborts the world so its peers return
/// from their collectives instead of blocking.
///
/// # Errors
///
/// The first failing rank's error, preferring a root cause over the
/// `Aborted` errors it triggered on other ranks. A panic surfaces as
/// [`CommError::WorkerPanicked`].
pub fn spawn_on<T, F>(world: World, f: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(usize, &World) -> Result<T> + Sync,
{
    let size = world.size();
    let outcomes: Vec<Result<T>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..size)
            .map(|rank| {
                let world = &world;
                let f = &f;
                thread::Builder::new()
                    .name(format!("rank-{rank}"))
                    .spawn_scoped(scope, move || {
                        let span = info_span!("rank", rank);
                        let _guard = span.enter();
                        let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(rank, world)))
                            .unwrap_or_else(|_| Err(CommError::WorkerPanicked { rank }.into()));
                        if let Err(e) = &outcome {
                            error!(error = %e, "worker failed");
                            world.abort();
                        }
                        outcome
                    })
            })
            .collect();
        if handles.iter().any(std::result::Result::is_err) {
            world.abort();
        }

        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| match handle {
                Ok(h) => h
                    .join()
                    .unwrap_or_else(|_| Err(CommError::WorkerPanicked { rank }.into())),
                Err(e) => Err(SparseError::Io(e)),
            })
            .collect()
    });

    let mut results = Vec::with_capacity(size);
    let mut first_abort = None;
    let mut root_cause = None;
    for outcome in outcomes {
        match outcome {
            Ok(v) => results.push(v),
            Err(SparseError::Comm(CommError::Aborted)) => {
                first_abort.get_or_insert(SparseError::Comm(CommError::Aborted));
            }
            Err(e) => {
                root_cause.get_or_insert(e);
            }
        }
    }
    match root_cause.or(first_abort) {
        Some(e) => Err(e),
        None => Ok(results),
    }
}
