//! Collective save and load.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, info_span};

use super::filesystem::{StorageReader, StorageWriter};
use super::metadata::Metadata;
use super::planner::{LoadPlanner, SavePlanner};
use super::state_dict::StateDict;
use crate::distributed::ProcessGroup;
use crate::error::{Result, SparseError};

type Outcome<T> = std::result::Result<T, String>;

fn outcome<T>(result: Result<T>) -> Outcome<T> {
    result.map_err(|e| e.to_string())
}

fn raise<T>(group: &ProcessGroup, member: usize, outcome: Outcome<T>) -> Result<T> {
    outcome.map_err(|msg| {
        SparseError::Checkpoint(format!("rank {}: {msg}", group.ranks()[member]))
    })
}

/// Every member's `local` result; the first failure, if any, fails every
/// member alike.
fn all_gather_checked<T: Serialize + DeserializeOwned>(
    group: &ProcessGroup,
    local: Result<T>,
) -> Result<Vec<T>> {
    let gathered = group.all_gather_object(&outcome(local))?;
    gathered
        .into_iter()
        .enumerate()
        .map(|(member, o)| raise(group, member, o))
        .collect()
}

/// Coordinator's `value` on every member, failures included.
fn broadcast_checked<T: Serialize + DeserializeOwned>(
    group: &ProcessGroup,
    value: Option<Result<T>>,
    coordinator: usize,
) -> Result<T> {
    let value = value.map(outcome);
    let received: Outcome<T> = group.broadcast_object(value.as_ref(), coordinator)?;
    raise(group, coordinator, received)
}

/// Save `state_dict` across every member of `group`.
///
/// Every member plans locally; `coordinator` (a group rank) merges the
/// plans and builds the metadata; every member writes its own file; the
/// coordinator commits `.metadata` once all writes succeed. A failure on
/// any member fails the save on every member.
///
/// # Errors
///
/// Planning, storage, or communication errors from any member.
pub fn save_state_dict<W, P>(
    state_dict: StateDict,
    writer: &mut W,
    planner: &mut P,
    group: &ProcessGroup,
    coordinator: usize,
) -> Result<Metadata>
where
    W: StorageWriter + ?Sized,
    P: SavePlanner,
{
    let span = info_span!("save_state_dict", rank = group.rank());
    let _guard = span.enter();
    let is_coordinator = group.group_rank() == coordinator;

    let set_up = planner
        .set_up(state_dict, is_coordinator)
        .and_then(|()| writer.set_up(is_coordinator));
    let local = set_up.and_then(|()| planner.create_local_plan());
    let plans = all_gather_checked(group, local)?;

    let global = is_coordinator.then(|| planner.create_global_plan(plans));
    let (mut plans, metadata) = broadcast_checked(group, global, coordinator)?;
    if plans.len() != group.size() {
        return Err(SparseError::Checkpoint(format!(
            "global plan has {} entries for {} ranks",
            plans.len(),
            group.size()
        )));
    }
    let plan = plans.swap_remove(group.group_rank());

    let written = planner
        .finish_plan(plan)
        .and_then(|plan| writer.write_data(group.rank(), &plan, &*planner));
    let results = all_gather_checked(group, written)?;

    let committed = is_coordinator.then(|| writer.finish(metadata, results));
    let metadata = broadcast_checked(group, committed, coordinator)?;
    info!(chunks = metadata.storage_data.len(), "saved state dict");
    Ok(metadata)
}

/// Load a checkpoint into `state_dict`'s shards across every member of
/// `group`, returning the filled state dict.
///
/// The destination layout may differ from the saved one: each local shard
/// reads whatever parts of the saved chunks overlap it.
///
/// # Errors
///
/// Missing files or tensors, size mismatches, uncovered shards, or
/// communication errors from any member.
pub fn load_state_dict<R, P>(
    state_dict: StateDict,
    reader: &mut R,
    planner: &mut P,
    group: &ProcessGroup,
    coordinator: usize,
) -> Result<StateDict>
where
    R: StorageReader + ?Sized,
    P: LoadPlanner,
{
    let span = info_span!("load_state_dict", rank = group.rank());
    let _guard = span.enter();
    let is_coordinator = group.group_rank() == coordinator;

    let prepared = reader.read_metadata().and_then(|metadata| {
        planner.set_up(state_dict, &metadata, is_coordinator)?;
        Ok(metadata)
    });
    let local = match &prepared {
        Ok(_) => planner.create_local_plan(),
        Err(e) => Err(SparseError::Checkpoint(e.to_string())),
    };
    let plans = all_gather_checked(group, local)?;
    let metadata = prepared?;

    let global = is_coordinator.then(|| planner.create_global_plan(plans));
    let mut plans = broadcast_checked(group, global, coordinator)?;
    if plans.len() != group.size() {
        return Err(SparseError::Checkpoint(format!(
            "global plan has {} entries for {} ranks",
            plans.len(),
            group.size()
        )));
    }
    let plan = plans.swap_remove(group.group_rank());

    let read = planner
        .finish_plan(plan)
        .and_then(|plan| reader.read_data(&metadata, &plan, &mut *planner));
    all_gather_checked(group, read)?;

    let loaded = planner.finish()?;
    info!(tensors = metadata.state_dict_metadata.len(), "loaded state dict");
    Ok(loaded)
}
