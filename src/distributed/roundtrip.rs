//! Save a trained 2D-parallel model, reload it into a fresh one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, info_span};

use super::comm::World;
use super::launch::spawn_on;
use super::mesh::DeviceMesh;
use super::model::{make_input, SimpleModel};
use crate::checkpoint::{
    load_state_dict, save_state_dict, DefaultLoadPlanner, DefaultSavePlanner, FileSystemReader,
    FileSystemWriter, Metadata, StateDict, StateValue,
};
use crate::error::{Result, SparseError};
use crate::tensor::Tensor;

/// Learning rate of the single training step.
pub const LR: f32 = 3e-5;

/// State dict key the model is saved under.
pub const MODEL_KEY: &str = "model";

/// Knobs of a round trip.
#[derive(Debug, Clone)]
pub struct RoundTripConfig {
    /// Data-parallel degree
    pub dp: usize,
    /// Tensor-parallel degree; must divide 8, 4, and 12
    pub tp: usize,
    /// Seed of model A; model B uses `seed + 1`
    pub seed: u64,
    /// SGD learning rate of model A's training step
    pub lr: f32,
    /// Fail any collective blocked for longer than this
    pub timeout: Option<Duration>,
}

impl Default for RoundTripConfig {
    fn default() -> Self {
        Self {
            dp: 2,
            tp: 2,
            seed: 0,
            lr: LR,
            timeout: Some(Duration::from_secs(60)),
        }
    }
}

/// Outcome of a successful round trip.
#[derive(Debug, Clone)]
pub struct RoundTripReport {
    /// Ranks in the world, `dp * tp`
    pub world_size: usize,
    /// Directory holding `.metadata` and the data files
    pub checkpoint_dir: PathBuf,
    /// Parameters compared on every rank
    pub parameters: Vec<String>,
    /// Training loss per rank
    pub losses: Vec<f32>,
    /// Chunks recorded in the metadata
    pub chunks: usize,
    /// Data files written
    pub files: Vec<String>,
}

fn compare(
    rank: usize,
    a: &BTreeMap<String, Tensor>,
    b: &BTreeMap<String, Tensor>,
    expect_equal: bool,
) -> Result<()> {
    for (name, ta) in a {
        let tb = b
            .get(name)
            .ok_or_else(|| SparseError::AssertionFailed(format!("rank {rank}: {name} missing")))?;
        if ta.values_eq(tb) != expect_equal {
            let relation = if expect_equal { "differs" } else { "already equals" };
            return Err(SparseError::AssertionFailed(format!(
                "rank {rank}: {name} {relation} after {}",
                if expect_equal { "load" } else { "init" }
            )));
        }
    }
    Ok(())
}

fn model_entry(mut state_dict: StateDict) -> Result<StateDict> {
    match state_dict.remove(MODEL_KEY) {
        Some(StateValue::Dict(model)) => Ok(model),
        _ => Err(SparseError::Checkpoint(format!("no {MODEL_KEY} entry"))),
    }
}

fn wrap(model: StateDict) -> StateDict {
    StateDict::from([(MODEL_KEY.to_string(), StateValue::Dict(model))])
}

struct RankOutcome {
    loss: f32,
    parameters: Vec<String>,
    metadata: Metadata,
}

fn run_rank(
    rank: usize,
    world: &World,
    mesh: DeviceMesh,
    config: &RoundTripConfig,
    dir: &Path,
) -> Result<RankOutcome> {
    let group = world.world_group(rank)?;
    let (dp_coord, _) = mesh.coords(rank);

    let mut model_a = SimpleModel::new(world, rank, mesh, config.seed)?;
    let loss = model_a.train_step(&make_input(dp_coord), config.lr)?;
    info!(loss, "trained model A");

    let mut writer = FileSystemWriter::new(dir);
    let mut save_planner = DefaultSavePlanner::new(true, true, true);
    let metadata = save_state_dict(
        wrap(model_a.sharded_state_dict()?),
        &mut writer,
        &mut save_planner,
        &group,
        0,
    )?;

    let mut model_b = SimpleModel::new(world, rank, mesh, config.seed + 1)?;
    let params_a = model_a.summon_full_params()?;
    compare(rank, &params_a, &model_b.summon_full_params()?, false)?;

    let mut reader = FileSystemReader::new(dir);
    let mut load_planner = DefaultLoadPlanner::new(true, true);
    let loaded = load_state_dict(
        wrap(model_b.sharded_state_dict()?),
        &mut reader,
        &mut load_planner,
        &group,
        0,
    )?;
    model_b.load_state_dict(&model_entry(loaded)?)?;

    compare(rank, &params_a, &model_b.summon_full_params()?, true)?;
    info!("model B matches model A");
    Ok(RankOutcome {
        loss,
        parameters: params_a.into_keys().collect(),
        metadata,
    })
}

/// Train, save, reload, and compare on a `dp x tp` world of threads.
///
/// # Errors
///
/// `AssertionFailed` if model B matches A before the load or differs
/// after it; any model, checkpoint, or communication error.
pub fn run_2d_checkpoint_roundtrip(config: &RoundTripConfig, dir: &Path) -> Result<RoundTripReport> {
    let mesh = DeviceMesh::new(config.dp, config.tp)?;
    let span = info_span!("checkpoint_roundtrip", dp = config.dp, tp = config.tp);
    let _guard = span.enter();

    let mut world = World::new(mesh.world_size())?;
    if let Some(timeout) = config.timeout {
        world = world.with_timeout(timeout);
    }
    let outcomes = spawn_on(world, |rank, world| run_rank(rank, world, mesh, config, dir))?;

    let metadata = &outcomes[0].metadata;
    let mut files: Vec<String> = metadata
        .storage_data
        .iter()
        .map(|entry| entry.info.relative_path.clone())
        .collect();
    files.sort();
    files.dedup();
    let report = RoundTripReport {
        world_size: mesh.world_size(),
        checkpoint_dir: dir.to_path_buf(),
        parameters: outcomes[0].parameters.clone(),
        losses: outcomes.iter().map(|o| o.loss).collect(),
        chunks: metadata.num_chunks(),
        files,
    };
    info!(chunks = report.chunks, files = report.files.len(), "round trip passed");
    Ok(report)
}
