//! 2D-parallel checkpoint round trips across meshes.

use semisparse::checkpoint::{
    load_state_dict, save_state_dict, DefaultLoadPlanner, DefaultSavePlanner, FileSystemReader,
    FileSystemWriter, StateDict, StateValue, METADATA_FILE,
};
use semisparse::distributed::{
    run_2d_checkpoint_roundtrip, spawn_world, DeviceMesh, RoundTripConfig, SimpleModel,
    MODEL_KEY,
};
use semisparse::SparseError;
use std::path::Path;

fn wrap(model: &SimpleModel) -> semisparse::Result<StateDict> {
    let mut state_dict = StateDict::new();
    state_dict.insert(
        MODEL_KEY.to_string(),
        StateValue::Dict(model.sharded_state_dict()?),
    );
    Ok(state_dict)
}

fn unwrap_model(mut state_dict: StateDict) -> semisparse::Result<StateDict> {
    match state_dict.remove(MODEL_KEY) {
        Some(StateValue::Dict(inner)) => Ok(inner),
        _ => Err(SparseError::Checkpoint("no model entry".to_string())),
    }
}

fn save(dir: &Path, dp: usize, tp: usize, seed: u64) {
    let mesh = DeviceMesh::new(dp, tp).unwrap();
    spawn_world(mesh.world_size(), |rank, world| {
        let model = SimpleModel::new(world, rank, mesh, seed)?;
        let group = world.world_group(rank)?;
        let mut writer = FileSystemWriter::new(dir);
        let mut planner = DefaultSavePlanner::new(true, true, true);
        save_state_dict(wrap(&model)?, &mut writer, &mut planner, &group, 0)?;
        Ok(())
    })
    .unwrap();
}

/// Full parameters of a fresh model loaded from `dir` under a `dp x 1` mesh.
fn load_full(dir: &Path, dp: usize) -> Vec<Vec<(String, Vec<f32>)>> {
    let mesh = DeviceMesh::new(dp, 1).unwrap();
    spawn_world(mesh.world_size(), |rank, world| {
        let mut model = SimpleModel::new(world, rank, mesh, 99)?;
        let group = world.world_group(rank)?;
        let mut reader = FileSystemReader::new(dir);
        let mut planner = DefaultLoadPlanner::new(true, true);
        let loaded = load_state_dict(wrap(&model)?, &mut reader, &mut planner, &group, 0)?;
        model.load_state_dict(&unwrap_model(loaded)?)?;
        Ok(model
            .summon_full_params()?
            .into_iter()
            .map(|(name, t)| (name, t.into_data()))
            .collect())
    })
    .unwrap()
}

fn reference(seed: u64) -> Vec<(String, Vec<f32>)> {
    let mesh = DeviceMesh::new(1, 1).unwrap();
    spawn_world(1, |rank, world| {
        Ok(SimpleModel::new(world, rank, mesh, seed)?
            .summon_full_params()?
            .into_iter()
            .map(|(name, t)| (name, t.into_data()))
            .collect::<Vec<_>>())
    })
    .unwrap()
    .remove(0)
}

#[test]
fn test_default_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let report = run_2d_checkpoint_roundtrip(&RoundTripConfig::default(), dir.path()).unwrap();
    assert_eq!(report.world_size, 4);
    assert_eq!(
        report.parameters,
        vec![
            "net1.bias",
            "net1.weight",
            "net2.bias",
            "net2.weight",
            "net3.bias",
            "net3.weight"
        ]
    );
    assert!(report.losses.iter().all(|l| l.is_finite()));
    assert!(dir.path().join(METADATA_FILE).exists());
    for file in &report.files {
        assert!(dir.path().join(file).exists(), "{file} missing");
    }
}

#[test]
fn test_tensor_parallel_checkpoint_loads_into_data_parallel_mesh() {
    let dir = tempfile::tempdir().unwrap();
    save(dir.path(), 2, 2, 11);
    let expected = reference(11);
    for per_rank in load_full(dir.path(), 4) {
        assert_eq!(per_rank, expected);
    }
}

#[test]
fn test_wide_tensor_parallel_checkpoint_loads_on_one_rank() {
    let dir = tempfile::tempdir().unwrap();
    save(dir.path(), 1, 4, 12);
    let loaded = load_full(dir.path(), 1);
    assert_eq!(loaded[0], reference(12));
}

#[test]
fn test_loading_from_an_empty_directory_fails_everywhere() {
    let dir = tempfile::tempdir().unwrap();
    let mesh = DeviceMesh::new(2, 1).unwrap();
    let err = spawn_world(2, |rank, world| {
        let model = SimpleModel::new(world, rank, mesh, 0)?;
        let group = world.world_group(rank)?;
        let mut reader = FileSystemReader::new(dir.path());
        let mut planner = DefaultLoadPlanner::default();
        load_state_dict(wrap(&model)?, &mut reader, &mut planner, &group, 0)?;
        Ok(())
    })
    .unwrap_err();
    assert!(
        matches!(&err, SparseError::Checkpoint(msg) if msg.starts_with("rank 0:")),
        "{err}"
    );
}
