use super::*;
use crate::distributed::{spawn_world, CommError};
use crate::dtype::DType;
use crate::error::SparseError;
use std::path::Path;

fn shard(offsets: Vec<usize>, sizes: Vec<usize>, data: Vec<f32>) -> Shard {
    Shard {
        metadata: ShardMetadata::new(offsets, sizes),
        data,
    }
}

fn tensor_value(t: ShardedTensor) -> StateValue {
    StateValue::Tensor(t)
}

fn single(state_dict: &StateDict, key: &str) -> ShardedTensor {
    match &state_dict[key] {
        StateValue::Tensor(t) => t.clone(),
        StateValue::Dict(_) => panic!("{key} is a dict"),
    }
}

/// Row-major `[rows, cols]` with value `r * 100 + c`.
fn grid(rows: usize, cols: usize) -> Vec<f32> {
    (0..rows)
        .flat_map(|r| (0..cols).map(move |c| (r * 100 + c) as f32))
        .collect()
}

fn block(rows: std::ops::Range<usize>, cols: std::ops::Range<usize>) -> Vec<f32> {
    rows.flat_map(|r| cols.clone().map(move |c| (r * 100 + c) as f32))
        .collect()
}

// ============================================================================
// Shard geometry
// ============================================================================

#[test]
fn test_intersect_boxes() {
    let a = ShardMetadata::new(vec![0, 0], vec![4, 4]);
    let b = ShardMetadata::new(vec![2, 3], vec![4, 4]);
    assert_eq!(
        a.intersect(&b),
        Some(ShardMetadata::new(vec![2, 3], vec![2, 1]))
    );
    let c = ShardMetadata::new(vec![4, 0], vec![1, 4]);
    assert_eq!(a.intersect(&c), None);
    assert_eq!(a.intersect(&ShardMetadata::new(vec![0], vec![4])), None);
}

#[test]
fn test_sharded_tensor_validates_shards() {
    let outside = ShardedTensor::new(
        vec![4, 2],
        DType::F32,
        vec![shard(vec![3, 0], vec![2, 2], vec![0.0; 4])],
    );
    assert!(matches!(outside, Err(SparseError::Checkpoint(_))));

    let short = ShardedTensor::new(
        vec![4, 2],
        DType::F32,
        vec![shard(vec![0, 0], vec![2, 2], vec![0.0; 3])],
    );
    assert!(matches!(short, Err(SparseError::Checkpoint(_))));
}

#[test]
fn test_flatten_composes_offsets() {
    let nested = ShardedTensor::new(
        vec![4, 5],
        DType::F32,
        vec![shard(vec![2, 0], vec![2, 5], vec![1.0; 10])],
    )
    .unwrap()
    .with_outer(OuterPlacement {
        global_size: vec![8, 5],
        offsets: vec![4, 0],
    })
    .unwrap();
    let flat = nested.flatten().unwrap();
    assert_eq!(flat.size(), &[8, 5]);
    assert!(flat.outer().is_none());
    assert_eq!(flat.local_shards()[0].metadata.offsets, vec![6, 0]);

    let mut changed = flat.clone();
    changed.local_shards_mut()[0].data = vec![2.0; 10];
    let back = nested.unflatten_from(changed).unwrap();
    assert_eq!(back.local_shards()[0].metadata.offsets, vec![2, 0]);
    assert_eq!(back.local_shards()[0].data, vec![2.0; 10]);
}

#[test]
fn test_outer_must_contain_tensor() {
    let t = ShardedTensor::new(vec![4], DType::F32, vec![]).unwrap();
    let err = t.with_outer(OuterPlacement {
        global_size: vec![6],
        offsets: vec![4],
    });
    assert!(matches!(err, Err(SparseError::Checkpoint(_))));
}

#[test]
fn test_replicated_tensor_must_cover_outer() {
    let t = ShardedTensor::new(vec![2], DType::F32, vec![])
        .unwrap()
        .with_outer(OuterPlacement {
            global_size: vec![4],
            offsets: vec![2],
        })
        .unwrap()
        .replicated();
    assert!(matches!(t.flatten(), Err(SparseError::Checkpoint(_))));
}

// ============================================================================
// State dict flattening
// ============================================================================

fn nested_state_dict() -> StateDict {
    let leaf = |v: f32| {
        tensor_value(
            ShardedTensor::new(vec![1], DType::F32, vec![shard(vec![0], vec![1], vec![v])]).unwrap(),
        )
    };
    let mut inner = StateDict::new();
    inner.insert("weight".to_string(), leaf(1.0));
    inner.insert("bias".to_string(), leaf(2.0));
    let mut root = StateDict::new();
    root.insert("model".to_string(), StateValue::Dict(inner));
    root.insert("step".to_string(), leaf(3.0));
    root
}

#[test]
fn test_flatten_and_unflatten_state_dict() {
    let original = nested_state_dict();
    let (flat, mapping) = flatten_state_dict(original.clone()).unwrap();
    let keys: Vec<&str> = flat.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["model.bias", "model.weight", "step"]);
    assert_eq!(mapping["model.weight"], vec!["model", "weight"]);
    assert_eq!(unflatten_state_dict(flat, &mapping).unwrap(), original);
}

#[test]
fn test_flatten_detects_key_collisions() {
    let mut sd = nested_state_dict();
    let dup = single(&sd, "step");
    sd.insert("model.weight".to_string(), tensor_value(dup));
    assert!(matches!(
        flatten_state_dict(sd),
        Err(SparseError::Checkpoint(msg)) if msg.contains("model.weight")
    ));
}

// ============================================================================
// Planners
// ============================================================================

fn write_item(fqn: &str, offsets: Vec<usize>) -> WriteItem {
    WriteItem {
        index: MetadataIndex::new(fqn, offsets.clone()),
        chunk: ShardMetadata::new(offsets, vec![2]),
        tensor_size: vec![4],
        dtype: DType::F32,
    }
}

#[test]
fn test_dedup_keeps_lowest_rank() {
    let plans = vec![
        SavePlan {
            items: vec![write_item("a", vec![0])],
        },
        SavePlan {
            items: vec![write_item("a", vec![0]), write_item("a", vec![2])],
        },
        SavePlan {
            items: vec![write_item("a", vec![2])],
        },
    ];
    let deduped = dedup_save_plans(plans);
    assert_eq!(deduped[0].items.len(), 1);
    assert_eq!(deduped[1].items, vec![write_item("a", vec![2])]);
    assert!(deduped[2].items.is_empty());
}

#[test]
fn test_global_plan_builds_metadata() {
    let mut planner = DefaultSavePlanner::default();
    let plans = vec![
        SavePlan {
            items: vec![write_item("a", vec![2])],
        },
        SavePlan {
            items: vec![write_item("a", vec![0])],
        },
    ];
    let (plans, metadata) = planner.create_global_plan(plans).unwrap();
    assert_eq!(plans.len(), 2);
    assert_eq!(metadata.version, FORMAT_VERSION);
    let meta = &metadata.state_dict_metadata["a"];
    assert_eq!(meta.size, vec![4]);
    assert_eq!(meta.chunks[0].offsets, vec![0]);
    assert_eq!(meta.chunks[1].offsets, vec![2]);
    assert!(metadata.storage_data.is_empty());
}

#[test]
fn test_global_plan_rejects_disagreeing_sizes() {
    let mut planner = DefaultSavePlanner::default();
    let mut other = write_item("a", vec![2]);
    other.tensor_size = vec![6];
    let plans = vec![
        SavePlan {
            items: vec![write_item("a", vec![0])],
        },
        SavePlan { items: vec![other] },
    ];
    assert!(planner.create_global_plan(plans).is_err());
}

#[test]
fn test_save_planner_flatten_options() {
    let mut planner = DefaultSavePlanner::new(false, true, true);
    assert!(matches!(
        planner.set_up(nested_state_dict(), true),
        Err(SparseError::Checkpoint(msg)) if msg.contains("flatten_state_dict")
    ));

    let nested = ShardedTensor::new(vec![2], DType::F32, vec![])
        .unwrap()
        .with_outer(OuterPlacement {
            global_size: vec![4],
            offsets: vec![2],
        })
        .unwrap();
    let mut sd = StateDict::new();
    sd.insert("t".to_string(), tensor_value(nested));
    let mut planner = DefaultSavePlanner::new(true, false, true);
    assert!(matches!(
        planner.set_up(sd, true),
        Err(SparseError::Checkpoint(msg)) if msg.contains("flatten_sharded_tensors")
    ));
}

#[test]
fn test_local_plan_and_resolve_data() {
    let mut planner = DefaultSavePlanner::default();
    planner.set_up(nested_state_dict(), true).unwrap();
    let plan = planner.create_local_plan().unwrap();
    assert_eq!(plan.items.len(), 3);
    let weight = plan
        .items
        .iter()
        .find(|i| i.index.fqn == "model.weight")
        .unwrap();
    assert_eq!(planner.resolve_data(weight).unwrap(), &[1.0]);

    let missing = write_item("model.weight", vec![1]);
    assert!(planner.resolve_data(&missing).is_err());
}

#[test]
fn test_planners_require_set_up() {
    let mut save = DefaultSavePlanner::default();
    assert!(save.create_local_plan().is_err());
    let mut load = DefaultLoadPlanner::default();
    assert!(load.create_local_plan().is_err());
    assert!(load.finish().is_err());
}

// ============================================================================
// Save and load
// ============================================================================

/// Each of `ranks` holds an equal row block of an `[8, 4]` grid.
fn save_row_blocks(dir: &Path, ranks: usize, dedup: bool) -> Vec<Metadata> {
    spawn_world(ranks, |rank, world| {
        let group = world.world_group(rank)?;
        let rows = 8 / ranks;
        let data = block(rank * rows..(rank + 1) * rows, 0..4);
        let t = ShardedTensor::new(
            vec![8, 4],
            DType::F32,
            vec![shard(vec![rank * rows, 0], vec![rows, 4], data)],
        )?;
        let mut sd = StateDict::new();
        sd.insert("w".to_string(), tensor_value(t));
        let mut writer = FileSystemWriter::new(dir).with_sync_files(false);
        let mut planner = DefaultSavePlanner::new(true, true, dedup);
        save_state_dict(sd, &mut writer, &mut planner, &group, 0)
    })
    .unwrap()
}

#[test]
fn test_save_writes_metadata_and_rank_files() {
    let dir = tempfile::tempdir().unwrap();
    let metadata = save_row_blocks(dir.path(), 4, true);
    assert!(metadata.iter().all(|m| m == &metadata[0]));
    assert_eq!(metadata[0].num_chunks(), 4);
    assert_eq!(metadata[0].storage_data.len(), 4);
    for rank in 0..4 {
        let file = dir.path().join(data_file_name(rank));
        assert_eq!(std::fs::metadata(file).unwrap().len(), 2 * 4 * 4);
    }

    let reader = FileSystemReader::new(dir.path());
    assert_eq!(reader.read_metadata().unwrap(), metadata[0]);
    let info = metadata[0]
        .storage_for(&MetadataIndex::new("w", vec![6, 0]))
        .unwrap();
    assert_eq!(info.relative_path, "__3_0.distcp");
    assert_eq!(info.offset, 0);
    assert_eq!(info.length, 32);
}

#[test]
fn test_load_reshards_rows_into_columns() {
    let dir = tempfile::tempdir().unwrap();
    save_row_blocks(dir.path(), 4, true);

    let loaded = spawn_world(2, |rank, world| {
        let group = world.world_group(rank)?;
        let t = ShardedTensor::new(
            vec![8, 4],
            DType::F32,
            vec![shard(vec![0, rank * 2], vec![8, 2], vec![0.0; 16])],
        )?;
        let mut sd = StateDict::new();
        sd.insert("w".to_string(), tensor_value(t));
        let mut reader = FileSystemReader::new(dir.path());
        let mut planner = DefaultLoadPlanner::default();
        load_state_dict(sd, &mut reader, &mut planner, &group, 0)
    })
    .unwrap();

    for (rank, sd) in loaded.iter().enumerate() {
        let t = single(sd, "w");
        assert_eq!(t.local_shards()[0].data, block(0..8, rank * 2..rank * 2 + 2));
    }
}

#[test]
fn test_load_into_single_full_shard() {
    let dir = tempfile::tempdir().unwrap();
    save_row_blocks(dir.path(), 2, true);
    let group = crate::distributed::World::new(1)
        .unwrap()
        .world_group(0)
        .unwrap();
    let t = ShardedTensor::new(
        vec![8, 4],
        DType::F32,
        vec![shard(vec![0, 0], vec![8, 4], vec![0.0; 32])],
    )
    .unwrap();
    let mut sd = StateDict::new();
    sd.insert("w".to_string(), tensor_value(t));
    let loaded = load_state_dict(
        sd,
        &mut FileSystemReader::new(dir.path()),
        &mut DefaultLoadPlanner::default(),
        &group,
        0,
    )
    .unwrap();
    assert_eq!(single(&loaded, "w").local_shards()[0].data, grid(8, 4));
}

fn replicated_save(dir: &Path, dedup: bool) -> Metadata {
    let mut metadata = spawn_world(2, |rank, world| {
        let group = world.world_group(rank)?;
        let t = ShardedTensor::new(
            vec![3],
            DType::F32,
            vec![shard(vec![0], vec![3], vec![1.0, 2.0, 3.0])],
        )?;
        let mut sd = StateDict::new();
        sd.insert("b".to_string(), tensor_value(t));
        let mut writer = FileSystemWriter::new(dir).with_sync_files(false);
        let mut planner = DefaultSavePlanner::new(true, true, dedup);
        save_state_dict(sd, &mut writer, &mut planner, &group, 0)
    })
    .unwrap();
    metadata.swap_remove(0)
}

#[test]
fn test_dedup_writes_replicated_chunk_once() {
    let dir = tempfile::tempdir().unwrap();
    let metadata = replicated_save(dir.path(), true);
    assert_eq!(metadata.num_chunks(), 1);
    assert_eq!(metadata.storage_data.len(), 1);
    assert_eq!(metadata.storage_data[0].info.relative_path, "__0_0.distcp");
    let rank1 = dir.path().join(data_file_name(1));
    assert_eq!(std::fs::metadata(rank1).unwrap().len(), 0);
}

#[test]
fn test_without_dedup_every_rank_writes() {
    let dir = tempfile::tempdir().unwrap();
    let metadata = replicated_save(dir.path(), false);
    assert_eq!(metadata.num_chunks(), 1);
    assert_eq!(metadata.storage_data.len(), 2);
}

#[test]
fn test_load_without_metadata_fails() {
    let dir = tempfile::tempdir().unwrap();
    let reader = FileSystemReader::new(dir.path());
    assert!(matches!(
        reader.read_metadata(),
        Err(SparseError::CheckpointFileNotFound(path)) if path.ends_with(METADATA_FILE)
    ));
}

#[test]
fn test_load_failure_reaches_every_rank() {
    let dir = tempfile::tempdir().unwrap();
    save_row_blocks(dir.path(), 2, true);
    let err = spawn_world(2, |rank, world| {
        let group = world.world_group(rank)?;
        let name = if rank == 0 { "w" } else { "missing" };
        let t = ShardedTensor::new(vec![8, 4], DType::F32, vec![])?;
        let mut sd = StateDict::new();
        sd.insert(name.to_string(), tensor_value(t));
        let mut reader = FileSystemReader::new(dir.path());
        load_state_dict(sd, &mut reader, &mut DefaultLoadPlanner::default(), &group, 0).map(drop)
    })
    .unwrap_err();
    // rank 0 planned fine but still reports rank 1's failure
    assert!(matches!(
        err,
        SparseError::Checkpoint(msg) if msg.contains("rank 1") && msg.contains("missing")
    ));
}

#[test]
fn test_load_rejects_size_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    save_row_blocks(dir.path(), 1, true);
    let group = crate::distributed::World::new(1)
        .unwrap()
        .world_group(0)
        .unwrap();
    let t = ShardedTensor::new(vec![4, 8], DType::F32, vec![]).unwrap();
    let mut sd = StateDict::new();
    sd.insert("w".to_string(), tensor_value(t));
    let err = load_state_dict(
        sd,
        &mut FileSystemReader::new(dir.path()),
        &mut DefaultLoadPlanner::default(),
        &group,
        0,
    )
    .unwrap_err();
    assert!(matches!(err, SparseError::Checkpoint(msg) if msg.contains("size")));
}

#[test]
fn test_nested_state_dict_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let group = crate::distributed::World::new(1)
        .unwrap()
        .world_group(0)
        .unwrap();
    save_state_dict(
        nested_state_dict(),
        &mut FileSystemWriter::new(dir.path()),
        &mut DefaultSavePlanner::default(),
        &group,
        0,
    )
    .unwrap();

    let zeroed: StateDict = {
        let (flat, mapping) = flatten_state_dict(nested_state_dict()).unwrap();
        let flat = flat
            .into_iter()
            .map(|(k, mut t)| {
                t.local_shards_mut()[0].data = vec![0.0];
                (k, t)
            })
            .collect();
        unflatten_state_dict(flat, &mapping).unwrap()
    };
    let loaded = load_state_dict(
        zeroed,
        &mut FileSystemReader::new(dir.path()),
        &mut DefaultLoadPlanner::default(),
        &group,
        0,
    )
    .unwrap();
    assert_eq!(loaded, nested_state_dict());
}

#[test]
fn test_aborted_world_surfaces_as_comm_error() {
    let world = crate::distributed::World::new(2).unwrap();
    world.abort();
    let group = world.world_group(0).unwrap();
    let err = save_state_dict(
        nested_state_dict(),
        &mut FileSystemWriter::new(tempfile::tempdir().unwrap().path()),
        &mut DefaultSavePlanner::default(),
        &group,
        0,
    )
    .unwrap_err();
    assert!(matches!(err, SparseError::Comm(CommError::Aborted)));
}
