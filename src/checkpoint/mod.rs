//! Sharded state-dict checkpointing.
//!
//! Every rank contributes the shards it holds; the coordinator merges
//! the ranks' plans, drops chunks several ranks hold (replicated
//! parameters), and writes one `.metadata` file next to the per-rank
//! data files. Loading plans reads by box intersection, so a checkpoint
//! saved under one sharding can be loaded under another.
//!
//! # Example
//!
//! ```
//! use semisparse::checkpoint::{
//!     load_state_dict, save_state_dict, DefaultLoadPlanner, DefaultSavePlanner,
//!     FileSystemReader, FileSystemWriter, Shard, ShardMetadata, ShardedTensor, StateDict,
//!     StateValue,
//! };
//! use semisparse::distributed::World;
//! use semisparse::dtype::DType;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let group = World::new(1).unwrap().world_group(0).unwrap();
//! let tensor = |data: Vec<f32>| {
//!     let shard = Shard { metadata: ShardMetadata::new(vec![0], vec![3]), data };
//!     ShardedTensor::new(vec![3], DType::F32, vec![shard]).unwrap()
//! };
//!
//! let mut saved = StateDict::new();
//! saved.insert("w".to_string(), StateValue::Tensor(tensor(vec![1.0, 2.0, 3.0])));
//! let mut writer = FileSystemWriter::new(dir.path());
//! save_state_dict(saved, &mut writer, &mut DefaultSavePlanner::default(), &group, 0).unwrap();
//!
//! let mut target = StateDict::new();
//! target.insert("w".to_string(), StateValue::Tensor(tensor(vec![0.0; 3])));
//! let mut reader = FileSystemReader::new(dir.path());
//! let loaded =
//!     load_state_dict(target, &mut reader, &mut DefaultLoadPlanner::default(), &group, 0).unwrap();
//! match &loaded["w"] {
//!     StateValue::Tensor(t) => assert_eq!(t.local_shards()[0].data, vec![1.0, 2.0, 3.0]),
//!     StateValue::Dict(_) => unreachable!(),
//! }
//! ```

mod api;
mod filesystem;
mod metadata;
mod planner;
mod state_dict;

pub use api::{load_state_dict, save_state_dict};
pub use filesystem::{
    data_file_name, FileSystemReader, FileSystemWriter, StorageReader, StorageWriter, WriteResult,
};
pub use metadata::{
    Metadata, MetadataIndex, StorageEntry, StorageInfo, TensorStorageMeta, FORMAT_VERSION,
    METADATA_FILE,
};
pub use planner::{
    dedup_save_plans, DefaultLoadPlanner, DefaultSavePlanner, LoadPlan, LoadPlanner, ReadItem,
    SavePlan, SavePlanner, WriteItem,
};
pub use state_dict::{
    flatten_state_dict, unflatten_state_dict, FlattenMapping, OuterPlacement, Shard,
    ShardMetadata, ShardedTensor, StateDict, StateValue,
};

#[cfg(test)]
mod tests;
