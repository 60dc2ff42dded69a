//! Save and load planners.
//!
//! A save runs `set_up` → `create_local_plan` on every rank →
//! `create_global_plan` on the coordinator → `finish_plan` on every rank,
//! after which the storage writer pulls tensor data through
//! [`SavePlanner::resolve_data`]. A load mirrors this with
//! [`LoadPlanner::load_chunk`] and [`LoadPlanner::finish`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use super::metadata::{Metadata, MetadataIndex, TensorStorageMeta};
use super::state_dict::{
    flatten_state_dict, unflatten_state_dict, FlattenMapping, ShardMetadata, ShardedTensor,
    StateDict, StateValue,
};
use crate::dtype::DType;
use crate::error::{Result, SparseError};

/// One chunk a rank will write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteItem {
    /// Tensor name and chunk offsets
    pub index: MetadataIndex,
    /// Offsets and sizes of the chunk in global coordinates
    pub chunk: ShardMetadata,
    /// Global size of the tensor the chunk belongs to
    pub tensor_size: Vec<usize>,
    /// Element type recorded in the metadata
    pub dtype: DType,
}

/// Chunks one rank writes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SavePlan {
    /// Chunks in write order
    pub items: Vec<WriteItem>,
}

/// Copy of one box from a saved chunk into a local shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadItem {
    /// Destination tensor and shard offsets
    pub dest_index: MetadataIndex,
    /// Box origin inside the destination shard
    pub dest_offsets: Vec<usize>,
    /// Saved chunk to read from
    pub storage_index: MetadataIndex,
    /// Box origin inside the saved chunk
    pub storage_offsets: Vec<usize>,
    /// Box extent
    pub lengths: Vec<usize>,
}

/// Reads one rank performs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadPlan {
    /// Box copies in read order
    pub items: Vec<ReadItem>,
}

/// Decides what each rank writes.
pub trait SavePlanner {
    /// Take ownership of the rank's state dict.
    fn set_up(&mut self, state_dict: StateDict, is_coordinator: bool) -> Result<()>;

    fn create_local_plan(&mut self) -> Result<SavePlan>;

    /// Coordinator only: adjust all ranks' plans and describe the checkpoint.
    fn create_global_plan(&mut self, plans: Vec<SavePlan>) -> Result<(Vec<SavePlan>, Metadata)>;

    fn finish_plan(&mut self, plan: SavePlan) -> Result<SavePlan>;

    /// Values of the chunk `item` names, row-major.
    fn resolve_data(&self, item: &WriteItem) -> Result<&[f32]>;
}

/// Decides what each rank reads and where it lands.
pub trait LoadPlanner {
    /// Take ownership of the destination state dict.
    fn set_up(&mut self, state_dict: StateDict, metadata: &Metadata, is_coordinator: bool)
        -> Result<()>;

    fn create_local_plan(&mut self) -> Result<LoadPlan>;

    /// Coordinator only.
    fn create_global_plan(&mut self, plans: Vec<LoadPlan>) -> Result<Vec<LoadPlan>>;

    fn finish_plan(&mut self, plan: LoadPlan) -> Result<LoadPlan>;

    /// Copy `item`'s box out of `chunk`, the full saved chunk's values.
    fn load_chunk(&mut self, item: &ReadItem, chunk: &[f32]) -> Result<()>;

    /// Return the filled state dict in its original shape.
    fn finish(&mut self) -> Result<StateDict>;
}

/// Flat view shared by both default planners.
#[derive(Debug, Default)]
struct Prepared {
    tensors: BTreeMap<String, ShardedTensor>,
    mapping: Option<FlattenMapping>,
    // nested originals, by fqn, when shards were rewritten to global coordinates
    nested: BTreeMap<String, ShardedTensor>,
}

impl Prepared {
    fn new(state_dict: StateDict, flatten_dicts: bool, flatten_sharded: bool) -> Result<Self> {
        let (tensors, mapping) = if flatten_dicts {
            let (flat, mapping) = flatten_state_dict(state_dict)?;
            (flat, Some(mapping))
        } else {
            let mut flat = BTreeMap::new();
            for (key, value) in state_dict {
                match value {
                    StateValue::Tensor(t) => {
                        flat.insert(key, t);
                    }
                    StateValue::Dict(_) => {
                        return Err(SparseError::Checkpoint(format!(
                            "nested dict {key} needs flatten_state_dict"
                        )))
                    }
                }
            }
            (flat, None)
        };

        let mut prepared = Self {
            tensors: BTreeMap::new(),
            mapping,
            nested: BTreeMap::new(),
        };
        for (fqn, tensor) in tensors {
            if tensor.outer().is_none() {
                prepared.tensors.insert(fqn, tensor);
            } else if flatten_sharded {
                prepared.tensors.insert(fqn.clone(), tensor.flatten()?);
                prepared.nested.insert(fqn, tensor);
            } else {
                return Err(SparseError::Checkpoint(format!(
                    "nested sharded tensor {fqn} needs flatten_sharded_tensors"
                )));
            }
        }
        Ok(prepared)
    }

    fn into_state_dict(self) -> Result<StateDict> {
        let mut nested = self.nested;
        let mut tensors = BTreeMap::new();
        for (fqn, flat) in self.tensors {
            let tensor = match nested.remove(&fqn) {
                Some(original) => original.unflatten_from(flat)?,
                None => flat,
            };
            tensors.insert(fqn, tensor);
        }
        match &self.mapping {
            Some(mapping) => unflatten_state_dict(tensors, mapping),
            None => Ok(tensors
                .into_iter()
                .map(|(k, t)| (k, StateValue::Tensor(t)))
                .collect()),
        }
    }
}

/// Save planner with optional flattening and cross-rank dedup.
#[derive(Debug)]
pub struct DefaultSavePlanner {
    /// Collapse nested dicts into dotted keys
    pub flatten_state_dict: bool,
    /// Rewrite nested sharded tensors in their enclosing coordinates
    pub flatten_sharded_tensors: bool,
    /// Keep only the lowest rank's copy of chunks several ranks hold
    pub dedup_replicated_tensors: bool,
    prepared: Option<Prepared>,
}

impl Default for DefaultSavePlanner {
    fn default() -> Self {
        Self::new(true, true, true)
    }
}

impl DefaultSavePlanner {
    #[must_use]
    pub fn new(
        flatten_state_dict: bool,
        flatten_sharded_tensors: bool,
        dedup_replicated_tensors: bool,
    ) -> Self {
        Self {
            flatten_state_dict,
            flatten_sharded_tensors,
            dedup_replicated_tensors,
            prepared: None,
        }
    }

    fn prepared(&self) -> Result<&Prepared> {
        self.prepared
            .as_ref()
            .ok_or_else(|| SparseError::Checkpoint("save planner used before set_up".to_string()))
    }
}

/// Drop every item a lower rank already writes.
#[must_use]
pub fn dedup_save_plans(plans: Vec<SavePlan>) -> Vec<SavePlan> {
    let mut seen = HashSet::new();
    plans
        .into_iter()
        .enumerate()
        .map(|(rank, plan)| {
            let before = plan.items.len();
            let items: Vec<WriteItem> = plan
                .items
                .into_iter()
                .filter(|item| seen.insert(item.index.clone()))
                .collect();
            if items.len() != before {
                debug!(rank, dropped = before - items.len(), "deduplicated write items");
            }
            SavePlan { items }
        })
        .collect()
}

impl SavePlanner for DefaultSavePlanner {
    fn set_up(&mut self, state_dict: StateDict, _is_coordinator: bool) -> Result<()> {
        self.prepared = Some(Prepared::new(
            state_dict,
            self.flatten_state_dict,
            self.flatten_sharded_tensors,
        )?);
        Ok(())
    }

    fn create_local_plan(&mut self) -> Result<SavePlan> {
        let items = self
            .prepared()?
            .tensors
            .iter()
            .flat_map(|(fqn, tensor)| {
                tensor.local_shards().iter().map(move |shard| WriteItem {
                    index: MetadataIndex::new(fqn.clone(), shard.metadata.offsets.clone()),
                    chunk: shard.metadata.clone(),
                    tensor_size: tensor.size().to_vec(),
                    dtype: tensor.dtype(),
                })
            })
            .collect();
        Ok(SavePlan { items })
    }

    fn create_global_plan(&mut self, plans: Vec<SavePlan>) -> Result<(Vec<SavePlan>, Metadata)> {
        let plans = if self.dedup_replicated_tensors {
            dedup_save_plans(plans)
        } else {
            plans
        };

        let mut tensors: BTreeMap<String, TensorStorageMeta> = BTreeMap::new();
        for item in plans.iter().flat_map(|p| &p.items) {
            let meta = tensors
                .entry(item.index.fqn.clone())
                .or_insert_with(|| TensorStorageMeta {
                    size: item.tensor_size.clone(),
                    dtype: item.dtype,
                    chunks: Vec::new(),
                });
            if meta.size != item.tensor_size || meta.dtype != item.dtype {
                return Err(SparseError::Checkpoint(format!(
                    "ranks disagree on {}: {:?} {} vs {:?} {}",
                    item.index.fqn, meta.size, meta.dtype, item.tensor_size, item.dtype
                )));
            }
            match meta.chunks.iter().find(|c| c.offsets == item.chunk.offsets) {
                Some(existing) if existing.sizes != item.chunk.sizes => {
                    return Err(SparseError::Checkpoint(format!(
                        "chunks of {} at {:?} disagree on sizes",
                        item.index.fqn, item.chunk.offsets
                    )));
                }
                Some(_) => {}
                None => meta.chunks.push(item.chunk.clone()),
            }
        }
        for meta in tensors.values_mut() {
            meta.chunks.sort();
        }
        Ok((plans, Metadata::new(tensors)))
    }

    fn finish_plan(&mut self, plan: SavePlan) -> Result<SavePlan> {
        Ok(plan)
    }

    fn resolve_data(&self, item: &WriteItem) -> Result<&[f32]> {
        let tensor = self
            .prepared()?
            .tensors
            .get(&item.index.fqn)
            .ok_or_else(|| SparseError::Checkpoint(format!("unknown tensor {}", item.index.fqn)))?;
        tensor
            .local_shards()
            .iter()
            .find(|shard| shard.metadata.offsets == item.index.offsets)
            .map(|shard| shard.data.as_slice())
            .ok_or_else(|| {
                SparseError::Checkpoint(format!(
                    "no local shard of {} at {:?}",
                    item.index.fqn, item.index.offsets
                ))
            })
    }
}

/// Load planner reading every saved chunk that overlaps a local shard.
#[derive(Debug)]
pub struct DefaultLoadPlanner {
    /// Collapse nested dicts into dotted keys
    pub flatten_state_dict: bool,
    /// Rewrite nested sharded tensors in their enclosing coordinates
    pub flatten_sharded_tensors: bool,
    prepared: Option<Prepared>,
    metadata: Option<Metadata>,
}

impl Default for DefaultLoadPlanner {
    fn default() -> Self {
        Self::new(true, true)
    }
}

impl DefaultLoadPlanner {
    #[must_use]
    pub fn new(flatten_state_dict: bool, flatten_sharded_tensors: bool) -> Self {
        Self {
            flatten_state_dict,
            flatten_sharded_tensors,
            prepared: None,
            metadata: None,
        }
    }

    fn not_set_up() -> SparseError {
        SparseError::Checkpoint("load planner used before set_up".to_string())
    }
}

impl LoadPlanner for DefaultLoadPlanner {
    fn set_up(
        &mut self,
        state_dict: StateDict,
        metadata: &Metadata,
        _is_coordinator: bool,
    ) -> Result<()> {
        self.prepared = Some(Prepared::new(
            state_dict,
            self.flatten_state_dict,
            self.flatten_sharded_tensors,
        )?);
        self.metadata = Some(metadata.clone());
        Ok(())
    }

    fn create_local_plan(&mut self) -> Result<LoadPlan> {
        let prepared = self.prepared.as_ref().ok_or_else(Self::not_set_up)?;
        let metadata = self.metadata.as_ref().ok_or_else(Self::not_set_up)?;

        let mut items = Vec::new();
        for (fqn, tensor) in &prepared.tensors {
            let saved = metadata.state_dict_metadata.get(fqn).ok_or_else(|| {
                SparseError::Checkpoint(format!("{fqn} missing from checkpoint"))
            })?;
            if saved.size != tensor.size() {
                return Err(SparseError::Checkpoint(format!(
                    "{fqn} saved with size {:?}, loading into {:?}",
                    saved.size,
                    tensor.size()
                )));
            }
            for shard in tensor.local_shards() {
                let mut covered = 0;
                for chunk in &saved.chunks {
                    let Some(overlap) = shard.metadata.intersect(chunk) else {
                        continue;
                    };
                    covered += overlap.numel();
                    items.push(ReadItem {
                        dest_index: MetadataIndex::new(fqn.clone(), shard.metadata.offsets.clone()),
                        dest_offsets: relative(&overlap.offsets, &shard.metadata.offsets),
                        storage_index: MetadataIndex::new(fqn.clone(), chunk.offsets.clone()),
                        storage_offsets: relative(&overlap.offsets, &chunk.offsets),
                        lengths: overlap.sizes,
                    });
                }
                if covered != shard.metadata.numel() {
                    return Err(SparseError::Checkpoint(format!(
                        "saved chunks cover {covered} of {} values of {fqn} at {:?}",
                        shard.metadata.numel(),
                        shard.metadata.offsets
                    )));
                }
            }
        }
        Ok(LoadPlan { items })
    }

    fn create_global_plan(&mut self, plans: Vec<LoadPlan>) -> Result<Vec<LoadPlan>> {
        Ok(plans)
    }

    fn finish_plan(&mut self, plan: LoadPlan) -> Result<LoadPlan> {
        Ok(plan)
    }

    fn load_chunk(&mut self, item: &ReadItem, chunk: &[f32]) -> Result<()> {
        let prepared = self.prepared.as_mut().ok_or_else(Self::not_set_up)?;
        let metadata = self.metadata.as_ref().ok_or_else(Self::not_set_up)?;
        let fqn = &item.dest_index.fqn;

        let chunk_sizes = &metadata
            .state_dict_metadata
            .get(fqn)
            .and_then(|m| {
                m.chunks
                    .iter()
                    .find(|c| c.offsets == item.storage_index.offsets)
            })
            .ok_or_else(|| {
                SparseError::Checkpoint(format!(
                    "no saved chunk of {fqn} at {:?}",
                    item.storage_index.offsets
                ))
            })?
            .sizes;
        let needed: usize = chunk_sizes.iter().product();
        if chunk.len() != needed {
            return Err(SparseError::Checkpoint(format!(
                "chunk of {fqn} at {:?} has {} values, expected {needed}",
                item.storage_index.offsets,
                chunk.len()
            )));
        }

        let shard = prepared
            .tensors
            .get_mut(fqn)
            .and_then(|t| {
                t.local_shards_mut()
                    .iter_mut()
                    .find(|s| s.metadata.offsets == item.dest_index.offsets)
            })
            .ok_or_else(|| {
                SparseError::Checkpoint(format!(
                    "no local shard of {fqn} at {:?}",
                    item.dest_index.offsets
                ))
            })?;
        let dest_sizes = shard.metadata.sizes.clone();
        copy_box(
            chunk,
            chunk_sizes,
            &item.storage_offsets,
            &mut shard.data,
            &dest_sizes,
            &item.dest_offsets,
            &item.lengths,
        );
        Ok(())
    }

    fn finish(&mut self) -> Result<StateDict> {
        self.metadata = None;
        self.prepared
            .take()
            .ok_or_else(Self::not_set_up)?
            .into_state_dict()
    }
}

fn relative(point: &[usize], origin: &[usize]) -> Vec<usize> {
    point.iter().zip(origin).map(|(p, o)| p - o).collect()
}

fn strides(sizes: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; sizes.len()];
    for d in (0..sizes.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * sizes[d + 1];
    }
    strides
}

/// Copy an N-d box between two row-major buffers, one innermost run at a time.
fn copy_box(
    src: &[f32],
    src_sizes: &[usize],
    src_offsets: &[usize],
    dst: &mut [f32],
    dst_sizes: &[usize],
    dst_offsets: &[usize],
    lengths: &[usize],
) {
    if lengths.iter().any(|&l| l == 0) {
        return;
    }
    if lengths.is_empty() {
        dst[0] = src[0];
        return;
    }
    let src_strides = strides(src_sizes);
    let dst_strides = strides(dst_sizes);
    let inner = lengths.len() - 1;
    let run = lengths[inner];
    let mut index = vec![0usize; inner];
    loop {
        let mut s = src_offsets[inner];
        let mut d = dst_offsets[inner];
        for dim in 0..inner {
            s += (src_offsets[dim] + index[dim]) * src_strides[dim];
            d += (dst_offsets[dim] + index[dim]) * dst_strides[dim];
        }
        dst[d..d + run].copy_from_slice(&src[s..s + run]);

        // odometer over the outer dimensions
        let mut dim = inner;
        loop {
            if dim == 0 {
                return;
            }
            dim -= 1;
            index[dim] += 1;
            if index[dim] < lengths[dim] {
                break;
            }
            index[dim] = 0;
        }
    }
}
