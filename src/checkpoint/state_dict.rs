//! Sharded state dicts and their flattening.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::dtype::DType;
use crate::error::{Result, SparseError};

/// Position and extent of one shard within its tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardMetadata {
    /// Start index along each dimension
    pub offsets: Vec<usize>,
    /// Extent along each dimension
    pub sizes: Vec<usize>,
}

impl ShardMetadata {
    #[must_use]
    pub fn new(offsets: Vec<usize>, sizes: Vec<usize>) -> Self {
        Self { offsets, sizes }
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.sizes.iter().product()
    }

    /// Overlap of two boxes of the same rank, if non-empty.
    #[must_use]
    pub fn intersect(&self, other: &ShardMetadata) -> Option<ShardMetadata> {
        if self.offsets.len() != other.offsets.len() {
            return None;
        }
        let mut offsets = Vec::with_capacity(self.offsets.len());
        let mut sizes = Vec::with_capacity(self.offsets.len());
        for d in 0..self.offsets.len() {
            let lo = self.offsets[d].max(other.offsets[d]);
            let hi = (self.offsets[d] + self.sizes[d]).min(other.offsets[d] + other.sizes[d]);
            if hi <= lo {
                return None;
            }
            offsets.push(lo);
            sizes.push(hi - lo);
        }
        Some(ShardMetadata { offsets, sizes })
    }

    fn fits_within(&self, size: &[usize]) -> bool {
        self.offsets.len() == size.len()
            && self.sizes.len() == size.len()
            && self
                .offsets
                .iter()
                .zip(&self.sizes)
                .zip(size)
                .all(|((&o, &s), &n)| o + s <= n)
    }
}

/// A locally held piece of a sharded tensor, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Shard {
    /// Placement inside the tensor
    pub metadata: ShardMetadata,
    /// Values, `metadata.numel()` of them
    pub data: Vec<f32>,
}

/// Where a nested sharded tensor sits inside its enclosing global tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OuterPlacement {
    /// Shape of the enclosing tensor
    pub global_size: Vec<usize>,
    /// Offset of this tensor's origin in the enclosing tensor
    pub offsets: Vec<usize>,
}

/// A tensor of which this rank holds zero or more shards.
///
/// With an `outer` placement the tensor is itself a slab of a larger one
/// (an FSDP shard of a tensor-parallel slice); [`ShardedTensor::flatten`]
/// composes the two levels into global coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardedTensor {
    size: Vec<usize>,
    dtype: DType,
    local_shards: Vec<Shard>,
    outer: Option<OuterPlacement>,
    replicated: bool,
}

impl ShardedTensor {
    /// # Errors
    ///
    /// `Checkpoint` if a shard leaves the tensor's bounds or its data
    /// length disagrees with its sizes.
    pub fn new(size: Vec<usize>, dtype: DType, local_shards: Vec<Shard>) -> Result<Self> {
        for shard in &local_shards {
            if !shard.metadata.fits_within(&size) {
                return Err(SparseError::Checkpoint(format!(
                    "shard {:?} outside tensor of size {size:?}",
                    shard.metadata
                )));
            }
            if shard.data.len() != shard.metadata.numel() {
                return Err(SparseError::Checkpoint(format!(
                    "shard {:?} holds {} values",
                    shard.metadata,
                    shard.data.len()
                )));
            }
        }
        Ok(Self {
            size,
            dtype,
            local_shards,
            outer: None,
            replicated: false,
        })
    }

    /// Nest inside an enclosing tensor.
    ///
    /// # Errors
    ///
    /// `Checkpoint` if this tensor does not fit inside `outer`.
    pub fn with_outer(mut self, outer: OuterPlacement) -> Result<Self> {
        let slab = ShardMetadata::new(outer.offsets.clone(), self.size.clone());
        if !slab.fits_within(&outer.global_size) {
            return Err(SparseError::Checkpoint(format!(
                "slab {slab:?} outside enclosing size {:?}",
                outer.global_size
            )));
        }
        self.outer = Some(outer);
        Ok(self)
    }

    /// Mark the enclosing placement as replicated: every slab holder
    /// carries the whole enclosing tensor.
    #[must_use]
    pub fn replicated(mut self) -> Self {
        self.replicated = true;
        self
    }

    /// Shape of the whole tensor.
    pub fn size(&self) -> &[usize] {
        &self.size
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Shards held by this rank.
    pub fn local_shards(&self) -> &[Shard] {
        &self.local_shards
    }

    pub fn local_shards_mut(&mut self) -> &mut [Shard] {
        &mut self.local_shards
    }

    /// Enclosing placement, if nested.
    pub fn outer(&self) -> Option<&OuterPlacement> {
        self.outer.as_ref()
    }

    pub fn is_replicated(&self) -> bool {
        self.replicated
    }

    pub fn into_local_shards(self) -> Vec<Shard> {
        self.local_shards
    }

    /// Rewrite shards in the enclosing tensor's coordinates.
    ///
    /// # Errors
    ///
    /// `Checkpoint` if a replicated tensor claims a partial slab.
    pub fn flatten(&self) -> Result<ShardedTensor> {
        let Some(outer) = &self.outer else {
            return Ok(self.clone());
        };
        if self.replicated
            && (outer.global_size != self.size || outer.offsets.iter().any(|&o| o != 0))
        {
            return Err(SparseError::Checkpoint(format!(
                "replicated tensor of size {:?} placed at {:?} in {:?}",
                self.size, outer.offsets, outer.global_size
            )));
        }
        let local_shards = self
            .local_shards
            .iter()
            .map(|shard| Shard {
                metadata: ShardMetadata::new(
                    shard
                        .metadata
                        .offsets
                        .iter()
                        .zip(&outer.offsets)
                        .map(|(a, b)| a + b)
                        .collect(),
                    shard.metadata.sizes.clone(),
                ),
                data: shard.data.clone(),
            })
            .collect();
        Ok(ShardedTensor {
            size: outer.global_size.clone(),
            dtype: self.dtype,
            local_shards,
            outer: None,
            replicated: self.replicated,
        })
    }

    /// Inverse of [`ShardedTensor::flatten`]: take `flat`'s shard data
    /// back into this tensor's local coordinates.
    ///
    /// # Errors
    ///
    /// `Checkpoint` if the shard lists do not line up.
    pub fn unflatten_from(mut self, flat: ShardedTensor) -> Result<ShardedTensor> {
        if flat.local_shards.len() != self.local_shards.len() {
            return Err(SparseError::Checkpoint(format!(
                "expected {} shards, got {}",
                self.local_shards.len(),
                flat.local_shards.len()
            )));
        }
        for (mine, theirs) in self.local_shards.iter_mut().zip(flat.local_shards) {
            if mine.metadata.sizes != theirs.metadata.sizes {
                return Err(SparseError::Checkpoint(format!(
                    "shard sizes {:?} vs {:?}",
                    mine.metadata.sizes, theirs.metadata.sizes
                )));
            }
            mine.data = theirs.data;
        }
        Ok(self)
    }
}

/// A state dict entry.
#[derive(Debug, Clone, PartialEq)]
pub enum StateValue {
    Tensor(ShardedTensor),
    Dict(StateDict),
}

/// Ordered mapping of names to tensors or nested dicts.
pub type StateDict = BTreeMap<String, StateValue>;

/// Flat key to the path of keys it came from.
pub type FlattenMapping = BTreeMap<String, Vec<String>>;

/// Collapse nested dicts into dotted keys.
///
/// # Errors
///
/// `Checkpoint` if two paths collapse to the same key.
pub fn flatten_state_dict(
    state_dict: StateDict,
) -> Result<(BTreeMap<String, ShardedTensor>, FlattenMapping)> {
    fn walk(
        dict: StateDict,
        path: &mut Vec<String>,
        flat: &mut BTreeMap<String, ShardedTensor>,
        mapping: &mut FlattenMapping,
    ) -> Result<()> {
        for (key, value) in dict {
            path.push(key);
            match value {
                StateValue::Tensor(t) => {
                    let fqn = path.join(".");
                    if flat.insert(fqn.clone(), t).is_some() {
                        return Err(SparseError::Checkpoint(format!(
                            "duplicate flattened key {fqn}"
                        )));
                    }
                    mapping.insert(fqn, path.clone());
                }
                StateValue::Dict(inner) => walk(inner, path, flat, mapping)?,
            }
            path.pop();
        }
        Ok(())
    }

    let mut flat = BTreeMap::new();
    let mut mapping = FlattenMapping::new();
    walk(state_dict, &mut Vec::new(), &mut flat, &mut mapping)?;
    Ok((flat, mapping))
}

/// Rebuild the nested dict [`flatten_state_dict`] collapsed.
///
/// # Errors
///
/// `Checkpoint` if a key has no mapping or two paths conflict.
pub fn unflatten_state_dict(
    flat: BTreeMap<String, ShardedTensor>,
    mapping: &FlattenMapping,
) -> Result<StateDict> {
    let mut root = StateDict::new();
    for (fqn, tensor) in flat {
        let path = mapping
            .get(&fqn)
            .ok_or_else(|| SparseError::Checkpoint(format!("no mapping for key {fqn}")))?;
        let Some((leaf, parents)) = path.split_last() else {
            return Err(SparseError::Checkpoint(format!("empty path for key {fqn}")));
        };
        let mut dict = &mut root;
        for parent in parents {
            let entry = dict
                .entry(parent.clone())
                .or_insert_with(|| StateValue::Dict(StateDict::new()));
            dict = match entry {
                StateValue::Dict(inner) => inner,
                StateValue::Tensor(_) => {
                    return Err(SparseError::Checkpoint(format!(
                        "{parent} is both a tensor and a dict"
                    )))
                }
            };
        }
        dict.insert(leaf.clone(), StateValue::Tensor(tensor));
    }
    Ok(root)
}
