//! Checkpoint metadata, stored as JSON in `<dir>/.metadata`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::state_dict::ShardMetadata;
use crate::dtype::DType;

/// Metadata file name inside a checkpoint directory.
pub const METADATA_FILE: &str = ".metadata";

/// Current metadata layout version.
pub const FORMAT_VERSION: u32 = 1;

/// Identifies one saved chunk: a tensor name and the chunk's offsets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MetadataIndex {
    /// Flattened tensor name
    pub fqn: String,
    /// Chunk origin in global coordinates
    pub offsets: Vec<usize>,
}

impl MetadataIndex {
    #[must_use]
    pub fn new(fqn: impl Into<String>, offsets: Vec<usize>) -> Self {
        Self {
            fqn: fqn.into(),
            offsets,
        }
    }
}

/// Global shape, dtype, and saved chunks of one tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorStorageMeta {
    /// Global shape
    pub size: Vec<usize>,
    /// Element type at save time
    pub dtype: DType,
    /// Every saved chunk, one entry per distinct offset
    pub chunks: Vec<ShardMetadata>,
}

/// Byte range of a chunk inside a data file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    /// File name relative to the checkpoint directory
    pub relative_path: String,
    /// First byte of the chunk
    pub offset: u64,
    /// Bytes of little-endian f32 data
    pub length: u64,
}

/// Storage location of one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEntry {
    /// Chunk identity
    pub index: MetadataIndex,
    /// File and byte range
    pub info: StorageInfo,
}

/// Everything a loader needs to find every chunk of every tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Layout version, checked on load
    pub version: u32,
    /// Per-tensor shape, dtype and chunk list, keyed by flattened name
    pub state_dict_metadata: BTreeMap<String, TensorStorageMeta>,
    /// Where every chunk was written
    pub storage_data: Vec<StorageEntry>,
}

impl Metadata {
    #[must_use]
    pub fn new(state_dict_metadata: BTreeMap<String, TensorStorageMeta>) -> Self {
        Self {
            version: FORMAT_VERSION,
            state_dict_metadata,
            storage_data: Vec::new(),
        }
    }

    /// Where the chunk `index` was written.
    #[must_use]
    pub fn storage_for(&self, index: &MetadataIndex) -> Option<&StorageInfo> {
        self.storage_data
            .iter()
            .find(|entry| &entry.index == index)
            .map(|entry| &entry.info)
    }

    /// Total saved chunks across every tensor.
    #[must_use]
    pub fn num_chunks(&self) -> usize {
        self.state_dict_metadata.values().map(|m| m.chunks.len()).sum()
    }
}
