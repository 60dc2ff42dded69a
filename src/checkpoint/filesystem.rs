//! Directory-backed checkpoint storage.
//!
//! Layout:
//!
//! ```text
//! <dir>/.metadata          JSON Metadata
//! <dir>/__<rank>_0.distcp  little-endian f32 chunks, back to back
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::metadata::{Metadata, MetadataIndex, StorageEntry, StorageInfo, METADATA_FILE};
use super::planner::{LoadPlan, LoadPlanner, SavePlan, SavePlanner};
use crate::error::{Result, SparseError};

/// Where one write item landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
    /// Chunk written
    pub index: MetadataIndex,
    /// File and byte range it went to
    pub info: StorageInfo,
}

/// Persists a rank's chunks and, on the coordinator, the metadata.
pub trait StorageWriter {
    fn set_up(&mut self, is_coordinator: bool) -> Result<()>;

    /// Write every item of `plan`, pulling data from `planner`.
    fn write_data(
        &mut self,
        rank: usize,
        plan: &SavePlan,
        planner: &dyn SavePlanner,
    ) -> Result<Vec<WriteResult>>;

    /// Coordinator only: record where every chunk went and commit the
    /// checkpoint. Returns the final metadata.
    fn finish(&mut self, metadata: Metadata, results: Vec<Vec<WriteResult>>) -> Result<Metadata>;
}

/// Reads metadata and chunks back.
pub trait StorageReader {
    fn read_metadata(&self) -> Result<Metadata>;

    /// Read every chunk `plan` names and hand it to `planner`.
    fn read_data(
        &mut self,
        metadata: &Metadata,
        plan: &LoadPlan,
        planner: &mut dyn LoadPlanner,
    ) -> Result<()>;
}

/// Data file written by `rank`.
#[must_use]
pub fn data_file_name(rank: usize) -> String {
    format!("__{rank}_0.distcp")
}

/// Writes checkpoint files into a directory.
#[derive(Debug, Clone)]
pub struct FileSystemWriter {
    path: PathBuf,
    sync_files: bool,
}

impl FileSystemWriter {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sync_files: true,
        }
    }

    /// Whether to fsync each file before reporting it written.
    #[must_use]
    pub fn with_sync_files(mut self, sync_files: bool) -> Self {
        self.sync_files = sync_files;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageWriter for FileSystemWriter {
    fn set_up(&mut self, _is_coordinator: bool) -> Result<()> {
        fs::create_dir_all(&self.path)?;
        Ok(())
    }

    fn write_data(
        &mut self,
        rank: usize,
        plan: &SavePlan,
        planner: &dyn SavePlanner,
    ) -> Result<Vec<WriteResult>> {
        let relative_path = data_file_name(rank);
        let file = File::create(self.path.join(&relative_path))?;
        let mut writer = BufWriter::new(file);

        let mut results = Vec::with_capacity(plan.items.len());
        let mut offset = 0u64;
        for item in &plan.items {
            let data = planner.resolve_data(item)?;
            for value in data {
                writer.write_all(&value.to_le_bytes())?;
            }
            let length = (data.len() * std::mem::size_of::<f32>()) as u64;
            results.push(WriteResult {
                index: item.index.clone(),
                info: StorageInfo {
                    relative_path: relative_path.clone(),
                    offset,
                    length,
                },
            });
            offset += length;
        }
        writer.flush()?;
        if self.sync_files {
            writer.get_ref().sync_all()?;
        }
        debug!(file = %relative_path, items = results.len(), bytes = offset, "wrote chunks");
        Ok(results)
    }

    fn finish(&mut self, mut metadata: Metadata, results: Vec<Vec<WriteResult>>) -> Result<Metadata> {
        metadata.storage_data = results
            .into_iter()
            .flatten()
            .map(|r| StorageEntry {
                index: r.index,
                info: r.info,
            })
            .collect();

        let tmp = self.path.join(format!("{METADATA_FILE}.tmp"));
        let file = File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &metadata)?;
        writer.flush()?;
        if self.sync_files {
            writer.get_ref().sync_all()?;
        }
        drop(writer);
        fs::rename(&tmp, self.path.join(METADATA_FILE))?;
        info!(
            dir = %self.path.display(),
            tensors = metadata.state_dict_metadata.len(),
            chunks = metadata.storage_data.len(),
            "checkpoint committed"
        );
        Ok(metadata)
    }
}

/// Reads checkpoint files from a directory.
#[derive(Debug, Clone)]
pub struct FileSystemReader {
    path: PathBuf,
}

impl FileSystemReader {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self, relative_path: &str) -> Result<File> {
        let path = self.path.join(relative_path);
        if !path.exists() {
            return Err(SparseError::CheckpointFileNotFound(path));
        }
        Ok(File::open(path)?)
    }
}

impl StorageReader for FileSystemReader {
    fn read_metadata(&self) -> Result<Metadata> {
        let reader = BufReader::new(self.open(METADATA_FILE)?);
        let metadata: Metadata = serde_json::from_reader(reader)?;
        if metadata.version != super::metadata::FORMAT_VERSION {
            return Err(SparseError::Checkpoint(format!(
                "unsupported metadata version {}",
                metadata.version
            )));
        }
        Ok(metadata)
    }

    fn read_data(
        &mut self,
        metadata: &Metadata,
        plan: &LoadPlan,
        planner: &mut dyn LoadPlanner,
    ) -> Result<()> {
        let mut by_file: BTreeMap<&str, Vec<(&StorageInfo, usize)>> = BTreeMap::new();
        for (i, item) in plan.items.iter().enumerate() {
            let info = metadata.storage_for(&item.storage_index).ok_or_else(|| {
                SparseError::Checkpoint(format!(
                    "no storage entry for {} at {:?}",
                    item.storage_index.fqn, item.storage_index.offsets
                ))
            })?;
            by_file
                .entry(info.relative_path.as_str())
                .or_default()
                .push((info, i));
        }

        for (relative_path, reads) in by_file {
            let mut file = BufReader::new(self.open(relative_path)?);
            for (info, i) in reads {
                file.seek(SeekFrom::Start(info.offset))?;
                let mut bytes = vec![0u8; usize::try_from(info.length).map_err(|_| {
                    SparseError::Checkpoint(format!("chunk of {} bytes", info.length))
                })?];
                file.read_exact(&mut bytes)?;
                let values = decode_le_f32(&bytes)?;
                planner.load_chunk(&plan.items[i], &values)?;
            }
            debug!(file = relative_path, "read chunks");
        }
        Ok(())
    }
}

fn decode_le_f32(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(SparseError::Checkpoint(format!(
            "chunk of {} bytes is not whole f32 values",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}
