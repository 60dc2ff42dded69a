//! 2D device mesh: data-parallel rows by tensor-parallel columns.

use serde::{Deserialize, Serialize};

use super::comm::{CommError, ProcessGroup, World};

/// Mesh dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeshDim {
    /// Dimension 0: FSDP shards parameters across it
    Data,
    /// Dimension 1: layers are split across it
    Tensor,
}

impl MeshDim {
    const fn tag(self) -> &'static str {
        match self {
            Self::Data => "dp",
            Self::Tensor => "tp",
        }
    }
}

/// `dp x tp` grid of ranks; rank `r` sits at `(r / tp, r % tp)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMesh {
    dp: usize,
    tp: usize,
}

impl DeviceMesh {
    /// # Errors
    ///
    /// `InvalidWorld` if either degree is zero.
    pub fn new(dp: usize, tp: usize) -> Result<Self, CommError> {
        if dp == 0 || tp == 0 {
            return Err(CommError::InvalidWorld(format!(
                "mesh degrees must be positive, got dp={dp} tp={tp}"
            )));
        }
        Ok(Self { dp, tp })
    }

    pub fn dp(&self) -> usize {
        self.dp
    }

    pub fn tp(&self) -> usize {
        self.tp
    }

    /// `dp * tp`.
    pub fn world_size(&self) -> usize {
        self.dp * self.tp
    }

    /// `(dp_coord, tp_coord)` of `rank`.
    #[must_use]
    pub fn coords(&self, rank: usize) -> (usize, usize) {
        (rank / self.tp, rank % self.tp)
    }

    #[must_use]
    pub fn rank_of(&self, dp_coord: usize, tp_coord: usize) -> usize {
        dp_coord * self.tp + tp_coord
    }

    /// Ranks that share `rank`'s other coordinate along `dim`.
    #[must_use]
    pub fn dim_ranks(&self, rank: usize, dim: MeshDim) -> Vec<usize> {
        let (d, t) = self.coords(rank);
        match dim {
            MeshDim::Data => (0..self.dp).map(|i| self.rank_of(i, t)).collect(),
            MeshDim::Tensor => (0..self.tp).map(|j| self.rank_of(d, j)).collect(),
        }
    }

    /// Communicator along `dim` for `rank`.
    ///
    /// # Errors
    ///
    /// `InvalidWorld` if the mesh does not match the world size.
    pub fn dim_group(
        &self,
        world: &World,
        rank: usize,
        dim: MeshDim,
    ) -> Result<ProcessGroup, CommError> {
        if world.size() != self.world_size() {
            return Err(CommError::InvalidWorld(format!(
                "mesh {}x{} needs {} ranks, world has {}",
                self.dp,
                self.tp,
                self.world_size(),
                world.size()
            )));
        }
        world.group(dim.tag(), rank, self.dim_ranks(rank, dim))
    }
}
