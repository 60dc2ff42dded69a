//! Block weight-norm pruner.
//!
//! Each target parameter is tiled into `block_shape` blocks. A step ranks
//! blocks by the L2 norm of their surviving weights, selects the
//! `round(sparsity_level * blocks)` weakest ones, and zeroes the
//! `zeros_per_block` smallest-magnitude weights inside each. With block
//! `(1, 4)`, two zeros per block and sparsity level 1.0 every group of
//! four loses its two weakest weights, which is exactly 2:4.
//!
//! # References
//! - Han, S., et al. (2015). Learning both weights and connections. `NeurIPS`.

use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use super::mask::{SparsityMask, SparsityPattern};
use crate::error::{Result, SparseError};
use crate::nn::Module;
use crate::tensor::Tensor;

/// Result of a pruning operation with diagnostics.
#[derive(Debug, Clone)]
pub struct PruningResult {
    /// Actual achieved sparsity over the targeted parameters.
    pub achieved_sparsity: f32,
    /// Number of parameters pruned (set to zero).
    pub parameters_pruned: usize,
    /// Total parameters targeted.
    pub total_parameters: usize,
    /// Per-parameter sparsity breakdown.
    pub layer_sparsity: HashMap<String, f32>,
    /// Estimated memory savings in bytes at the parameters' dtype.
    pub memory_savings_bytes: usize,
}

impl PruningResult {
    /// Get compression ratio (original / pruned size).
    #[must_use]
    pub fn compression_ratio(&self) -> f32 {
        if self.total_parameters == 0 || self.achieved_sparsity >= 1.0 {
            return f32::INFINITY;
        }
        1.0 / (1.0 - self.achieved_sparsity)
    }
}

/// Block weight-norm sparsifier with the prepare / step / squash cycle.
#[derive(Debug, Clone)]
pub struct WeightNormPruner {
    sparsity_level: f32,
    block_shape: (usize, usize),
    zeros_per_block: usize,
    masks: BTreeMap<String, Tensor>,
}

impl WeightNormPruner {
    /// Create a pruner.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for a sparsity level outside `[0, 1]`, an empty
    /// block, or more zeros per block than the block holds.
    pub fn new(
        sparsity_level: f32,
        block_shape: (usize, usize),
        zeros_per_block: usize,
    ) -> Result<Self> {
        if !(0.0..=1.0).contains(&sparsity_level) {
            return Err(SparseError::InvalidConfig {
                param: "sparsity_level".to_string(),
                value: sparsity_level.to_string(),
                constraint: "a value in [0, 1]".to_string(),
            });
        }
        let (bh, bw) = block_shape;
        if bh == 0 || bw == 0 {
            return Err(SparseError::InvalidConfig {
                param: "block_shape".to_string(),
                value: format!("{block_shape:?}"),
                constraint: "non-zero block dimensions".to_string(),
            });
        }
        if zeros_per_block > bh * bw {
            return Err(SparseError::InvalidConfig {
                param: "zeros_per_block".to_string(),
                value: zeros_per_block.to_string(),
                constraint: format!("at most {} for block {block_shape:?}", bh * bw),
            });
        }
        Ok(Self {
            sparsity_level,
            block_shape,
            zeros_per_block,
            masks: BTreeMap::new(),
        })
    }

    /// Pattern every step's masks satisfy.
    #[must_use]
    pub fn pattern(&self) -> SparsityPattern {
        let (bh, bw) = self.block_shape;
        if bh == 1 && self.sparsity_level >= 1.0 {
            SparsityPattern::NM {
                n: bw - self.zeros_per_block,
                m: bw,
            }
        } else {
            SparsityPattern::Unstructured
        }
    }

    /// Attach an all-ones mask to every named parameter.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for a missing parameter or one whose shape does not
    /// tile into blocks.
    pub fn prepare(&mut self, module: &dyn Module, targets: &[&str]) -> Result<()> {
        let (bh, bw) = self.block_shape;
        for &name in targets {
            let param = module.parameter(name).ok_or_else(|| SparseError::InvalidConfig {
                param: "targets".to_string(),
                value: name.to_string(),
                constraint: "a dense parameter of the module".to_string(),
            })?;
            let (rows, cols) = param.dims2()?;
            if rows % bh != 0 || cols % bw != 0 {
                return Err(SparseError::InvalidConfig {
                    param: name.to_string(),
                    value: format!("{:?}", param.shape()),
                    constraint: format!("a shape divisible by block {:?}", self.block_shape),
                });
            }
            self.masks
                .insert(name.to_string(), Tensor::ones(param.shape()));
        }
        Ok(())
    }

    /// Names of the prepared parameters.
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.masks.keys().map(String::as_str)
    }

    /// Current mask of one target.
    #[must_use]
    pub fn mask(&self, name: &str) -> Option<&Tensor> {
        self.masks.get(name)
    }

    /// Recompute masks from the current weights and apply them.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if a prepared parameter disappeared, or a mask
    /// fails pattern validation.
    pub fn step(&mut self, module: &mut dyn Module) -> Result<PruningResult> {
        let pattern = self.pattern();
        let mut total = 0;
        let mut pruned = 0;
        let mut bytes = 0;
        let mut layer_sparsity = HashMap::new();

        for (name, mask) in &mut self.masks {
            let param = module
                .parameter_mut(name)
                .ok_or_else(|| SparseError::InvalidConfig {
                    param: "targets".to_string(),
                    value: name.clone(),
                    constraint: "a dense parameter of the module".to_string(),
                })?;
            let (rows, cols) = param.dims2()?;
            let new_mask = block_mask(
                param.data(),
                mask.data(),
                rows,
                cols,
                self.block_shape,
                self.sparsity_level,
                self.zeros_per_block,
            );
            let checked = SparsityMask::new(Tensor::from_vec(new_mask, &[rows, cols])?, pattern)?;
            checked.apply(param)?;

            let zeros = param.numel() - checked.nnz();
            total += param.numel();
            pruned += zeros;
            bytes += zeros * param.dtype().size_of();
            layer_sparsity.insert(name.clone(), checked.sparsity());
            debug!(param = %name, sparsity = checked.sparsity(), "pruner step");
            *mask = checked.tensor().clone();
        }

        Ok(PruningResult {
            achieved_sparsity: if total == 0 {
                0.0
            } else {
                pruned as f32 / total as f32
            },
            parameters_pruned: pruned,
            total_parameters: total,
            layer_sparsity,
            memory_savings_bytes: bytes,
        })
    }

    /// Bake the masks into the weights and detach the pruner.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if a prepared parameter disappeared.
    pub fn squash_mask(&mut self, module: &mut dyn Module) -> Result<()> {
        for (name, mask) in std::mem::take(&mut self.masks) {
            let param = module
                .parameter_mut(&name)
                .ok_or_else(|| SparseError::InvalidConfig {
                    param: "targets".to_string(),
                    value: name.clone(),
                    constraint: "a dense parameter of the module".to_string(),
                })?;
            for (w, &m) in param.data_mut().iter_mut().zip(mask.data()) {
                *w *= m;
            }
        }
        Ok(())
    }
}

/// One step's mask: the previous mask with the weakest blocks thinned.
fn block_mask(
    weights: &[f32],
    prev: &[f32],
    rows: usize,
    cols: usize,
    (bh, bw): (usize, usize),
    sparsity_level: f32,
    zeros_per_block: usize,
) -> Vec<f32> {
    let blocks_per_row = cols / bw;
    let n_blocks = (rows / bh) * blocks_per_row;
    let block_cells = move |b: usize| {
        let (br, bc) = (b / blocks_per_row, b % blocks_per_row);
        (0..bh).flat_map(move |r| (0..bw).map(move |c| (br * bh + r) * cols + bc * bw + c))
    };

    let mut norms: Vec<(usize, f32)> = (0..n_blocks)
        .map(|b| {
            let sq: f32 = block_cells(b)
                .map(|i| {
                    let v = weights[i] * prev[i];
                    v * v
                })
                .sum();
            (b, sq.sqrt())
        })
        .collect();
    norms.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

    let n_selected = (sparsity_level * n_blocks as f32).round() as usize;
    let mut mask = prev.to_vec();
    for &(b, _) in norms.iter().take(n_selected) {
        let mut cells: Vec<usize> = block_cells(b).collect();
        cells.sort_by(|&x, &y| {
            (weights[x] * prev[x])
                .abs()
                .total_cmp(&(weights[y] * prev[y]).abs())
                .then(x.cmp(&y))
        });
        for &i in cells.iter().take(zeros_per_block) {
            mask[i] = 0.0;
        }
    }
    mask
}
