//! Sparsity mask representation and pattern validation.
//!
//! Masks validate shape compatibility and binary values at construction,
//! preventing invalid operations downstream.
//!
//! # References
//! - Zhou, A., et al. (2021). Learning N:M fine-grained structured sparse networks. ICLR.
//! - Mishra, A., et al. (2021). Accelerating sparse deep neural networks.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::dtype::{DType, Device};
use crate::error::{Result, SparseError};
use crate::tensor::Tensor;

/// The six ways to keep two of four elements.
pub const TWO_FOUR_PATTERNS: [[f32; 4]; 6] = [
    [1.0, 1.0, 0.0, 0.0],
    [1.0, 0.0, 1.0, 0.0],
    [1.0, 0.0, 0.0, 1.0],
    [0.0, 1.0, 1.0, 0.0],
    [0.0, 1.0, 0.0, 1.0],
    [0.0, 0.0, 1.0, 1.0],
];

/// Sparsity pattern constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SparsityPattern {
    /// No structural constraint - any element can be pruned.
    #[default]
    Unstructured,

    /// N:M sparsity - in every M consecutive elements, at most N are non-zero.
    ///
    /// 2:4 is the pattern the semi-structured kernels accept.
    NM {
        /// Number of non-zero elements per group
        n: usize,
        /// Group size
        m: usize,
    },
}

impl SparsityPattern {
    /// The 2:4 pattern.
    pub const TWO_FOUR: Self = Self::NM { n: 2, m: 4 };

    /// Check if this pattern configuration is valid.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        match self {
            SparsityPattern::NM { n, m } => *n <= *m && *m > 0,
            SparsityPattern::Unstructured => true,
        }
    }

    /// Theoretical sparsity for this pattern (0.0 = dense, 1.0 = fully sparse).
    #[must_use]
    pub fn theoretical_sparsity(&self) -> Option<f32> {
        match self {
            SparsityPattern::NM { n, m } => Some(1.0 - (*n as f32 / *m as f32)),
            SparsityPattern::Unstructured => None,
        }
    }

    /// Validate a tensor's nonzero structure against this pattern.
    ///
    /// Groups run along the last dimension; every group of `m` may hold at
    /// most `n` nonzeros.
    ///
    /// # Errors
    ///
    /// `InvalidPattern` naming the first offending group.
    pub fn validate(&self, tensor: &Tensor) -> Result<()> {
        match self {
            SparsityPattern::Unstructured => Ok(()),
            SparsityPattern::NM { n, m } => {
                let cols = tensor.shape().last().copied().unwrap_or(0);
                if *m == 0 || cols % m != 0 {
                    return Err(SparsityPattern::invalid(format!(
                        "last dimension {cols} not divisible by M={m}"
                    )));
                }
                for (i, chunk) in tensor.data().chunks(*m).enumerate() {
                    let count = chunk.iter().filter(|&&v| v != 0.0).count();
                    if count > *n {
                        return Err(SparsityPattern::invalid(format!(
                            "group {i} has {count} non-zeros, expected at most {n} for {n}:{m} pattern"
                        )));
                    }
                }
                Ok(())
            }
        }
    }

    fn invalid(message: String) -> SparseError {
        SparseError::InvalidPattern { message }
    }
}

/// Binary mask with validation.
///
/// # Invariants
/// - All values are exactly 0.0 or 1.0
/// - Pattern constraints are satisfied
#[derive(Debug, Clone)]
pub struct SparsityMask {
    /// Binary mask tensor (1 = keep, 0 = prune)
    mask: Tensor,
    /// Pattern used to generate this mask
    pattern: SparsityPattern,
    /// Cached sparsity ratio
    sparsity: f32,
}

impl SparsityMask {
    /// Create a new mask with validation.
    ///
    /// # Errors
    ///
    /// `InvalidPattern` if values are not binary or the pattern is violated.
    pub fn new(mask: Tensor, pattern: SparsityPattern) -> Result<Self> {
        if let Some(v) = mask.data().iter().find(|&&v| v != 0.0 && v != 1.0) {
            return Err(SparseError::InvalidPattern {
                message: format!("mask contains non-binary value: {v}"),
            });
        }
        pattern.validate(&mask)?;

        let data = mask.data();
        let sparsity = if data.is_empty() {
            0.0
        } else {
            data.iter().filter(|&&v| v == 0.0).count() as f32 / data.len() as f32
        };

        Ok(Self {
            mask,
            pattern,
            sparsity,
        })
    }

    /// Sparsity ratio (0.0 = dense, 1.0 = all zeros).
    #[must_use]
    pub fn sparsity(&self) -> f32 {
        self.sparsity
    }

    /// Pattern used for this mask.
    #[must_use]
    pub fn pattern(&self) -> SparsityPattern {
        self.pattern
    }

    /// Underlying mask tensor.
    #[must_use]
    pub fn tensor(&self) -> &Tensor {
        &self.mask
    }

    /// Apply mask to weights in place.
    ///
    /// # Errors
    ///
    /// `ShapeMismatch` if shapes don't match.
    pub fn apply(&self, weights: &mut Tensor) -> Result<()> {
        if weights.shape() != self.mask.shape() {
            return Err(SparseError::shape_mismatch(
                "SparsityMask::apply",
                self.mask.shape(),
                weights.shape(),
            ));
        }
        for (w, &m) in weights.data_mut().iter_mut().zip(self.mask.data()) {
            *w *= m;
        }
        Ok(())
    }

    /// Number of kept elements.
    #[must_use]
    pub fn nnz(&self) -> usize {
        self.mask.data().iter().filter(|&&v| v == 1.0).count()
    }
}

/// Generate an N:M mask keeping the `n` highest scores of every `m` group.
///
/// Ties keep the earlier position.
///
/// # Errors
///
/// `InvalidPattern` if `n > m`, `m == 0`, or the length is not divisible by `m`.
pub fn generate_nm_mask(scores: &Tensor, n: usize, m: usize) -> Result<SparsityMask> {
    if n > m {
        return Err(SparseError::InvalidPattern {
            message: format!("N ({n}) must be <= M ({m})"),
        });
    }
    if m == 0 {
        return Err(SparseError::InvalidPattern {
            message: "M must be > 0".to_string(),
        });
    }

    let data = scores.data();
    if data.len() % m != 0 {
        return Err(SparseError::InvalidPattern {
            message: format!("Tensor length {} not divisible by M={}", data.len(), m),
        });
    }

    let mut mask_data = vec![0.0f32; data.len()];
    for (group_idx, chunk) in data.chunks(m).enumerate() {
        let mut indexed: Vec<(usize, f32)> =
            chunk.iter().enumerate().map(|(i, &v)| (i, v)).collect();
        indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        for (local_idx, _) in indexed.into_iter().take(n) {
            mask_data[group_idx * m + local_idx] = 1.0;
        }
    }

    SparsityMask::new(
        Tensor::from_vec(mask_data, scores.shape())?,
        SparsityPattern::NM { n, m },
    )
}

/// Random 2:4 mask of shape `[m, k]` on `device`, as `dtype`.
///
/// Every group of four along a row is one of [`TWO_FOUR_PATTERNS`],
/// chosen uniformly.
///
/// # Errors
///
/// `ShapeMismatch` unless `m * k` is a multiple of 4.
pub fn gen_two_four_sparse_mask<R: Rng + ?Sized>(
    m: usize,
    k: usize,
    dtype: DType,
    device: Device,
    rng: &mut R,
) -> Result<Tensor> {
    if k % 4 != 0 {
        return Err(SparseError::shape_mismatch(
            "gen_two_four_sparse_mask (k must be a multiple of 4)",
            &[m, k.next_multiple_of(4)],
            &[m, k],
        ));
    }
    let mut data = Vec::with_capacity(m * k);
    for _ in 0..(m * k / 4) {
        if let Some(pattern) = TWO_FOUR_PATTERNS.choose(rng) {
            data.extend_from_slice(pattern);
        }
    }
    Ok(Tensor::from_vec(data, &[m, k])?.with_dtype(dtype).to_device(device))
}
