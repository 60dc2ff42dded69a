//! 2:4 pruning.
//!
//! Random 2:4 masks for synthetic benchmark weights, magnitude-based N:M
//! masks, pattern validation, and the block weight-norm pruner that turns
//! a trained dense weight into one the semi-structured kernels accept.
//!
//! # Example
//!
//! ```
//! use semisparse::nn::{Model, Module};
//! use semisparse::pruning::{SparsityPattern, WeightNormPruner};
//!
//! let mut model = Model::new(8, 16, Some(0));
//! let mut pruner = WeightNormPruner::new(1.0, (1, 4), 2).unwrap();
//! pruner.prepare(&model, &["linear.weight"]).unwrap();
//! pruner.step(&mut model).unwrap();
//! pruner.squash_mask(&mut model).unwrap();
//!
//! let weight = model.parameter("linear.weight").unwrap();
//! assert!(SparsityPattern::TWO_FOUR.validate(weight).is_ok());
//! ```
//!
//! # References
//! - Zhou, A., et al. (2021). Learning N:M fine-grained structured sparse networks. ICLR.
//! - Mishra, A., et al. (2021). Accelerating sparse deep neural networks.

mod mask;
mod pruner;

pub use mask::{
    gen_two_four_sparse_mask, generate_nm_mask, SparsityMask, SparsityPattern, TWO_FOUR_PATTERNS,
};
pub use pruner::{PruningResult, WeightNormPruner};
