//! Convenience re-exports for common usage.
//!
//! # Usage
//!
//! ```
//! use semisparse::prelude::*;
//! ```

pub use crate::dispatch;
pub use crate::dtype::{DType, Device};
pub use crate::error::{Result, SparseError};
pub use crate::nn::{Linear, Model, Module, Weight};
pub use crate::pruning::{SparsityPattern, WeightNormPruner};
pub use crate::semi_structured::SemiSparseTensor;
pub use crate::tensor::Tensor;
