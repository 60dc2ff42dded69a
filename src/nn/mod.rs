//! Neural network layers.
//!
//! The [`Module`] trait exposes named parameters so pruners and the
//! benchmark can address weights the way a state dict does
//! (`linear.weight`). Compressed weights are not parameters: once a
//! [`Linear`] weight is a [`Weight::SemiSparse`], only its bias is listed.
//!
//! # Example
//!
//! ```
//! use semisparse::nn::{Model, Module};
//! use semisparse::tensor::Tensor;
//!
//! let model = Model::new(8, 16, Some(0));
//! let y = model.forward(&Tensor::ones(&[4, 16])).unwrap();
//! assert_eq!(y.shape(), &[4, 8]);
//! ```

pub mod init;
mod linear;

pub use linear::{Linear, Model, Weight};

use crate::error::Result;
use crate::tensor::Tensor;

/// A layer or model with named dense parameters.
pub trait Module {
    /// Forward pass.
    ///
    /// # Errors
    ///
    /// Shape, dtype, and dispatch errors from the underlying kernels.
    fn forward(&self, input: &Tensor) -> Result<Tensor>;

    /// Dense parameters with their dotted names.
    fn named_parameters(&self) -> Vec<(String, &Tensor)>;

    /// Mutable dense parameters with their dotted names.
    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)>;

    /// Look up one parameter by name.
    fn parameter(&self, name: &str) -> Option<&Tensor> {
        self.named_parameters()
            .into_iter()
            .find_map(|(n, t)| (n == name).then_some(t))
    }

    /// Look up one parameter by name, mutably.
    fn parameter_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        self.named_parameters_mut()
            .into_iter()
            .find_map(|(n, t)| (n == name).then_some(t))
    }

    /// Total number of dense parameter elements.
    fn num_parameters(&self) -> usize {
        self.named_parameters().iter().map(|(_, t)| t.numel()).sum()
    }
}

#[cfg(test)]
mod tests;
