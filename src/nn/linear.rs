//! Fully connected (linear) layer with a dense or 2:4 compressed weight.
//!
//! Implements the transformation y = xW^T + b. The product goes through
//! [`crate::dispatch`] as `addmm(b, x, W^T)` (or `mm(x, W^T)` without a
//! bias), so a [`Weight::SemiSparse`] weight reaches the compressed kernel
//! as a transposed right operand.

use rand::Rng;

use super::init::{linear_uniform, seeded_rng};
use super::Module;
use crate::dispatch::{self, Operand};
use crate::dtype::{DType, Device};
use crate::error::{Result, SparseError};
use crate::semi_structured::SemiSparseTensor;
use crate::tensor::Tensor;

/// Weight storage of a [`Linear`] layer.
#[derive(Debug, Clone)]
pub enum Weight {
    /// Dense `[out_features, in_features]`
    Dense(Tensor),
    /// 2:4 compressed `[out_features, in_features]`
    SemiSparse(SemiSparseTensor),
}

impl Weight {
    /// Logical shape.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        match self {
            Weight::Dense(t) => t.shape(),
            Weight::SemiSparse(t) => t.shape(),
        }
    }

    /// Element type.
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Weight::Dense(t) => t.dtype(),
            Weight::SemiSparse(t) => t.dtype(),
        }
    }

    /// Whether the weight is compressed.
    #[must_use]
    pub fn is_semi_sparse(&self) -> bool {
        matches!(self, Weight::SemiSparse(_))
    }

    /// The dense tensor, if not compressed.
    #[must_use]
    pub fn as_dense(&self) -> Option<&Tensor> {
        match self {
            Weight::Dense(t) => Some(t),
            Weight::SemiSparse(_) => None,
        }
    }
}

/// Fully connected layer: y = xW^T + b
///
/// # Shape
///
/// - Input: `(*, in_features)` where `*` means any number of batch dimensions
/// - Output: `(*, out_features)`
#[derive(Debug, Clone)]
pub struct Linear {
    /// Weight matrix, shape: [out_features, in_features]
    weight: Weight,

    /// Bias vector, shape: [out_features], or None if bias=false
    bias: Option<Tensor>,

    in_features: usize,
    out_features: usize,
}

impl Linear {
    /// Create a layer with a specific random seed (`None` for entropy).
    #[must_use]
    pub fn with_seed(in_features: usize, out_features: usize, seed: Option<u64>) -> Self {
        Self::from_rng(in_features, out_features, &mut seeded_rng(seed))
    }

    /// Create a layer drawing weight then bias from `rng`.
    pub fn from_rng<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        let weight = linear_uniform(&[out_features, in_features], in_features, rng).requires_grad();
        let bias = linear_uniform(&[out_features], in_features, rng).requires_grad();
        Self {
            weight: Weight::Dense(weight),
            bias: Some(bias),
            in_features,
            out_features,
        }
    }

    /// Build a layer from existing tensors.
    ///
    /// # Errors
    ///
    /// `ShapeMismatch` if the weight is not 2-D or the bias is not
    /// `[out_features]`.
    pub fn from_tensors(weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        let (out_features, in_features) = weight.dims2()?;
        if let Some(b) = &bias {
            if b.shape() != [out_features] {
                return Err(SparseError::shape_mismatch(
                    "Linear bias",
                    &[out_features],
                    b.shape(),
                ));
            }
        }
        Ok(Self {
            weight: Weight::Dense(weight),
            bias,
            in_features,
            out_features,
        })
    }

    /// Get the input feature dimension.
    #[must_use]
    pub fn in_features(&self) -> usize {
        self.in_features
    }

    /// Get the output feature dimension.
    #[must_use]
    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// Check if this layer has a bias term.
    #[must_use]
    pub fn has_bias(&self) -> bool {
        self.bias.is_some()
    }

    /// Get reference to the weight.
    #[must_use]
    pub fn weight(&self) -> &Weight {
        &self.weight
    }

    /// Get reference to bias tensor if present.
    #[must_use]
    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Replace the weight.
    ///
    /// # Errors
    ///
    /// `ShapeMismatch` if the new weight's shape differs.
    pub fn set_weight(&mut self, weight: Weight) -> Result<()> {
        if weight.shape() != [self.out_features, self.in_features] {
            return Err(SparseError::shape_mismatch(
                "Linear::set_weight",
                &[self.out_features, self.in_features],
                weight.shape(),
            ));
        }
        self.weight = weight;
        Ok(())
    }

    /// Replace or drop the bias.
    pub fn set_bias(&mut self, bias: Option<Tensor>) {
        self.bias = bias;
    }

    /// Compress the dense weight in place into a [`SemiSparseTensor`].
    ///
    /// A weight that is already compressed is left as is.
    ///
    /// # Errors
    ///
    /// Compression errors (device, dtype, or a non-2:4 weight).
    pub fn sparsify_weight(&mut self) -> Result<()> {
        if let Weight::Dense(w) = &self.weight {
            let sparse = SemiSparseTensor::from_dense(w.clone())?;
            self.weight = Weight::SemiSparse(sparse);
        }
        Ok(())
    }

    /// Cast dense parameters to `dtype` and move everything to `device`.
    ///
    /// # Errors
    ///
    /// `UnsupportedDtype` when a compressed weight would need a cast, and
    /// `DeviceUnsupported` when it would need a move.
    pub fn to(mut self, dtype: DType, device: Device) -> Result<Self> {
        self.weight = match self.weight {
            Weight::Dense(w) => Weight::Dense(w.to_dtype(dtype).to_device(device)),
            Weight::SemiSparse(w) => {
                if w.dtype() != dtype {
                    return Err(SparseError::UnsupportedDtype {
                        dtype: dtype.to_string(),
                        context: "casting a compressed weight".to_string(),
                    });
                }
                if w.device() != device {
                    return Err(SparseError::DeviceUnsupported {
                        found: device.to_string(),
                        expected: w.device().to_string(),
                        context: "moving a compressed weight".to_string(),
                    });
                }
                Weight::SemiSparse(w)
            }
        };
        self.bias = self.bias.map(|b| b.to_dtype(dtype).to_device(device));
        Ok(self)
    }
}

impl Module for Linear {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let input_shape = input.shape();
        let ndim = input_shape.len();
        let in_features = input_shape.last().copied().unwrap_or(0);
        if ndim < 2 || in_features != self.in_features {
            return Err(SparseError::shape_mismatch(
                "Linear::forward",
                &[0, self.in_features],
                input_shape,
            ));
        }

        // flatten batch dimensions
        let batch: usize = input_shape[..ndim - 1].iter().product();
        let reshaped;
        let x = if ndim > 2 {
            reshaped = input.reshape(&[batch, in_features])?;
            &reshaped
        } else {
            input
        };

        let dense_t;
        let sparse_t;
        let w_t = match &self.weight {
            Weight::Dense(w) => {
                dense_t = w.t()?;
                Operand::Dense(&dense_t)
            }
            Weight::SemiSparse(w) => {
                sparse_t = w.t();
                Operand::SemiSparse(&sparse_t)
            }
        };

        let output = match &self.bias {
            Some(b) => dispatch::addmm(b, x, w_t)?,
            None => dispatch::mm(x, w_t)?,
        };

        if ndim > 2 {
            let mut shape = input_shape[..ndim - 1].to_vec();
            shape.push(self.out_features);
            output.reshape(&shape)
        } else {
            Ok(output)
        }
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = Vec::new();
        if let Weight::Dense(w) = &self.weight {
            params.push(("weight".to_string(), w));
        }
        if let Some(b) = &self.bias {
            params.push(("bias".to_string(), b));
        }
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params = Vec::new();
        if let Weight::Dense(w) = &mut self.weight {
            params.push(("weight".to_string(), w));
        }
        if let Some(b) = &mut self.bias {
            params.push(("bias".to_string(), b));
        }
        params
    }
}

/// Single-layer model used by the benchmark: `Linear(k, m)`.
///
/// Parameters are named `linear.weight` and `linear.bias`.
#[derive(Debug, Clone)]
pub struct Model {
    /// The only layer
    pub linear: Linear,
}

impl Model {
    /// `Linear(k, m)`: weight `[m, k]`, bias `[m]`.
    #[must_use]
    pub fn new(m: usize, k: usize, seed: Option<u64>) -> Self {
        Self {
            linear: Linear::with_seed(k, m, seed),
        }
    }

    /// Cast and move every parameter.
    ///
    /// # Errors
    ///
    /// See [`Linear::to`].
    pub fn to(self, dtype: DType, device: Device) -> Result<Self> {
        Ok(Self {
            linear: self.linear.to(dtype, device)?,
        })
    }
}

impl Module for Model {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        self.linear.forward(input)
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        self.linear
            .named_parameters()
            .into_iter()
            .map(|(name, t)| (format!("linear.{name}"), t))
            .collect()
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        self.linear
            .named_parameters_mut()
            .into_iter()
            .map(|(name, t)| (format!("linear.{name}"), t))
            .collect()
    }
}
