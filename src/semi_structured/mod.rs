//! 2:4 semi-structured sparse tensors.
//!
//! A [`SemiSparseTensor`] wraps an opaque, reference-counted
//! [`SparseContext`] holding the compressed weight. The dense source is
//! consumed at wrap time and dropped right after compression.
//!
//! The compressed representation cannot be transposed. Transposing the
//! wrapper only flips a flag; the dispatch table in [`crate::dispatch`]
//! accepts the wrapper as a left operand when the flag is clear and as a
//! right operand when it is set, and rejects the other two orientations.
//!
//! # Hardware Acceleration
//! - 2:4 structured sparsity maps to sparse tensor cores on recent GPUs
//! - here the kernel runs on [`Device::Accelerator`], row-parallel on rayon
//!
//! # References
//! - Mishra, A., et al. (2021). Accelerating sparse deep neural networks.

mod compress;

pub use compress::{CompressedBuffer, GROUP, KEPT};

use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::dtype::{DType, Device};
use crate::error::{Result, SparseError};
use crate::tensor::{Epilogue, Tensor, TensorId};

/// How a bias vector is broadcast onto the product.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BiasAxis {
    /// One bias per output column (dense `addmm` semantics)
    Columns,
    /// One bias per output row, i.e. per row of the sparse operand
    Rows,
}

/// Opaque handle owning one compressed matrix and its kernels.
///
/// Shared by every wrapper derived from the same compression through
/// `Arc`; never mutated after construction.
#[derive(Debug)]
pub struct SparseContext {
    buffer: CompressedBuffer,
    device: Device,
}

impl SparseContext {
    /// Compress a dense 2-D tensor.
    ///
    /// # Errors
    ///
    /// - `DeviceUnsupported` unless the source lives on `Device::Accelerator`
    /// - `UnsupportedDtype` unless the dtype is F16, BF16 or I8
    /// - `ShapeMismatch` / `NotTwoFourSparse` from compression
    pub fn compress(source: &Tensor) -> Result<Self> {
        if !source.device().supports_semi_structured() {
            return Err(SparseError::DeviceUnsupported {
                found: source.device().to_string(),
                expected: Device::Accelerator.to_string(),
                context: "semi-structured compression".to_string(),
            });
        }
        if !matches!(source.dtype(), DType::F16 | DType::BF16 | DType::I8) {
            return Err(SparseError::UnsupportedDtype {
                dtype: source.dtype().to_string(),
                context: "semi-structured compression".to_string(),
            });
        }
        let (rows, cols) = source.dims2()?;
        let buffer = CompressedBuffer::compress(source.data(), rows, cols, source.dtype())?;
        debug!(
            rows,
            cols,
            dtype = %source.dtype(),
            compressed_bytes = buffer.size_bytes(),
            dense_bytes = buffer.dense_size_bytes(),
            "compressed 2:4 tensor"
        );
        Ok(Self {
            buffer,
            device: source.device(),
        })
    }

    /// Rows of the compressed matrix.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.buffer.rows()
    }

    /// Columns of the compressed matrix.
    #[must_use]
    pub fn cols(&self) -> usize {
        self.buffer.cols()
    }

    /// Element type.
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.buffer.dtype()
    }

    /// Device the context was created on.
    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    /// The compressed buffer.
    #[must_use]
    pub fn buffer(&self) -> &CompressedBuffer {
        &self.buffer
    }

    fn check_dense(&self, op: &str, dense: &Tensor) -> Result<usize> {
        let (k, n) = dense.dims2()?;
        if k != self.cols() {
            return Err(SparseError::shape_mismatch(op, &[self.cols(), n], dense.shape()));
        }
        if dense.dtype() != self.dtype() {
            return Err(SparseError::UnsupportedDtype {
                dtype: dense.dtype().to_string(),
                context: format!("{op} against a {} sparse operand", self.dtype()),
            });
        }
        Ok(n)
    }

    /// `A @ dense` where `A` is the compressed `[rows, cols]` matrix.
    ///
    /// # Errors
    ///
    /// `ShapeMismatch` or `UnsupportedDtype` for an incompatible operand.
    pub fn mm(&self, dense: &Tensor) -> Result<Tensor> {
        let n = self.check_dense("semi-structured mm", dense)?;
        let data = self.buffer.spmm(dense.data(), n, Epilogue::None, true);
        Ok(Tensor::from_parts(data, vec![self.rows(), n], self.dtype(), self.device))
    }

    /// `A @ dense + bias`, broadcasting `bias` along `axis`.
    ///
    /// # Errors
    ///
    /// As [`SparseContext::mm`], plus `ShapeMismatch` for a bias whose
    /// length does not match the broadcast axis.
    pub fn addmm(&self, dense: &Tensor, bias: &Tensor, axis: BiasAxis) -> Result<Tensor> {
        let n = self.check_dense("semi-structured addmm", dense)?;
        let (expected, epilogue) = match axis {
            BiasAxis::Columns => (n, Epilogue::ColumnBias(bias.data())),
            BiasAxis::Rows => (self.rows(), Epilogue::RowBias(bias.data())),
        };
        if bias.shape() != [expected] {
            return Err(SparseError::shape_mismatch(
                "semi-structured addmm bias",
                &[expected],
                bias.shape(),
            ));
        }
        let data = self.buffer.spmm(dense.data(), n, epilogue, true);
        Ok(Tensor::from_parts(data, vec![self.rows(), n], self.dtype(), self.device))
    }
}

/// Wrapper tensor backed by a shared 2:4 compressed context.
///
/// # Invariants
/// - `shape` is the context's `[rows, cols]`, swapped when `transposed`
/// - the context is never re-derived; `t` and `detach` share it
#[derive(Clone)]
pub struct SemiSparseTensor {
    ctx: Arc<SparseContext>,
    shape: [usize; 2],
    transposed: bool,
    requires_grad: bool,
    id: TensorId,
}

impl SemiSparseTensor {
    /// Compress `original`, consuming it.
    ///
    /// Gradient tracking is inherited from the source.
    ///
    /// # Errors
    ///
    /// See [`SparseContext::compress`].
    pub fn from_dense(original: Tensor) -> Result<Self> {
        let ctx = SparseContext::compress(&original)?;
        let requires_grad = original.requires_grad_enabled();
        drop(original);
        let mut out = Self::from_context(Arc::new(ctx), false);
        out.requires_grad = requires_grad;
        Ok(out)
    }

    /// Wrap an existing context.
    #[must_use]
    pub fn from_context(ctx: Arc<SparseContext>, transposed: bool) -> Self {
        let (rows, cols) = (ctx.rows(), ctx.cols());
        let shape = if transposed { [cols, rows] } else { [rows, cols] };
        Self {
            ctx,
            shape,
            transposed,
            requires_grad: false,
            id: TensorId::new(),
        }
    }

    /// New wrapper over the same context with the flag inverted.
    #[must_use]
    pub fn t(&self) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
            shape: [self.shape[1], self.shape[0]],
            transposed: !self.transposed,
            requires_grad: self.requires_grad,
            id: TensorId::new(),
        }
    }

    /// New wrapper over the same context without gradient tracking.
    #[must_use]
    pub fn detach(&self) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
            shape: self.shape,
            transposed: self.transposed,
            requires_grad: false,
            id: TensorId::new(),
        }
    }

    /// Logical shape.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Shape of the compressed source.
    #[must_use]
    pub fn original_shape(&self) -> [usize; 2] {
        [self.ctx.rows(), self.ctx.cols()]
    }

    /// Whether an odd number of transpositions has been applied.
    #[must_use]
    pub fn is_transposed(&self) -> bool {
        self.transposed
    }

    /// Shared context.
    #[must_use]
    pub fn context(&self) -> &Arc<SparseContext> {
        &self.ctx
    }

    /// Whether two wrappers share one compressed buffer.
    #[must_use]
    pub fn shares_context(&self, other: &SemiSparseTensor) -> bool {
        Arc::ptr_eq(&self.ctx, &other.ctx)
    }

    /// Element type.
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.ctx.dtype()
    }

    /// Device.
    #[must_use]
    pub fn device(&self) -> Device {
        self.ctx.device()
    }

    /// Whether this wrapper tracks gradients.
    #[must_use]
    pub fn requires_grad_enabled(&self) -> bool {
        self.requires_grad
    }

    /// Unique identifier.
    #[must_use]
    pub fn id(&self) -> TensorId {
        self.id
    }

    /// Bytes held by the compressed buffer.
    #[must_use]
    pub fn compressed_size_bytes(&self) -> usize {
        self.ctx.buffer().size_bytes()
    }
}

impl fmt::Debug for SemiSparseTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SemiSparseTensor(shape={:?})", self.shape)
    }
}

#[cfg(test)]
mod tests;
