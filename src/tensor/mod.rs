//! Dense row-major tensor.
//!
//! This is the dense side of every comparison in the crate: the benchmark
//! baseline, the operand the semi-structured kernels multiply against, and
//! the storage behind sharded model parameters.

mod matmul;

pub use matmul::{addmm, mm, Epilogue};
pub(crate) use matmul::apply_epilogue;
#[cfg(test)]
pub(crate) use matmul::gemm;

use rand::Rng;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::dtype::{DType, Device};
use crate::error::{Result, SparseError};

/// Unique identifier for a tensor node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorId(u64);

impl TensorId {
    /// Generate a new unique tensor ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        TensorId(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for TensorId {
    fn default() -> Self {
        Self::new()
    }
}

/// A dense tensor with a dtype, a device, and a gradient-tracking flag.
///
/// # Invariants
///
/// - `data.len()` equals the product of `shape`
/// - every value is representable in `dtype`
#[derive(Clone)]
pub struct Tensor {
    data: Vec<f32>,
    shape: Vec<usize>,
    dtype: DType,
    device: Device,
    requires_grad: bool,
    id: TensorId,
}

impl Tensor {
    /// Create an `F32` CPU tensor from a slice with the given shape.
    ///
    /// # Panics
    ///
    /// Panics if the data length doesn't match the product of shape dimensions.
    #[must_use]
    pub fn new(data: &[f32], shape: &[usize]) -> Self {
        let expected_len: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected_len,
            "Data length {} doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            expected_len
        );
        Self::from_parts(data.to_vec(), shape.to_vec(), DType::F32, Device::Cpu)
    }

    /// Create a tensor taking ownership of `data`.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the length does not match the shape.
    pub fn from_vec(data: Vec<f32>, shape: &[usize]) -> Result<Self> {
        let expected_len: usize = shape.iter().product();
        if data.len() != expected_len {
            return Err(SparseError::shape_mismatch(
                "Tensor::from_vec",
                &[expected_len],
                &[data.len()],
            ));
        }
        Ok(Self::from_parts(data, shape.to_vec(), DType::F32, Device::Cpu))
    }

    pub(crate) fn from_parts(
        mut data: Vec<f32>,
        shape: Vec<usize>,
        dtype: DType,
        device: Device,
    ) -> Self {
        debug_assert_eq!(data.len(), shape.iter().product::<usize>());
        dtype.round_slice(&mut data);
        Self {
            data,
            shape,
            dtype,
            device,
            requires_grad: false,
            id: TensorId::new(),
        }
    }

    /// Create a tensor filled with zeros.
    #[must_use]
    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, 0.0)
    }

    /// Create a tensor filled with ones.
    #[must_use]
    pub fn ones(shape: &[usize]) -> Self {
        Self::full(shape, 1.0)
    }

    /// Create a tensor filled with `value`.
    #[must_use]
    pub fn full(shape: &[usize], value: f32) -> Self {
        let len: usize = shape.iter().product();
        Self::from_parts(vec![value; len], shape.to_vec(), DType::F32, Device::Cpu)
    }

    /// Uniform samples from `[0, 1)`.
    pub fn rand<R: Rng + ?Sized>(shape: &[usize], rng: &mut R) -> Self {
        let len: usize = shape.iter().product();
        let data = (0..len).map(|_| rng.gen::<f32>()).collect();
        Self::from_parts(data, shape.to_vec(), DType::F32, Device::Cpu)
    }

    /// Integer samples from `[0, high)`, stored as floats.
    pub fn randint<R: Rng + ?Sized>(high: u32, shape: &[usize], rng: &mut R) -> Self {
        let len: usize = shape.iter().product();
        let data = (0..len).map(|_| rng.gen_range(0..high.max(1)) as f32).collect();
        Self::from_parts(data, shape.to_vec(), DType::F32, Device::Cpu)
    }

    /// Cast to `dtype`, rounding every value.
    #[must_use]
    pub fn to_dtype(&self, dtype: DType) -> Self {
        let mut out = Self::from_parts(self.data.clone(), self.shape.clone(), dtype, self.device);
        out.requires_grad = self.requires_grad;
        out
    }

    /// Consuming variant of [`Tensor::to_dtype`].
    #[must_use]
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        dtype.round_slice(&mut self.data);
        self.dtype = dtype;
        self
    }

    /// Move to `device`.
    #[must_use]
    pub fn to_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Enable gradient tracking. Returns self for chaining.
    #[must_use]
    pub fn requires_grad(mut self) -> Self {
        self.requires_grad = true;
        self
    }

    /// Enable or disable gradient tracking in place.
    pub fn requires_grad_(&mut self, requires: bool) -> &mut Self {
        self.requires_grad = requires;
        self
    }

    /// Whether this tensor tracks gradients.
    #[must_use]
    pub fn requires_grad_enabled(&self) -> bool {
        self.requires_grad
    }

    /// New node with the same values and no gradient tracking.
    #[must_use]
    pub fn detach(&self) -> Self {
        Self {
            data: self.data.clone(),
            shape: self.shape.clone(),
            dtype: self.dtype,
            device: self.device,
            requires_grad: false,
            id: TensorId::new(),
        }
    }

    /// Unique identifier.
    #[must_use]
    pub fn id(&self) -> TensorId {
        self.id
    }

    /// Shape.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Element type.
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Device.
    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    /// Whether the dtype is floating point.
    #[must_use]
    pub fn is_floating_point(&self) -> bool {
        self.dtype.is_floating_point()
    }

    /// Total number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Number of dimensions.
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Underlying values.
    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Consume the tensor, returning its storage.
    #[must_use]
    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Mutable access to the values. Callers keep values representable.
    pub(crate) fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// `(rows, cols)` of a 2-D tensor.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` for any other rank.
    pub fn dims2(&self) -> Result<(usize, usize)> {
        match self.shape.as_slice() {
            [rows, cols] => Ok((*rows, *cols)),
            other => Err(SparseError::shape_mismatch("dims2", &[0, 0], other)),
        }
    }

    /// Transpose of a 2-D tensor (materialised).
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the tensor is not 2-D.
    pub fn t(&self) -> Result<Self> {
        let (rows, cols) = self.dims2()?;
        let mut data = vec![0.0f32; rows * cols];
        for r in 0..rows {
            for c in 0..cols {
                data[c * rows + r] = self.data[r * cols + c];
            }
        }
        let mut out = Self::from_parts(data, vec![cols, rows], self.dtype, self.device);
        out.requires_grad = self.requires_grad;
        Ok(out)
    }

    /// View with a new shape holding the same number of elements.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the element counts differ.
    pub fn reshape(&self, shape: &[usize]) -> Result<Self> {
        let len: usize = shape.iter().product();
        if len != self.numel() {
            return Err(SparseError::shape_mismatch("reshape", shape, &self.shape));
        }
        let mut out = self.clone();
        out.shape = shape.to_vec();
        out.id = TensorId::new();
        Ok(out)
    }

    /// Element-wise product.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the shapes differ.
    pub fn mul(&self, other: &Tensor) -> Result<Self> {
        if self.shape != other.shape {
            return Err(SparseError::shape_mismatch("mul", &self.shape, &other.shape));
        }
        let data = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| a * b)
            .collect();
        Ok(Self::from_parts(data, self.shape.clone(), self.dtype, self.device))
    }

    /// Element-wise `max(x, 0)`.
    #[must_use]
    pub fn relu(&self) -> Self {
        let data = self.data.iter().map(|&v| v.max(0.0)).collect();
        Self::from_parts(data, self.shape.clone(), self.dtype, self.device)
    }

    /// Sum of all elements, accumulated in `f64`.
    #[must_use]
    pub fn sum(&self) -> f32 {
        self.data.iter().map(|&v| f64::from(v)).sum::<f64>() as f32
    }

    /// `|self - other| <= atol + rtol * |other|` element-wise.
    ///
    /// Tensors of different shapes are never close. NaNs are never close.
    #[must_use]
    pub fn allclose(&self, other: &Tensor, rtol: f32, atol: f32) -> bool {
        self.shape == other.shape
            && self
                .data
                .iter()
                .zip(&other.data)
                .all(|(&a, &b)| (a - b).abs() <= atol + rtol * b.abs())
    }

    /// Largest absolute element-wise difference, or `None` on shape mismatch.
    #[must_use]
    pub fn max_abs_diff(&self, other: &Tensor) -> Option<f32> {
        (self.shape == other.shape).then(|| {
            self.data
                .iter()
                .zip(&other.data)
                .map(|(a, b)| (a - b).abs())
                .fold(0.0f32, f32::max)
        })
    }

    /// Exact value and shape equality (dtype and device ignored).
    #[must_use]
    pub fn values_eq(&self, other: &Tensor) -> bool {
        self.shape == other.shape && self.data == other.data
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("device", &self.device)
            .field("requires_grad", &self.requires_grad)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;
