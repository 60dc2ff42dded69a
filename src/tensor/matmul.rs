//! Dense GEMM kernels.
//!
//! Loop order is i-k-j so every output element accumulates its products
//! in increasing `k`. The semi-structured kernel uses the same order over
//! the kept columns, which keeps dense and sparse results bit-comparable.

use rayon::prelude::*;

use super::Tensor;
use crate::dtype::Device;
use crate::error::{Result, SparseError};

/// What to add to the raw product before rounding.
#[derive(Debug, Clone, Copy)]
pub enum Epilogue<'a> {
    /// Plain product
    None,
    /// `bias[j]` added to every row (dense `addmm` broadcasting)
    ColumnBias(&'a [f32]),
    /// `bias[i]` added to every column of row `i`
    RowBias(&'a [f32]),
}

/// Row-major `[m, k] @ [k, n]` into a fresh `[m, n]` buffer.
pub(crate) fn gemm(
    a: &[f32],
    b: &[f32],
    m: usize,
    k: usize,
    n: usize,
    epilogue: Epilogue<'_>,
    parallel: bool,
) -> Vec<f32> {
    let mut out = vec![0.0f32; m * n];
    if n == 0 {
        return out;
    }
    let row = |(i, out_row): (usize, &mut [f32])| {
        let a_row = &a[i * k..(i + 1) * k];
        for (kk, &av) in a_row.iter().enumerate() {
            let b_row = &b[kk * n..(kk + 1) * n];
            for (o, &bv) in out_row.iter_mut().zip(b_row) {
                *o += av * bv;
            }
        }
        apply_epilogue(out_row, i, epilogue);
    };
    if parallel {
        out.par_chunks_mut(n).enumerate().for_each(row);
    } else {
        out.chunks_mut(n).enumerate().for_each(row);
    }
    out
}

pub(crate) fn apply_epilogue(out_row: &mut [f32], i: usize, epilogue: Epilogue<'_>) {
    match epilogue {
        Epilogue::None => {}
        Epilogue::ColumnBias(bias) => {
            for (o, &b) in out_row.iter_mut().zip(bias) {
                *o += b;
            }
        }
        Epilogue::RowBias(bias) => {
            let b = bias[i];
            for o in out_row.iter_mut() {
                *o += b;
            }
        }
    }
}

fn check_operands(op: &str, a: &Tensor, b: &Tensor) -> Result<(usize, usize, usize)> {
    let (m, k) = a.dims2()?;
    let (k2, n) = b.dims2()?;
    if k != k2 {
        return Err(SparseError::shape_mismatch(op, &[k, n], b.shape()));
    }
    if a.dtype() != b.dtype() {
        return Err(SparseError::UnsupportedDtype {
            dtype: format!("{} x {}", a.dtype(), b.dtype()),
            context: format!("{op} requires matching dtypes"),
        });
    }
    Ok((m, k, n))
}

/// Dense `a @ b`.
///
/// Output dtype and device follow `a`; `Accelerator` tensors run row-parallel.
///
/// # Errors
///
/// Returns `ShapeMismatch` for non-2-D or incompatible operands and
/// `UnsupportedDtype` when the dtypes differ.
pub fn mm(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let (m, k, n) = check_operands("mm", a, b)?;
    let parallel = a.device() == Device::Accelerator;
    let data = gemm(a.data(), b.data(), m, k, n, Epilogue::None, parallel);
    Ok(Tensor::from_parts(data, vec![m, n], a.dtype(), a.device()))
}

/// Dense `bias + a @ b` with `bias` of shape `[n]` broadcast over rows.
///
/// # Errors
///
/// As [`mm`], plus `ShapeMismatch` for a bias that is not `[n]`.
pub fn addmm(bias: &Tensor, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let (m, k, n) = check_operands("addmm", a, b)?;
    if bias.shape() != [n] {
        return Err(SparseError::shape_mismatch("addmm bias", &[n], bias.shape()));
    }
    let parallel = a.device() == Device::Accelerator;
    let data = gemm(
        a.data(),
        b.data(),
        m,
        k,
        n,
        Epilogue::ColumnBias(bias.data()),
        parallel,
    );
    Ok(Tensor::from_parts(data, vec![m, n], a.dtype(), a.device()))
}
