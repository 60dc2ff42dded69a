//! Closed dispatch table for semi-structured operands.
//!
//! Exactly four operations are intercepted when a [`SemiSparseTensor`]
//! takes part: transpose, detach, biased matmul and plain matmul. Anything
//! else is [`Op::Other`] and fails with `SparseError::Unsupported`; there
//! is no silent densifying fallback.
//!
//! | op        | accepted operands                                         |
//! |-----------|-----------------------------------------------------------|
//! | transpose | any wrapper; flag flips, context shared                   |
//! | detach    | any wrapper; flag kept, gradient tracking dropped         |
//! | addmm     | floating bias on the accelerator, and `a` untransposed sparse or `b` transposed sparse |
//! | mm        | `a` untransposed sparse or `b` transposed sparse          |
//!
//! Dense-only calls through [`mm`] and [`addmm`] go straight to the dense
//! kernels and never reach the table.

use tracing::debug;

use crate::dtype::Device;
use crate::error::{Result, SparseError};
use crate::semi_structured::{BiasAxis, SemiSparseTensor};
use crate::tensor::{self, Tensor};

/// A matmul operand.
#[derive(Debug, Clone, Copy)]
pub enum Operand<'a> {
    /// Dense tensor
    Dense(&'a Tensor),
    /// 2:4 compressed tensor
    SemiSparse(&'a SemiSparseTensor),
}

impl<'a> Operand<'a> {
    /// Logical shape.
    #[must_use]
    pub fn shape(&self) -> &'a [usize] {
        match *self {
            Operand::Dense(t) => t.shape(),
            Operand::SemiSparse(t) => t.shape(),
        }
    }

    fn as_dense(&self) -> Option<&'a Tensor> {
        match *self {
            Operand::Dense(t) => Some(t),
            Operand::SemiSparse(_) => None,
        }
    }

    fn as_semi_sparse(&self) -> Option<&'a SemiSparseTensor> {
        match *self {
            Operand::SemiSparse(t) => Some(t),
            Operand::Dense(_) => None,
        }
    }
}

impl<'a> From<&'a Tensor> for Operand<'a> {
    fn from(t: &'a Tensor) -> Self {
        Operand::Dense(t)
    }
}

impl<'a> From<&'a SemiSparseTensor> for Operand<'a> {
    fn from(t: &'a SemiSparseTensor) -> Self {
        Operand::SemiSparse(t)
    }
}

/// An operation routed to the semi-structured table.
#[derive(Debug, Clone, Copy)]
pub enum Op<'a> {
    /// Swap dimensions
    Transpose(&'a SemiSparseTensor),
    /// Drop gradient tracking
    Detach(&'a SemiSparseTensor),
    /// `bias + a @ b`
    Addmm {
        /// Bias of shape `[n]`
        bias: &'a Tensor,
        /// Left operand
        a: Operand<'a>,
        /// Right operand
        b: Operand<'a>,
    },
    /// `a @ b`
    Mm {
        /// Left operand
        a: Operand<'a>,
        /// Right operand
        b: Operand<'a>,
    },
    /// Any operation outside the table, by name
    Other(&'a str),
}

impl Op<'_> {
    /// Operation name used in errors and logs.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Op::Transpose(_) => "transpose",
            Op::Detach(_) => "detach",
            Op::Addmm { .. } => "addmm",
            Op::Mm { .. } => "mm",
            Op::Other(name) => name,
        }
    }
}

/// Result of a dispatched operation.
#[derive(Debug, Clone)]
pub enum DispatchOutput {
    /// A new wrapper sharing the compressed context
    SemiSparse(SemiSparseTensor),
    /// A dense product
    Dense(Tensor),
}

impl DispatchOutput {
    /// The dense result, or `None` for a wrapper.
    #[must_use]
    pub fn into_dense(self) -> Option<Tensor> {
        match self {
            DispatchOutput::Dense(t) => Some(t),
            DispatchOutput::SemiSparse(_) => None,
        }
    }

    /// The wrapper result, or `None` for a dense tensor.
    #[must_use]
    pub fn into_semi_sparse(self) -> Option<SemiSparseTensor> {
        match self {
            DispatchOutput::SemiSparse(t) => Some(t),
            DispatchOutput::Dense(_) => None,
        }
    }
}

/// Run one operation through the closed table.
///
/// # Errors
///
/// `Unsupported` for [`Op::Other`] and for matmuls whose operands are in
/// no supported orientation; kernel errors propagate unchanged.
pub fn dispatch(op: Op<'_>) -> Result<DispatchOutput> {
    match op {
        Op::Transpose(t) => Ok(DispatchOutput::SemiSparse(t.t())),
        Op::Detach(t) => Ok(DispatchOutput::SemiSparse(t.detach())),
        Op::Addmm { bias, a, b } => {
            if bias.is_floating_point() && bias.device() == Device::Accelerator {
                if let Some(sa) = a.as_semi_sparse().filter(|s| !s.is_transposed()) {
                    if let Some(db) = b.as_dense() {
                        debug!(route = "left", shape = ?sa.shape(), "semi-structured addmm");
                        let out = sa.context().addmm(db, bias, BiasAxis::Columns)?;
                        return Ok(DispatchOutput::Dense(out));
                    }
                }
                if let Some(sb) = b.as_semi_sparse().filter(|s| s.is_transposed()) {
                    if let Some(da) = a.as_dense() {
                        debug!(route = "right", shape = ?sb.shape(), "semi-structured addmm");
                        let out = sb.t().context().addmm(&da.t()?, bias, BiasAxis::Rows)?;
                        return Ok(DispatchOutput::Dense(out.t()?));
                    }
                }
            }
            Err(SparseError::unsupported(
                op.name(),
                format!(
                    "no semi-structured route for bias {:?} on {}, a {:?}, b {:?}",
                    bias.dtype(),
                    bias.device(),
                    describe(&a),
                    describe(&b)
                ),
            ))
        }
        Op::Mm { a, b } => {
            if let Some(sa) = a.as_semi_sparse().filter(|s| !s.is_transposed()) {
                if let Some(db) = b.as_dense() {
                    debug!(route = "left", shape = ?sa.shape(), "semi-structured mm");
                    return Ok(DispatchOutput::Dense(sa.context().mm(db)?));
                }
            }
            if let Some(sb) = b.as_semi_sparse().filter(|s| s.is_transposed()) {
                if let Some(da) = a.as_dense() {
                    debug!(route = "right", shape = ?sb.shape(), "semi-structured mm");
                    let out = sb.t().context().mm(&da.t()?)?;
                    return Ok(DispatchOutput::Dense(out.t()?));
                }
            }
            Err(SparseError::unsupported(
                op.name(),
                format!(
                    "no semi-structured route for a {:?}, b {:?}",
                    describe(&a),
                    describe(&b)
                ),
            ))
        }
        Op::Other(name) => Err(SparseError::unsupported(
            name,
            "not in the semi-structured dispatch table",
        )),
    }
}

fn describe(operand: &Operand<'_>) -> String {
    match operand {
        Operand::Dense(t) => format!("dense{:?}", t.shape()),
        Operand::SemiSparse(t) if t.is_transposed() => format!("semi-sparse{:?} (transposed)", t.shape()),
        Operand::SemiSparse(t) => format!("semi-sparse{:?}", t.shape()),
    }
}

/// `a @ b` for any mix of dense and semi-structured operands.
///
/// # Errors
///
/// Dense kernel errors, or the table's `Unsupported`.
pub fn mm<'a>(a: impl Into<Operand<'a>>, b: impl Into<Operand<'a>>) -> Result<Tensor> {
    let (a, b) = (a.into(), b.into());
    if let (Operand::Dense(da), Operand::Dense(db)) = (a, b) {
        return tensor::mm(da, db);
    }
    dispatch(Op::Mm { a, b })?
        .into_dense()
        .ok_or_else(|| SparseError::unsupported("mm", "table returned a wrapper"))
}

/// `bias + a @ b` for any mix of dense and semi-structured operands.
///
/// # Errors
///
/// Dense kernel errors, or the table's `Unsupported`.
pub fn addmm<'a>(
    bias: &'a Tensor,
    a: impl Into<Operand<'a>>,
    b: impl Into<Operand<'a>>,
) -> Result<Tensor> {
    let (a, b) = (a.into(), b.into());
    if let (Operand::Dense(da), Operand::Dense(db)) = (a, b) {
        return tensor::addmm(bias, da, db);
    }
    dispatch(Op::Addmm { bias, a, b })?
        .into_dense()
        .ok_or_else(|| SparseError::unsupported("addmm", "table returned a wrapper"))
}
