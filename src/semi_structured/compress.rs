//! 2:4 compressed storage and the compressed GEMM kernel.
//!
//! # Memory Layout
//!
//! For an `[m, k]` matrix with `k % 4 == 0`:
//! - `values`: `[m * k / 2]` kept values, two per group of four, in column order
//! - `metadata`: one nibble per group, `idx0 | idx1 << 2`, two groups per byte
//!   (low nibble first)
//!
//! ```text
//! Dense row:  [0, 3, 0, 5 | 7, 0, 0, 0]
//! values:     [3, 5, 7, 0]
//! nibbles:    [1 | 3 << 2, 0 | 1 << 2] = [0b1101, 0b0100]
//! metadata:   [0b0100_1101]
//! ```

use rayon::prelude::*;

use crate::dtype::DType;
use crate::error::{Result, SparseError};
use crate::tensor::Epilogue;

/// Elements per group.
pub const GROUP: usize = 4;
/// Kept elements per group.
pub const KEPT: usize = 2;

/// Packed 2:4 representation of a row-major matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedBuffer {
    values: Vec<f32>,
    metadata: Vec<u8>,
    rows: usize,
    cols: usize,
    dtype: DType,
}

impl CompressedBuffer {
    /// Compress a row-major `[rows, cols]` matrix.
    ///
    /// Groups with fewer than two nonzeros are padded with explicit zeros
    /// at the lowest free positions.
    ///
    /// # Errors
    ///
    /// - `ShapeMismatch` if `cols` is not a multiple of 4 or the matrix is empty
    /// - `NotTwoFourSparse` if a group holds more than two nonzeros
    pub fn compress(data: &[f32], rows: usize, cols: usize, dtype: DType) -> Result<Self> {
        if rows == 0 || cols == 0 || cols % GROUP != 0 || data.len() != rows * cols {
            return Err(SparseError::shape_mismatch(
                "2:4 compression (cols must be a nonzero multiple of 4)",
                &[rows, cols.next_multiple_of(GROUP).max(GROUP)],
                &[rows, cols],
            ));
        }

        let groups_per_row = cols / GROUP;
        let total_groups = rows * groups_per_row;
        let mut values = Vec::with_capacity(total_groups * KEPT);
        let mut metadata = vec![0u8; total_groups.div_ceil(2)];

        for (row, row_data) in data.chunks_exact(cols).enumerate() {
            for (group, chunk) in row_data.chunks_exact(GROUP).enumerate() {
                let [i0, i1] = kept_indices(chunk).ok_or_else(|| SparseError::NotTwoFourSparse {
                    row,
                    group,
                    nonzeros: chunk.iter().filter(|&&v| v != 0.0).count(),
                })?;
                values.push(chunk[i0]);
                values.push(chunk[i1]);

                let nibble = (i0 as u8) | ((i1 as u8) << 2);
                let g = row * groups_per_row + group;
                metadata[g / 2] |= nibble << ((g % 2) * 4);
            }
        }

        Ok(Self {
            values,
            metadata,
            rows,
            cols,
            dtype,
        })
    }

    /// Rows of the dense matrix.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Columns of the dense matrix.
    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Element type of the kept values.
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Kept values.
    #[must_use]
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Packed index metadata.
    #[must_use]
    pub fn metadata(&self) -> &[u8] {
        &self.metadata
    }

    /// Bytes used by values plus metadata at the buffer's dtype.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.values.len() * self.dtype.size_of() + self.metadata.len()
    }

    /// Bytes the dense matrix would need.
    #[must_use]
    pub fn dense_size_bytes(&self) -> usize {
        self.rows * self.cols * self.dtype.size_of()
    }

    #[inline]
    fn group_indices(&self, g: usize) -> (usize, usize) {
        let nibble = (self.metadata[g / 2] >> ((g % 2) * 4)) & 0x0f;
        ((nibble & 0b11) as usize, ((nibble >> 2) & 0b11) as usize)
    }

    /// `self @ b` for row-major `b` of shape `[cols, n]`.
    ///
    /// Accumulates in `f32` in increasing column order, skipping the
    /// pruned half of every group. Output is not rounded.
    pub(crate) fn spmm(&self, b: &[f32], n: usize, epilogue: Epilogue<'_>, parallel: bool) -> Vec<f32> {
        debug_assert_eq!(b.len(), self.cols * n);
        let mut out = vec![0.0f32; self.rows * n];
        if n == 0 {
            return out;
        }
        let groups_per_row = self.cols / GROUP;
        let row = |(i, out_row): (usize, &mut [f32])| {
            for group in 0..groups_per_row {
                let g = i * groups_per_row + group;
                let (i0, i1) = self.group_indices(g);
                let base = group * GROUP;
                for (slot, idx) in [(0, i0), (1, i1)] {
                    let av = self.values[g * KEPT + slot];
                    let col = base + idx;
                    let b_row = &b[col * n..(col + 1) * n];
                    for (o, &bv) in out_row.iter_mut().zip(b_row) {
                        *o += av * bv;
                    }
                }
            }
            crate::tensor::apply_epilogue(out_row, i, epilogue);
        };
        if parallel {
            out.par_chunks_mut(n).enumerate().for_each(row);
        } else {
            out.chunks_mut(n).enumerate().for_each(row);
        }
        out
    }
}

/// Positions kept for one group, or `None` when more than two are nonzero.
fn kept_indices(chunk: &[f32]) -> Option<[usize; 2]> {
    let mut kept = [usize::MAX; KEPT];
    let mut count = 0;
    for (i, &v) in chunk.iter().enumerate() {
        if v != 0.0 {
            if count == KEPT {
                return None;
            }
            kept[count] = i;
            count += 1;
        }
    }
    for i in 0..GROUP {
        if count == KEPT {
            break;
        }
        if !kept[..count].contains(&i) {
            kept[count] = i;
            count += 1;
        }
    }
    kept.sort_unstable();
    Some(kept)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_matches_doc_example() {
        let data = [0.0, 3.0, 0.0, 5.0, 7.0, 0.0, 0.0, 0.0];
        let buf = CompressedBuffer::compress(&data, 1, 8, DType::F16).unwrap();
        assert_eq!(buf.values(), &[3.0, 5.0, 7.0, 0.0]);
        // second group keeps 7 at index 0 and pads at index 1
        assert_eq!(buf.metadata(), &[0b0100_1101]);
    }

    #[test]
    fn test_kept_indices_pads_lowest_free() {
        assert_eq!(kept_indices(&[0.0, 0.0, 0.0, 0.0]), Some([0, 1]));
        assert_eq!(kept_indices(&[0.0, 0.0, 0.0, 2.0]), Some([0, 3]));
        assert_eq!(kept_indices(&[1.0, 0.0, 2.0, 0.0]), Some([0, 2]));
        assert_eq!(kept_indices(&[1.0, 1.0, 2.0, 0.0]), None);
    }

    #[test]
    fn test_rejects_three_nonzeros() {
        let data = [1.0, 1.0, 1.0, 0.0];
        let err = CompressedBuffer::compress(&data, 1, 4, DType::F16).unwrap_err();
        assert!(matches!(
            err,
            SparseError::NotTwoFourSparse {
                row: 0,
                group: 0,
                nonzeros: 3
            }
        ));
    }

    #[test]
    fn test_rejects_cols_not_multiple_of_four() {
        let data = [1.0; 6];
        assert!(CompressedBuffer::compress(&data, 1, 6, DType::F16).is_err());
    }

    #[test]
    fn test_size_accounting() {
        let data = vec![0.0; 64 * 128];
        let buf = CompressedBuffer::compress(&data, 64, 128, DType::F16).unwrap();
        assert_eq!(buf.dense_size_bytes(), 64 * 128 * 2);
        // half the values plus 4 bits per group of four
        assert_eq!(buf.size_bytes(), 64 * 128 + 64 * 128 / 8);
    }

    #[test]
    fn test_spmm_matches_dense_gemm() {
        let a = [1.0, 0.0, 2.0, 0.0, 0.0, 3.0, 0.0, 4.0];
        let b = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let buf = CompressedBuffer::compress(&a, 2, 4, DType::F32).unwrap();
        let sparse = buf.spmm(&b, 2, Epilogue::None, false);
        let dense = crate::tensor::gemm(&a, &b, 2, 4, 2, Epilogue::None, false);
        assert_eq!(sparse, dense);
        assert_eq!(sparse, vec![11.0, 14.0, 37.0, 44.0]);
    }
}
