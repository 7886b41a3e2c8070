//! Internal helpers for building and reshaping CSR matrices.
//!
//! `nalgebra-sparse` has no stacking or padding primitives,
//! so these work directly on the raw CSR arrays
//! (`disassemble` / `try_from_csr_data`) instead of going through
//! per-element insertion, which would be asymptotically much slower.

use fixedbitset as fb;
use nalgebra as na;
use nalgebra_sparse as nas;

/// Stack matrices on top of each other.
///
/// All blocks must have the same column count; the caller is expected
/// to have validated this.
pub(crate) fn vstack(blocks: &[&nas::CsrMatrix<f64>]) -> nas::CsrMatrix<f64> {
    assert!(!blocks.is_empty(), "cannot stack an empty set of matrices");
    let ncols = blocks[0].ncols();
    let nrows: usize = blocks.iter().map(|b| b.nrows()).sum();
    let nnz: usize = blocks.iter().map(|b| b.nnz()).sum();

    let mut row_offsets = Vec::with_capacity(nrows + 1);
    let mut col_indices = Vec::with_capacity(nnz);
    let mut values = Vec::with_capacity(nnz);
    row_offsets.push(0);
    for block in blocks {
        assert_eq!(
            block.ncols(),
            ncols,
            "stacked blocks must share a column count"
        );
        let base = values.len();
        col_indices.extend_from_slice(block.col_indices());
        values.extend_from_slice(block.values());
        // skip the leading zero of each block's offset array
        row_offsets.extend(block.row_offsets()[1..].iter().map(|off| base + off));
    }

    nas::CsrMatrix::try_from_csr_data(nrows, ncols, row_offsets, col_indices, values).unwrap()
}

/// Widen a matrix by `before` zero columns on the left and `after` on the right.
///
/// Since the padding holds no stored entries, this is just a shift
/// of the column indices; no zero blocks are materialized.
pub(crate) fn pad_columns(
    mat: &nas::CsrMatrix<f64>,
    before: usize,
    after: usize,
) -> nas::CsrMatrix<f64> {
    let nrows = mat.nrows();
    let ncols = before + mat.ncols() + after;
    let (row_offsets, mut col_indices, values) = mat.clone().disassemble();
    for col in &mut col_indices {
        *col += before;
    }
    nas::CsrMatrix::try_from_csr_data(nrows, ncols, row_offsets, col_indices, values).unwrap()
}

/// Build a diagonal matrix from a dense vector.
pub(crate) fn diagonal(diag: &na::DVector<f64>) -> nas::CsrMatrix<f64> {
    // nalgebra doesn't have a method to construct CSR directly from a diagonal.
    // construct an identity matrix to get the right sparsity pattern
    // and then replace the entries
    let mut csr = nas::CsrMatrix::identity(diag.len());
    for (&diag_val, mat_diag) in diag.iter().zip(csr.values_mut()) {
        *mat_diag = diag_val;
    }
    csr
}

/// Multiply every stored entry by a constant.
pub(crate) fn scale(mat: &nas::CsrMatrix<f64>, factor: f64) -> nas::CsrMatrix<f64> {
    let mut scaled = mat.clone();
    for val in scaled.values_mut() {
        *val *= factor;
    }
    scaled
}

/// Scale each row by its own factor, i.e. compute `diag(by) * mat`
/// without building the diagonal.
///
/// `by` must have one entry per row; the caller validates this.
pub(crate) fn scale_rows(mat: &nas::CsrMatrix<f64>, by: &na::DVector<f64>) -> nas::CsrMatrix<f64> {
    let nrows = mat.nrows();
    let ncols = mat.ncols();
    let (row_offsets, col_indices, mut values) = mat.clone().disassemble();
    for row_idx in 0..nrows {
        let row_factor = by[row_idx];
        for val in &mut values[row_offsets[row_idx]..row_offsets[row_idx + 1]] {
            *val *= row_factor;
        }
    }
    nas::CsrMatrix::try_from_csr_data(nrows, ncols, row_offsets, col_indices, values).unwrap()
}

/// Extract the rows whose indices are set in `rows`, in ascending order,
/// into a matrix with one row per set bit.
pub(crate) fn select_rows(
    mat: &nas::CsrMatrix<f64>,
    rows: &fb::FixedBitSet,
) -> nas::CsrMatrix<f64> {
    let mut row_offsets = Vec::with_capacity(rows.count_ones(..) + 1);
    let mut col_indices = Vec::new();
    let mut values = Vec::new();
    row_offsets.push(0);
    for row_idx in rows.ones() {
        let row = mat.row(row_idx);
        col_indices.extend_from_slice(row.col_indices());
        values.extend_from_slice(row.values());
        row_offsets.push(values.len());
    }
    nas::CsrMatrix::try_from_csr_data(
        row_offsets.len() - 1,
        mat.ncols(),
        row_offsets,
        col_indices,
        values,
    )
    .unwrap()
}

/// The set of rows holding at least one nonzero entry.
///
/// Explicitly stored zeros don't count, so a row that an operator
/// merely touches structurally is not marked.
pub(crate) fn row_indicator(mat: &nas::CsrMatrix<f64>) -> fb::FixedBitSet {
    let mut indicator = fb::FixedBitSet::with_capacity(mat.nrows());
    for (row_idx, row) in mat.row_iter().enumerate() {
        if row.values().iter().any(|&v| v != 0.0) {
            indicator.insert(row_idx);
        }
    }
    indicator
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csr_from_triplets(
        nrows: usize,
        ncols: usize,
        triplets: &[(usize, usize, f64)],
    ) -> nas::CsrMatrix<f64> {
        let mut coo = nas::CooMatrix::new(nrows, ncols);
        for &(r, c, v) in triplets {
            coo.push(r, c, v);
        }
        nas::CsrMatrix::from(&coo)
    }

    fn dense(mat: &nas::CsrMatrix<f64>) -> na::DMatrix<f64> {
        let mut out = na::DMatrix::zeros(mat.nrows(), mat.ncols());
        for (r, c, v) in mat.triplet_iter() {
            out[(r, c)] = *v;
        }
        out
    }

    #[test]
    fn vstack_concatenates_rows_in_order() {
        let top = csr_from_triplets(1, 3, &[(0, 0, 1.0), (0, 2, 2.0)]);
        let bottom = csr_from_triplets(2, 3, &[(0, 1, 3.0), (1, 0, 4.0)]);
        let stacked = vstack(&[&top, &bottom]);
        assert_eq!(stacked.nrows(), 3);
        let expected =
            na::DMatrix::from_row_slice(3, 3, &[1., 0., 2., 0., 3., 0., 4., 0., 0.]);
        assert_eq!(dense(&stacked), expected);
    }

    #[test]
    fn pad_columns_shifts_without_new_entries() {
        let mat = csr_from_triplets(2, 2, &[(0, 0, 1.0), (1, 1, 2.0)]);
        let padded = pad_columns(&mat, 3, 1);
        assert_eq!(padded.ncols(), 6);
        assert_eq!(padded.nnz(), mat.nnz());
        assert_eq!(dense(&padded)[(0, 3)], 1.0);
        assert_eq!(dense(&padded)[(1, 4)], 2.0);
    }

    #[test]
    fn diagonal_and_row_scaling_agree() {
        let mat = csr_from_triplets(3, 3, &[(0, 0, 1.0), (1, 0, 2.0), (1, 2, 3.0), (2, 1, 4.0)]);
        let factors = na::DVector::from_vec(vec![2.0, -1.0, 0.5]);
        let via_product = &diagonal(&factors) * &mat;
        let via_rewrite = scale_rows(&mat, &factors);
        assert_eq!(dense(&via_product), dense(&via_rewrite));
    }

    #[test]
    fn select_rows_keeps_ascending_subset() {
        let mat = csr_from_triplets(4, 2, &[(0, 0, 1.0), (1, 1, 2.0), (2, 0, 3.0), (3, 1, 4.0)]);
        let mut rows = fb::FixedBitSet::with_capacity(4);
        rows.insert(3);
        rows.insert(1);
        let sub = select_rows(&mat, &rows);
        assert_eq!(sub.nrows(), 2);
        let expected = na::DMatrix::from_row_slice(2, 2, &[0., 2., 0., 4.]);
        assert_eq!(dense(&sub), expected);
    }

    #[test]
    fn row_indicator_ignores_stored_zeros() {
        let mat = csr_from_triplets(3, 2, &[(0, 0, 1.0), (2, 1, 0.0)]);
        let indicator = row_indicator(&mat);
        assert!(indicator.contains(0));
        assert!(!indicator.contains(1));
        assert!(!indicator.contains(2), "stored zero must not mark the row");
    }
}
