//! Composable sparse operators at field scope and model scope.
//!
//! A [`FieldOperator`] acts on a single field's unknowns only;
//! a [`ModelMatrix`] spans the full concatenated unknown vector.
//! Arithmetic between operators of the *same* field stays field-scoped
//! and cheap; anything that crosses fields goes through [`FieldOperator::widen`],
//! which zero-pads the columns out to model scope.
//!
//! Only meaningful operand pairings have `std::ops` impls,
//! so e.g. dividing by an operator or adding a bare number to one
//! is rejected by the compiler.
//! Pairings that share a type but not a shape
//! (operators of two different fields, a grid function of the wrong length)
//! panic with a message naming both operands,
//! the same contract `nalgebra` uses for dimension mismatch.

use fixedbitset as fb;
use nalgebra as na;
use nalgebra_sparse as nas;

use itertools::izip;

use crate::{field::FieldRef, sparse};

/// A sparse operator over a single field's unknowns.
///
/// Produced by differencing-stencil constructors outside this crate,
/// or from [`FieldRef::identity`].
/// Immutable; every operation returns a new operator.
#[derive(Clone, Debug)]
pub struct FieldOperator {
    matrix: nas::CsrMatrix<f64>,
    field: FieldRef,
}

impl FieldOperator {
    /// Wrap a square matrix over `field`'s unknowns.
    ///
    /// # Panics
    /// If the matrix is not `field.size()` by `field.size()`.
    pub fn new(field: FieldRef, matrix: nas::CsrMatrix<f64>) -> Self {
        assert!(
            matrix.nrows() == field.size() && matrix.ncols() == field.size(),
            "operator for field `{}` must be {n}x{n}, got {rows}x{cols}",
            field.name(),
            n = field.size(),
            rows = matrix.nrows(),
            cols = matrix.ncols(),
        );
        Self { matrix, field }
    }

    /// The field this operator acts on.
    #[inline]
    pub fn field(&self) -> &FieldRef {
        &self.field
    }

    /// The wrapped matrix.
    #[inline]
    pub fn matrix(&self) -> &nas::CsrMatrix<f64> {
        &self.matrix
    }

    /// Widen to model scope by zero-padding the columns:
    /// fields registered before this one on the left, after it on the right.
    pub fn widen(self) -> ModelMatrix {
        let before = self.field.offset();
        let after = self.field.model_size() - before - self.field.size();
        ModelMatrix::new(sparse::pad_columns(&self.matrix, before, after))
    }

    /// Select the operator rows inside the given index ranges,
    /// one range per axis of the field's shape,
    /// and widen the result to model scope.
    ///
    /// Row-subset operators are how boundary-condition masks
    /// and partial-domain equation blocks are built;
    /// they are always consumed at model scope.
    ///
    /// # Panics
    /// If the number of ranges doesn't match the field's rank,
    /// or a range reaches past its axis.
    pub fn slice(&self, ranges: &[std::ops::Range<usize>]) -> ModelMatrix {
        let shape = self.field.shape();
        assert_eq!(
            ranges.len(),
            shape.len(),
            "field `{}` has shape {:?}; expected {} slice ranges, got {}",
            self.field.name(),
            shape,
            shape.len(),
            ranges.len(),
        );
        for (axis, (range, &extent)) in izip!(ranges, shape).enumerate() {
            assert!(
                range.end <= extent,
                "slice {:?} reaches past axis {} of field `{}` with extent {}",
                range,
                axis,
                self.field.name(),
                extent,
            );
        }

        // mark the row-major flat indices falling inside every range
        let mut mask = fb::FixedBitSet::with_capacity(self.field.size());
        for flat in 0..self.field.size() {
            let mut rem = flat;
            let mut inside = true;
            for (range, &extent) in izip!(ranges, shape).rev() {
                let idx = rem % extent;
                rem /= extent;
                if !range.contains(&idx) {
                    inside = false;
                    break;
                }
            }
            if inside {
                mask.insert(flat);
            }
        }

        let selected = sparse::select_rows(&self.matrix, &mask);
        let before = self.field.offset();
        let after = self.field.model_size() - before - self.field.size();
        ModelMatrix::new(sparse::pad_columns(&selected, before, after))
    }

    fn assert_same_field(&self, other: &FieldOperator, op_name: &str) {
        assert!(
            self.field == *other.field(),
            "operators over fields `{}` and `{}` cannot be {op_name} at field scope; widen one side first",
            self.field.name(),
            other.field().name(),
        );
    }

    fn assert_grid_fn(&self, len: usize) {
        assert_eq!(
            len,
            self.field.size(),
            "grid function with {} entries is not compatible with field `{}` of shape {:?}",
            len,
            self.field.name(),
            self.field.shape(),
        );
    }
}

impl PartialEq for FieldOperator {
    fn eq(&self, other: &Self) -> bool {
        self.field == other.field && self.matrix == other.matrix
    }
}

/// A sparse operator spanning the full model-wide unknown vector.
///
/// Obtained by widening a [`FieldOperator`] or combining widened operators;
/// the end product is registered as an equation or boundary-condition block.
/// No field scoping remains at this layer: arithmetic is matrix-to-matrix only.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelMatrix {
    matrix: nas::CsrMatrix<f64>,
}

impl ModelMatrix {
    pub(crate) fn new(matrix: nas::CsrMatrix<f64>) -> Self {
        Self { matrix }
    }

    /// The wrapped matrix.
    #[inline]
    pub fn matrix(&self) -> &nas::CsrMatrix<f64> {
        &self.matrix
    }

    /// Unwrap into the underlying CSR matrix.
    #[inline]
    pub fn into_csr(self) -> nas::CsrMatrix<f64> {
        self.matrix
    }

    fn assert_grid_fn(&self, len: usize) {
        assert_eq!(
            len,
            self.matrix.nrows(),
            "grid function with {} entries is not compatible with a {}x{} model matrix",
            len,
            self.matrix.nrows(),
            self.matrix.ncols(),
        );
    }

    fn assert_same_shape(&self, other: &ModelMatrix, op_name: &str) {
        assert!(
            self.matrix.nrows() == other.matrix.nrows()
                && self.matrix.ncols() == other.matrix.ncols(),
            "model matrices of shapes {}x{} and {}x{} cannot be {op_name}",
            self.matrix.nrows(),
            self.matrix.ncols(),
            other.matrix.nrows(),
            other.matrix.ncols(),
        );
    }
}

impl From<FieldOperator> for ModelMatrix {
    fn from(op: FieldOperator) -> Self {
        op.widen()
    }
}

//
// std trait implementations
//
// one impl per supported operand pairing;
// pairings not listed here are compile errors by construction

// scalar scaling, commutative

impl std::ops::Mul<f64> for FieldOperator {
    type Output = FieldOperator;

    fn mul(self, rhs: f64) -> Self::Output {
        FieldOperator {
            matrix: sparse::scale(&self.matrix, rhs),
            field: self.field,
        }
    }
}

impl std::ops::Mul<FieldOperator> for f64 {
    type Output = FieldOperator;

    fn mul(self, rhs: FieldOperator) -> Self::Output {
        rhs * self
    }
}

impl std::ops::Div<f64> for FieldOperator {
    type Output = FieldOperator;

    fn div(self, rhs: f64) -> Self::Output {
        self * rhs.recip()
    }
}

impl std::ops::Mul<f64> for ModelMatrix {
    type Output = ModelMatrix;

    fn mul(self, rhs: f64) -> Self::Output {
        ModelMatrix::new(sparse::scale(&self.matrix, rhs))
    }
}

impl std::ops::Mul<ModelMatrix> for f64 {
    type Output = ModelMatrix;

    fn mul(self, rhs: ModelMatrix) -> Self::Output {
        rhs * self
    }
}

impl std::ops::Div<f64> for ModelMatrix {
    type Output = ModelMatrix;

    fn div(self, rhs: f64) -> Self::Output {
        self * rhs.recip()
    }
}

// row scaling by a grid function:
// `op * v` multiplies each equation row by a per-point coefficient,
// i.e. computes `diag(v) * op`

impl std::ops::Mul<&na::DVector<f64>> for FieldOperator {
    type Output = FieldOperator;

    fn mul(self, rhs: &na::DVector<f64>) -> Self::Output {
        self.assert_grid_fn(rhs.len());
        FieldOperator {
            matrix: sparse::scale_rows(&self.matrix, rhs),
            field: self.field,
        }
    }
}

impl std::ops::Div<&na::DVector<f64>> for FieldOperator {
    type Output = FieldOperator;

    fn div(self, rhs: &na::DVector<f64>) -> Self::Output {
        self.assert_grid_fn(rhs.len());
        let reciprocal = rhs.map(f64::recip);
        FieldOperator {
            matrix: sparse::scale_rows(&self.matrix, &reciprocal),
            field: self.field,
        }
    }
}

impl std::ops::Mul<&na::DVector<f64>> for ModelMatrix {
    type Output = ModelMatrix;

    fn mul(self, rhs: &na::DVector<f64>) -> Self::Output {
        self.assert_grid_fn(rhs.len());
        ModelMatrix::new(sparse::scale_rows(&self.matrix, rhs))
    }
}

impl std::ops::Div<&na::DVector<f64>> for ModelMatrix {
    type Output = ModelMatrix;

    fn div(self, rhs: &na::DVector<f64>) -> Self::Output {
        self.assert_grid_fn(rhs.len());
        let reciprocal = rhs.map(f64::recip);
        ModelMatrix::new(sparse::scale_rows(&self.matrix, &reciprocal))
    }
}

// composition of operators over the same field

impl std::ops::Mul for FieldOperator {
    type Output = FieldOperator;

    fn mul(self, rhs: FieldOperator) -> Self::Output {
        self.assert_same_field(&rhs, "multiplied");
        FieldOperator {
            matrix: &self.matrix * &rhs.matrix,
            field: self.field,
        }
    }
}

// sums; same field stays field-scoped, a model-scope operand widens the other side

impl std::ops::Add for FieldOperator {
    type Output = FieldOperator;

    fn add(self, rhs: FieldOperator) -> Self::Output {
        self.assert_same_field(&rhs, "summed");
        FieldOperator {
            matrix: &self.matrix + &rhs.matrix,
            field: self.field,
        }
    }
}

impl std::ops::Sub for FieldOperator {
    type Output = FieldOperator;

    fn sub(self, rhs: FieldOperator) -> Self::Output {
        self.assert_same_field(&rhs, "summed");
        FieldOperator {
            matrix: &self.matrix - &rhs.matrix,
            field: self.field,
        }
    }
}

impl std::ops::Add<ModelMatrix> for FieldOperator {
    type Output = ModelMatrix;

    fn add(self, rhs: ModelMatrix) -> Self::Output {
        self.widen() + rhs
    }
}

impl std::ops::Sub<ModelMatrix> for FieldOperator {
    type Output = ModelMatrix;

    fn sub(self, rhs: ModelMatrix) -> Self::Output {
        self.widen() - rhs
    }
}

impl std::ops::Add<FieldOperator> for ModelMatrix {
    type Output = ModelMatrix;

    fn add(self, rhs: FieldOperator) -> Self::Output {
        self + rhs.widen()
    }
}

impl std::ops::Sub<FieldOperator> for ModelMatrix {
    type Output = ModelMatrix;

    fn sub(self, rhs: FieldOperator) -> Self::Output {
        self - rhs.widen()
    }
}

impl std::ops::Add for ModelMatrix {
    type Output = ModelMatrix;

    fn add(self, rhs: ModelMatrix) -> Self::Output {
        self.assert_same_shape(&rhs, "summed");
        ModelMatrix::new(&self.matrix + &rhs.matrix)
    }
}

impl std::ops::Sub for ModelMatrix {
    type Output = ModelMatrix;

    fn sub(self, rhs: ModelMatrix) -> Self::Output {
        self.assert_same_shape(&rhs, "summed");
        ModelMatrix::new(&self.matrix - &rhs.matrix)
    }
}

// negation

impl std::ops::Neg for FieldOperator {
    type Output = FieldOperator;

    fn neg(self) -> Self::Output {
        self * -1.0
    }
}

impl std::ops::Neg for ModelMatrix {
    type Output = ModelMatrix;

    fn neg(self) -> Self::Output {
        self * -1.0
    }
}
