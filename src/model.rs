//! The model: named fields, equation and boundary-condition blocks,
//! and the cached four-stage assembly pipeline that turns them into
//! one solvable sparse linear system.

use fixedbitset as fb;
use nalgebra as na;
use nalgebra_sparse as nas;

use crate::{
    field::{Field, FieldLayout, FieldRef},
    operator::ModelMatrix,
    solver::{LinearSolver, SolveError},
    sparse,
};

/// Errors produced when configuring, assembling, or solving a model.
#[derive(thiserror::Error, Debug)]
pub enum ModelError {
    /// Two fields were registered under the same name.
    #[error("field `{0}` is registered more than once")]
    DuplicateField(String),
    /// A block is missing its coefficient matrix.
    #[error("coefficient matrix for {kind} `{label}` has not been specified")]
    MissingCoefficients {
        /// Which kind of block.
        kind: BlockKind,
        /// The block's label.
        label: String,
    },
    /// A block is missing its constraint vector.
    #[error("constraint vector for {kind} `{label}` has not been specified")]
    MissingConstraints {
        /// Which kind of block.
        kind: BlockKind,
        /// The block's label.
        label: String,
    },
    /// A boundary condition is missing its mask.
    #[error("mask for boundary condition `{0}` has not been specified")]
    MissingMask(String),
    /// A block's coefficient matrix doesn't span the model's unknowns.
    #[error("{kind} `{label}` coefficient matrix is {cols} columns wide but the model has {expected} unknowns")]
    WrongWidth {
        /// Which kind of block.
        kind: BlockKind,
        /// The block's label.
        label: String,
        /// Column count of the offending matrix.
        cols: usize,
        /// The model's unknown count.
        expected: usize,
    },
    /// A block's constraint vector doesn't match its coefficient rows.
    #[error("{kind} `{label}` has {rows} coefficient rows but {entries} constraint entries")]
    ConstraintLength {
        /// Which kind of block.
        kind: BlockKind,
        /// The block's label.
        label: String,
        /// Row count of the block's coefficient matrix.
        rows: usize,
        /// Length of the block's constraint vector.
        entries: usize,
    },
    /// A uniform constraint was given before the block's row count is known.
    #[error("cannot broadcast a uniform constraint for {kind} `{label}` before its coefficient matrix is set")]
    UnsizedConstraint {
        /// Which kind of block.
        kind: BlockKind,
        /// The block's label.
        label: String,
    },
    /// The stacked equations leave unknowns unconstrained.
    #[error("solution underspecified: {rows} equation rows for {unknowns} unknowns")]
    Underspecified {
        /// Stacked equation row count.
        rows: usize,
        /// The model's unknown count.
        unknowns: usize,
    },
    /// The stacked equations over-constrain the unknowns.
    #[error("solution overspecified: {rows} equation rows for {unknowns} unknowns")]
    Overspecified {
        /// Stacked equation row count.
        rows: usize,
        /// The model's unknown count.
        unknowns: usize,
    },
    /// Two boundary conditions claim the same rows.
    #[error("boundary conditions `{first}` and `{second}` overwrite overlapping rows")]
    OverlappingBoundaryRows {
        /// Label of the already-registered boundary condition.
        first: String,
        /// Label of the boundary condition being updated.
        second: String,
    },
    /// A boundary condition's mask and coefficient matrix disagree.
    #[error("boundary condition `{label}` mask was built from {mask_rows} operator rows but its coefficient matrix has {rows}")]
    MaskCoefficientMismatch {
        /// The boundary condition's label.
        label: String,
        /// Row count of the operator the mask was built from.
        mask_rows: usize,
        /// Row count of the coefficient matrix.
        rows: usize,
    },
    /// A boundary condition's mask and constraint vector disagree.
    #[error("boundary condition `{label}` mask selects {mask_rows} rows but its constraint vector has {entries} entries")]
    MaskConstraintMismatch {
        /// The boundary condition's label.
        label: String,
        /// Number of global rows the mask overwrites.
        mask_rows: usize,
        /// Length of the constraint vector.
        entries: usize,
    },
    /// The assembled system could not be solved.
    #[error(transparent)]
    Solve(#[from] SolveError),
}

/// Which kind of block a [`ModelError`] refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockKind {
    /// A governing-equation block.
    Equation,
    /// A boundary-condition block.
    BoundaryCondition,
}

impl std::fmt::Display for BlockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Equation => f.write_str("equation"),
            Self::BoundaryCondition => f.write_str("boundary condition"),
        }
    }
}

/// One half of an update record.
///
/// [`Update::Keep`] reuses the value already stored under the label,
/// which is what makes single-block updates between timesteps cheap.
#[derive(Clone, Debug, Default)]
pub enum Update<T> {
    /// Replace the stored value.
    Set(T),
    /// Keep the stored value.
    #[default]
    Keep,
}

impl<T> From<T> for Update<T> {
    fn from(value: T) -> Self {
        Self::Set(value)
    }
}

/// Right-hand-side values for a block of equations.
#[derive(Clone, Debug)]
pub enum Constraint {
    /// One value per equation row.
    Vector(na::DVector<f64>),
    /// The same value on every row of the block.
    Uniform(f64),
}

impl From<f64> for Constraint {
    fn from(value: f64) -> Self {
        Self::Uniform(value)
    }
}

impl From<na::DVector<f64>> for Constraint {
    fn from(values: na::DVector<f64>) -> Self {
        Self::Vector(values)
    }
}

impl From<Vec<f64>> for Constraint {
    fn from(values: Vec<f64>) -> Self {
        Self::Vector(na::DVector::from_vec(values))
    }
}

/// Update record for one equation block.
#[derive(Clone, Debug, Default)]
pub struct EquationUpdate {
    /// Replacement coefficient block, widened to model scope.
    pub coefficients: Update<ModelMatrix>,
    /// Replacement constraint values.
    pub constraints: Update<Constraint>,
}

impl EquationUpdate {
    /// Replace both halves of the block.
    pub fn new(
        coefficients: impl Into<ModelMatrix>,
        constraints: impl Into<Constraint>,
    ) -> Self {
        Self {
            coefficients: Update::Set(coefficients.into()),
            constraints: Update::Set(constraints.into()),
        }
    }

    /// Replace only the coefficient matrix.
    pub fn coefficients(coefficients: impl Into<ModelMatrix>) -> Self {
        Self {
            coefficients: Update::Set(coefficients.into()),
            constraints: Update::Keep,
        }
    }

    /// Replace only the constraint values.
    pub fn constraints(constraints: impl Into<Constraint>) -> Self {
        Self {
            coefficients: Update::Keep,
            constraints: Update::Set(constraints.into()),
        }
    }
}

/// Update record for one boundary condition.
#[derive(Clone, Debug, Default)]
pub struct BocoUpdate {
    /// Replacement mask operator; its nonzero rows mark the global rows to overwrite.
    pub mask: Update<ModelMatrix>,
    /// Replacement coefficient rows injected in place of the masked rows.
    pub coefficients: Update<ModelMatrix>,
    /// Replacement constraint values for the masked rows.
    pub constraints: Update<Constraint>,
}

impl BocoUpdate {
    /// Replace the whole boundary condition.
    pub fn new(
        mask: impl Into<ModelMatrix>,
        coefficients: impl Into<ModelMatrix>,
        constraints: impl Into<Constraint>,
    ) -> Self {
        Self {
            mask: Update::Set(mask.into()),
            coefficients: Update::Set(coefficients.into()),
            constraints: Update::Set(constraints.into()),
        }
    }

    /// Replace only the constraint values,
    /// the usual per-timestep update for a moving boundary value.
    pub fn constraints(constraints: impl Into<Constraint>) -> Self {
        Self {
            mask: Update::Keep,
            coefficients: Update::Keep,
            constraints: Update::Set(constraints.into()),
        }
    }

    /// Replace only the coefficient rows.
    pub fn coefficients(coefficients: impl Into<ModelMatrix>) -> Self {
        Self {
            mask: Update::Keep,
            coefficients: Update::Set(coefficients.into()),
            constraints: Update::Keep,
        }
    }
}

/// Counters of assembly work performed over a model's lifetime.
///
/// An unchanged model rebuilds with no counter movement,
/// which is how tests observe that cached stages are actually reused.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BuildStats {
    /// Times the equation coefficient matrix was stacked.
    pub coefficient_stacks: usize,
    /// Times the equation constraint vector was stacked.
    pub constraint_stacks: usize,
    /// Individual boundary-condition coefficient applications.
    pub coefficient_applications: usize,
    /// Individual boundary-condition constraint applications.
    pub constraint_applications: usize,
}

/// Solved model state, sliced back into per-field blocks.
#[derive(Clone, Debug)]
pub struct Solution {
    fields: Vec<(FieldRef, na::DVector<f64>)>,
}

impl Solution {
    /// The solution values of one field, flattened row-major over its shape.
    pub fn field(&self, name: &str) -> Option<&na::DVector<f64>> {
        self.fields
            .iter()
            .find(|(field, _)| field.name() == name)
            .map(|(_, values)| values)
    }

    /// Iterate over fields in registration order together with their values.
    pub fn iter(&self) -> impl Iterator<Item = (&FieldRef, &na::DVector<f64>)> {
        self.fields.iter().map(|(field, values)| (field, values))
    }
}

#[derive(Debug)]
struct EquationBlock {
    label: String,
    coefficients: Option<nas::CsrMatrix<f64>>,
    constraints: Option<na::DVector<f64>>,
}

/// Mask triple driving the row overwrite of one boundary condition.
#[derive(Debug)]
struct RowMask {
    /// Diagonal with 0 on overwritten rows, 1 elsewhere.
    keep: nas::CsrMatrix<f64>,
    /// Transposed boundary operator injecting the replacement rows.
    inject: nas::CsrMatrix<f64>,
    /// Exactly the global rows this boundary condition overwrites.
    rows: fb::FixedBitSet,
}

#[derive(Debug)]
struct BoundaryCondition {
    label: String,
    mask: Option<RowMask>,
    coefficients: Option<nas::CsrMatrix<f64>>,
    constraints: Option<na::DVector<f64>>,
    coefficients_applied: bool,
    constraints_applied: bool,
}

/// A finite-difference model assembled from labeled equation
/// and boundary-condition blocks.
///
/// The assembly runs in four cached stages
/// (stack equation coefficients, stack equation constraints,
/// apply boundary-condition coefficients, apply boundary-condition constraints),
/// each gated by its own dirty flag.
/// Updating a single block between solves only re-runs the stages
/// its change actually invalidates.
#[derive(Debug)]
pub struct FdModel {
    fields: Vec<FieldRef>,
    size: usize,
    equations: Vec<EquationBlock>,
    bocos: Vec<BoundaryCondition>,
    equation_coefficients_built: bool,
    equation_constraints_built: bool,
    boco_coefficients_applied: bool,
    boco_constraints_applied: bool,
    /// Stacked equations before boundary conditions.
    base_coefficients: Option<nas::CsrMatrix<f64>>,
    base_constraints: Option<na::DVector<f64>>,
    /// The final assembled system.
    coefficients: Option<nas::CsrMatrix<f64>>,
    constraints: Option<na::DVector<f64>>,
    stats: BuildStats,
}

impl FdModel {
    /// Register the model's fields.
    ///
    /// Registration order fixes the global block layout:
    /// the block offset of each field is the cumulative size of those before it.
    pub fn new(fields: impl IntoIterator<Item = Field>) -> Result<Self, ModelError> {
        let fields: Vec<Field> = fields.into_iter().collect();
        for (idx, field) in fields.iter().enumerate() {
            if fields[..idx].iter().any(|f| f.name() == field.name()) {
                return Err(ModelError::DuplicateField(field.name().to_string()));
            }
        }

        let model_size: usize = fields.iter().map(Field::size).sum();
        let mut refs = Vec::with_capacity(fields.len());
        let mut offset = 0;
        for field in fields {
            let size = field.size();
            let (name, shape) = field.into_parts();
            refs.push(FieldRef::new(FieldLayout {
                name,
                shape,
                size,
                offset,
                model_size,
            }));
            offset += size;
        }

        Ok(Self {
            fields: refs,
            size: model_size,
            equations: Vec::new(),
            bocos: Vec::new(),
            equation_coefficients_built: false,
            equation_constraints_built: false,
            boco_coefficients_applied: false,
            boco_constraints_applied: false,
            base_coefficients: None,
            base_constraints: None,
            coefficients: None,
            constraints: None,
            stats: BuildStats::default(),
        })
    }

    /// Total unknown count across all fields.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Per-field unknown counts in registration order.
    pub fn shape(&self) -> Vec<usize> {
        self.fields.iter().map(FieldRef::size).collect()
    }

    /// Look up a registered field by name.
    pub fn field(&self, name: &str) -> Option<FieldRef> {
        self.fields.iter().find(|f| f.name() == name).cloned()
    }

    /// Iterate over the registered fields in registration order.
    pub fn fields(&self) -> impl Iterator<Item = &FieldRef> {
        self.fields.iter()
    }

    /// Assembly work counters.
    #[inline]
    pub fn stats(&self) -> BuildStats {
        self.stats
    }

    /// The assembled coefficient matrix, if [`build`][Self::build] has succeeded.
    #[inline]
    pub fn coefficients(&self) -> Option<&nas::CsrMatrix<f64>> {
        self.coefficients.as_ref()
    }

    /// The assembled constraint vector, if [`build`][Self::build] has succeeded.
    #[inline]
    pub fn constraints(&self) -> Option<&na::DVector<f64>> {
        self.constraints.as_ref()
    }

    /// Merge equation updates into the model.
    ///
    /// New labels are appended in iteration order;
    /// their position in the row stack never changes afterwards.
    /// `purge` clears all equations first,
    /// useful when restructuring a model.
    pub fn update_equations<I, S>(&mut self, updates: I, purge: bool) -> Result<(), ModelError>
    where
        I: IntoIterator<Item = (S, EquationUpdate)>,
        S: Into<String>,
    {
        if purge {
            self.equations.clear();
            self.equation_coefficients_built = false;
            self.equation_constraints_built = false;
        }

        for (label, update) in updates {
            let label: String = label.into();
            let idx = match self.equations.iter().position(|eq| eq.label == label) {
                Some(idx) => idx,
                None => {
                    self.equations.push(EquationBlock {
                        label: label.clone(),
                        coefficients: None,
                        constraints: None,
                    });
                    self.equations.len() - 1
                }
            };

            if let Update::Set(coefficients) = update.coefficients {
                let matrix = coefficients.into_csr();
                if matrix.ncols() != self.size {
                    return Err(ModelError::WrongWidth {
                        kind: BlockKind::Equation,
                        label,
                        cols: matrix.ncols(),
                        expected: self.size,
                    });
                }
                self.equations[idx].coefficients = Some(matrix);
                self.equation_coefficients_built = false;
            }

            if let Update::Set(constraints) = update.constraints {
                let values = match constraints {
                    Constraint::Vector(values) => values,
                    Constraint::Uniform(value) => {
                        let rows = self.equations[idx]
                            .coefficients
                            .as_ref()
                            .map(|c| c.nrows())
                            .ok_or_else(|| ModelError::UnsizedConstraint {
                                kind: BlockKind::Equation,
                                label: label.clone(),
                            })?;
                        na::DVector::from_element(rows, value)
                    }
                };
                self.equations[idx].constraints = Some(values);
                self.equation_constraints_built = false;
            }
        }

        // boundary conditions must be reapplied against the new bases
        if !self.equation_coefficients_built {
            for bc in &mut self.bocos {
                bc.coefficients_applied = false;
            }
        }
        if !self.equation_constraints_built {
            for bc in &mut self.bocos {
                bc.constraints_applied = false;
            }
        }
        Ok(())
    }

    /// Merge boundary-condition updates into the model.
    ///
    /// A mask operator's nonzero rows mark the global rows the condition
    /// overwrites; masks of distinct boundary conditions must be disjoint.
    /// `purge` clears all boundary conditions first.
    pub fn update_bocos<I, S>(&mut self, updates: I, purge: bool) -> Result<(), ModelError>
    where
        I: IntoIterator<Item = (S, BocoUpdate)>,
        S: Into<String>,
    {
        if purge {
            self.bocos.clear();
            self.boco_coefficients_applied = false;
            self.boco_constraints_applied = false;
        }

        for (label, update) in updates {
            let label: String = label.into();
            let idx = match self.bocos.iter().position(|bc| bc.label == label) {
                Some(idx) => idx,
                None => {
                    self.bocos.push(BoundaryCondition {
                        label: label.clone(),
                        mask: None,
                        coefficients: None,
                        constraints: None,
                        coefficients_applied: false,
                        constraints_applied: false,
                    });
                    self.bocos.len() - 1
                }
            };

            if let Update::Set(mask) = update.mask {
                let row_mask = self.build_row_mask(&label, idx, mask)?;
                self.bocos[idx].mask = Some(row_mask);
                self.bocos[idx].coefficients_applied = false;
                self.bocos[idx].constraints_applied = false;
                self.boco_coefficients_applied = false;
                self.boco_constraints_applied = false;
            }

            if let Update::Set(coefficients) = update.coefficients {
                let matrix = coefficients.into_csr();
                if matrix.ncols() != self.size {
                    return Err(ModelError::WrongWidth {
                        kind: BlockKind::BoundaryCondition,
                        label,
                        cols: matrix.ncols(),
                        expected: self.size,
                    });
                }
                self.bocos[idx].coefficients = Some(matrix);
                self.bocos[idx].coefficients_applied = false;
                self.boco_coefficients_applied = false;
            }

            if let Update::Set(constraints) = update.constraints {
                let values = match constraints {
                    Constraint::Vector(values) => values,
                    Constraint::Uniform(value) => {
                        let rows = self.bocos[idx]
                            .coefficients
                            .as_ref()
                            .map(|c| c.nrows())
                            .ok_or_else(|| ModelError::UnsizedConstraint {
                                kind: BlockKind::BoundaryCondition,
                                label: label.clone(),
                            })?;
                        na::DVector::from_element(rows, value)
                    }
                };
                self.bocos[idx].constraints = Some(values);
                self.bocos[idx].constraints_applied = false;
                self.boco_constraints_applied = false;
            }
        }

        // application always restarts from a fresh copy of the stacked base,
        // so invalidating the stage invalidates every condition's application
        if !self.boco_coefficients_applied {
            for bc in &mut self.bocos {
                bc.coefficients_applied = false;
            }
        }
        if !self.boco_constraints_applied {
            for bc in &mut self.bocos {
                bc.constraints_applied = false;
            }
        }
        Ok(())
    }

    /// Convert a mask operator into the row-mask triple,
    /// rejecting overlap with any other registered boundary condition.
    fn build_row_mask(
        &self,
        label: &str,
        own_idx: usize,
        mask: ModelMatrix,
    ) -> Result<RowMask, ModelError> {
        let matrix = mask.into_csr();
        if matrix.ncols() != self.size {
            return Err(ModelError::WrongWidth {
                kind: BlockKind::BoundaryCondition,
                label: label.to_string(),
                cols: matrix.ncols(),
                expected: self.size,
            });
        }

        let inject = matrix.transpose();
        let rows = sparse::row_indicator(&inject);

        for (idx, other) in self.bocos.iter().enumerate() {
            if idx == own_idx {
                continue;
            }
            if let Some(other_mask) = &other.mask {
                if !rows.is_disjoint(&other_mask.rows) {
                    return Err(ModelError::OverlappingBoundaryRows {
                        first: other.label.clone(),
                        second: label.to_string(),
                    });
                }
            }
        }

        let mut keep_diagonal = na::DVector::from_element(self.size, 1.0);
        for row in rows.ones() {
            keep_diagonal[row] = 0.0;
        }
        Ok(RowMask {
            keep: sparse::diagonal(&keep_diagonal),
            inject,
            rows,
        })
    }

    fn check_equation(eq: &EquationBlock) -> Result<(), ModelError> {
        let kind = BlockKind::Equation;
        let coefficients = eq.coefficients.as_ref().ok_or_else(|| {
            ModelError::MissingCoefficients {
                kind,
                label: eq.label.clone(),
            }
        })?;
        let constraints = eq.constraints.as_ref().ok_or_else(|| {
            ModelError::MissingConstraints {
                kind,
                label: eq.label.clone(),
            }
        })?;
        if coefficients.nrows() != constraints.len() {
            return Err(ModelError::ConstraintLength {
                kind,
                label: eq.label.clone(),
                rows: coefficients.nrows(),
                entries: constraints.len(),
            });
        }
        Ok(())
    }

    fn check_boco(bc: &BoundaryCondition) -> Result<(), ModelError> {
        let kind = BlockKind::BoundaryCondition;
        let mask = bc
            .mask
            .as_ref()
            .ok_or_else(|| ModelError::MissingMask(bc.label.clone()))?;
        let coefficients = bc.coefficients.as_ref().ok_or_else(|| {
            ModelError::MissingCoefficients {
                kind,
                label: bc.label.clone(),
            }
        })?;
        let constraints = bc.constraints.as_ref().ok_or_else(|| {
            ModelError::MissingConstraints {
                kind,
                label: bc.label.clone(),
            }
        })?;
        if coefficients.nrows() != constraints.len() {
            return Err(ModelError::ConstraintLength {
                kind,
                label: bc.label.clone(),
                rows: coefficients.nrows(),
                entries: constraints.len(),
            });
        }
        if mask.inject.ncols() != coefficients.nrows() {
            return Err(ModelError::MaskCoefficientMismatch {
                label: bc.label.clone(),
                mask_rows: mask.inject.ncols(),
                rows: coefficients.nrows(),
            });
        }
        let selected = mask.rows.count_ones(..);
        if selected != constraints.len() {
            return Err(ModelError::MaskConstraintMismatch {
                label: bc.label.clone(),
                mask_rows: selected,
                entries: constraints.len(),
            });
        }
        Ok(())
    }

    /// Assemble the final coefficient matrix and constraint vector,
    /// re-running only the stages whose inputs changed since the last build.
    ///
    /// Calling `build` twice with no updates in between performs no work
    /// the second time.
    /// A failed build leaves previously-cached valid stages untouched.
    pub fn build(&mut self) -> Result<(), ModelError> {
        // stage 1: stack equation coefficients
        if !self.equation_coefficients_built {
            for eq in &self.equations {
                Self::check_equation(eq)?;
            }
            let rows: usize = self
                .equations
                .iter()
                .filter_map(|eq| eq.coefficients.as_ref())
                .map(|c| c.nrows())
                .sum();
            if rows < self.size {
                return Err(ModelError::Underspecified {
                    rows,
                    unknowns: self.size,
                });
            }
            if rows > self.size {
                return Err(ModelError::Overspecified {
                    rows,
                    unknowns: self.size,
                });
            }

            let blocks: Vec<&nas::CsrMatrix<f64>> = self
                .equations
                .iter()
                .filter_map(|eq| eq.coefficients.as_ref())
                .collect();
            self.base_coefficients = Some(sparse::vstack(&blocks));
            self.equation_coefficients_built = true;
            // the cached post-boundary-condition results are now stale
            self.boco_coefficients_applied = false;
            self.boco_constraints_applied = false;
            for bc in &mut self.bocos {
                bc.coefficients_applied = false;
                bc.constraints_applied = false;
            }
            self.stats.coefficient_stacks += 1;
            log::trace!("stacked {rows} equation rows from {} blocks", blocks.len());
        }

        // stage 2: stack equation constraints
        if !self.equation_constraints_built {
            for eq in &self.equations {
                Self::check_equation(eq)?;
            }
            let mut stacked = Vec::with_capacity(self.size);
            for eq in &self.equations {
                if let Some(constraints) = &eq.constraints {
                    stacked.extend(constraints.iter().copied());
                }
            }
            self.base_constraints = Some(na::DVector::from_vec(stacked));
            self.equation_constraints_built = true;
            self.boco_constraints_applied = false;
            for bc in &mut self.bocos {
                bc.constraints_applied = false;
            }
            self.stats.constraint_stacks += 1;
        }

        // stage 3: apply boundary-condition coefficients.
        // the row replacement is pure matrix algebra;
        // per-row indexed assignment into a sparse matrix would be
        // asymptotically much slower
        if !self.boco_coefficients_applied {
            for bc in &self.bocos {
                Self::check_boco(bc)?;
            }
            // stage 1 has either just run or was already valid
            let mut coefficients = self.base_coefficients.clone().unwrap();
            for bc in &mut self.bocos {
                if bc.coefficients_applied {
                    continue;
                }
                let mask = bc.mask.as_ref().unwrap();
                let coeff = bc.coefficients.as_ref().unwrap();
                coefficients = &mask.keep * &coefficients + &mask.inject * coeff;
                bc.coefficients_applied = true;
                self.stats.coefficient_applications += 1;
                log::trace!("applied boundary condition `{}` coefficients", bc.label);
            }
            self.coefficients = Some(coefficients);
            self.boco_coefficients_applied = true;
        }

        // stage 4: apply boundary-condition constraints.
        // the target is a dense vector, so direct assignment is fine here
        if !self.boco_constraints_applied {
            for bc in &self.bocos {
                Self::check_boco(bc)?;
            }
            let mut constraints = self.base_constraints.clone().unwrap();
            for bc in &mut self.bocos {
                if bc.constraints_applied {
                    continue;
                }
                let mask = bc.mask.as_ref().unwrap();
                let values = bc.constraints.as_ref().unwrap();
                for (entry, row) in mask.rows.ones().enumerate() {
                    constraints[row] = values[entry];
                }
                bc.constraints_applied = true;
                self.stats.constraint_applications += 1;
            }
            self.constraints = Some(constraints);
            self.boco_constraints_applied = true;
        }

        Ok(())
    }

    /// Build, solve, and slice the solution back into per-field arrays.
    pub fn solve(&mut self, solver: &dyn LinearSolver) -> Result<Solution, ModelError> {
        self.build()?;
        // build just succeeded, so both caches exist
        let coefficients = self.coefficients.as_ref().unwrap();
        let constraints = self.constraints.as_ref().unwrap();
        let flat = solver.solve(coefficients, constraints)?;

        let fields = self
            .fields
            .iter()
            .map(|field| {
                let values = flat.rows(field.offset(), field.size()).into_owned();
                (field.clone(), values)
            })
            .collect();
        Ok(Solution { fields })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        solver::{DenseLu, Lsqr},
        Field, FieldOperator,
    };
    use approx::assert_relative_eq;

    /// Centered second difference with one-sided ends, unit spacing.
    fn second_difference(field: &FieldRef) -> FieldOperator {
        let n = field.size();
        let mut coo = nas::CooMatrix::new(n, n);
        for i in 0..n {
            let center = i.clamp(1, n - 2);
            coo.push(i, center - 1, 1.0);
            coo.push(i, center, -2.0);
            coo.push(i, center + 1, 1.0);
        }
        FieldOperator::new(field.clone(), nas::CsrMatrix::from(&coo))
    }

    /// One field of size 5 with a Laplace interior and Dirichlet ends 0 and 1.
    fn laplace_model() -> FdModel {
        let mut model = FdModel::new([Field::new("T", [5])]).unwrap();
        let t = model.field("T").unwrap();
        model
            .update_equations(
                [("diffusion", EquationUpdate::new(second_difference(&t), 0.0))],
                false,
            )
            .unwrap();
        model
            .update_bocos(
                [
                    (
                        "left",
                        BocoUpdate::new(
                            t.identity().slice(&[0..1]),
                            t.identity().slice(&[0..1]),
                            0.0,
                        ),
                    ),
                    (
                        "right",
                        BocoUpdate::new(
                            t.identity().slice(&[4..5]),
                            t.identity().slice(&[4..5]),
                            1.0,
                        ),
                    ),
                ],
                false,
            )
            .unwrap();
        model
    }

    #[test]
    fn size_is_the_sum_of_field_sizes() {
        let model = FdModel::new([Field::new("T", [3, 4]), Field::new("p", [5])]).unwrap();
        assert_eq!(model.shape(), vec![12, 5]);
        assert_eq!(model.size(), 17);
        assert_eq!(
            model.fields().map(|f| f.offset()).collect::<Vec<_>>(),
            vec![0, 12]
        );
    }

    #[test]
    fn duplicate_field_names_are_rejected() {
        let err = FdModel::new([Field::new("T", [3]), Field::new("T", [4])]).unwrap_err();
        assert!(matches!(err, ModelError::DuplicateField(name) if name == "T"));
    }

    #[test]
    fn underspecified_stacks_are_rejected() {
        let mut model = FdModel::new([Field::new("T", [4])]).unwrap();
        let t = model.field("T").unwrap();
        model
            .update_equations(
                [("partial", EquationUpdate::new(t.identity().slice(&[0..2]), 0.0))],
                false,
            )
            .unwrap();
        let err = model.build().unwrap_err();
        assert!(matches!(
            err,
            ModelError::Underspecified {
                rows: 2,
                unknowns: 4
            }
        ));
    }

    #[test]
    fn overspecified_stacks_are_rejected() {
        let mut model = FdModel::new([Field::new("T", [4])]).unwrap();
        let t = model.field("T").unwrap();
        model
            .update_equations(
                [
                    ("a", EquationUpdate::new(t.identity(), 0.0)),
                    ("b", EquationUpdate::new(t.identity(), 0.0)),
                ],
                false,
            )
            .unwrap();
        let err = model.build().unwrap_err();
        assert!(matches!(
            err,
            ModelError::Overspecified {
                rows: 8,
                unknowns: 4
            }
        ));
    }

    #[test]
    fn missing_halves_are_reported_with_their_label() {
        let mut model = FdModel::new([Field::new("T", [4])]).unwrap();
        let t = model.field("T").unwrap();
        model
            .update_equations(
                [("interior", EquationUpdate::coefficients(t.identity()))],
                false,
            )
            .unwrap();
        let err = model.build().unwrap_err();
        assert!(matches!(
            err,
            ModelError::MissingConstraints { label, .. } if label == "interior"
        ));

        model
            .update_equations(
                [("rhs_only", EquationUpdate::constraints(vec![0.0; 4]))],
                true,
            )
            .unwrap();
        let err = model.build().unwrap_err();
        assert!(matches!(
            err,
            ModelError::MissingCoefficients { label, .. } if label == "rhs_only"
        ));
    }

    #[test]
    fn uniform_constraint_needs_a_sized_block() {
        let mut model = FdModel::new([Field::new("T", [4])]).unwrap();
        let err = model
            .update_equations([("interior", EquationUpdate::constraints(1.0))], false)
            .unwrap_err();
        assert!(matches!(err, ModelError::UnsizedConstraint { .. }));
    }

    #[test]
    fn missing_boco_mask_is_reported() {
        let mut model = FdModel::new([Field::new("T", [4])]).unwrap();
        let t = model.field("T").unwrap();
        model
            .update_equations([("interior", EquationUpdate::new(t.identity(), 0.0))], false)
            .unwrap();
        model
            .update_bocos(
                [(
                    "edge",
                    BocoUpdate {
                        mask: Update::Keep,
                        coefficients: Update::Set(t.identity().slice(&[0..1])),
                        constraints: Update::Set(Constraint::Uniform(1.0)),
                    },
                )],
                false,
            )
            .unwrap();
        let err = model.build().unwrap_err();
        assert!(matches!(err, ModelError::MissingMask(label) if label == "edge"));
    }

    #[test]
    fn boundary_conditions_overwrite_exactly_their_rows() {
        let mut model = FdModel::new([Field::new("T", [4])]).unwrap();
        let t = model.field("T").unwrap();
        model
            .update_equations([("interior", EquationUpdate::new(t.identity(), 9.0))], false)
            .unwrap();
        model
            .update_bocos(
                [
                    (
                        "left",
                        BocoUpdate::new(
                            t.identity().slice(&[0..1]),
                            t.identity().slice(&[0..1]),
                            5.0,
                        ),
                    ),
                    (
                        "right",
                        BocoUpdate::new(
                            t.identity().slice(&[3..4]),
                            t.identity().slice(&[3..4]),
                            5.0,
                        ),
                    ),
                ],
                false,
            )
            .unwrap();
        model.build().unwrap();

        let constraints = model.constraints().unwrap();
        assert_eq!(constraints.as_slice(), &[5.0, 9.0, 9.0, 5.0]);
    }

    #[test]
    fn laplace_problem_solves_to_a_linear_ramp() {
        let mut model = laplace_model();
        let expected = [0.0, 0.25, 0.5, 0.75, 1.0];

        let solution = model.solve(&DenseLu).unwrap();
        let values = solution.field("T").unwrap();
        for (value, expected) in values.iter().zip(expected) {
            assert_relative_eq!(*value, expected, epsilon = 1e-12);
        }

        let solution = model.solve(&Lsqr::default()).unwrap();
        let values = solution.field("T").unwrap();
        for (value, expected) in values.iter().zip(expected) {
            assert_relative_eq!(*value, expected, epsilon = 1e-6);
        }
    }

    #[test]
    fn build_is_idempotent() {
        let mut model = laplace_model();
        model.build().unwrap();
        let stats = model.stats();
        let coefficients = model.coefficients().unwrap().clone();
        let constraints = model.constraints().unwrap().clone();

        model.build().unwrap();
        assert_eq!(model.stats(), stats, "a clean rebuild must do no work");
        assert_eq!(model.coefficients().unwrap(), &coefficients);
        assert_eq!(model.constraints().unwrap(), &constraints);
    }

    #[test]
    fn constraint_only_update_reuses_the_coefficient_stages() {
        let mut model = laplace_model();
        model.build().unwrap();
        let stats = model.stats();
        let coefficients = model.coefficients().unwrap().clone();

        let t = model.field("T").unwrap();
        let heating = na::DVector::from_element(t.size(), -0.1);
        model
            .update_equations(
                [("diffusion", EquationUpdate::constraints(heating))],
                false,
            )
            .unwrap();
        model.build().unwrap();

        let after = model.stats();
        assert_eq!(after.coefficient_stacks, stats.coefficient_stacks);
        assert_eq!(after.coefficient_applications, stats.coefficient_applications);
        assert_eq!(after.constraint_stacks, stats.constraint_stacks + 1);
        assert_eq!(model.coefficients().unwrap(), &coefficients);
        assert_eq!(model.constraints().unwrap()[1], -0.1);
        assert_eq!(
            model.constraints().unwrap()[0],
            0.0,
            "boundary rows must keep their boundary values"
        );
    }

    #[test]
    fn boco_constraint_update_reapplies_against_the_cached_base() {
        let mut model = laplace_model();
        model.build().unwrap();
        let stats = model.stats();

        model
            .update_bocos([("right", BocoUpdate::constraints(2.0))], false)
            .unwrap();
        model.build().unwrap();

        let after = model.stats();
        assert_eq!(after.coefficient_stacks, stats.coefficient_stacks);
        assert_eq!(after.constraint_stacks, stats.constraint_stacks);
        assert_eq!(after.coefficient_applications, stats.coefficient_applications);
        assert!(after.constraint_applications > stats.constraint_applications);

        let constraints = model.constraints().unwrap();
        assert_eq!(constraints[4], 2.0);
        assert_eq!(constraints[0], 0.0, "the other boundary must survive");
    }

    #[test]
    fn purged_equations_make_the_model_underspecified() {
        let mut model = laplace_model();
        model.build().unwrap();

        let no_updates: [(&str, EquationUpdate); 0] = [];
        model.update_equations(no_updates, true).unwrap();
        let err = model.build().unwrap_err();
        assert!(matches!(
            err,
            ModelError::Underspecified {
                rows: 0,
                unknowns: 5
            }
        ));
    }

    #[test]
    fn overlapping_masks_are_rejected() {
        let mut model = FdModel::new([Field::new("T", [4])]).unwrap();
        let t = model.field("T").unwrap();
        model
            .update_bocos(
                [(
                    "left",
                    BocoUpdate::new(
                        t.identity().slice(&[0..1]),
                        t.identity().slice(&[0..1]),
                        0.0,
                    ),
                )],
                false,
            )
            .unwrap();
        let err = model
            .update_bocos(
                [(
                    "wide",
                    BocoUpdate::new(
                        t.identity().slice(&[0..2]),
                        t.identity().slice(&[0..2]),
                        0.0,
                    ),
                )],
                false,
            )
            .unwrap_err();
        match err {
            ModelError::OverlappingBoundaryRows { first, second } => {
                assert_eq!(first, "left");
                assert_eq!(second, "wide");
            }
            other => panic!("expected an overlap error, got {other}"),
        }
    }

    #[test]
    fn replacing_a_mask_reclaims_its_rows() {
        let mut model = FdModel::new([Field::new("T", [4])]).unwrap();
        let t = model.field("T").unwrap();
        model
            .update_bocos(
                [(
                    "edge",
                    BocoUpdate::new(
                        t.identity().slice(&[0..1]),
                        t.identity().slice(&[0..1]),
                        0.0,
                    ),
                )],
                false,
            )
            .unwrap();
        // moving the same label's mask away from row 0 must not self-collide
        model
            .update_bocos(
                [(
                    "edge",
                    BocoUpdate::new(
                        t.identity().slice(&[3..4]),
                        t.identity().slice(&[3..4]),
                        0.0,
                    ),
                )],
                false,
            )
            .unwrap();
    }

    #[test]
    fn solution_is_sliced_per_field() {
        let mut model = FdModel::new([Field::new("a", [3]), Field::new("b", [2])]).unwrap();
        let a = model.field("a").unwrap();
        let b = model.field("b").unwrap();
        model
            .update_equations(
                [
                    ("a", EquationUpdate::new(a.identity(), vec![1.0, 2.0, 3.0])),
                    ("b", EquationUpdate::new(b.identity(), vec![4.0, 5.0])),
                ],
                false,
            )
            .unwrap();
        let solution = model.solve(&DenseLu).unwrap();
        assert_eq!(solution.field("a").unwrap().as_slice(), &[1.0, 2.0, 3.0]);
        assert_eq!(solution.field("b").unwrap().as_slice(), &[4.0, 5.0]);
        let order: Vec<&str> = solution.iter().map(|(f, _)| f.name()).collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn two_field_coupled_model_solves() {
        // u is a ramp fixed by boundary conditions; v must equal u pointwise
        let mut model = FdModel::new([Field::new("u", [3]), Field::new("v", [3])]).unwrap();
        let u = model.field("u").unwrap();
        let v = model.field("v").unwrap();
        model
            .update_equations(
                [
                    (
                        "u_interior",
                        EquationUpdate::new(second_difference(&u), 0.0),
                    ),
                    (
                        "coupling",
                        EquationUpdate::new(v.identity() - u.identity().widen(), 0.0),
                    ),
                ],
                false,
            )
            .unwrap();
        model
            .update_bocos(
                [
                    (
                        "u_left",
                        BocoUpdate::new(
                            u.identity().slice(&[0..1]),
                            u.identity().slice(&[0..1]),
                            0.0,
                        ),
                    ),
                    (
                        "u_right",
                        BocoUpdate::new(
                            u.identity().slice(&[2..3]),
                            u.identity().slice(&[2..3]),
                            2.0,
                        ),
                    ),
                ],
                false,
            )
            .unwrap();
        let solution = model.solve(&DenseLu).unwrap();
        let u_values = solution.field("u").unwrap();
        let v_values = solution.field("v").unwrap();
        for (u_val, expected) in u_values.iter().zip([0.0, 1.0, 2.0]) {
            assert_relative_eq!(*u_val, expected, epsilon = 1e-12);
        }
        assert_relative_eq!(u_values, v_values, epsilon = 1e-12);
    }
}
