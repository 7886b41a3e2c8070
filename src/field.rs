//! Fields, the named unknowns of a model, and their global block layout.

use nalgebra_sparse as nas;

use std::sync::Arc;

use crate::operator::FieldOperator;

/// Description of one named physical quantity discretized over its own grid.
///
/// A field contributes a block of `shape.iter().product()` unknowns
/// to the global system of the [`FdModel`][crate::FdModel] it is registered into.
/// Registration order fixes the block layout,
/// so equations always address the same columns between model updates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Field {
    name: String,
    shape: Vec<usize>,
}

impl Field {
    /// Describe a field by name and grid shape.
    ///
    /// Values are stored row-major over the shape,
    /// the last axis varying fastest.
    pub fn new(name: impl Into<String>, shape: impl Into<Vec<usize>>) -> Self {
        let shape = shape.into();
        assert!(
            !shape.is_empty() && shape.iter().all(|&dim| dim > 0),
            "a field needs at least one axis of nonzero extent, got shape {shape:?}"
        );
        Self {
            name: name.into(),
            shape,
        }
    }

    /// The field's name, unique within its model.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The field's grid shape.
    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Total number of unknowns the field contributes.
    #[inline]
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    pub(crate) fn into_parts(self) -> (String, Vec<usize>) {
        (self.name, self.shape)
    }
}

/// Layout record frozen at model construction.
/// Carried by every [`FieldRef`] so that operators can widen themselves
/// to model scope without a lookup through the model.
#[derive(Debug)]
pub(crate) struct FieldLayout {
    pub(crate) name: String,
    pub(crate) shape: Vec<usize>,
    pub(crate) size: usize,
    pub(crate) offset: usize,
    pub(crate) model_size: usize,
}

/// Handle to a field registered in a model.
///
/// Handed out by [`FdModel::field`][crate::FdModel::field]; cheap to clone.
/// Two handles compare equal only when they refer to the same registration,
/// never by name, so fields of distinct models cannot alias each other.
#[derive(Clone, Debug)]
pub struct FieldRef(Arc<FieldLayout>);

impl FieldRef {
    pub(crate) fn new(layout: FieldLayout) -> Self {
        Self(Arc::new(layout))
    }

    /// The field's name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// The field's grid shape.
    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.0.shape
    }

    /// Number of unknowns in the field's block.
    #[inline]
    pub fn size(&self) -> usize {
        self.0.size
    }

    /// Column offset of the field's block in the model-wide unknown vector.
    #[inline]
    pub fn offset(&self) -> usize {
        self.0.offset
    }

    /// Total unknown count of the model the field belongs to.
    #[inline]
    pub fn model_size(&self) -> usize {
        self.0.model_size
    }

    /// The identity operator over this field's unknowns.
    ///
    /// The usual starting point for value (rather than derivative) terms
    /// and for boundary-condition masks.
    pub fn identity(&self) -> FieldOperator {
        FieldOperator::new(self.clone(), nas::CsrMatrix::identity(self.size()))
    }
}

impl PartialEq for FieldRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
