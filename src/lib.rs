//! Sparse finite-difference model assembly and solving.
//!
//! A model is made of named [`Field`]s, each contributing a block of unknowns
//! to one global linear system.
//! Equations and boundary conditions are registered as labeled blocks
//! and can be swapped out one at a time between solves;
//! the assembly pipeline caches its four stages
//! and only re-runs the ones a change actually invalidates,
//! which is what makes per-timestep updates cheap.
//!
//! Per-field operators are combined algebraically
//! and widened to model scope with zero-padding,
//! never by materializing dense arrays.
//!
//! ```
//! use findif::{
//!     solver::DenseLu, BocoUpdate, EquationUpdate, FdModel, Field, FieldOperator,
//! };
//! use nalgebra_sparse::{CooMatrix, CsrMatrix};
//!
//! # fn main() -> Result<(), findif::ModelError> {
//! // steady heat conduction along a rod of five points
//! let mut model = FdModel::new([Field::new("T", [5])])?;
//! let t = model.field("T").unwrap();
//!
//! // second-difference stencil over the interior, unit spacing
//! let mut d2 = CooMatrix::new(5, 5);
//! for i in 1..4 {
//!     d2.push(i, i - 1, 1.0);
//!     d2.push(i, i, -2.0);
//!     d2.push(i, i + 1, 1.0);
//! }
//! let d2 = FieldOperator::new(t.clone(), CsrMatrix::from(&d2));
//!
//! model.update_equations([("diffusion", EquationUpdate::new(d2, 0.0))], false)?;
//! model.update_bocos(
//!     [
//!         (
//!             "left",
//!             BocoUpdate::new(t.identity().slice(&[0..1]), t.identity().slice(&[0..1]), 0.0),
//!         ),
//!         (
//!             "right",
//!             BocoUpdate::new(t.identity().slice(&[4..5]), t.identity().slice(&[4..5]), 1.0),
//!         ),
//!     ],
//!     false,
//! )?;
//!
//! let solution = model.solve(&DenseLu)?;
//! let temperature = solution.field("T").unwrap();
//! assert!((temperature[2] - 0.5).abs() < 1e-12);
//!
//! // between timesteps, touch only what changed;
//! // everything else is reused from the cache
//! model.update_bocos([("right", BocoUpdate::constraints(2.0))], false)?;
//! let solution = model.solve(&DenseLu)?;
//! assert!((solution.field("T").unwrap()[2] - 1.0).abs() < 1e-12);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod field;
#[doc(inline)]
pub use field::{Field, FieldRef};

pub mod operator;
#[doc(inline)]
pub use operator::{FieldOperator, ModelMatrix};

pub mod model;
#[doc(inline)]
pub use model::{
    BlockKind, BocoUpdate, BuildStats, Constraint, EquationUpdate, FdModel, ModelError, Solution,
    Update,
};

pub mod solver;
#[doc(inline)]
pub use solver::{LinearSolver, SolveError};

pub(crate) mod sparse;

// nalgebra re-exports of common types for convenience

pub use nalgebra as na;
pub use nalgebra_sparse as nas;
/// Type alias for the dense vectors used for constraints and grid functions.
pub type DVector = na::DVector<f64>;
