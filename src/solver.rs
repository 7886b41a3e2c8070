//! Pluggable linear solvers consuming the assembled system.
//!
//! [`FdModel::solve`][crate::FdModel::solve] takes any [`LinearSolver`],
//! so swapping the solution method (or bringing your own)
//! never touches the assembly pipeline.
//! [`DenseLu`] is the reliable default for small and moderate models;
//! [`BiCgStab`] and [`Lsqr`] avoid factorization for large sparse systems.

use nalgebra as na;
use nalgebra_sparse as nas;

/// Error in solving an assembled linear system.
#[derive(thiserror::Error, Debug)]
pub enum SolveError {
    /// The coefficient matrix is not square.
    #[error("coefficient matrix is {nrows}x{ncols} but must be square")]
    NotSquare {
        /// Row count of the matrix.
        nrows: usize,
        /// Column count of the matrix.
        ncols: usize,
    },
    /// The constraint vector's length doesn't match the matrix.
    #[error("constraint vector has {len} entries but the matrix has {rows} rows")]
    DimensionMismatch {
        /// Row count of the matrix.
        rows: usize,
        /// Length of the constraint vector.
        len: usize,
    },
    /// The coefficient matrix has no unique solution.
    #[error("coefficient matrix is singular")]
    Singular,
    /// An iterative method ran out of iterations or broke down.
    #[error("did not converge within {iterations} iterations (residual {residual:.3e})")]
    NotConverged {
        /// Iterations performed before giving up.
        iterations: usize,
        /// Residual norm at the final iteration.
        residual: f64,
    },
}

/// A backend that solves `coefficients * x = constraints` for `x`.
///
/// Implementations are free to require squareness ([`DenseLu`], [`BiCgStab`])
/// or accept rectangular least-squares systems ([`Lsqr`]).
pub trait LinearSolver {
    /// Solve the system, returning the flat solution vector.
    fn solve(
        &self,
        coefficients: &nas::CsrMatrix<f64>,
        constraints: &na::DVector<f64>,
    ) -> Result<na::DVector<f64>, SolveError>;
}

/// Termination settings shared by the iterative solvers.
#[derive(Clone, Copy, Debug)]
pub struct SolverConfig {
    /// Relative convergence tolerance, scaled by the constraint norm.
    pub rtol: f64,
    /// Absolute convergence tolerance.
    pub atol: f64,
    /// Maximum number of iterations.
    pub max_iter: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            rtol: 1e-8,
            atol: 1e-14,
            max_iter: 1000,
        }
    }
}

fn check_dimensions(
    coefficients: &nas::CsrMatrix<f64>,
    constraints: &na::DVector<f64>,
) -> Result<(), SolveError> {
    if coefficients.nrows() != constraints.len() {
        return Err(SolveError::DimensionMismatch {
            rows: coefficients.nrows(),
            len: constraints.len(),
        });
    }
    Ok(())
}

fn check_square(coefficients: &nas::CsrMatrix<f64>) -> Result<(), SolveError> {
    if coefficients.nrows() != coefficients.ncols() {
        return Err(SolveError::NotSquare {
            nrows: coefficients.nrows(),
            ncols: coefficients.ncols(),
        });
    }
    Ok(())
}

/// Direct solve through a dense LU factorization with partial pivoting.
///
/// Densifies the coefficient matrix,
/// so it's meant for small and moderate model sizes;
/// for large systems prefer [`BiCgStab`] or [`Lsqr`].
#[derive(Clone, Copy, Debug, Default)]
pub struct DenseLu;

impl LinearSolver for DenseLu {
    fn solve(
        &self,
        coefficients: &nas::CsrMatrix<f64>,
        constraints: &na::DVector<f64>,
    ) -> Result<na::DVector<f64>, SolveError> {
        check_square(coefficients)?;
        check_dimensions(coefficients, constraints)?;

        let mut dense = na::DMatrix::zeros(coefficients.nrows(), coefficients.ncols());
        for (row, col, val) in coefficients.triplet_iter() {
            dense[(row, col)] = *val;
        }
        dense
            .lu()
            .solve(constraints)
            .ok_or(SolveError::Singular)
    }
}

/// Biconjugate gradient stabilized iteration.
///
/// Handles the nonsymmetric systems boundary-condition row replacement produces,
/// without ever factorizing the matrix.
#[derive(Clone, Copy, Debug, Default)]
pub struct BiCgStab {
    /// Termination settings.
    pub config: SolverConfig,
}

impl LinearSolver for BiCgStab {
    fn solve(
        &self,
        coefficients: &nas::CsrMatrix<f64>,
        constraints: &na::DVector<f64>,
    ) -> Result<na::DVector<f64>, SolveError> {
        check_square(coefficients)?;
        check_dimensions(coefficients, constraints)?;

        let n = coefficients.ncols();
        let b_norm = constraints.norm();
        if b_norm == 0.0 {
            return Ok(na::DVector::zeros(n));
        }
        let tol = self.config.atol + self.config.rtol * b_norm;

        let mut x = na::DVector::zeros(n);
        let mut r = constraints.clone();
        let r_shadow = r.clone();
        let mut rho = 1.0;
        let mut alpha = 1.0;
        let mut omega = 1.0;
        let mut v = na::DVector::zeros(n);
        let mut p = na::DVector::zeros(n);

        for iter in 1..=self.config.max_iter {
            let rho_next = r_shadow.dot(&r);
            if rho_next.abs() < f64::MIN_POSITIVE {
                // breakdown; the shadow residual has become orthogonal to r
                return Err(SolveError::NotConverged {
                    iterations: iter,
                    residual: r.norm(),
                });
            }
            let beta = (rho_next / rho) * (alpha / omega);
            p.axpy(-omega, &v, 1.0);
            p *= beta;
            p += &r;

            v = coefficients * &p;
            let denom = r_shadow.dot(&v);
            if denom.abs() < f64::MIN_POSITIVE {
                return Err(SolveError::NotConverged {
                    iterations: iter,
                    residual: r.norm(),
                });
            }
            alpha = rho_next / denom;

            let mut s = r.clone();
            s.axpy(-alpha, &v, 1.0);
            if s.norm() <= tol {
                x.axpy(alpha, &p, 1.0);
                log::trace!("BiCGStab converged in {iter} iterations (early exit)");
                return Ok(x);
            }

            let t = coefficients * &s;
            let t_dot_t = t.dot(&t);
            if t_dot_t < f64::MIN_POSITIVE {
                return Err(SolveError::NotConverged {
                    iterations: iter,
                    residual: s.norm(),
                });
            }
            omega = t.dot(&s) / t_dot_t;

            x.axpy(alpha, &p, 1.0);
            x.axpy(omega, &s, 1.0);
            r = s;
            r.axpy(-omega, &t, 1.0);

            let residual = r.norm();
            log::trace!("BiCGStab iter {iter}: residual = {residual:.6e}");
            if residual <= tol {
                return Ok(x);
            }
            rho = rho_next;
        }

        Err(SolveError::NotConverged {
            iterations: self.config.max_iter,
            residual: r.norm(),
        })
    }
}

/// Least-squares iteration after Paige & Saunders.
///
/// Accepts rectangular systems and minimizes the residual norm,
/// so it also tolerates mildly inconsistent row stacks.
#[derive(Clone, Copy, Debug, Default)]
pub struct Lsqr {
    /// Termination settings.
    pub config: SolverConfig,
}

impl LinearSolver for Lsqr {
    fn solve(
        &self,
        coefficients: &nas::CsrMatrix<f64>,
        constraints: &na::DVector<f64>,
    ) -> Result<na::DVector<f64>, SolveError> {
        check_dimensions(coefficients, constraints)?;

        let transposed = coefficients.transpose();
        // Frobenius norm, used to scale the least-squares termination test
        let norm_estimate = coefficients
            .values()
            .iter()
            .map(|v| v * v)
            .sum::<f64>()
            .sqrt();

        let mut x = na::DVector::zeros(coefficients.ncols());

        // Golub-Kahan bidiagonalization seeded with the constraint vector
        let mut u = constraints.clone();
        let mut beta = u.norm();
        if beta == 0.0 {
            return Ok(x);
        }
        u /= beta;
        let b_norm = beta;

        let mut v = &transposed * &u;
        let mut alpha = v.norm();
        if alpha == 0.0 {
            return Ok(x);
        }
        v /= alpha;

        let mut w = v.clone();
        let mut phi_bar = beta;
        let mut rho_bar = alpha;

        for iter in 1..=self.config.max_iter {
            let mut u_next = coefficients * &v;
            u_next.axpy(-alpha, &u, 1.0);
            beta = u_next.norm();
            if beta > 0.0 {
                u_next /= beta;
            }

            let mut v_next = &transposed * &u_next;
            v_next.axpy(-beta, &v, 1.0);
            alpha = v_next.norm();
            if alpha > 0.0 {
                v_next /= alpha;
            }

            // plane rotation eliminating the subdiagonal
            let rho = rho_bar.hypot(beta);
            let c = rho_bar / rho;
            let s = beta / rho;
            let theta = s * alpha;
            rho_bar = -c * alpha;
            let phi = c * phi_bar;
            phi_bar *= s;

            x.axpy(phi / rho, &w, 1.0);
            w.axpy(1.0, &v_next, -(theta / rho));

            u = u_next;
            v = v_next;

            // phi_bar estimates |r|; phi_bar * alpha * |c| estimates |A^T r|
            let residual = phi_bar;
            let normal_residual = phi_bar * alpha * c.abs();
            log::trace!("LSQR iter {iter}: residual = {residual:.6e}");
            if residual <= self.config.atol + self.config.rtol * b_norm
                || normal_residual <= self.config.rtol * norm_estimate * residual
            {
                return Ok(x);
            }
        }

        Err(SolveError::NotConverged {
            iterations: self.config.max_iter,
            residual: phi_bar,
        })
    }
}
