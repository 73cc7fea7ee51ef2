//! Equilibrium solve: assemble A = Cnᵀ Q Cn and b = P − Cnᵀ Q Cf XYZf,
//! factorise, and solve for the free-node coordinates.

use ndarray::Array2;
use sprs::{CsMat, CsMatView, FillInReduction, SymmetryCheck};
use sprs_ldl::{Ldl, LdlNumeric};
use tracing::debug;

use crate::analysis;
use crate::assembly::{load_matrix, LinearProblem};
use crate::topology::Network;
use crate::types::{FdmError, FdmResult, Point3};

// ─────────────────────────────────────────────────────────────
//  System matrix and right-hand side
// ─────────────────────────────────────────────────────────────

/// A = Cnᵀ Q Cn  (nn_free × nn_free, CSC).
pub fn system_matrix(problem: &LinearProblem) -> CsMat<f64> {
    let cn_t = problem.free_incidence.transpose_view().to_csc();
    let cn_t_q = &cn_t * &problem.force_density_matrix;
    let a = &cn_t_q * &problem.free_incidence;
    a.to_csc()
}

/// b = P − Cnᵀ Q Cf XYZf  (nn_free × 3).
pub fn rhs(problem: &LinearProblem, loads: &Array2<f64>) -> Array2<f64> {
    // cf_xf = Cf * XYZf   (ne × 3)
    let mut cf_xf = Array2::zeros((problem.num_edges, 3));
    spmm_add_into(&problem.fixed_incidence, &problem.fixed_positions, &mut cf_xf, 1.0);

    // q_cf_xf = Q * cf_xf
    let mut q_cf_xf = Array2::zeros((problem.num_edges, 3));
    spmm_add_into(&problem.force_density_matrix, &cf_xf, &mut q_cf_xf, 1.0);

    // b = P − Cnᵀ * q_cf_xf
    let mut b = loads.clone();
    let cn_t = problem.free_incidence.transpose_view().to_csc();
    spmm_add_into(&cn_t, &q_cf_xf, &mut b, -1.0);
    b
}

/// out += scale · A · B   for sparse A (m × k) and dense B (k × 3).
fn spmm_add_into(a: &CsMat<f64>, b: &Array2<f64>, out: &mut Array2<f64>, scale: f64) {
    for (&val, (row, col)) in a.iter() {
        for d in 0..3 {
            out[[row, d]] += scale * val * b[[col, d]];
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Factorisation
// ─────────────────────────────────────────────────────────────

/// Sparse LDLᵀ factorisation of A with every pivot checked positive, i.e. a
/// Cholesky factorisation in LDLᵀ form.
///
/// When every force density is negative the factorised matrix is −A, and
/// `solve` flips the sign of the right-hand side to compensate.
pub struct Factorization {
    ldl: LdlNumeric<f64, usize>,
    sign: f64,
    dim: usize,
}

impl std::fmt::Debug for Factorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Factorization")
            .field("dim", &self.dim)
            .field("sign", &self.sign)
            .finish()
    }
}

impl Factorization {
    /// Factorise A for the given force densities.
    pub fn new(a: CsMatView<f64>, force_densities: &[f64]) -> FdmResult<Self> {
        let all_negative = !force_densities.is_empty() && force_densities.iter().all(|&q| q < 0.0);
        let sign = if all_negative { -1.0 } else { 1.0 };
        let dim = a.rows();

        let ldl = if all_negative {
            let neg = a.map(|&v| -v);
            factor_spd(neg.view())?
        } else {
            factor_spd(a)?
        };
        Ok(Self { ldl, sign, dim })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Solve A x = rhs.
    pub fn solve(&self, rhs: &[f64]) -> Vec<f64> {
        if self.sign < 0.0 {
            let neg: Vec<f64> = rhs.iter().map(|v| -v).collect();
            self.ldl.solve(&neg[..])
        } else {
            self.ldl.solve(rhs)
        }
    }

    /// Solve every column of `rhs` against the one factorisation.
    pub fn solve_columns(&self, rhs: &Array2<f64>) -> Array2<f64> {
        let mut x = Array2::zeros(rhs.raw_dim());
        for d in 0..rhs.ncols() {
            let col: Vec<f64> = rhs.column(d).to_vec();
            let sol = self.solve(&col);
            for (i, v) in sol.into_iter().enumerate() {
                x[[i, d]] = v;
            }
        }
        x
    }
}

fn factor_spd(a: CsMatView<f64>) -> FdmResult<LdlNumeric<f64, usize>> {
    // sprs' Cuthill-McKee ordering requires at least two rows.
    let ordering = if a.rows() < 2 {
        FillInReduction::NoReduction
    } else {
        FillInReduction::ReverseCuthillMcKee
    };
    let ldl = Ldl::new()
        .fill_in_reduction(ordering)
        .check_symmetry(SymmetryCheck::DontCheckSymmetry)
        .numeric(a)?;
    // Positive-definiteness: every pivot of D must be strictly positive.
    for (i, &di) in ldl.d().iter().enumerate() {
        if !(di > 0.0) || !di.is_finite() {
            return Err(FdmError::SingularSystem(format!(
                "pivot {i} is {di:e}; Cnᵀ Q Cn is not positive definite"
            )));
        }
    }
    Ok(ldl)
}

// ─────────────────────────────────────────────────────────────
//  Solve
// ─────────────────────────────────────────────────────────────

fn check_loads(problem: &LinearProblem, loads: &Array2<f64>) -> FdmResult<()> {
    if loads.nrows() != problem.num_free() || loads.ncols() != 3 {
        return Err(FdmError::ArityMismatch {
            what: "load matrix rows",
            found: loads.nrows(),
            expected: problem.num_free(),
        });
    }
    Ok(())
}

/// Free-node coordinates (nn_free × 3) for the given load matrix.
///
/// All three axes are solved against a single factorisation.
pub fn solve(problem: &LinearProblem, loads: &Array2<f64>) -> FdmResult<Array2<f64>> {
    check_loads(problem, loads)?;
    if problem.num_free() == 0 {
        return Ok(Array2::zeros((0, 3)));
    }
    let a = system_matrix(problem);
    let b = rhs(problem, loads);
    let factor = Factorization::new(a.view(), &problem.force_densities)?;
    let x = factor.solve_columns(&b);
    debug!(free = problem.num_free(), nnz = a.nnz(), "solved equilibrium");
    Ok(x)
}

/// Solve a single coordinate axis (0 = x, 1 = y, 2 = z).
pub fn solve_axis(problem: &LinearProblem, loads: &Array2<f64>, axis: usize) -> FdmResult<Vec<f64>> {
    check_loads(problem, loads)?;
    if axis > 2 {
        return Err(FdmError::ArityMismatch { what: "axis", found: axis, expected: 3 });
    }
    if problem.num_free() == 0 {
        return Ok(Vec::new());
    }
    let a = system_matrix(problem);
    let b = rhs(problem, loads);
    let factor = Factorization::new(a.view(), &problem.force_densities)?;
    Ok(factor.solve(&b.column(axis).to_vec()))
}

// ─────────────────────────────────────────────────────────────
//  Solved network
// ─────────────────────────────────────────────────────────────

/// Result of an equilibrium solve applied back onto a network.
#[derive(Debug, Clone)]
pub struct Equilibrium {
    /// Network with free nodes moved to equilibrium; same topology.
    pub network: Network,
    /// Free-node coordinates in free index-list order (nn_free × 3).
    pub free_positions: Array2<f64>,
    /// Per-edge length of the solved geometry.
    pub member_lengths: Vec<f64>,
    /// Per-edge axial force `q × length` of the solved geometry.
    pub member_forces: Vec<f64>,
}

/// Write solved free-node coordinates back into the full node list; fixed
/// nodes keep their positions.
pub fn full_positions(network: &Network, free_positions: &Array2<f64>) -> Vec<Point3> {
    let mut points = network.positions();
    for (i, &node) in network.free_indices().iter().enumerate() {
        points[node] = [free_positions[[i, 0]], free_positions[[i, 1]], free_positions[[i, 2]]];
    }
    points
}

/// Solve `network` under `loads` (one per free node, or one broadcast vector)
/// and return the equilibrium network.
pub fn solve_network(network: &Network, loads: &[Point3]) -> FdmResult<Equilibrium> {
    network.validate()?;
    let problem = LinearProblem::from_network(network)?;
    let p = load_matrix(loads, problem.num_free())?;
    let free_positions = solve(&problem, &p)?;

    let points = full_positions(network, &free_positions);
    let solved = network.with_geometry(&points, &problem.force_densities)?;
    let member_lengths = analysis::lengths(&solved);
    let member_forces = analysis::forces(&solved);

    Ok(Equilibrium {
        network: solved,
        free_positions,
        member_lengths,
        member_forces,
    })
}
