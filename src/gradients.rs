//! Analytic dLoss/dq via the adjoint of the equilibrium system.
//!
//! For A x = b with A = Cnᵀ Q Cn and b = P − Cnᵀ Q Cf XYZf:
//!   1. evaluate the objectives on the solved geometry, collecting dJ/dℓ,
//!      dJ/df, dJ/dxyz and explicit dJ/dq,
//!   2. chain f = q·ℓ and ℓ = ‖x_v − x_u‖ down to dJ/dx̂ on free nodes,
//!   3. solve A λ = dJ/dx̂ with the forward factorisation (A is symmetric),
//!   4. dJ/dq_k = explicit_k − (λ_v − λ_u) · (x_v − x_u), with λ = 0 on
//!      fixed nodes.

use ndarray::Array2;

use crate::assembly::LinearProblem;
use crate::fdm::{rhs, system_matrix, Factorization};
use crate::objectives::{bounds_penalty, total_loss, Objective, Partials, Snapshot, DEFAULT_BARRIER_SHARPNESS};
use crate::types::{norm, FdmError, FdmResult, LENGTH_EPSILON};

/// Everything fixed across an optimisation run: topology, anchors, loads,
/// target geometry and the objective set.
#[derive(Debug, Clone)]
pub struct OptimizationContext {
    pub problem: LinearProblem,
    /// P (|N| × 3)
    pub loads: Array2<f64>,
    /// Reference coordinates for the target objective (nn × 3).
    pub target: Array2<f64>,
    pub objectives: Vec<Objective>,
    pub lower_bound: f64,
    pub upper_bound: f64,
    free_slot: Vec<Option<usize>>,
}

impl OptimizationContext {
    pub fn new(
        problem: LinearProblem,
        loads: Array2<f64>,
        target: Array2<f64>,
        objectives: Vec<Objective>,
        lower_bound: f64,
        upper_bound: f64,
    ) -> FdmResult<Self> {
        if loads.dim() != (problem.num_free(), 3) {
            return Err(FdmError::ArityMismatch {
                what: "load matrix rows",
                found: loads.nrows(),
                expected: problem.num_free(),
            });
        }
        if target.dim() != (problem.num_nodes, 3) {
            return Err(FdmError::ArityMismatch {
                what: "target coordinates",
                found: target.nrows(),
                expected: problem.num_nodes,
            });
        }
        let mut free_slot = vec![None; problem.num_nodes];
        for (slot, &node) in problem.free_node_indices.iter().enumerate() {
            free_slot[node] = Some(slot);
        }
        Ok(Self {
            problem,
            loads,
            target,
            objectives,
            lower_bound,
            upper_bound,
            free_slot,
        })
    }

    pub fn num_edges(&self) -> usize {
        self.problem.num_edges
    }
}

/// Forward solve plus loss and gradient at one force-density vector.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub loss: f64,
    pub gradient: Vec<f64>,
    /// All node coordinates (nn × 3).
    pub xyz: Array2<f64>,
    pub lengths: Vec<f64>,
    pub forces: Vec<f64>,
}

/// Solve, evaluate every objective and back-propagate to dJ/dq.
pub fn evaluate(ctx: &OptimizationContext, q: &[f64]) -> FdmResult<Evaluation> {
    let ne = ctx.num_edges();
    if q.len() != ne {
        return Err(FdmError::ArityMismatch { what: "force densities", found: q.len(), expected: ne });
    }
    let problem = ctx.problem.with_force_densities(q)?;
    let nn = problem.num_nodes;

    // ── Forward ─────────────────────────────────────────────
    let factor = if problem.num_free() > 0 {
        let a = system_matrix(&problem);
        Some(Factorization::new(a.view(), q)?)
    } else {
        None
    };
    let x_free = match &factor {
        Some(f) => f.solve_columns(&rhs(&problem, &ctx.loads)),
        None => Array2::zeros((0, 3)),
    };

    let mut xyz = Array2::zeros((nn, 3));
    for (row, &node) in problem.fixed_node_indices.iter().enumerate() {
        xyz.row_mut(node).assign(&problem.fixed_positions.row(row));
    }
    for (row, &node) in problem.free_node_indices.iter().enumerate() {
        xyz.row_mut(node).assign(&x_free.row(row));
    }

    let deltas: Vec<[f64; 3]> = problem
        .edges
        .iter()
        .map(|&(u, v)| [xyz[[v, 0]] - xyz[[u, 0]], xyz[[v, 1]] - xyz[[u, 1]], xyz[[v, 2]] - xyz[[u, 2]]])
        .collect();
    let lengths: Vec<f64> = deltas.iter().map(|d| norm(*d)).collect();
    let forces: Vec<f64> = lengths.iter().zip(q).map(|(l, qk)| qk * l).collect();

    // ── Loss and partials ───────────────────────────────────
    let mut partials = Partials::zeros(ne, nn);
    let snap = Snapshot { xyz: &xyz, target: &ctx.target, lengths: &lengths, forces: &forces };
    let mut loss = total_loss(&ctx.objectives, &snap, &mut partials);
    loss += bounds_penalty(q, ctx.lower_bound, ctx.upper_bound, DEFAULT_BARRIER_SHARPNESS, 1.0, &mut partials.q);

    // f = q ℓ
    for k in 0..ne {
        partials.lengths[k] += partials.forces[k] * q[k];
        partials.q[k] += partials.forces[k] * lengths[k];
    }

    // ℓ = ‖Δ‖ → xyz
    for (k, &(u, v)) in problem.edges.iter().enumerate() {
        let len = lengths[k];
        if len < LENGTH_EPSILON {
            continue;
        }
        let scale = partials.lengths[k] / len;
        for d in 0..3 {
            partials.xyz[[v, d]] += scale * deltas[k][d];
            partials.xyz[[u, d]] -= scale * deltas[k][d];
        }
    }

    // ── Adjoint ─────────────────────────────────────────────
    let mut gradient = partials.q;
    if let Some(factor) = &factor {
        let mut g = Array2::zeros((problem.num_free(), 3));
        for (row, &node) in problem.free_node_indices.iter().enumerate() {
            g.row_mut(row).assign(&partials.xyz.row(node));
        }
        let lambda = factor.solve_columns(&g);

        for (k, &(u, v)) in problem.edges.iter().enumerate() {
            for d in 0..3 {
                let lam_u = ctx.free_slot[u].map_or(0.0, |j| lambda[[j, d]]);
                let lam_v = ctx.free_slot[v].map_or(0.0, |j| lambda[[j, d]]);
                gradient[k] -= (lam_v - lam_u) * deltas[k][d];
            }
        }
    }

    Ok(Evaluation { loss, gradient, xyz, lengths, forces })
}

/// Loss and dLoss/dq at `q`.
pub fn value_and_gradient(ctx: &OptimizationContext, q: &[f64]) -> FdmResult<(f64, Vec<f64>)> {
    let eval = evaluate(ctx, q)?;
    Ok((eval.loss, eval.gradient))
}
