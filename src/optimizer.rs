//! Reference implementation of the remote optimiser, run in-process.
//!
//! Consumes an `OptimizationRequest`, runs L-BFGS over the force densities via
//! `argmin`, and reports `ProgressMessage`s at the requested cadence.  The
//! run is split into chunks of `update_frequency` iterations; each chunk
//! restarts from the best parameters of the previous one.
//!
//! Uses `Vec<f64>` as the argmin parameter type so argmin-math's `vec`
//! backend applies.

use std::cell::RefCell;

use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use ndarray::Array2;
use tracing::{debug, info, warn};

use crate::gradients::{evaluate, value_and_gradient, OptimizationContext};
use crate::protocol::{OptimizationRequest, OptimizationSettings, ProgressMessage};
use crate::types::{FdmError, FdmResult};

/// L-BFGS history length.
const LBFGS_MEMORY: usize = 10;

/// Loss reported for force densities whose system is not positive definite.
const INFEASIBLE_LOSS: f64 = 1e12;

// ─────────────────────────────────────────────────────────────
//  argmin problem wrapper
// ─────────────────────────────────────────────────────────────

/// argmin calls `cost(q)` and `gradient(q)` separately at the same point; the
/// last `(q, loss, grad)` is cached so the forward + adjoint solve runs once.
struct ForceDensityProblem<'a> {
    context: &'a OptimizationContext,
    last_eval: RefCell<Option<(Vec<f64>, f64, Vec<f64>)>>,
}

impl<'a> ForceDensityProblem<'a> {
    fn new(context: &'a OptimizationContext) -> Self {
        Self { context, last_eval: RefCell::new(None) }
    }

    fn evaluated(&self, q: &[f64]) -> Result<(f64, Vec<f64>), argmin::core::Error> {
        if let Some((ref cached_q, loss, ref grad)) = *self.last_eval.borrow() {
            if cached_q.as_slice() == q {
                return Ok((loss, grad.clone()));
            }
        }
        // Indefinite systems count as infeasible so the line search backs off.
        let (loss, grad) = match value_and_gradient(self.context, q) {
            Ok(eval) => eval,
            Err(FdmError::SingularSystem(_)) => (INFEASIBLE_LOSS, vec![0.0; q.len()]),
            Err(e) => return Err(argmin::core::Error::msg(e.to_string())),
        };
        *self.last_eval.borrow_mut() = Some((q.to_vec(), loss, grad.clone()));
        Ok((loss, grad))
    }
}

impl<'a> CostFunction for ForceDensityProblem<'a> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, q: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
        Ok(self.evaluated(q)?.0)
    }
}

impl<'a> Gradient for ForceDensityProblem<'a> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, q: &Self::Param) -> Result<Self::Gradient, argmin::core::Error> {
        Ok(self.evaluated(q)?.1)
    }
}

// ─────────────────────────────────────────────────────────────
//  Context from a request
// ─────────────────────────────────────────────────────────────

/// Decode a request into the data an optimisation run needs.
pub fn context_from_request(request: &OptimizationRequest) -> FdmResult<(OptimizationContext, OptimizationSettings)> {
    let settings = request.settings()?;
    let problem = request.linear_problem()?;
    let positions = request.positions()?;
    let mut target = Array2::zeros((request.nn, 3));
    for (i, p) in positions.iter().enumerate() {
        for d in 0..3 {
            target[[i, d]] = p[d];
        }
    }
    let context = OptimizationContext::new(
        problem,
        request.loads()?,
        target,
        settings.effective_objectives(),
        settings.lower_bound,
        settings.upper_bound,
    )?;
    Ok((context, settings))
}

fn progress_message(
    context: &OptimizationContext,
    q: &[f64],
    iter: usize,
    finished: bool,
    trace: &[f64],
) -> FdmResult<ProgressMessage> {
    let eval = evaluate(context, q)?;
    Ok(ProgressMessage {
        finished,
        iter,
        loss: eval.loss,
        q: q.to_vec(),
        x: eval.xyz.column(0).to_vec(),
        y: eval.xyz.column(1).to_vec(),
        z: eval.xyz.column(2).to_vec(),
        losstrace: trace.to_vec(),
    })
}

// ─────────────────────────────────────────────────────────────
//  Chunked L-BFGS run
// ─────────────────────────────────────────────────────────────

struct Chunk {
    q: Vec<f64>,
    loss: f64,
    iterations: usize,
    converged: bool,
}

fn run_chunk(context: &OptimizationContext, settings: &OptimizationSettings, q0: Vec<f64>, max_iters: usize) -> FdmResult<Chunk> {
    let linesearch = MoreThuenteLineSearch::new();
    let solver = LBFGS::new(linesearch, LBFGS_MEMORY)
        .with_tolerance_grad(settings.abs_tolerance)?
        .with_tolerance_cost(settings.rel_tolerance)?;

    let result = Executor::new(ForceDensityProblem::new(context), solver)
        .configure(|config| {
            config
                .param(q0)
                .max_iters(max_iters as u64)
                .target_cost(f64::NEG_INFINITY)
        })
        .run()?;

    let state = result.state();
    let q = state
        .get_best_param()
        .cloned()
        .ok_or_else(|| FdmError::Solver("L-BFGS returned no best parameters".into()))?;
    Ok(Chunk {
        q,
        loss: state.get_best_cost(),
        iterations: state.get_iter() as usize,
        converged: matches!(state.get_termination_reason(), Some(TerminationReason::SolverConverged)),
    })
}

/// Clamp every force density into `[lower, upper]`.
fn project(q: &[f64], lower: f64, upper: f64) -> Vec<f64> {
    q.iter().map(|v| v.max(lower).min(upper)).collect()
}

/// Optimise the request's force densities.
///
/// `on_report` receives each intermediate snapshot (`Finished = false`) when
/// the request asks for iteration reports.  The final snapshot
/// (`Finished = true`) is returned.  A chunk that fails after the first one
/// ends the run at the best point found so far.
///
/// Within a chunk the bounds act as a softplus penalty on the loss; between
/// chunks the force densities are projected onto `[LowerBound, UpperBound]`,
/// so every reported `Q` lies inside them.
pub fn optimize<F>(request: &OptimizationRequest, mut on_report: F) -> FdmResult<ProgressMessage>
where
    F: FnMut(&ProgressMessage),
{
    let (context, settings) = context_from_request(request)?;
    let mut q = request.q.clone();
    let mut trace = vec![evaluate(&context, &q)?.loss];
    let mut iter = 0;
    let chunk_size = settings.update_frequency.max(1);

    info!(
        edges = context.num_edges(),
        objectives = context.objectives.len(),
        max_iterations = settings.max_iterations,
        "starting force-density optimisation"
    );

    while iter < settings.max_iterations {
        let budget = chunk_size.min(settings.max_iterations - iter);
        let chunk = match run_chunk(&context, &settings, q.clone(), budget) {
            Ok(chunk) => chunk,
            Err(e) if iter > 0 => {
                warn!(error = %e, iter, "optimisation chunk failed; keeping best result");
                break;
            }
            Err(e) => return Err(e),
        };
        q = project(&chunk.q, settings.lower_bound, settings.upper_bound);
        iter += chunk.iterations;
        let loss = if q == chunk.q { chunk.loss } else { evaluate(&context, &q)?.loss };
        trace.push(loss);
        debug!(iter, loss, "optimisation chunk finished");

        if chunk.converged || chunk.iterations == 0 || iter >= settings.max_iterations {
            break;
        }
        if settings.show_iterations {
            on_report(&progress_message(&context, &q, iter, false, &trace)?);
        }
    }

    let last = progress_message(&context, &q, iter, true, &trace)?;
    info!(iter, loss = last.loss, "optimisation finished");
    Ok(last)
}
