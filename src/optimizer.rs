//! L-BFGS driver via the `argmin` crate.
//!
//! Minimises `½‖E(x)‖²` for any [`LeastSquaresTraits`] object, with the
//! gradient `Jᵀ·E` assembled from the analytic Jacobian.  The traits object
//! must already be initialised.
//!
//! Uses `Vec<f64>` as the argmin parameter type to avoid ndarray version
//! conflicts between our ndarray 0.16 and argmin-math's bundled ndarray.

use crate::types::{IterationControl, LeastSquaresTraits, SeamlessError};
use argmin::core::{CostFunction, Executor, Gradient, State};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use std::cell::{Cell, RefCell};

#[derive(Debug, Clone, Copy)]
pub struct OptimizerOptions {
    pub max_iterations: usize,
    /// L-BFGS correction pairs.
    pub memory: usize,
}

impl Default for OptimizerOptions {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            memory: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OptimizerResult {
    /// Best reduced state found.
    pub x: Vec<f64>,
    pub cost: f64,
    pub initial_cost: f64,
    pub iterations: usize,
    /// Integration infeasibility at `x`.
    pub integrability: f64,
    /// Set when a `post_iteration` hook asked to stop.
    pub stop_requested: bool,
}

// ─────────────────────────────────────────────────────────────
//  argmin problem wrapper
// ─────────────────────────────────────────────────────────────

/// `RefCell` because argmin's traits take `&self` while the iteration hooks
/// need `&mut`.  The last `(x, cost, gradient)` is cached since argmin asks
/// for cost and gradient separately at the same point.
struct LeastSquaresProblem<'a, T: LeastSquaresTraits> {
    traits: RefCell<&'a mut T>,
    last_eval: RefCell<Option<(Vec<f64>, f64, Vec<f64>)>>,
    stop_requested: &'a Cell<bool>,
}

/// `½‖E‖²` and `Jᵀ·E` at `x`.
fn cost_and_gradient<T: LeastSquaresTraits + ?Sized>(
    traits: &T,
    x: &[f64],
) -> Result<(f64, Vec<f64>), SeamlessError> {
    let eval = traits.objective_jacobian(x, true)?;
    let cost = 0.5 * eval.residual.iter().map(|e| e * e).sum::<f64>();

    let mut grad = vec![0.0; x.len()];
    if let Some(jac) = &eval.jacobian {
        for (&v, (r, c)) in jac.iter() {
            grad[c] += v * eval.residual[r];
        }
    }
    Ok((cost, grad))
}

impl<'a, T: LeastSquaresTraits> LeastSquaresProblem<'a, T> {
    fn ensure_evaluated(&self, x: &[f64]) -> Result<(), argmin::core::Error> {
        {
            let cached = self.last_eval.borrow();
            if let Some((ref t, _, _)) = *cached {
                if t == x {
                    return Ok(());
                }
            }
        }

        let mut traits = self.traits.borrow_mut();
        traits.pre_iteration(x);
        let (cost, grad) = cost_and_gradient(&**traits, x)
            .map_err(|e| argmin::core::Error::msg(e.to_string()))?;
        if traits.post_iteration(x) == IterationControl::Stop {
            self.stop_requested.set(true);
        }
        *self.last_eval.borrow_mut() = Some((x.to_vec(), cost, grad));
        Ok(())
    }

    fn cached<R>(&self, f: impl FnOnce(&(Vec<f64>, f64, Vec<f64>)) -> R) -> Result<R, argmin::core::Error> {
        self.last_eval
            .borrow()
            .as_ref()
            .map(f)
            .ok_or_else(|| argmin::core::Error::msg("no cached evaluation"))
    }
}

impl<'a, T: LeastSquaresTraits> CostFunction for LeastSquaresProblem<'a, T> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, x: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
        self.ensure_evaluated(x)?;
        self.cached(|(_, cost, _)| *cost)
    }
}

impl<'a, T: LeastSquaresTraits> Gradient for LeastSquaresProblem<'a, T> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, x: &Self::Param) -> Result<Self::Gradient, argmin::core::Error> {
        self.ensure_evaluated(x)?;
        self.cached(|(_, _, grad)| grad.clone())
    }
}

// ─────────────────────────────────────────────────────────────
//  Entry point
// ─────────────────────────────────────────────────────────────

/// Run L-BFGS from the traits object's initial solution.
pub fn minimize<T: LeastSquaresTraits>(
    traits: &mut T,
    options: &OptimizerOptions,
) -> Result<OptimizerResult, SeamlessError> {
    let x0 = traits.initial_solution()?;
    let (initial_cost, _) = cost_and_gradient(&*traits, &x0)?;
    if !initial_cost.is_finite() {
        return Err(SeamlessError::Solver(format!(
            "initial cost is not finite ({initial_cost})"
        )));
    }
    log::debug!("L-BFGS start: {} unknowns, cost {:.6e}", x0.len(), initial_cost);

    let stop_requested = Cell::new(false);
    let problem = LeastSquaresProblem {
        traits: RefCell::new(&mut *traits),
        last_eval: RefCell::new(None),
        stop_requested: &stop_requested,
    };

    let linesearch = MoreThuenteLineSearch::new();
    let solver = LBFGS::new(linesearch, options.memory);

    let result = Executor::new(problem, solver)
        .configure(|config| {
            config
                .param(x0)
                .max_iters(options.max_iterations as u64)
                .target_cost(f64::NEG_INFINITY)
        })
        .run()?;

    let state = result.state();
    let x = state
        .get_best_param()
        .cloned()
        .ok_or_else(|| SeamlessError::Solver("L-BFGS returned no best parameters".into()))?;
    let cost = state.get_best_cost();
    let iterations = state.get_iter() as usize;
    drop(result);
    let stop_requested = stop_requested.get();

    let integrability = traits.objective_jacobian(&x, false)?.integrability;
    log::info!(
        "L-BFGS done: {iterations} iterations, cost {initial_cost:.6e} → {cost:.6e}, integrability {integrability:.6e}"
    );

    Ok(OptimizerResult {
        x,
        cost,
        initial_cost,
        iterations,
        integrability,
        stop_requested,
    })
}
