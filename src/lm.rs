//! Adaptive-damping Levenberg–Marquardt driver (spec §4.E).
//!
//! Repeatedly accumulates normal equations at the current `x`, forms
//! `A = JtJ + λ·diag(JtJ)`, solves `Aδ = −Jᵀr`, and accepts the step iff
//! the cost at `x + δ` improves on the cost at `x`. Damping floors/caps at
//! `[1e-12, 1e12]` (spec §4.E step 2/3).

use nalgebra::DVector;

use crate::accumulate::{accumulate, cost_only};
use crate::error::Error;
use crate::linalg::solve_spd;
use crate::logger::{Logger, Tag};
use crate::residuals::Row;

const LAMBDA_FLOOR: f64 = 1e-12;
const LAMBDA_CAP: f64 = 1e12;

#[derive(Debug, Clone, Copy)]
pub struct LmOptions {
    pub tolerance: f64,
    pub max_iterations: usize,
    pub initial_damping: f64,
    /// `N_reject`: consecutive solve/step failures tolerated before giving up.
    pub max_attempts: usize,
}

impl Default for LmOptions {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            max_iterations: 100,
            initial_damping: 1e-3,
            max_attempts: 3,
        }
    }
}

pub struct LmResult {
    pub x: DVector<f64>,
    pub converged: bool,
    pub iterations: usize,
    pub cost: f64,
    pub error: Option<Error>,
}

/// Run the LM loop to convergence, the iteration cap, or a hard failure
/// (spec §4.E, §7).
pub fn optimize(n: usize, rows: &[Row], x0: &DVector<f64>, opts: &LmOptions, logger: &mut Logger) -> LmResult {
    let mut x = x0.clone();
    let mut lambda = opts.initial_damping;
    let mut iterations = 0usize;
    let mut consecutive_small = 0usize;
    let mut current_cost = cost_only(rows, &x);

    if !current_cost.is_finite() {
        logger.log(Tag::Warn, "initial cost is non-finite");
        return LmResult {
            x,
            converged: false,
            iterations: 0,
            cost: current_cost,
            error: Some(Error::NumericFailure("initial cost non-finite".into())),
        };
    }

    while iterations < opts.max_iterations {
        let eq = accumulate(n, rows, &x);
        let diag = eq.jtj.diagonal();

        let mut reject_count = 0usize;
        let mut nonfinite_count = 0usize;
        let step = loop {
            let lambda_vec = &diag * lambda;
            let a = eq.jtj.add_diagonal(&lambda_vec);

            let solved = solve_spd(&a, &eq.neg_jtr);
            match solved {
                Some(delta) => {
                    let candidate = &x + &delta;
                    let candidate_cost = cost_only(rows, &candidate);
                    if !candidate_cost.is_finite() {
                        nonfinite_count += 1;
                        lambda = (lambda * 10.0).min(LAMBDA_CAP);
                    } else if candidate_cost < eq.cost {
                        lambda = (lambda / 10.0).max(LAMBDA_FLOOR);
                        break Some((delta, candidate_cost));
                    } else {
                        reject_count += 1;
                        lambda = (lambda * 10.0).min(LAMBDA_CAP);
                    }
                }
                None => {
                    reject_count += 1;
                    lambda = (lambda * 10.0).min(LAMBDA_CAP);
                }
            }

            if nonfinite_count > opts.max_attempts {
                break None;
            }
            if reject_count > opts.max_attempts {
                break None;
            }
        };

        let Some((delta, new_cost)) = step else {
            let err = if nonfinite_count > opts.max_attempts {
                Error::NumericFailure("residual or gradient repeatedly non-finite".into())
            } else {
                Error::Diverged { iterations }
            };
            logger.log(Tag::Warn, format!("lm stopped: {err}"));
            return LmResult {
                x,
                converged: false,
                iterations,
                cost: current_cost,
                error: Some(err),
            };
        };

        iterations += 1;
        let delta_inf = delta.amax();
        let x_inf = x.amax();
        let rel_cost_change = (eq.cost - new_cost).abs() / (eq.cost.abs() + 1e-300);

        x += &delta;
        current_cost = new_cost;

        logger.log(Tag::Solve, format!("iter {iterations}: cost={current_cost:.6} lambda={lambda:.3e}"));

        if rel_cost_change < opts.tolerance {
            consecutive_small += 1;
        } else {
            consecutive_small = 0;
        }

        if consecutive_small >= 2 || delta_inf / (x_inf + 1e-12) < opts.tolerance {
            return LmResult {
                x,
                converged: true,
                iterations,
                cost: current_cost,
                error: None,
            };
        }
    }

    LmResult {
        x,
        converged: false,
        iterations,
        cost: current_cost,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::residuals::Coord;
    use approx::assert_relative_eq;

    #[test]
    fn converges_on_simple_quadratic() {
        // residual = x0 - 5; minimizing sum of squares should drive x0 -> 5.
        let row = Row::new(vec![Coord::free(0)], |x: &DVector<f64>| (x[0] - 5.0, vec![1.0]));
        let x0 = DVector::from_vec(vec![0.0]);
        let mut logger = Logger::new(false);
        let result = optimize(1, &[row], &x0, &LmOptions::default(), &mut logger);
        assert!(result.converged);
        assert_relative_eq!(result.x[0], 5.0, epsilon = 1e-5);
    }

    #[test]
    fn converges_on_two_variable_system() {
        let row_a = Row::new(vec![Coord::free(0)], |x: &DVector<f64>| (x[0] - 3.0, vec![1.0]));
        let row_b = Row::new(vec![Coord::free(1)], |x: &DVector<f64>| (x[1] + 2.0, vec![1.0]));
        let x0 = DVector::from_vec(vec![0.0, 0.0]);
        let mut logger = Logger::new(false);
        let result = optimize(2, &[row_a, row_b], &x0, &LmOptions::default(), &mut logger);
        assert!(result.converged);
        assert_relative_eq!(result.x[0], 3.0, epsilon = 1e-5);
        assert_relative_eq!(result.x[1], -2.0, epsilon = 1e-5);
    }
}
