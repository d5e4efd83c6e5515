//! Projected Levenberg-Marquardt for constrained nonlinear least squares.
//!
//! References:
//! - Levenberg (1944), Marquardt (1963).
//! - Kanzow, Yamashita and Fukushima (2004), projected LM for convex constraints.
//!
//! Steps are computed on the unconstrained damped normal equations, projected back onto
//! the feasible set, and accepted only when the objective strictly decreases. The final
//! objective is therefore never above the objective at the (projected) starting point.

use nalgebra::{DMatrix, DVector};

use crate::core::CreditError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    GradientTolerance,
    StepTolerance,
    ObjectiveTolerance,
    Stagnation,
    MaxIterations,
    NumericalFailure,
}

#[derive(Debug, Clone, Copy)]
pub struct LmOptions {
    pub max_iterations: usize,
    pub initial_lambda: f64,
    pub lambda_up: f64,
    pub lambda_down: f64,
    pub gradient_tolerance: f64,
    pub step_tolerance: f64,
    pub objective_tolerance: f64,
    pub max_stagnation: usize,
}

impl Default for LmOptions {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            initial_lambda: 1e-3,
            lambda_up: 4.0,
            lambda_down: 0.3,
            gradient_tolerance: 1e-12,
            step_tolerance: 1e-12,
            objective_tolerance: 1e-16,
            max_stagnation: 25,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LeastSquaresResult {
    pub x: Vec<f64>,
    /// Half the sum of squared residuals at `x`.
    pub objective: f64,
    /// Half the sum of squared residuals at the projected starting point.
    pub initial_objective: f64,
    pub iterations: usize,
    pub converged: bool,
    pub reason: TerminationReason,
}

#[inline]
fn least_squares_objective(residuals: &[f64]) -> f64 {
    0.5 * residuals.iter().map(|r| r * r).sum::<f64>()
}

/// Minimizes `0.5 * |r(x)|^2` subject to `x` staying in the set enforced by `project`.
///
/// `jacobian_fn` must return the `m x n` Jacobian of `residual_fn` at `x`.
pub fn projected_levenberg_marquardt<R, J, P>(
    initial: &[f64],
    options: LmOptions,
    mut residual_fn: R,
    mut jacobian_fn: J,
    project: P,
) -> Result<LeastSquaresResult, CreditError>
where
    R: FnMut(&[f64]) -> Vec<f64>,
    J: FnMut(&[f64]) -> DMatrix<f64>,
    P: Fn(&mut [f64]),
{
    if initial.is_empty() {
        return Err(CreditError::invalid("LM requires a non-empty parameter vector"));
    }

    let mut x = initial.to_vec();
    project(&mut x);
    let mut residuals = residual_fn(&x);
    if residuals.is_empty() {
        return Err(CreditError::invalid(
            "LM residual function returned empty residual vector",
        ));
    }

    let mut objective = least_squares_objective(&residuals);
    if !objective.is_finite() {
        return Err(CreditError::NumericalError(
            "LM objective is not finite at initial point".to_string(),
        ));
    }
    let initial_objective = objective;

    let mut lambda = options.initial_lambda.max(1e-12);
    let mut iterations = 0usize;
    let mut reason = TerminationReason::MaxIterations;
    let mut converged = false;
    let mut stagnation = 0usize;
    let mut jacobian = jacobian_fn(&x);

    for iter in 0..options.max_iterations {
        iterations = iter + 1;

        let r_vec = DVector::from_column_slice(&residuals);
        let jt = jacobian.transpose();
        let mut a = &jt * &jacobian;
        let g = &jt * r_vec;

        let gradient_norm = g.norm();
        if !gradient_norm.is_finite() {
            reason = TerminationReason::NumericalFailure;
            break;
        }
        if gradient_norm <= options.gradient_tolerance {
            converged = true;
            reason = TerminationReason::GradientTolerance;
            break;
        }

        for i in 0..a.nrows() {
            a[(i, i)] += lambda * (a[(i, i)].abs() + 1.0);
        }

        let Some(delta) = a.cholesky().map(|c| c.solve(&(-&g))) else {
            lambda = (lambda * options.lambda_up).min(1e12);
            stagnation += 1;
            if stagnation >= options.max_stagnation {
                reason = TerminationReason::Stagnation;
                break;
            }
            continue;
        };

        let mut candidate = x.clone();
        for (c, d) in candidate.iter_mut().zip(delta.iter()) {
            *c += d;
        }
        project(&mut candidate);

        let step_norm = candidate
            .iter()
            .zip(x.iter())
            .map(|(c, p)| (c - p) * (c - p))
            .sum::<f64>()
            .sqrt();
        if step_norm <= options.step_tolerance {
            converged = true;
            reason = TerminationReason::StepTolerance;
            break;
        }

        let candidate_residuals = residual_fn(&candidate);
        let candidate_obj = least_squares_objective(&candidate_residuals);

        if candidate_obj.is_finite() && candidate_obj < objective {
            let improvement = objective - candidate_obj;
            x = candidate;
            residuals = candidate_residuals;
            objective = candidate_obj;
            jacobian = jacobian_fn(&x);
            lambda = (lambda * options.lambda_down).max(1e-12);
            stagnation = 0;

            if improvement <= options.objective_tolerance * objective.max(1e-300) {
                converged = true;
                reason = TerminationReason::ObjectiveTolerance;
                break;
            }
        } else {
            lambda = (lambda * options.lambda_up).min(1e12);
            stagnation += 1;
            if stagnation >= options.max_stagnation {
                reason = TerminationReason::Stagnation;
                break;
            }
        }
    }

    Ok(LeastSquaresResult {
        x,
        objective,
        initial_objective,
        iterations,
        converged,
        reason,
    })
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn fits_a_linear_model_exactly() {
        let xs = [0.0, 1.0, 2.0, 3.0];
        let ys = [1.0, 3.0, 5.0, 7.0];
        let result = projected_levenberg_marquardt(
            &[0.0, 0.0],
            LmOptions::default(),
            |p| xs.iter().zip(ys.iter()).map(|(x, y)| p[0] + p[1] * x - y).collect(),
            |_| DMatrix::from_fn(4, 2, |r, c| if c == 0 { 1.0 } else { xs[r] }),
            |_| {},
        )
        .unwrap();

        assert_relative_eq!(result.x[0], 1.0, epsilon = 1e-8);
        assert_relative_eq!(result.x[1], 2.0, epsilon = 1e-8);
        assert!(result.objective < 1e-14);
    }

    #[test]
    fn projection_keeps_iterates_feasible() {
        // Unconstrained optimum is x = 2, feasible set is x <= 1.
        let result = projected_levenberg_marquardt(
            &[0.0],
            LmOptions::default(),
            |p| vec![p[0] - 2.0],
            |_| DMatrix::from_element(1, 1, 1.0),
            |p: &mut [f64]| p[0] = p[0].min(1.0),
        )
        .unwrap();

        assert!(result.x[0] <= 1.0);
        assert_relative_eq!(result.x[0], 1.0, epsilon = 1e-9);
        assert!(result.objective <= result.initial_objective);
    }
}
