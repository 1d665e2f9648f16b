//! Levenberg-Marquardt over lifted rotation variables.
//!
//! Parameters live in the tangent space at the current iterate; every
//! accepted step is pushed back onto SO(p)^N through the QR retraction, so
//! the linearization is always taken at a feasible point.

use nalgebra::DVector;
use tracing::debug;

use crate::config::LmParams;
use crate::error::{Result, ShonanError};
use crate::lifted::{LiftedProblem, LiftedValues};

const DAMPING_UP: f64 = 10.0;
const DAMPING_DOWN: f64 = 0.1;
const MIN_DAMPING: f64 = 1e-12;
const MAX_DAMPING: f64 = 1e12;

/// Result of one nonlinear solve.
#[derive(Debug)]
pub struct LmOutcome {
    /// Locally optimal lifted values.
    pub values: LiftedValues,

    /// Number of iterations.
    pub iterations: usize,

    /// Cost at the initial point.
    pub initial_cost: f64,

    /// Cost at the returned point.
    pub final_cost: f64,
}

/// Minimizes the lifted problem from `initial`.
///
/// Returns `SolverDivergence` when the iteration cap is reached (or the
/// damping range is exhausted) without meeting any convergence criterion.
pub fn solve(
    problem: &LiftedProblem,
    initial: LiftedValues,
    params: &LmParams,
) -> Result<LmOutcome> {
    let dof = problem.dof();
    let n_params = problem.n_vars() * dof;

    let mut current = initial;
    let mut current_cost = problem.cost(&current);
    let initial_cost = current_cost;
    let mut damping = params.initial_damping;
    let mut converged = false;
    let mut iterations = 0;

    for iter in 0..params.max_iterations {
        iterations = iter + 1;

        let (residuals, jacobian) = problem.residual_and_jacobian(&current);
        let gradient = jacobian.transpose() * &residuals;
        let gradient_norm = 2.0 * gradient.norm();
        if gradient_norm < params.gradient_tolerance {
            converged = true;
            break;
        }

        let jtj = jacobian.transpose() * &jacobian;
        let mut damped = jtj.clone();
        for i in 0..n_params {
            damped[(i, i)] += damping * damped[(i, i)].max(1e-6);
        }

        let delta = match damped.lu().solve(&(-&gradient)) {
            Some(d) => d,
            None => {
                damping = (damping * DAMPING_UP).min(MAX_DAMPING);
                continue;
            }
        };

        if delta.norm() < params.param_tolerance {
            converged = true;
            break;
        }

        let trial = apply_step(&current, &delta, dof);
        let trial_cost = problem.cost(&trial);

        debug!(
            iter,
            cost = current_cost,
            trial_cost,
            gradient_norm,
            damping,
            "lm iteration"
        );

        if trial_cost < current_cost {
            let relative_decrease = (current_cost - trial_cost) / current_cost.max(1e-300);
            current = trial;
            current_cost = trial_cost;
            damping = (damping * DAMPING_DOWN).max(MIN_DAMPING);
            if relative_decrease < params.cost_tolerance {
                converged = true;
                break;
            }
        } else {
            damping *= DAMPING_UP;
            if damping > MAX_DAMPING {
                break;
            }
        }
    }

    if !converged {
        return Err(ShonanError::SolverDivergence {
            p: problem.p(),
            iterations,
        });
    }

    Ok(LmOutcome {
        values: current,
        iterations,
        initial_cost,
        final_cost: current_cost,
    })
}

/// Splits a stacked tangent step into per-variable directions and retracts.
fn apply_step(values: &LiftedValues, delta: &DVector<f64>, dof: usize) -> LiftedValues {
    let directions: Vec<DVector<f64>> = (0..values.len())
        .map(|v| delta.rows(v * dof, dof).into_owned())
        .collect();
    values.retract_all(&directions, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::edge_weights;
    use crate::measurement::{Key, MeasurementSet, RotationMeasurement};
    use approx::assert_relative_eq;
    use nalgebra::{DMatrix, Rotation3, Vector3};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rot_z(ang: f64) -> DMatrix<f64> {
        DMatrix::from_fn(3, 3, |r, c| {
            Rotation3::from_axis_angle(&Vector3::z_axis(), ang).matrix()[(r, c)]
        })
    }

    fn consistent_chain() -> MeasurementSet {
        let poses = (0..3).map(|k| (Key(k), DMatrix::identity(3, 3))).collect();
        let measurements = vec![
            RotationMeasurement::new(Key(0), Key(1), rot_z(0.5)),
            RotationMeasurement::new(Key(1), Key(2), rot_z(-0.2)),
        ];
        MeasurementSet::new(3, poses, measurements).unwrap()
    }

    #[test]
    fn test_converges_to_zero_cost_on_consistent_chain() {
        let set = consistent_chain();
        let weights = edge_weights(&set, false, 0.0);
        let problem = LiftedProblem::build(
            &set,
            &weights,
            4,
            Some((0, DMatrix::identity(3, 3), 1.0)),
        );
        let mut rng = StdRng::seed_from_u64(17);
        let initial = LiftedValues::random(4, 3, &mut rng);
        let outcome = solve(&problem, initial, &LmParams::default()).unwrap();
        assert!(outcome.final_cost <= outcome.initial_cost);
        assert_relative_eq!(outcome.final_cost, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_immediate_convergence_at_stationary_point() {
        let set = consistent_chain();
        let weights = edge_weights(&set, false, 0.0);
        let problem = LiftedProblem::build(&set, &weights, 3, None);
        // The chain's exact solution is a stationary point with zero cost.
        let r01 = rot_z(0.5);
        let values = LiftedValues::new(
            3,
            vec![
                crate::geometry::SOn::identity(3),
                crate::geometry::SOn::from_matrix_unchecked(r01.clone()),
                crate::geometry::SOn::from_matrix_unchecked(&r01 * rot_z(-0.2)),
            ],
        );
        let outcome = solve(&problem, values, &LmParams::default()).unwrap();
        assert_relative_eq!(outcome.final_cost, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_zero_iteration_cap_is_divergence() {
        let set = consistent_chain();
        let weights = edge_weights(&set, false, 0.0);
        let problem = LiftedProblem::build(&set, &weights, 3, None);
        let mut rng = StdRng::seed_from_u64(31);
        let initial = LiftedValues::random(3, 3, &mut rng);
        let params = LmParams {
            max_iterations: 0,
            ..LmParams::default()
        };
        let err = solve(&problem, initial, &params).unwrap_err();
        assert!(matches!(err, ShonanError::SolverDivergence { p: 3, .. }));
    }
}
