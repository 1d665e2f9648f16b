//! The Riemannian staircase: dimension lifting, descent initialization and
//! the level-by-level driver.
//!
//! Each level solves the lifted problem at dimension p. A certified level
//! terminates the staircase; otherwise the minimum eigenvector of the
//! certificate matrix supplies an escape direction into dimension p+1,
//! where the saddle created by zero-padding can be walked down.

use nalgebra::DVector;
use rand::Rng;
use tracing::{info, warn};

use crate::averaging::{ShonanAveraging, ShonanResult};
use crate::config::DescentParams;
use crate::error::{Result, ShonanError};
use crate::geometry::SOn;
use crate::lifted::{Initialization, LiftedProblem, LiftedValues};
use crate::optimizer;

/// Per-level diagnostics collected by the driver.
#[derive(Debug, Clone)]
pub struct LevelDiagnostic {
    /// Staircase level.
    pub p: usize,

    /// Cost of the locally optimal solution at this level.
    pub cost: f64,

    /// Minimum eigenvalue of the certificate matrix.
    pub min_eigenvalue: f64,

    /// Nonlinear-solver iterations spent.
    pub iterations: usize,
}

/// Tangent vector at SO(p) that is zero except for the coordinates rotating
/// the first d axes into the newest dimension, filled from eigenvector
/// segment v_i. The trailing p-1 tangent coordinates address exactly those
/// rotations under the basis ordering of [`crate::geometry::tangent_pairs`].
pub fn make_a_tangent_vector(p: usize, d: usize, v: &DVector<f64>, i: usize) -> DVector<f64> {
    debug_assert!(p > d);
    let dof = SOn::dimension(p);
    let base = dof - (p - 1);
    let mut xi = DVector::zeros(dof);
    for r in 0..d {
        xi[base + r] = v[d * i + r];
    }
    xi
}

/// One descent tangent per variable, assembled from the minimum eigenvector.
fn descent_directions(p: usize, d: usize, v: &DVector<f64>, n: usize) -> Vec<DVector<f64>> {
    (0..n).map(|i| make_a_tangent_vector(p, d, v, i)).collect()
}

/// Embeds values into dimension p+1 and perturbs along the descent tangent
/// built from the minimum eigenvector. With a zero eigenvector this is the
/// plain embedding, exactly.
pub fn dimension_lifting(
    values: &LiftedValues,
    min_eigen_vector: &DVector<f64>,
    d: usize,
    lift_step: f64,
) -> LiftedValues {
    let p_next = values.p() + 1;
    let lifted = values.embed(p_next);
    if min_eigen_vector.norm() == 0.0 {
        return lifted;
    }
    let dirs = descent_directions(p_next, d, min_eigen_vector, values.len());
    lifted.retract_all(&dirs, lift_step)
}

/// Backtracking line search along the descent direction at dimension p+1.
///
/// Accepts the first step that both achieves the second-order sufficient
/// decrease and leaves a gradient the next solve can follow; falls back to
/// the best decreasing step, then to a minimal nudge off the saddle.
pub fn initialize_with_descent(
    problem: &LiftedProblem,
    values: &LiftedValues,
    min_eigen_vector: &DVector<f64>,
    min_eigenvalue: f64,
    params: &DescentParams,
) -> LiftedValues {
    let p_next = values.p() + 1;
    debug_assert_eq!(problem.p(), p_next);
    let base = values.embed(p_next);
    if min_eigen_vector.norm() == 0.0 {
        return base;
    }
    let dirs = descent_directions(p_next, problem.d(), min_eigen_vector, values.len());
    let base_cost = problem.cost(&base);

    let mut step = params.initial_step;
    let mut fallback: Option<LiftedValues> = None;
    for _ in 0..params.max_backtracks {
        let candidate = base.retract_all(&dirs, step);
        let cost = problem.cost(&candidate);
        let expected_gain = params.sufficient_decrease * step * step * min_eigenvalue.abs();
        if cost < base_cost - expected_gain {
            let grad_norm = problem.gradient_norm(&candidate);
            if grad_norm >= params.grad_tolerance {
                return candidate;
            }
            if grad_norm < params.grad_norm_tolerance {
                warn!(step, grad_norm, "descent step left a near-zero gradient");
            }
            if fallback.is_none() {
                fallback = Some(candidate);
            }
        }
        step *= 0.5;
    }

    match fallback {
        Some(candidate) => candidate,
        None => {
            warn!(
                min_eigenvalue,
                "line search found no decreasing step, nudging off the saddle"
            );
            base.retract_all(&dirs, params.min_step)
        }
    }
}

/// Runs the staircase from p_min up to p_max.
///
/// Terminal outcomes: a certified level (result flagged `certified`), the
/// ceiling reached without certification (best solution, `certified` false,
/// negative diagnostic eigenvalue), or a hard error when no level could be
/// solved at all or the eigensolver failed.
pub fn run<R: Rng + ?Sized>(
    shonan: &ShonanAveraging,
    p_min: usize,
    p_max: usize,
    with_descent: bool,
    init: Initialization,
    rng: &mut R,
) -> Result<ShonanResult> {
    let d = shonan.measurements().d();
    if p_min < d {
        return Err(ShonanError::InvalidConfig(format!(
            "p_min={p_min} is below the ambient dimension {d}"
        )));
    }
    if p_max < p_min {
        return Err(ShonanError::InvalidConfig(format!(
            "p_max={p_max} is below p_min={p_min}"
        )));
    }

    let params = shonan.params();
    let mut next_init = match init {
        Initialization::Given(values) => {
            if values.p() != p_min {
                return Err(ShonanError::InvalidConfig(format!(
                    "initial values have dimension {}, expected p_min={p_min}",
                    values.p()
                )));
            }
            Some(values)
        }
        Initialization::Random => None,
    };

    let mut levels = Vec::new();
    let mut latest: Option<(LiftedValues, f64)> = None;
    let mut last_divergence = None;

    for p in p_min..=p_max {
        let problem = shonan.build_graph_at(p);

        let mut outcome = None;
        for attempt in 0..=params.divergence_retries {
            let initial = next_init
                .take()
                .unwrap_or_else(|| shonan.initialize_randomly_at(p, rng));
            match optimizer::solve(&problem, initial, &params.lm) {
                Ok(o) => {
                    outcome = Some(o);
                    break;
                }
                Err(err @ ShonanError::SolverDivergence { .. }) => {
                    warn!(p, attempt, "nonlinear solve diverged, re-randomizing");
                    last_divergence = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        let Some(out) = outcome else {
            warn!(p, "level abandoned after retries");
            continue;
        };

        let (min_eigenvalue, min_eigen_vector) = shonan.min_eigen_pair(&out.values, rng)?;
        info!(
            p,
            cost = out.final_cost,
            min_eigenvalue,
            iterations = out.iterations,
            "staircase level complete"
        );
        levels.push(LevelDiagnostic {
            p,
            cost: out.final_cost,
            min_eigenvalue,
            iterations: out.iterations,
        });

        if min_eigenvalue >= params.optimality_threshold {
            return shonan.finish(out.values, min_eigenvalue, true, levels);
        }

        if p < p_max {
            next_init = Some(if with_descent {
                let next_problem = shonan.build_graph_at(p + 1);
                initialize_with_descent(
                    &next_problem,
                    &out.values,
                    &min_eigen_vector,
                    min_eigenvalue,
                    &params.descent,
                )
            } else {
                dimension_lifting(&out.values, &min_eigen_vector, d, params.descent.lift_step)
            });
        }
        latest = Some((out.values, min_eigenvalue));
    }

    match latest {
        Some((values, min_eigenvalue)) => {
            warn!(
                p_max,
                min_eigenvalue, "staircase exhausted without certification"
            );
            shonan.finish(values, min_eigenvalue, false, levels)
        }
        None => Err(last_divergence.unwrap_or(ShonanError::SolverDivergence {
            p: p_max,
            iterations: 0,
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::{compute_a, compute_lambda_at, min_eigenpair};
    use crate::config::EigenParams;
    use crate::graph::edge_weights;
    use crate::measurement::{Key, MeasurementSet, RotationMeasurement};
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::f64::consts::TAU;

    fn rot2(theta: f64) -> DMatrix<f64> {
        DMatrix::from_row_slice(2, 2, &[theta.cos(), -theta.sin(), theta.sin(), theta.cos()])
    }

    /// 5-cycle of identity measurements in SO(2); the evenly wound
    /// configuration is a stationary point that is not globally optimal.
    fn winding_cycle() -> (MeasurementSet, LiftedValues) {
        let poses = (0..5).map(|k| (Key(k), DMatrix::identity(2, 2))).collect();
        let measurements = (0..5)
            .map(|k| RotationMeasurement::new(Key(k), Key((k + 1) % 5), DMatrix::identity(2, 2)))
            .collect();
        let set = MeasurementSet::new(2, poses, measurements).unwrap();
        let winding = LiftedValues::new(
            2,
            (0..5)
                .map(|k| SOn::from_matrix_unchecked(rot2(TAU * k as f64 / 5.0)))
                .collect(),
        );
        (set, winding)
    }

    #[test]
    fn test_make_a_tangent_vector_placement() {
        let v = DVector::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        // p = 4, d = 3, variable 1.
        let xi = make_a_tangent_vector(4, 3, &v, 1);
        assert_eq!(xi.len(), SOn::dimension(4));
        // Leading coordinates untouched, trailing row carries v_1.
        assert_relative_eq!(xi.rows(0, 3).into_owned(), DVector::zeros(3), epsilon = 0.0);
        assert_relative_eq!(
            xi.rows(3, 3).into_owned(),
            DVector::from_vec(vec![4.0, 5.0, 6.0]),
            epsilon = 0.0
        );
    }

    #[test]
    fn test_dimension_lifting_zero_vector_is_embedding() {
        let mut rng = StdRng::seed_from_u64(61);
        let values = LiftedValues::random(3, 4, &mut rng);
        let zero = DVector::zeros(3 * 4);
        let lifted = dimension_lifting(&values, &zero, 3, 1.0);
        assert_eq!(lifted.p(), 4);
        for (orig, up) in values.rotations().iter().zip(lifted.rotations()) {
            assert_relative_eq!(
                up.matrix().view((0, 0), (3, 3)).into_owned(),
                orig.matrix().clone(),
                epsilon = 0.0
            );
            assert_relative_eq!(up.matrix()[(3, 3)], 1.0, epsilon = 0.0);
        }
    }

    #[test]
    fn test_winding_cycle_is_stationary_but_suboptimal() {
        let (set, winding) = winding_cycle();
        let weights = edge_weights(&set, false, 0.0);
        let problem = LiftedProblem::build(&set, &weights, 2, None);

        // Stationary: coordinate gradient vanishes.
        assert!(problem.gradient_norm(&winding) < 1e-9);
        // Suboptimal: the consistent solution has zero cost.
        assert!(problem.cost(&winding) > 1.0);

        // The certificate detects it.
        let lambda = compute_lambda_at(&set, &weights, &winding);
        let a = compute_a(&set, &weights, &lambda).unwrap();
        let mut rng = StdRng::seed_from_u64(67);
        let (min_eig, _) = min_eigenpair(&a, &EigenParams::default(), &mut rng).unwrap();
        assert!(min_eig < -1e-3, "expected negative certificate, got {min_eig}");
    }

    #[test]
    fn test_descent_initialization_escapes_winding() {
        let (set, winding) = winding_cycle();
        let weights = edge_weights(&set, false, 0.0);
        let p2 = LiftedProblem::build(&set, &weights, 2, None);
        let p3 = LiftedProblem::build(&set, &weights, 3, None);

        let lambda = compute_lambda_at(&set, &weights, &winding);
        let a = compute_a(&set, &weights, &lambda).unwrap();
        let mut rng = StdRng::seed_from_u64(71);
        let (min_eig, min_vec) = min_eigenpair(&a, &EigenParams::default(), &mut rng).unwrap();
        assert!(min_eig < 0.0);

        let lifted = initialize_with_descent(
            &p3,
            &winding,
            &min_vec,
            min_eig,
            &DescentParams::default(),
        );
        assert_eq!(lifted.p(), 3);
        assert!(
            p3.cost(&lifted) < p2.cost(&winding),
            "descent step must strictly decrease cost"
        );
    }
}
