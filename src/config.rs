//! Configuration for the rotation-averaging solver.

use serde::{Deserialize, Serialize};

/// Parameters governing the whole averaging run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShonanParams {
    /// Attach a chordal gauge prior on the anchor (first) key.
    /// Default: true
    pub prior: bool,

    /// Use the chordal mean of the initial rotations as the prior target
    /// instead of the identity. Only meaningful when `prior` is set.
    /// Default: true
    pub karcher: bool,

    /// Per-edge noise sigma. When positive, measurements without an explicit
    /// weight are weighted by 1/sigma^2; when zero, noise weighting is
    /// disabled and unweighted edges get weight 1.
    /// Default: 0.0
    pub noise_sigma: f64,

    /// Certification threshold on the minimum eigenvalue of the certificate
    /// matrix. Slightly negative to absorb numerical noise.
    /// Default: -1e-4
    pub optimality_threshold: f64,

    /// First staircase level.
    /// Default: 5
    pub p_min: usize,

    /// Staircase ceiling.
    /// Default: 20
    pub p_max: usize,

    /// Initialize each new level by line search along the descent direction
    /// instead of a plain lifted perturbation.
    /// Default: true
    pub with_descent: bool,

    /// Re-randomized retries after a solver divergence at one level before
    /// the level is abandoned.
    /// Default: 1
    pub divergence_retries: usize,

    /// Nested nonlinear-solver parameters.
    pub lm: LmParams,

    /// Nested eigensolver parameters.
    pub eigen: EigenParams,

    /// Nested lift / line-search parameters.
    pub descent: DescentParams,
}

impl Default for ShonanParams {
    fn default() -> Self {
        Self {
            prior: true,
            karcher: true,
            noise_sigma: 0.0,
            optimality_threshold: -1e-4,
            p_min: 5,
            p_max: 20,
            with_descent: true,
            divergence_retries: 1,
            lm: LmParams::default(),
            eigen: EigenParams::default(),
            descent: DescentParams::default(),
        }
    }
}

/// Levenberg-Marquardt parameters for the per-level nonlinear solve.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LmParams {
    /// Maximum number of LM iterations.
    /// Default: 100
    pub max_iterations: usize,

    /// Convergence threshold on parameter change.
    /// Default: 1e-10
    pub param_tolerance: f64,

    /// Convergence threshold on gradient norm.
    /// Default: 1e-7
    pub gradient_tolerance: f64,

    /// Convergence threshold on relative cost decrease of an accepted step.
    /// Default: 1e-12
    pub cost_tolerance: f64,

    /// Initial damping value.
    /// Default: 1e-3
    pub initial_damping: f64,
}

impl Default for LmParams {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            param_tolerance: 1e-10,
            gradient_tolerance: 1e-7,
            cost_tolerance: 1e-12,
            initial_damping: 1e-3,
        }
    }
}

/// Parameters for the shifted power iteration used on the certificate matrix.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EigenParams {
    /// Iteration cap before reporting `EigensolverFailure`.
    /// Default: 50_000
    pub max_iterations: usize,

    /// Relative residual tolerance on the eigenpair.
    /// Default: 1e-7
    pub tolerance: f64,
}

impl Default for EigenParams {
    fn default() -> Self {
        Self {
            max_iterations: 50_000,
            tolerance: 1e-7,
        }
    }
}

/// Parameters for dimension lifting and the descent line search.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DescentParams {
    /// Step applied along the descent tangent by plain dimension lifting.
    /// Default: 1.0
    pub lift_step: f64,

    /// Initial step of the backtracking line search.
    /// Default: 1.0
    pub initial_step: f64,

    /// Maximum number of halvings in the line search.
    /// Default: 20
    pub max_backtracks: usize,

    /// Sufficient-decrease coefficient on the expected second-order gain.
    /// Default: 1e-4
    pub sufficient_decrease: f64,

    /// Fallback step when no backtracking candidate is accepted.
    /// Default: 1e-6
    pub min_step: f64,

    /// Riemannian gradient norm the accepted point must exceed so the next
    /// solve does not stall on the lifted saddle.
    /// Default: 1e-2
    pub grad_tolerance: f64,

    /// Gradient norm below which the accepted point is reported as weak.
    /// Default: 1e-4
    pub grad_norm_tolerance: f64,
}

impl Default for DescentParams {
    fn default() -> Self {
        Self {
            lift_step: 1.0,
            initial_step: 1.0,
            max_backtracks: 20,
            sufficient_decrease: 1e-4,
            min_step: 1e-6,
            grad_tolerance: 1e-2,
            grad_norm_tolerance: 1e-4,
        }
    }
}
