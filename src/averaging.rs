//! Public entry point: certifiable rotation averaging over a measurement set.
//!
//! `ShonanAveraging` owns the validated measurements, the sparse matrices
//! D, Q and L (built once, read-only afterwards) and the configuration, and
//! exposes both the staircase `run` and its individual building blocks for
//! diagnostic use.

use std::collections::HashMap;

use faer::sparse::SparseColMat;
use nalgebra::{DMatrix, DVector};
use rand::Rng;

use crate::certificate;
use crate::config::ShonanParams;
use crate::error::{Result, ShonanError};
use crate::geometry::SOn;
use crate::graph;
use crate::lifted::{Initialization, LiftedProblem, LiftedValues};
use crate::measurement::{Key, MeasurementSet};
use crate::optimizer;
use crate::staircase::{self, LevelDiagnostic};

/// Weight of the chordal gauge prior on the anchor key.
const GAUGE_PRIOR_WEIGHT: f64 = 1.0;

/// Outcome of a staircase run.
///
/// `certified` distinguishes a proven global optimum from the best-effort
/// solution returned when the staircase ceiling was reached; in the latter
/// case `min_eigenvalue` is negative and diagnostic only.
#[derive(Debug, Clone)]
pub struct ShonanResult {
    /// Estimated rotation per key, at the native dimension d.
    pub rotations: HashMap<Key, SOn>,

    /// Minimum eigenvalue of the certificate matrix at the final level.
    pub min_eigenvalue: f64,

    /// True when the final level passed the optimality check.
    pub certified: bool,

    /// Staircase level the result was produced at.
    pub final_p: usize,

    /// Weighted chordal cost of the rounded solution.
    pub cost: f64,

    /// Per-level diagnostics in staircase order.
    pub levels: Vec<LevelDiagnostic>,
}

/// Certifiable rotation averaging via the Riemannian staircase.
pub struct ShonanAveraging {
    params: ShonanParams,
    set: MeasurementSet,
    weights: Vec<f64>,
    d_mat: SparseColMat<usize, f64>,
    q_mat: SparseColMat<usize, f64>,
    l_mat: SparseColMat<usize, f64>,
    prior: Option<(usize, DMatrix<f64>, f64)>,
}

impl ShonanAveraging {
    /// Builds the solver from a validated measurement set. The sparse
    /// matrices are assembled here, once.
    pub fn new(set: MeasurementSet, params: ShonanParams) -> Result<Self> {
        let use_noise_model = params.noise_sigma > 0.0;
        let weights = graph::edge_weights(&set, use_noise_model, params.noise_sigma);
        let d_mat = graph::build_d(&set, &weights)?;
        let q_mat = graph::build_q(&set, &weights)?;
        let l_mat = graph::build_laplacian(&set, &weights)?;

        let prior = if params.prior {
            let target = if params.karcher {
                chordal_mean(set.initial_rotations())?
            } else {
                DMatrix::identity(set.d(), set.d())
            };
            Some((0, target, GAUGE_PRIOR_WEIGHT))
        } else {
            None
        };

        Ok(Self {
            params,
            set,
            weights,
            d_mat,
            q_mat,
            l_mat,
            prior,
        })
    }

    pub fn params(&self) -> &ShonanParams {
        &self.params
    }

    pub fn measurements(&self) -> &MeasurementSet {
        &self.set
    }

    /// Number of rotation variables.
    pub fn nr_poses(&self) -> usize {
        self.set.nr_poses()
    }

    /// Effective per-edge weights in measurement order.
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Sparse degree matrix D.
    pub fn d_matrix(&self) -> &SparseColMat<usize, f64> {
        &self.d_mat
    }

    /// Sparse measurement matrix Q.
    pub fn q_matrix(&self) -> &SparseColMat<usize, f64> {
        &self.q_mat
    }

    /// Sparse connection Laplacian L = D - Q.
    pub fn laplacian(&self) -> &SparseColMat<usize, f64> {
        &self.l_mat
    }

    /// Rebuilds D with the noise model explicitly enabled or disabled,
    /// independent of the configured weights.
    pub fn build_d(&self, use_noise_model: bool) -> Result<SparseColMat<usize, f64>> {
        let weights = graph::edge_weights(&self.set, use_noise_model, self.params.noise_sigma);
        graph::build_d(&self.set, &weights)
    }

    /// Rebuilds Q with the noise model explicitly enabled or disabled.
    pub fn build_q(&self, use_noise_model: bool) -> Result<SparseColMat<usize, f64>> {
        let weights = graph::edge_weights(&self.set, use_noise_model, self.params.noise_sigma);
        graph::build_q(&self.set, &weights)
    }

    /// Dense copy of D, for diagnostics and tests.
    pub fn dense_d(&self) -> DMatrix<f64> {
        graph::to_dense(&self.d_mat)
    }

    /// Dense copy of Q.
    pub fn dense_q(&self) -> DMatrix<f64> {
        graph::to_dense(&self.q_mat)
    }

    /// Dense copy of L.
    pub fn dense_laplacian(&self) -> DMatrix<f64> {
        graph::to_dense(&self.l_mat)
    }

    /// The lifted problem at level p (chordal factors plus the configured
    /// gauge prior).
    pub fn build_graph_at(&self, p: usize) -> LiftedProblem {
        LiftedProblem::build(&self.set, &self.weights, p, self.prior.clone())
    }

    /// Independent uniform draws from SO(p), one per key.
    pub fn initialize_randomly_at<R: Rng + ?Sized>(&self, p: usize, rng: &mut R) -> LiftedValues {
        LiftedValues::random(p, self.set.nr_poses(), rng)
    }

    /// Total weighted chordal cost (plus prior term) at level p.
    pub fn cost_at(&self, p: usize, values: &LiftedValues) -> f64 {
        debug_assert_eq!(values.p(), p);
        self.build_graph_at(p).cost(values)
    }

    /// Weighted chordal cost of a rounded solution at the native dimension.
    pub fn cost(&self, rotations: &HashMap<Key, SOn>) -> f64 {
        self.set
            .measurements()
            .iter()
            .zip(&self.weights)
            .map(|(m, &w)| {
                let ri = rotations[&m.i].matrix();
                let rj = rotations[&m.j].matrix();
                w * (rj - ri * &m.rotation).norm_squared()
            })
            .sum()
    }

    /// Locally optimizes the lifted problem at level p.
    pub fn try_optimizing_at<R: Rng + ?Sized>(
        &self,
        p: usize,
        init: Initialization,
        rng: &mut R,
    ) -> Result<LiftedValues> {
        let problem = self.build_graph_at(p);
        let initial = match init {
            Initialization::Random => self.initialize_randomly_at(p, rng),
            Initialization::Given(values) => {
                if values.p() != p {
                    return Err(ShonanError::InvalidConfig(format!(
                        "initial values have dimension {}, expected {p}",
                        values.p()
                    )));
                }
                values
            }
        };
        Ok(optimizer::solve(&problem, initial, &self.params.lm)?.values)
    }

    /// Block-diagonal Lagrange multiplier at the stacked Stiefel matrix S.
    pub fn compute_lambda(&self, s: &DMatrix<f64>) -> Vec<DMatrix<f64>> {
        certificate::compute_lambda(&self.set, &self.weights, s)
    }

    /// Lambda evaluated at lifted values.
    pub fn compute_lambda_at(&self, values: &LiftedValues) -> Vec<DMatrix<f64>> {
        certificate::compute_lambda_at(&self.set, &self.weights, values)
    }

    /// Certificate matrix A = blockdiag(Lambda) - Q at the given values.
    pub fn compute_a(&self, values: &LiftedValues) -> Result<SparseColMat<usize, f64>> {
        let lambda = self.compute_lambda_at(values);
        certificate::compute_a(&self.set, &self.weights, &lambda)
    }

    /// Minimum eigenpair of the certificate matrix.
    pub fn min_eigen_pair<R: Rng + ?Sized>(
        &self,
        values: &LiftedValues,
        rng: &mut R,
    ) -> Result<(f64, DVector<f64>)> {
        let a = self.compute_a(values)?;
        certificate::min_eigenpair(&a, &self.params.eigen, rng)
    }

    /// Minimum eigenvalue of the certificate matrix.
    pub fn min_eigenvalue<R: Rng + ?Sized>(
        &self,
        values: &LiftedValues,
        rng: &mut R,
    ) -> Result<f64> {
        Ok(self.min_eigen_pair(values, rng)?.0)
    }

    /// True when the minimum eigenvalue clears the optimality threshold.
    pub fn check_optimality<R: Rng + ?Sized>(
        &self,
        values: &LiftedValues,
        rng: &mut R,
    ) -> Result<bool> {
        Ok(self.min_eigenvalue(values, rng)? >= self.params.optimality_threshold)
    }

    /// Coordinate gradient of the lifted cost at the current values.
    pub fn riemannian_gradient(&self, values: &LiftedValues) -> DVector<f64> {
        self.build_graph_at(values.p()).gradient(values)
    }

    /// Lifts values one dimension up with a plain perturbation along the
    /// descent tangent built from the minimum eigenvector.
    pub fn dimension_lifting(
        &self,
        values: &LiftedValues,
        min_eigen_vector: &DVector<f64>,
    ) -> LiftedValues {
        staircase::dimension_lifting(
            values,
            min_eigen_vector,
            self.set.d(),
            self.params.descent.lift_step,
        )
    }

    /// Lifts values one dimension up by line search along the descent
    /// direction; the stopping tolerances come from the descent parameters.
    pub fn initialize_with_descent(
        &self,
        values: &LiftedValues,
        min_eigen_vector: &DVector<f64>,
        min_eigenvalue: f64,
    ) -> LiftedValues {
        let problem = self.build_graph_at(values.p() + 1);
        staircase::initialize_with_descent(
            &problem,
            values,
            min_eigen_vector,
            min_eigenvalue,
            &self.params.descent,
        )
    }

    /// Projects lifted values down to SO(d) by truncating each variable to
    /// its top-left d x d block and snapping to the nearest rotation.
    pub fn project_from(&self, values: &LiftedValues) -> Result<HashMap<Key, SOn>> {
        let d = self.set.d();
        let mut rotations = HashMap::with_capacity(self.set.nr_poses());
        for (idx, key) in self.set.keys().iter().enumerate() {
            let block = values
                .get(idx)
                .matrix()
                .view((0, 0), (d, d))
                .into_owned();
            rotations.insert(*key, SOn::project(&block)?);
        }
        Ok(rotations)
    }

    /// Rounds a lifted solution to SO(d)^N: projects the stacked Stiefel
    /// matrix onto its top-d left singular space, fixes the determinant
    /// orientation by majority, then snaps each block to the nearest
    /// rotation.
    pub fn round_solution(&self, values: &LiftedValues) -> Result<HashMap<Key, SOn>> {
        let d = self.set.d();
        let n = self.set.nr_poses();
        let s = values.stacked_stiefel(d);

        let svd = s.clone().svd(true, false);
        let u = svd
            .u
            .ok_or_else(|| ShonanError::Numerical("SVD failed to produce U".into()))?;
        let mut r_hat = u.columns(0, d).transpose() * &s;

        let negative = (0..n)
            .filter(|&i| r_hat.columns(d * i, d).into_owned().determinant() < 0.0)
            .count();
        if 2 * negative > n {
            let cols = r_hat.ncols();
            for c in 0..cols {
                r_hat[(d - 1, c)] = -r_hat[(d - 1, c)];
            }
        }

        let mut rotations = HashMap::with_capacity(n);
        for (idx, key) in self.set.keys().iter().enumerate() {
            let block = r_hat.columns(d * idx, d).into_owned();
            rotations.insert(*key, SOn::project(&block)?);
        }
        Ok(rotations)
    }

    /// Runs the staircase from p_min to p_max with random first-level
    /// initialization.
    pub fn run<R: Rng + ?Sized>(
        &self,
        p_min: usize,
        p_max: usize,
        with_descent: bool,
        rng: &mut R,
    ) -> Result<ShonanResult> {
        staircase::run(self, p_min, p_max, with_descent, Initialization::Random, rng)
    }

    /// Runs the staircase from an explicit first-level initialization.
    pub fn run_from<R: Rng + ?Sized>(
        &self,
        p_min: usize,
        p_max: usize,
        with_descent: bool,
        init: Initialization,
        rng: &mut R,
    ) -> Result<ShonanResult> {
        staircase::run(self, p_min, p_max, with_descent, init, rng)
    }

    /// Runs the staircase with the configured bounds and mode.
    pub fn run_with_params<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<ShonanResult> {
        self.run(
            self.params.p_min,
            self.params.p_max,
            self.params.with_descent,
            rng,
        )
    }

    /// Rounds a terminal staircase solution into a result.
    pub(crate) fn finish(
        &self,
        values: LiftedValues,
        min_eigenvalue: f64,
        certified: bool,
        levels: Vec<LevelDiagnostic>,
    ) -> Result<ShonanResult> {
        let final_p = values.p();
        let rotations = self.round_solution(&values)?;
        let cost = self.cost(&rotations);
        Ok(ShonanResult {
            rotations,
            min_eigenvalue,
            certified,
            final_p,
            cost,
            levels,
        })
    }
}

/// Chordal L2 mean: the nearest rotation to the Euclidean average.
fn chordal_mean(rotations: &[SOn]) -> Result<DMatrix<f64>> {
    let d = rotations[0].n();
    let mut mean = DMatrix::zeros(d, d);
    for r in rotations {
        mean += r.matrix();
    }
    mean /= rotations.len() as f64;
    Ok(SOn::project(&mean)?.into_matrix())
}
