//! The lifted optimization problem at staircase level p.
//!
//! Variables are SO(p) elements, one per key; only their first d columns
//! (the Stiefel part) enter the chordal cost. Residuals are linear in those
//! columns, so the only nonlinearity is the manifold retraction.

use nalgebra::{DMatrix, DVector};
use rand::Rng;

use crate::geometry::{tangent_pairs, SOn};
use crate::measurement::MeasurementSet;

/// All lifted variables of one staircase level. Every entry shares the same
/// ambient dimension p; entries are ordered by measurement-set block index.
#[derive(Debug, Clone)]
pub struct LiftedValues {
    p: usize,
    rotations: Vec<SOn>,
}

impl LiftedValues {
    pub fn new(p: usize, rotations: Vec<SOn>) -> Self {
        debug_assert!(rotations.iter().all(|q| q.n() == p));
        Self { p, rotations }
    }

    /// Ambient dimension shared by all entries.
    pub fn p(&self) -> usize {
        self.p
    }

    pub fn len(&self) -> usize {
        self.rotations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rotations.is_empty()
    }

    pub fn get(&self, idx: usize) -> &SOn {
        &self.rotations[idx]
    }

    pub fn rotations(&self) -> &[SOn] {
        &self.rotations
    }

    /// Draws every variable i.i.d. uniformly from SO(p).
    pub fn random<R: Rng + ?Sized>(p: usize, n: usize, rng: &mut R) -> Self {
        Self::new(p, (0..n).map(|_| SOn::random(p, rng)).collect())
    }

    /// Zero-pad embedding of every variable into SO(p_new), p_new >= p.
    pub fn embed(&self, p_new: usize) -> Self {
        Self::new(p_new, self.rotations.iter().map(|q| q.embed(p_new)).collect())
    }

    /// Retracts every variable along its tangent direction scaled by `step`.
    pub fn retract_all(&self, directions: &[DVector<f64>], step: f64) -> Self {
        debug_assert_eq!(directions.len(), self.rotations.len());
        let rotations = self
            .rotations
            .iter()
            .zip(directions)
            .map(|(q, xi)| q.retract(&(xi * step)))
            .collect();
        Self::new(self.p, rotations)
    }

    /// Stacks the Stiefel parts into a p x (d*N) matrix, block i occupying
    /// columns [d*i, d*i + d).
    pub fn stacked_stiefel(&self, d: usize) -> DMatrix<f64> {
        let n = self.rotations.len();
        let mut s = DMatrix::zeros(self.p, d * n);
        for (i, q) in self.rotations.iter().enumerate() {
            s.view_mut((0, d * i), (self.p, d)).copy_from(&q.stiefel(d));
        }
        s
    }
}

/// Explicit initialization choice for a level solve.
#[derive(Debug, Clone)]
pub enum Initialization {
    /// Draw a fresh random start from the threaded RNG.
    Random,
    /// Start from previously computed values of matching dimension.
    Given(LiftedValues),
}

/// A differentiable residual over one or more lifted variables.
///
/// One trait covers every arity: the gauge prior touches a single key, the
/// chordal factor touches two. Jacobian blocks are returned per key, each of
/// shape residual_dim x (p(p-1)/2), taken with respect to the retraction's
/// tangent coordinates at the current value.
pub trait LiftedFactor {
    /// Block indices of the variables this factor touches.
    fn keys(&self) -> &[usize];

    /// Residual length at level p.
    fn residual_dim(&self, p: usize) -> usize;

    /// Weighted residual at the current values.
    fn residual(&self, values: &LiftedValues) -> DVector<f64>;

    /// One Jacobian block per entry of `keys()`.
    fn jacobians(&self, values: &LiftedValues) -> Vec<DMatrix<f64>>;
}

/// Chordal (Frobenius) factor: sqrt(w) * (Y_j - Y_i * R_ij).
pub struct ChordalFactor {
    keys: [usize; 2],
    rotation: DMatrix<f64>,
    sqrt_weight: f64,
    d: usize,
}

impl ChordalFactor {
    pub fn new(i: usize, j: usize, rotation: DMatrix<f64>, weight: f64) -> Self {
        let d = rotation.nrows();
        Self {
            keys: [i, j],
            rotation,
            sqrt_weight: weight.sqrt(),
            d,
        }
    }
}

impl LiftedFactor for ChordalFactor {
    fn keys(&self) -> &[usize] {
        &self.keys
    }

    fn residual_dim(&self, p: usize) -> usize {
        p * self.d
    }

    fn residual(&self, values: &LiftedValues) -> DVector<f64> {
        let yi = values.get(self.keys[0]).stiefel(self.d);
        let yj = values.get(self.keys[1]).stiefel(self.d);
        vec_of(&((yj - yi * &self.rotation) * self.sqrt_weight))
    }

    fn jacobians(&self, values: &LiftedValues) -> Vec<DMatrix<f64>> {
        let p = values.p();
        let dof = SOn::dimension(p);
        let qi = values.get(self.keys[0]).matrix();
        let qj = values.get(self.keys[1]).matrix();

        let mut ji = DMatrix::zeros(p * self.d, dof);
        let mut jj = DMatrix::zeros(p * self.d, dof);
        for (k, (a, b)) in tangent_pairs(p).into_iter().enumerate() {
            let mi = tangent_stiefel(qi, a, b, self.d);
            let block_i = (mi * &self.rotation) * (-self.sqrt_weight);
            ji.column_mut(k).copy_from(&vec_of(&block_i));

            let mj = tangent_stiefel(qj, a, b, self.d) * self.sqrt_weight;
            jj.column_mut(k).copy_from(&vec_of(&mj));
        }
        vec![ji, jj]
    }
}

/// Unary gauge prior pinning the anchor key's Stiefel part to a target
/// rotation embedded at the top of the column block.
pub struct GaugePrior {
    keys: [usize; 1],
    target: DMatrix<f64>,
    sqrt_weight: f64,
    d: usize,
}

impl GaugePrior {
    pub fn new(key: usize, target: DMatrix<f64>, weight: f64) -> Self {
        let d = target.nrows();
        Self {
            keys: [key],
            target,
            sqrt_weight: weight.sqrt(),
            d,
        }
    }
}

impl LiftedFactor for GaugePrior {
    fn keys(&self) -> &[usize] {
        &self.keys
    }

    fn residual_dim(&self, p: usize) -> usize {
        p * self.d
    }

    fn residual(&self, values: &LiftedValues) -> DVector<f64> {
        let p = values.p();
        let y = values.get(self.keys[0]).stiefel(self.d);
        let mut target = DMatrix::zeros(p, self.d);
        target.view_mut((0, 0), (self.d, self.d)).copy_from(&self.target);
        vec_of(&((y - target) * self.sqrt_weight))
    }

    fn jacobians(&self, values: &LiftedValues) -> Vec<DMatrix<f64>> {
        let p = values.p();
        let dof = SOn::dimension(p);
        let q = values.get(self.keys[0]).matrix();
        let mut j = DMatrix::zeros(p * self.d, dof);
        for (k, (a, b)) in tangent_pairs(p).into_iter().enumerate() {
            let m = tangent_stiefel(q, a, b, self.d) * self.sqrt_weight;
            j.column_mut(k).copy_from(&vec_of(&m));
        }
        vec![j]
    }
}

/// The assembled problem at one level: all factors plus dimensions.
pub struct LiftedProblem {
    p: usize,
    d: usize,
    n_vars: usize,
    factors: Vec<Box<dyn LiftedFactor>>,
}

impl LiftedProblem {
    /// Builds the chordal problem over a measurement set, with an optional
    /// gauge prior (anchor block index, target rotation, weight).
    pub fn build(
        set: &MeasurementSet,
        weights: &[f64],
        p: usize,
        prior: Option<(usize, DMatrix<f64>, f64)>,
    ) -> Self {
        let d = set.d();
        let mut factors: Vec<Box<dyn LiftedFactor>> =
            Vec::with_capacity(set.nr_measurements() + 1);
        for (m, &w) in set.measurements().iter().zip(weights) {
            let i = set.index_of(m.i).expect("validated key");
            let j = set.index_of(m.j).expect("validated key");
            factors.push(Box::new(ChordalFactor::new(i, j, m.rotation.clone(), w)));
        }
        if let Some((anchor, target, w)) = prior {
            factors.push(Box::new(GaugePrior::new(anchor, target, w)));
        }
        Self {
            p,
            d,
            n_vars: set.nr_poses(),
            factors,
        }
    }

    pub fn p(&self) -> usize {
        self.p
    }

    pub fn d(&self) -> usize {
        self.d
    }

    pub fn n_vars(&self) -> usize {
        self.n_vars
    }

    /// Tangent degrees of freedom per variable.
    pub fn dof(&self) -> usize {
        SOn::dimension(self.p)
    }

    /// Total residual length.
    pub fn residual_dim(&self) -> usize {
        self.factors.iter().map(|f| f.residual_dim(self.p)).sum()
    }

    /// Total cost: the sum of squared weighted residuals, i.e. the weighted
    /// chordal error plus the prior term.
    pub fn cost(&self, values: &LiftedValues) -> f64 {
        self.factors
            .iter()
            .map(|f| f.residual(values).norm_squared())
            .sum()
    }

    /// Stacked residual vector and dense Jacobian at the current values.
    pub fn residual_and_jacobian(&self, values: &LiftedValues) -> (DVector<f64>, DMatrix<f64>) {
        let dof = self.dof();
        let m = self.residual_dim();
        let n = self.n_vars * dof;
        let mut residuals = DVector::zeros(m);
        let mut jacobian = DMatrix::zeros(m, n);

        let mut row = 0;
        for factor in &self.factors {
            let r = factor.residual(values);
            let dim = r.len();
            residuals.rows_mut(row, dim).copy_from(&r);
            for (key, block) in factor.keys().iter().zip(factor.jacobians(values)) {
                jacobian
                    .view_mut((row, key * dof), (dim, dof))
                    .copy_from(&block);
            }
            row += dim;
        }
        (residuals, jacobian)
    }

    /// Coordinate gradient 2 J^T r of the cost.
    pub fn gradient(&self, values: &LiftedValues) -> DVector<f64> {
        let (r, j) = self.residual_and_jacobian(values);
        j.transpose() * r * 2.0
    }

    /// Norm of the coordinate gradient; the stall criterion used by the
    /// optimizer and the descent line search.
    pub fn gradient_norm(&self, values: &LiftedValues) -> f64 {
        self.gradient(values).norm()
    }
}

/// Column-major flattening of a matrix.
fn vec_of(m: &DMatrix<f64>) -> DVector<f64> {
    DVector::from_column_slice(m.as_slice())
}

/// First d columns of Q * G_ab for the so(p) basis element G_ab of the pair
/// (a, b): column a is Q's column b, column b is -Q's column a, all other
/// columns zero (and dropped when a or b lands beyond d).
fn tangent_stiefel(q: &DMatrix<f64>, a: usize, b: usize, d: usize) -> DMatrix<f64> {
    let p = q.nrows();
    let mut m = DMatrix::zeros(p, d);
    if a < d {
        m.column_mut(a).copy_from(&q.column(b));
    }
    if b < d {
        let neg = -q.column(a).into_owned();
        m.column_mut(b).copy_from(&neg);
    }
    m
}
