//! Global-optimality certificate for a candidate lifted solution.
//!
//! For a stationary point Y of the chordal cost, the Lagrange-multiplier
//! blocks are Lambda_i = sym((Y^T Y Q)_ii) and the certificate matrix is
//! A = blockdiag(Lambda) - Q. A nonnegative minimum eigenvalue of A proves,
//! through the duality of the semidefinite relaxation, that the rounded
//! solution is a global optimum of the original problem. At an exactly
//! consistent solution Lambda reduces to the degree blocks of D, and A to
//! the connection Laplacian L.

use faer::sparse::{SparseColMat, Triplet};
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::config::EigenParams;
use crate::error::{Result, ShonanError};
use crate::graph::spmv;
use crate::lifted::LiftedValues;
use crate::measurement::MeasurementSet;

/// Block-diagonal Lagrange multiplier, one symmetric d x d block per key,
/// evaluated at the stacked Stiefel matrix S (p x d*N).
pub fn compute_lambda(
    set: &MeasurementSet,
    weights: &[f64],
    s: &DMatrix<f64>,
) -> Vec<DMatrix<f64>> {
    let d = set.d();
    let n = set.nr_poses();
    let mut blocks = vec![DMatrix::zeros(d, d); n];

    for (m, &w) in set.measurements().iter().zip(weights) {
        let i = set.index_of(m.i).expect("validated key");
        let j = set.index_of(m.j).expect("validated key");
        let yi = s.columns(d * i, d);
        let yj = s.columns(d * j, d);
        // (Y^T Y)_{ij} * Q_{ji} and (Y^T Y)_{ji} * Q_{ij}.
        let cross = yi.transpose() * yj;
        blocks[i] += &cross * (m.rotation.transpose() * w);
        blocks[j] += cross.transpose() * (&m.rotation * w);
    }

    blocks
        .into_iter()
        .map(|b| (&b + b.transpose()) * 0.5)
        .collect()
}

/// Lambda evaluated at lifted values.
pub fn compute_lambda_at(
    set: &MeasurementSet,
    weights: &[f64],
    values: &LiftedValues,
) -> Vec<DMatrix<f64>> {
    compute_lambda(set, weights, &values.stacked_stiefel(set.d()))
}

/// Certificate matrix A = blockdiag(Lambda) - Q, assembled sparse.
pub fn compute_a(
    set: &MeasurementSet,
    weights: &[f64],
    lambda: &[DMatrix<f64>],
) -> Result<SparseColMat<usize, f64>> {
    let d = set.d();
    let n = set.nr_poses() * d;
    let mut triplets = Vec::new();

    for (i, block) in lambda.iter().enumerate() {
        for r in 0..d {
            for c in 0..d {
                if block[(r, c)] != 0.0 {
                    triplets.push(Triplet::new(d * i + r, d * i + c, block[(r, c)]));
                }
            }
        }
    }
    for (m, &w) in set.measurements().iter().zip(weights) {
        let bi = set.index_of(m.i).expect("validated key") * d;
        let bj = set.index_of(m.j).expect("validated key") * d;
        for r in 0..d {
            for c in 0..d {
                let v = w * m.rotation[(r, c)];
                triplets.push(Triplet::new(bi + r, bj + c, -v));
                triplets.push(Triplet::new(bj + c, bi + r, -v));
            }
        }
    }

    SparseColMat::try_new_from_triplets(n, n, &triplets)
        .map_err(|e| ShonanError::Numerical(format!("certificate assembly failed: {e:?}")))
}

/// Algebraically smallest eigenpair of a sparse symmetric matrix.
///
/// Power iteration on the spectrally shifted C = bound*I - A, where `bound`
/// is a Gershgorin upper bound on the spectrum of A; the dominant eigenpair
/// of C is (bound - lambda_min, v_min). Purely matrix-vector products, so
/// the matrix is never densified.
pub fn min_eigenpair<R: Rng + ?Sized>(
    a: &SparseColMat<usize, f64>,
    params: &EigenParams,
    rng: &mut R,
) -> Result<(f64, DVector<f64>)> {
    let n = a.nrows();
    let mut diag = vec![0.0; n];
    let mut radius = vec![0.0; n];
    for t in a.triplet_iter() {
        if t.row == t.col {
            diag[t.row] += t.val;
        } else {
            radius[t.row] += t.val.abs();
        }
    }
    let bound = diag
        .iter()
        .zip(&radius)
        .map(|(d, r)| d + r)
        .fold(f64::NEG_INFINITY, f64::max)
        .max(0.0)
        + 1.0;
    let scale = bound.abs().max(1.0);

    let mut x = DVector::from_fn(n, |_, _| rng.sample::<f64, _>(StandardNormal));
    x /= x.norm();

    for _ in 0..params.max_iterations {
        let ax = spmv(a, &x);
        let lambda = x.dot(&ax);
        let residual = (&ax - &x * lambda).norm();
        if residual <= params.tolerance * scale {
            return Ok((lambda, x));
        }

        let mut y = &x * bound - ax;
        if y.norm() < 1e-300 {
            // x landed at the top of A's spectrum; restart.
            y = DVector::from_fn(n, |_, _| rng.sample::<f64, _>(StandardNormal));
        }
        y /= y.norm();
        x = y;
    }

    Err(ShonanError::EigensolverFailure {
        iterations: params.max_iterations,
    })
}
