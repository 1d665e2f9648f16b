//! Block-sparse matrices over the measurement graph.
//!
//! Builds the degree matrix D, the measurement matrix Q and the connection
//! Laplacian L = D - Q, each of size (d*N) x (d*N). All three are assembled
//! once per measurement set and read-only afterwards.

use std::collections::BTreeMap;

use faer::sparse::{SparseColMat, Triplet};
use nalgebra::{DMatrix, DVector};

use crate::error::{Result, ShonanError};
use crate::measurement::MeasurementSet;

/// Effective per-edge weights under the configured noise model.
///
/// With the noise model enabled, an edge uses its explicit weight when
/// present and 1/sigma^2 otherwise; disabled, every edge weighs 1.
pub fn edge_weights(set: &MeasurementSet, use_noise_model: bool, noise_sigma: f64) -> Vec<f64> {
    set.measurements()
        .iter()
        .map(|m| {
            if use_noise_model {
                m.weight
                    .unwrap_or_else(|| 1.0 / (noise_sigma * noise_sigma))
            } else {
                1.0
            }
        })
        .collect()
}

/// Sparse block-diagonal degree matrix D: for each edge (i, j) with weight
/// w, w*I_d is added to the diagonal blocks of both i and j.
pub fn build_d(set: &MeasurementSet, weights: &[f64]) -> Result<SparseColMat<usize, f64>> {
    let d = set.d();
    let mut acc = BTreeMap::new();
    for (m, &w) in set.measurements().iter().zip(weights) {
        let bi = set.index_of(m.i).expect("validated key") * d;
        let bj = set.index_of(m.j).expect("validated key") * d;
        for r in 0..d {
            *acc.entry((bi + r, bi + r)).or_insert(0.0) += w;
            *acc.entry((bj + r, bj + r)).or_insert(0.0) += w;
        }
    }
    from_accumulated(set.nr_poses() * d, acc)
}

/// Sparse measurement matrix Q: w*R_ij at block (i, j) and its transpose at
/// block (j, i). Diagonal blocks stay zero.
pub fn build_q(set: &MeasurementSet, weights: &[f64]) -> Result<SparseColMat<usize, f64>> {
    let d = set.d();
    let mut acc = BTreeMap::new();
    for (m, &w) in set.measurements().iter().zip(weights) {
        let bi = set.index_of(m.i).expect("validated key") * d;
        let bj = set.index_of(m.j).expect("validated key") * d;
        for r in 0..d {
            for c in 0..d {
                let v = w * m.rotation[(r, c)];
                *acc.entry((bi + r, bj + c)).or_insert(0.0) += v;
                *acc.entry((bj + c, bi + r)).or_insert(0.0) += v;
            }
        }
    }
    from_accumulated(set.nr_poses() * d, acc)
}

/// Connection Laplacian L = D - Q, assembled in one pass so the identity
/// holds exactly rather than up to two separate assemblies.
pub fn build_laplacian(set: &MeasurementSet, weights: &[f64]) -> Result<SparseColMat<usize, f64>> {
    let d = set.d();
    let mut acc = BTreeMap::new();
    for (m, &w) in set.measurements().iter().zip(weights) {
        let bi = set.index_of(m.i).expect("validated key") * d;
        let bj = set.index_of(m.j).expect("validated key") * d;
        for r in 0..d {
            *acc.entry((bi + r, bi + r)).or_insert(0.0) += w;
            *acc.entry((bj + r, bj + r)).or_insert(0.0) += w;
        }
        for r in 0..d {
            for c in 0..d {
                let v = w * m.rotation[(r, c)];
                *acc.entry((bi + r, bj + c)).or_insert(0.0) -= v;
                *acc.entry((bj + c, bi + r)).or_insert(0.0) -= v;
            }
        }
    }
    from_accumulated(set.nr_poses() * d, acc)
}

fn from_accumulated(
    n: usize,
    acc: BTreeMap<(usize, usize), f64>,
) -> Result<SparseColMat<usize, f64>> {
    let triplets: Vec<Triplet<usize, usize, f64>> = acc
        .into_iter()
        .map(|((r, c), v)| Triplet::new(r, c, v))
        .collect();
    SparseColMat::try_new_from_triplets(n, n, &triplets)
        .map_err(|e| ShonanError::Numerical(format!("sparse assembly failed: {e:?}")))
}

/// Sparse matrix-vector product y = A x.
pub(crate) fn spmv(a: &SparseColMat<usize, f64>, x: &DVector<f64>) -> DVector<f64> {
    let mut y = DVector::zeros(a.nrows());
    for t in a.triplet_iter() {
        y[t.row] += t.val * x[t.col];
    }
    y
}

/// Dense copy, for diagnostics and tests.
pub fn to_dense(a: &SparseColMat<usize, f64>) -> DMatrix<f64> {
    let mut m = DMatrix::zeros(a.nrows(), a.ncols());
    for t in a.triplet_iter() {
        m[(t.row, t.col)] += t.val;
    }
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::{Key, RotationMeasurement};
    use approx::assert_relative_eq;
    use nalgebra::{DMatrix, Rotation3, Vector3};

    fn triangle_set() -> MeasurementSet {
        let rot = |ang: f64| {
            DMatrix::from_fn(3, 3, |r, c| {
                Rotation3::from_axis_angle(&Vector3::z_axis(), ang).matrix()[(r, c)]
            })
        };
        let poses = (0..3).map(|k| (Key(k), DMatrix::identity(3, 3))).collect();
        let measurements = vec![
            RotationMeasurement::new(Key(0), Key(1), rot(0.3)),
            RotationMeasurement::with_weight(Key(1), Key(2), rot(-0.2), 2.0),
            RotationMeasurement::new(Key(2), Key(0), rot(0.1)),
        ];
        MeasurementSet::new(3, poses, measurements).unwrap()
    }

    #[test]
    fn test_laplacian_is_d_minus_q() {
        let set = triangle_set();
        let weights = edge_weights(&set, true, 0.5);
        let d = to_dense(&build_d(&set, &weights).unwrap());
        let q = to_dense(&build_q(&set, &weights).unwrap());
        let l = to_dense(&build_laplacian(&set, &weights).unwrap());
        assert_relative_eq!(l, d - q, epsilon = 1e-12);
    }

    #[test]
    fn test_d_is_block_diagonal() {
        let set = triangle_set();
        let weights = edge_weights(&set, false, 0.0);
        let d = to_dense(&build_d(&set, &weights).unwrap());
        for r in 0..9 {
            for c in 0..9 {
                if r != c {
                    assert_eq!(d[(r, c)], 0.0);
                }
            }
        }
        // Each key touches two unit-weight edges.
        for k in 0..9 {
            assert_relative_eq!(d[(k, k)], 2.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_q_symmetric_with_zero_diagonal_blocks() {
        let set = triangle_set();
        let weights = edge_weights(&set, false, 0.0);
        let q = to_dense(&build_q(&set, &weights).unwrap());
        assert_relative_eq!(q.transpose(), q.clone(), epsilon = 1e-12);
        for b in 0..3 {
            let block = q.view((3 * b, 3 * b), (3, 3)).into_owned();
            assert_relative_eq!(block, DMatrix::zeros(3, 3), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_noise_model_weights() {
        let set = triangle_set();
        let weights = edge_weights(&set, true, 0.5);
        // Explicit weight wins; sigma fallback is 1/0.25 = 4.
        assert_relative_eq!(weights[0], 4.0, epsilon = 1e-12);
        assert_relative_eq!(weights[1], 2.0, epsilon = 1e-12);
        let disabled = edge_weights(&set, false, 0.5);
        assert!(disabled.iter().all(|&w| w == 1.0));
    }

    #[test]
    fn test_spmv_matches_dense() {
        let set = triangle_set();
        let weights = edge_weights(&set, false, 0.0);
        let l = build_laplacian(&set, &weights).unwrap();
        let dense = to_dense(&l);
        let x = DVector::from_fn(9, |k, _| (k as f64) - 4.0);
        assert_relative_eq!(spmv(&l, &x), dense * x.clone(), epsilon = 1e-12);
    }
}
