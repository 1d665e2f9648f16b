//! SO(n) with the ambient dimension carried at runtime.
//!
//! The staircase optimizes over rotation matrices whose dimension grows one
//! level at a time, so the group element is a square `DMatrix` paired with
//! explicit-dimension tangent operations rather than a fixed-size type.

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::{Result, ShonanError};

/// A rotation in SO(n): an n-by-n orthogonal matrix with determinant +1.
#[derive(Debug, Clone, PartialEq)]
pub struct SOn {
    mat: DMatrix<f64>,
}

/// Ordered basis index pairs (a, b), a < b, of the tangent space so(n).
///
/// Pairs are enumerated column-by-column:
///
/// ```text
/// (0,1), (0,2), (1,2), (0,3), (1,3), (2,3), ...
/// ```
///
/// so the trailing n-1 coordinates are exactly the pairs (a, n-1) touching
/// the newest dimension. Dimension lifting relies on that layout.
pub fn tangent_pairs(n: usize) -> Vec<(usize, usize)> {
    let mut pairs = Vec::with_capacity(SOn::dimension(n));
    for b in 1..n {
        for a in 0..b {
            pairs.push((a, b));
        }
    }
    pairs
}

impl SOn {
    /// Dimension of the tangent space: n(n-1)/2.
    pub fn dimension(n: usize) -> usize {
        n * (n - 1) / 2
    }

    /// Identity rotation in SO(n).
    pub fn identity(n: usize) -> Self {
        Self {
            mat: DMatrix::identity(n, n),
        }
    }

    /// Wraps a matrix that is already a rotation. No checks are performed.
    pub fn from_matrix_unchecked(mat: DMatrix<f64>) -> Self {
        Self { mat }
    }

    /// Ambient dimension n.
    pub fn n(&self) -> usize {
        self.mat.nrows()
    }

    /// The underlying rotation matrix.
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.mat
    }

    /// Consumes self, returning the rotation matrix.
    pub fn into_matrix(self) -> DMatrix<f64> {
        self.mat
    }

    /// First d columns of the matrix: the Stiefel part used by the chordal
    /// cost at native dimension d.
    pub fn stiefel(&self, d: usize) -> DMatrix<f64> {
        self.mat.columns(0, d).into_owned()
    }

    /// Group composition self * other.
    pub fn compose(&self, other: &SOn) -> SOn {
        SOn {
            mat: &self.mat * &other.mat,
        }
    }

    /// Inverse rotation (the transpose).
    pub fn inverse(&self) -> SOn {
        SOn {
            mat: self.mat.transpose(),
        }
    }

    /// Maps tangent coordinates to the skew-symmetric matrix hat(xi).
    ///
    /// For basis pair (a, b): hat(xi)[b][a] = +xi_k, hat(xi)[a][b] = -xi_k.
    pub fn hat(n: usize, xi: &DVector<f64>) -> DMatrix<f64> {
        debug_assert_eq!(xi.len(), Self::dimension(n));
        let mut h = DMatrix::zeros(n, n);
        for (k, (a, b)) in tangent_pairs(n).into_iter().enumerate() {
            h[(b, a)] = xi[k];
            h[(a, b)] = -xi[k];
        }
        h
    }

    /// Inverse of [`SOn::hat`]: reads tangent coordinates off a
    /// skew-symmetric matrix.
    pub fn vee(h: &DMatrix<f64>) -> DVector<f64> {
        let n = h.nrows();
        let mut xi = DVector::zeros(Self::dimension(n));
        for (k, (a, b)) in tangent_pairs(n).into_iter().enumerate() {
            xi[k] = h[(b, a)];
        }
        xi
    }

    /// QR-based retraction: the Q factor of self * (I + hat(xi)), with the
    /// R diagonal sign-fixed so the retraction is first-order equal to the
    /// exponential map and continuous at xi = 0.
    pub fn retract(&self, xi: &DVector<f64>) -> SOn {
        let n = self.n();
        let m = &self.mat * (DMatrix::identity(n, n) + Self::hat(n, xi));
        Self::orthonormalize(m)
    }

    /// Draws a rotation uniformly (Haar) from SO(n): the sign-fixed Q factor
    /// of a matrix with i.i.d. standard normal entries.
    pub fn random<R: Rng + ?Sized>(n: usize, rng: &mut R) -> SOn {
        let g = DMatrix::from_fn(n, n, |_, _| rng.sample(StandardNormal));
        Self::orthonormalize(g)
    }

    /// Projects an arbitrary square matrix to the nearest rotation in
    /// Frobenius norm: U V^T from the SVD, with the last column of U negated
    /// when the determinant comes out -1.
    pub fn project(m: &DMatrix<f64>) -> Result<SOn> {
        let n = m.nrows();
        let svd = m.clone().svd(true, true);
        let u = svd
            .u
            .ok_or_else(|| ShonanError::Numerical("SVD failed to produce U".into()))?;
        let v_t = svd
            .v_t
            .ok_or_else(|| ShonanError::Numerical("SVD failed to produce V^T".into()))?;
        let mut r = &u * &v_t;
        if r.determinant() < 0.0 {
            let mut u_fixed = u;
            for row in 0..n {
                u_fixed[(row, n - 1)] = -u_fixed[(row, n - 1)];
            }
            r = &u_fixed * &v_t;
        }
        Ok(SOn { mat: r })
    }

    /// Embeds self into SO(p), p >= n, as diag(self, I).
    pub fn embed(&self, p: usize) -> SOn {
        let n = self.n();
        debug_assert!(p >= n);
        let mut mat = DMatrix::identity(p, p);
        mat.view_mut((0, 0), (n, n)).copy_from(&self.mat);
        SOn { mat }
    }

    /// QR factorization with the R diagonal forced nonnegative and the
    /// determinant forced to +1.
    fn orthonormalize(m: DMatrix<f64>) -> SOn {
        let n = m.nrows();
        let qr = m.qr();
        let r = qr.r();
        let mut q = qr.q();
        for k in 0..n {
            if r[(k, k)] < 0.0 {
                for row in 0..n {
                    q[(row, k)] = -q[(row, k)];
                }
            }
        }
        if q.determinant() < 0.0 {
            for row in 0..n {
                q[(row, n - 1)] = -q[(row, n - 1)];
            }
        }
        SOn { mat: q }
    }
}
