//! Error types for certifiable rotation averaging.

use thiserror::Error;

use crate::measurement::Key;

/// Errors produced while loading measurements or running the staircase.
///
/// Reaching the staircase ceiling without a certificate is *not* an error;
/// it is reported through `ShonanResult::certified`.
#[derive(Error, Debug)]
pub enum ShonanError {
    /// A measurement references a key with no initial pose entry.
    #[error("measurement references unknown key {key:?}")]
    UnknownKey { key: Key },

    /// The measurement graph does not connect all keys.
    #[error("measurement graph is disconnected: {connected} of {total} keys reachable from the anchor")]
    DisconnectedGraph { connected: usize, total: usize },

    /// A measurement or initial rotation has the wrong shape for the
    /// ambient dimension, or is otherwise malformed.
    #[error("invalid measurement: {0}")]
    InvalidMeasurement(String),

    /// The nonlinear solve at level p hit its iteration cap without meeting
    /// any convergence criterion. Recoverable by re-randomizing the start.
    #[error("solver diverged at level p={p} after {iterations} iterations")]
    SolverDivergence { p: usize, iterations: usize },

    /// The sparse eigensolver failed to converge to the minimum eigenpair,
    /// so no certificate can be produced for this run.
    #[error("eigensolver failed to converge after {iterations} iterations")]
    EigensolverFailure { iterations: usize },

    /// Staircase bounds or initial values are inconsistent with the
    /// measurement set.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A dense factorization failed (singular system, failed SVD).
    #[error("numerical failure: {0}")]
    Numerical(String),
}

pub type Result<T> = std::result::Result<T, ShonanError>;
