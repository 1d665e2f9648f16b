//! Nonlinear optimization at a fixed staircase level.

pub mod lm;

pub use lm::{solve, LmOutcome};
