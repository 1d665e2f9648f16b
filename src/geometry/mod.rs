//! Rotation-manifold primitives: runtime-dimension SO(n).

pub mod son;

pub use son::{tangent_pairs, SOn};
