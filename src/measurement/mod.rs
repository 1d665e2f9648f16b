//! Measurement store: keyed relative-rotation measurements and initial poses.
//!
//! An external loader (G2O or otherwise) produces the measurement list; this
//! module only validates and indexes it. Key insertion order is preserved so
//! block indices into the sparse matrices are reproducible across runs.

use std::collections::{HashMap, VecDeque};

use nalgebra::DMatrix;

use crate::error::{Result, ShonanError};
use crate::geometry::SOn;

/// Opaque identifier of one rotation variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(pub u64);

impl Key {
    pub fn new(id: u64) -> Self {
        Key(id)
    }
}

/// One relative-rotation edge between two keys. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct RotationMeasurement {
    /// Source key.
    pub i: Key,

    /// Target key.
    pub j: Key,

    /// Measured relative rotation R_ij, a d x d rotation matrix, mapping
    /// frame j into frame i.
    pub rotation: DMatrix<f64>,

    /// Optional information weight. `None` falls back to the configured
    /// noise model.
    pub weight: Option<f64>,
}

impl RotationMeasurement {
    pub fn new(i: Key, j: Key, rotation: DMatrix<f64>) -> Self {
        Self {
            i,
            j,
            rotation,
            weight: None,
        }
    }

    pub fn with_weight(i: Key, j: Key, rotation: DMatrix<f64>, weight: f64) -> Self {
        Self {
            i,
            j,
            rotation,
            weight: Some(weight),
        }
    }
}

/// Validated, indexed set of measurements over a closed key set.
#[derive(Debug, Clone)]
pub struct MeasurementSet {
    d: usize,
    keys: Vec<Key>,
    index: HashMap<Key, usize>,
    initial_rotations: Vec<SOn>,
    measurements: Vec<RotationMeasurement>,
}

impl MeasurementSet {
    /// Builds the store from an ordered pose list and a measurement list.
    ///
    /// `poses` carries the initial rotation estimate per key (translations
    /// are already stripped by the loader); its order fixes the block index
    /// of each key. Fails on duplicate keys, measurements referencing
    /// unknown keys, shape mismatches against the ambient dimension `d`,
    /// self-edges, and a disconnected measurement graph.
    pub fn new(
        d: usize,
        poses: Vec<(Key, DMatrix<f64>)>,
        measurements: Vec<RotationMeasurement>,
    ) -> Result<Self> {
        if !(2..=3).contains(&d) {
            return Err(ShonanError::InvalidMeasurement(format!(
                "ambient dimension must be 2 or 3, got {d}"
            )));
        }
        if poses.is_empty() {
            return Err(ShonanError::InvalidMeasurement(
                "no poses supplied".into(),
            ));
        }

        let mut keys = Vec::with_capacity(poses.len());
        let mut index = HashMap::with_capacity(poses.len());
        let mut initial_rotations = Vec::with_capacity(poses.len());
        for (key, rot) in poses {
            if rot.nrows() != d || rot.ncols() != d {
                return Err(ShonanError::InvalidMeasurement(format!(
                    "initial rotation for key {key:?} is {}x{}, expected {d}x{d}",
                    rot.nrows(),
                    rot.ncols()
                )));
            }
            if index.insert(key, keys.len()).is_some() {
                return Err(ShonanError::InvalidMeasurement(format!(
                    "duplicate key {key:?}"
                )));
            }
            keys.push(key);
            initial_rotations.push(SOn::from_matrix_unchecked(rot));
        }

        for m in &measurements {
            if !index.contains_key(&m.i) {
                return Err(ShonanError::UnknownKey { key: m.i });
            }
            if !index.contains_key(&m.j) {
                return Err(ShonanError::UnknownKey { key: m.j });
            }
            if m.i == m.j {
                return Err(ShonanError::InvalidMeasurement(format!(
                    "self-edge on key {:?}",
                    m.i
                )));
            }
            if m.rotation.nrows() != d || m.rotation.ncols() != d {
                return Err(ShonanError::InvalidMeasurement(format!(
                    "measurement ({:?}, {:?}) rotation is {}x{}, expected {d}x{d}",
                    m.i,
                    m.j,
                    m.rotation.nrows(),
                    m.rotation.ncols()
                )));
            }
            if let Some(w) = m.weight {
                if !w.is_finite() || w <= 0.0 {
                    return Err(ShonanError::InvalidMeasurement(format!(
                        "measurement ({:?}, {:?}) has non-positive weight {w}",
                        m.i, m.j
                    )));
                }
            }
        }

        let set = Self {
            d,
            keys,
            index,
            initial_rotations,
            measurements,
        };
        set.check_connectivity()?;
        Ok(set)
    }

    /// Ambient rotation dimension d.
    pub fn d(&self) -> usize {
        self.d
    }

    /// Number of unique keys N.
    pub fn nr_poses(&self) -> usize {
        self.keys.len()
    }

    /// Number of measurements.
    pub fn nr_measurements(&self) -> usize {
        self.measurements.len()
    }

    /// Keys in block-index order.
    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    /// Block index of a key.
    pub fn index_of(&self, key: Key) -> Option<usize> {
        self.index.get(&key).copied()
    }

    /// k-th measurement.
    pub fn measurement(&self, k: usize) -> &RotationMeasurement {
        &self.measurements[k]
    }

    /// All measurements.
    pub fn measurements(&self) -> &[RotationMeasurement] {
        &self.measurements
    }

    /// Initial rotation of the key at block index `idx`.
    pub fn initial_rotation(&self, idx: usize) -> &SOn {
        &self.initial_rotations[idx]
    }

    /// Initial rotations in block-index order.
    pub fn initial_rotations(&self) -> &[SOn] {
        &self.initial_rotations
    }

    /// BFS over the measurement adjacency from the anchor key.
    fn check_connectivity(&self) -> Result<()> {
        let n = self.keys.len();
        let mut adjacency = vec![Vec::new(); n];
        for m in &self.measurements {
            let i = self.index[&m.i];
            let j = self.index[&m.j];
            adjacency[i].push(j);
            adjacency[j].push(i);
        }

        let mut visited = vec![false; n];
        let mut queue = VecDeque::new();
        visited[0] = true;
        queue.push_back(0);
        let mut connected = 1;
        while let Some(v) = queue.pop_front() {
            for &w in &adjacency[v] {
                if !visited[w] {
                    visited[w] = true;
                    connected += 1;
                    queue.push_back(w);
                }
            }
        }

        if connected != n {
            return Err(ShonanError::DisconnectedGraph {
                connected,
                total: n,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DMatrix;

    fn identity_poses(n: u64, d: usize) -> Vec<(Key, DMatrix<f64>)> {
        (0..n).map(|k| (Key(k), DMatrix::identity(d, d))).collect()
    }

    #[test]
    fn test_valid_chain() {
        let measurements = vec![
            RotationMeasurement::new(Key(0), Key(1), DMatrix::identity(3, 3)),
            RotationMeasurement::new(Key(1), Key(2), DMatrix::identity(3, 3)),
        ];
        let set = MeasurementSet::new(3, identity_poses(3, 3), measurements).unwrap();
        assert_eq!(set.nr_poses(), 3);
        assert_eq!(set.nr_measurements(), 2);
        assert_eq!(set.index_of(Key(2)), Some(2));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let measurements = vec![RotationMeasurement::new(
            Key(0),
            Key(9),
            DMatrix::identity(3, 3),
        )];
        let err = MeasurementSet::new(3, identity_poses(2, 3), measurements).unwrap_err();
        assert!(matches!(err, ShonanError::UnknownKey { key: Key(9) }));
    }

    #[test]
    fn test_disconnected_graph_rejected() {
        // Keys 0-1 connected, keys 2-3 connected, no bridge.
        let measurements = vec![
            RotationMeasurement::new(Key(0), Key(1), DMatrix::identity(3, 3)),
            RotationMeasurement::new(Key(2), Key(3), DMatrix::identity(3, 3)),
        ];
        let err = MeasurementSet::new(3, identity_poses(4, 3), measurements).unwrap_err();
        assert!(matches!(
            err,
            ShonanError::DisconnectedGraph {
                connected: 2,
                total: 4
            }
        ));
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let measurements = vec![RotationMeasurement::new(
            Key(0),
            Key(1),
            DMatrix::identity(2, 2),
        )];
        let err = MeasurementSet::new(3, identity_poses(2, 3), measurements).unwrap_err();
        assert!(matches!(err, ShonanError::InvalidMeasurement(_)));
    }

    #[test]
    fn test_self_edge_rejected() {
        let measurements = vec![RotationMeasurement::new(
            Key(1),
            Key(1),
            DMatrix::identity(3, 3),
        )];
        let err = MeasurementSet::new(3, identity_poses(2, 3), measurements).unwrap_err();
        assert!(matches!(err, ShonanError::InvalidMeasurement(_)));
    }

    #[test]
    fn test_key_order_preserved() {
        let poses = vec![
            (Key(7), DMatrix::identity(3, 3)),
            (Key(3), DMatrix::identity(3, 3)),
        ];
        let measurements = vec![RotationMeasurement::new(
            Key(7),
            Key(3),
            DMatrix::identity(3, 3),
        )];
        let set = MeasurementSet::new(3, poses, measurements).unwrap();
        assert_eq!(set.keys(), &[Key(7), Key(3)]);
        assert_eq!(set.index_of(Key(7)), Some(0));
        assert_eq!(set.index_of(Key(3)), Some(1));
    }
}
