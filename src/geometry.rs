//! Geometry collaborator: maps between index space and physical
//! coordinates.
//!
//! The grid core never computes coordinates itself; it consults an
//! injected `Geometry` with a deliberately narrow capability: index box to
//! physical bounds, and physical point to indices. A uniform axis-aligned
//! box is provided; stretched or mapped geometries implement the same
//! trait.

use crate::topology::index::{IndexSpace, Indices};

/// Axis-aligned physical bounds of one cell.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CellBounds {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl CellBounds {
    /// Geometric center of the cell.
    #[inline]
    pub fn center(&self) -> [f64; 3] {
        [
            (self.min[0] + self.max[0]) / 2.0,
            (self.min[1] + self.max[1]) / 2.0,
            (self.min[2] + self.max[2]) / 2.0,
        ]
    }
}

/// Mapping between the grid's index space and physical coordinates.
pub trait Geometry: Send + Sync {
    /// Physical bounds of the index-space box starting at `min_indices`
    /// with edge length `size_in_indices`.
    fn bounds(&self, min_indices: Indices, size_in_indices: u64) -> CellBounds;

    /// Indices (at maximum refinement level) of the point, or `None` if
    /// the point lies outside the grid.
    fn indices_at(&self, x: f64, y: f64, z: f64) -> Option<Indices>;
}

/// Uniform geometry: every unrefined cell is the same axis-aligned box.
#[derive(Clone, Debug)]
pub struct UniformGeometry {
    start: [f64; 3],
    /// physical length of one index step per axis
    index_step: [f64; 3],
    length_in_indices: [u64; 3],
}

impl UniformGeometry {
    /// Creates a uniform geometry with the grid origin at `start` and
    /// unrefined cells of physical size `cell_length`.
    pub fn new(start: [f64; 3], cell_length: [f64; 3], space: &IndexSpace) -> Self {
        let per_cell = space.size_at_level(0) as f64;
        Self {
            start,
            index_step: [
                cell_length[0] / per_cell,
                cell_length[1] / per_cell,
                cell_length[2] / per_cell,
            ],
            length_in_indices: space.length_in_indices(),
        }
    }

    /// Unit geometry: origin 0, unrefined cell length 1.
    pub fn unit(space: &IndexSpace) -> Self {
        Self::new([0.0; 3], [1.0; 3], space)
    }
}

impl Geometry for UniformGeometry {
    fn bounds(&self, min_indices: Indices, size_in_indices: u64) -> CellBounds {
        let mut min = [0.0; 3];
        let mut max = [0.0; 3];
        for i in 0..3 {
            min[i] = self.start[i] + min_indices[i] as f64 * self.index_step[i];
            max[i] = self.start[i] + (min_indices[i] + size_in_indices) as f64 * self.index_step[i];
        }
        CellBounds { min, max }
    }

    fn indices_at(&self, x: f64, y: f64, z: f64) -> Option<Indices> {
        let p = [x, y, z];
        let mut indices = [0u64; 3];
        for i in 0..3 {
            let offset = (p[i] - self.start[i]) / self.index_step[i];
            if offset < 0.0 {
                return None;
            }
            let index = offset as u64;
            if index >= self.length_in_indices[i] {
                return None;
            }
            indices[i] = index;
        }
        Some(indices)
    }
}
