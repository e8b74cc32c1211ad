//! `IndexSpace`: the reversible encoding between cell ids and
//! (indices, refinement level).
//!
//! The id space is split into contiguous bands, one per refinement level:
//! band `r` holds `Lx * Ly * Lz * 8^r` ids, numbered from 1 upward, and
//! within a band ids enumerate cells in row-major order (x fastest). Cell
//! indices are always expressed at the maximum refinement level `R`, so a
//! cell at level `r` occupies a cube of `2^(R - r)` indices per axis and
//! its children subdivide that cube.

use crate::grid_error::GridError;
use crate::topology::cell::CellId;

/// Cell indices, expressed at the maximum refinement level.
pub type Indices = [u64; 3];

/// Immutable description of the id space of one grid.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IndexSpace {
    length: [u64; 3],
    grid_length: u64,
    max_refinement_level: u8,
    last_id: u64,
}

impl IndexSpace {
    /// Creates an id space for a root grid of `length` unrefined cells,
    /// refinable `max_refinement_level` times; `None` auto-maximizes the
    /// level for the given lengths.
    pub fn new(length: [u64; 3], max_refinement_level: Option<u8>) -> Result<Self, GridError> {
        if length[0] == 0 || length[1] == 0 || length[2] == 0 {
            return Err(GridError::ZeroGridLength(length[0], length[1], length[2]));
        }

        let grid_length = length[0]
            .checked_mul(length[1])
            .and_then(|v| v.checked_mul(length[2]))
            .ok_or(GridError::GridTooLarge {
                lengths: length,
                max_level: 0,
            })?;

        let possible = Self::max_possible_refinement_level_for(grid_length);
        let max_refinement_level = match max_refinement_level {
            None => possible,
            Some(r) if r <= possible => r,
            Some(r) => {
                return Err(GridError::RefinementLevelTooLarge {
                    requested: r,
                    possible,
                });
            }
        };

        let last_id = Self::last_id_for(grid_length, max_refinement_level);
        Ok(Self {
            length,
            grid_length,
            max_refinement_level,
            last_id,
        })
    }

    /// Largest refinement level whose level bands still fit in a `u64` id.
    fn max_possible_refinement_level_for(grid_length: u64) -> u8 {
        let mut total: u128 = 0;
        let mut level: u8 = 0;
        loop {
            let band = (grid_length as u128) << (3 * level as u32);
            if total + band > u64::MAX as u128 {
                // the previous level was the last one that fit
                return level.saturating_sub(1);
            }
            total += band;
            if level == u8::MAX {
                return level;
            }
            level += 1;
        }
    }

    fn last_id_for(grid_length: u64, max_refinement_level: u8) -> u64 {
        let mut last: u64 = 0;
        for level in 0..=max_refinement_level {
            last += grid_length << (3 * level as u32);
        }
        last
    }

    /// Length of the grid in unrefined cells per axis.
    #[inline]
    pub fn length(&self) -> [u64; 3] {
        self.length
    }

    /// Number of unrefined cells.
    #[inline]
    pub fn grid_length(&self) -> u64 {
        self.grid_length
    }

    /// Maximum refinement level of any cell (0 means unrefined).
    #[inline]
    pub fn max_refinement_level(&self) -> u8 {
        self.max_refinement_level
    }

    /// Largest valid cell id for these lengths and maximum level.
    #[inline]
    pub fn last_id(&self) -> u64 {
        self.last_id
    }

    /// Length of the grid in indices per axis.
    #[inline]
    pub fn length_in_indices(&self) -> Indices {
        [
            self.length[0] << self.max_refinement_level as u32,
            self.length[1] << self.max_refinement_level as u32,
            self.length[2] << self.max_refinement_level as u32,
        ]
    }

    /// Edge length of a cell of the given refinement level, in indices.
    #[inline]
    pub fn size_at_level(&self, level: u8) -> u64 {
        1 << (self.max_refinement_level - level) as u32
    }

    /// The cell of the given refinement level at the given indices, or
    /// `None` if an index is outside the grid or the level is invalid.
    pub fn cell_at(&self, indices: Indices, level: u8) -> Option<CellId> {
        let max = self.length_in_indices();
        if indices[0] >= max[0] || indices[1] >= max[1] || indices[2] >= max[2] {
            return None;
        }
        if level > self.max_refinement_level {
            return None;
        }

        // ids of all coarser bands come first
        let mut id: u64 = 1;
        for coarser in 0..level {
            id += self.grid_length << (3 * coarser as u32);
        }

        let shift = (self.max_refinement_level - level) as u32;
        let x = indices[0] >> shift;
        let y = indices[1] >> shift;
        let z = indices[2] >> shift;

        let level_x_length = self.length[0] << level as u32;
        let level_y_length = self.length[1] << level as u32;
        id += x + y * level_x_length + z * level_x_length * level_y_length;

        // id >= 1 by construction
        Some(unsafe { CellId::new_unchecked(id) })
    }

    /// Refinement level of the given cell, or `None` for an id outside the
    /// valid range.
    pub fn level_of(&self, cell: CellId) -> Option<u8> {
        let raw = cell.get();
        if raw > self.last_id {
            return None;
        }
        let mut current_last: u64 = 0;
        for level in 0..=self.max_refinement_level {
            current_last += self.grid_length << (3 * level as u32);
            if raw <= current_last {
                return Some(level);
            }
        }
        None
    }

    /// Indices of the given cell, expressed at the maximum refinement
    /// level, or `None` for an invalid id.
    pub fn indices_of(&self, cell: CellId) -> Option<Indices> {
        let level = self.level_of(cell)?;

        let mut offset = cell.get();
        for coarser in 0..level {
            offset -= self.grid_length << (3 * coarser as u32);
        }
        offset -= 1; // numbering starts at 1

        let level_x_length = self.length[0] << level as u32;
        let level_y_length = self.length[1] << level as u32;
        let shift = (self.max_refinement_level - level) as u32;

        Some([
            (offset % level_x_length) << shift,
            ((offset / level_x_length) % level_y_length) << shift,
            (offset / (level_x_length * level_y_length)) << shift,
        ])
    }

    /// Edge length of the given cell in indices, or `None` for an invalid
    /// id.
    #[inline]
    pub fn size_in_indices(&self, cell: CellId) -> Option<u64> {
        Some(self.size_at_level(self.level_of(cell)?))
    }

    /// Parent of the given cell; a level-0 cell is its own parent.
    pub fn parent_of(&self, cell: CellId) -> Option<CellId> {
        let level = self.level_of(cell)?;
        if level == 0 {
            return Some(cell);
        }
        self.cell_at(self.indices_of(cell)?, level - 1)
    }

    /// All 8 children of the given cell in z-major order (x fastest), or
    /// `None` at the maximum refinement level or for an invalid id.
    ///
    /// The order is observable: refinement assigns payloads to children in
    /// exactly this order.
    pub fn children_of(&self, cell: CellId) -> Option<[CellId; 8]> {
        let level = self.level_of(cell)?;
        if level >= self.max_refinement_level {
            return None;
        }
        let indices = self.indices_of(cell)?;
        let half = self.size_at_level(level + 1);

        let mut children = [cell; 8];
        let mut slot = 0;
        for dz in [0, half] {
            for dy in [0, half] {
                for dx in [0, half] {
                    children[slot] = self.cell_at(
                        [indices[0] + dx, indices[1] + dy, indices[2] + dz],
                        level + 1,
                    )?;
                    slot += 1;
                }
            }
        }
        Some(children)
    }

    /// The cell and its 7 siblings (all children of its parent); a level-0
    /// cell is its own single sibling.
    pub fn siblings_of(&self, cell: CellId) -> Option<Vec<CellId>> {
        let level = self.level_of(cell)?;
        if level == 0 {
            return Some(vec![cell]);
        }
        let parent = self.parent_of(cell)?;
        Some(self.children_of(parent)?.to_vec())
    }

    /// True if the per-axis index ranges `[a, a + a_size)` and
    /// `[b, b + b_size)` overlap on every axis.
    pub fn indices_overlap(&self, a: Indices, a_size: u64, b: Indices, b_size: u64) -> bool {
        (0..3).all(|i| a[i] + a_size > b[i] && a[i] < b[i] + b_size)
    }

    /// Number of axes on which the footprints of the two cells overlap.
    pub fn overlapping_axes(&self, a: CellId, b: CellId) -> Option<u32> {
        let ia = self.indices_of(a)?;
        let ib = self.indices_of(b)?;
        let sa = self.size_in_indices(a)?;
        let sb = self.size_in_indices(b)?;
        Some(
            (0..3)
                .filter(|&i| ia[i] + sa > ib[i] && ia[i] < ib[i] + sb)
                .count() as u32,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space(l: [u64; 3], r: u8) -> IndexSpace {
        IndexSpace::new(l, Some(r)).unwrap()
    }

    #[test]
    fn rejects_zero_lengths() {
        assert!(IndexSpace::new([0, 1, 1], Some(0)).is_err());
    }

    #[test]
    fn rejects_too_large_level() {
        let possible = IndexSpace::new([1, 1, 1], None)
            .unwrap()
            .max_refinement_level();
        assert!(IndexSpace::new([1, 1, 1], Some(possible + 1)).is_err());
    }

    #[test]
    fn auto_level_is_maximal() {
        let s = IndexSpace::new([1, 1, 1], None).unwrap();
        // (8^23 - 1) / 7 overflows u64, (8^22 - 1) / 7 does not
        assert_eq!(s.max_refinement_level(), 21);
    }

    #[test]
    fn unrefined_ids_are_row_major_from_one() {
        let s = space([4, 3, 2], 0);
        assert_eq!(s.cell_at([0, 0, 0], 0).unwrap().get(), 1);
        assert_eq!(s.cell_at([1, 0, 0], 0).unwrap().get(), 2);
        assert_eq!(s.cell_at([0, 1, 0], 0).unwrap().get(), 5);
        assert_eq!(s.cell_at([0, 0, 1], 0).unwrap().get(), 13);
        assert_eq!(s.last_id(), 24);
    }

    #[test]
    fn level_bands_are_contiguous() {
        let s = space([2, 2, 2], 1);
        // band 0: 1..=8, band 1: 9..=72
        assert_eq!(s.cell_at([0, 0, 0], 1).unwrap().get(), 9);
        assert_eq!(s.last_id(), 8 + 64);
        assert_eq!(s.level_of(CellId::new(8).unwrap()), Some(0));
        assert_eq!(s.level_of(CellId::new(9).unwrap()), Some(1));
        assert_eq!(s.level_of(CellId::new(72).unwrap()), Some(1));
        assert_eq!(s.level_of(CellId::new(73).unwrap()), None);
    }

    #[test]
    fn indices_round_trip_at_level() {
        let s = space([4, 4, 4], 2);
        for &(ix, iy, iz, level) in
            &[(0, 0, 0, 0u8), (4, 8, 12, 0), (2, 0, 6, 1), (3, 5, 7, 2)]
        {
            let cell = s.cell_at([ix, iy, iz], level).unwrap();
            let size = s.size_at_level(level);
            let trunc = |i: u64| (i / size) * size;
            assert_eq!(s.indices_of(cell).unwrap(), [trunc(ix), trunc(iy), trunc(iz)]);
            assert_eq!(s.level_of(cell), Some(level));
        }
    }

    #[test]
    fn children_cover_parent_footprint() {
        let s = space([2, 2, 2], 2);
        let parent = s.cell_at([0, 0, 0], 0).unwrap();
        let children = s.children_of(parent).unwrap();
        // x fastest, then y, then z
        assert_eq!(s.indices_of(children[0]).unwrap(), [0, 0, 0]);
        assert_eq!(s.indices_of(children[1]).unwrap(), [2, 0, 0]);
        assert_eq!(s.indices_of(children[2]).unwrap(), [0, 2, 0]);
        assert_eq!(s.indices_of(children[4]).unwrap(), [0, 0, 2]);
        for child in children {
            assert_eq!(s.parent_of(child), Some(parent));
        }
    }

    #[test]
    fn root_cell_is_its_own_parent() {
        let s = space([2, 2, 2], 1);
        let root = s.cell_at([0, 0, 0], 0).unwrap();
        assert_eq!(s.parent_of(root), Some(root));
        assert_eq!(s.siblings_of(root).unwrap(), vec![root]);
    }

    #[test]
    fn no_children_at_max_level() {
        let s = space([2, 2, 2], 1);
        let fine = s.cell_at([0, 0, 0], 1).unwrap();
        assert!(s.children_of(fine).is_none());
    }

    #[test]
    fn out_of_grid_indices_are_rejected() {
        let s = space([4, 4, 4], 1);
        assert!(s.cell_at([8, 0, 0], 0).is_none());
        assert!(s.cell_at([0, 0, 0], 2).is_none());
    }

    #[test]
    fn overlap_counts_axes() {
        let s = space([4, 4, 4], 1);
        let a = s.cell_at([0, 0, 0], 1).unwrap();
        let face = s.cell_at([1, 0, 0], 1).unwrap();
        let diag = s.cell_at([1, 1, 0], 1).unwrap();
        assert_eq!(s.overlapping_axes(a, face), Some(2));
        assert_eq!(s.overlapping_axes(a, diag), Some(1));
    }
}
