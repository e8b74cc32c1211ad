//! Replicated directory of existing cells and their owning ranks.
//!
//! Every rank holds the same `cell -> owner` map for all cells that
//! currently exist: the root cells, plus, for every refined cell, the cell
//! itself and its children. A cell is a *leaf* when none of its children
//! are present; the leaves cover the grid exactly once.
//!
//! The directory is only mutated inside collective operations (initial
//! construction, `stop_refining`, migrations), with deltas applied in rank
//! order so every rank converges to the same map.

use crate::topology::cell::CellId;
use crate::topology::index::{IndexSpace, Indices};
use hashbrown::{HashMap, HashSet};

/// Replicated `cell -> owning rank` map with existence searches.
#[derive(Clone, Debug, Default)]
pub struct CellDirectory {
    owners: HashMap<CellId, usize>,
}

impl CellDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of existing cells (leaves and refined ancestors).
    #[inline]
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    #[inline]
    pub fn contains(&self, cell: CellId) -> bool {
        self.owners.contains_key(&cell)
    }

    /// Owner of the given cell, or `None` if the cell does not exist.
    #[inline]
    pub fn owner_of(&self, cell: CellId) -> Option<usize> {
        self.owners.get(&cell).copied()
    }

    #[inline]
    pub fn insert(&mut self, cell: CellId, owner: usize) {
        self.owners.insert(cell, owner);
    }

    #[inline]
    pub fn remove(&mut self, cell: CellId) -> Option<usize> {
        self.owners.remove(&cell)
    }

    /// Iterates over all existing cells with their owners, in map order.
    pub fn iter(&self) -> impl Iterator<Item = (CellId, usize)> + '_ {
        self.owners.iter().map(|(c, r)| (*c, *r))
    }

    /// True if the cell exists and at least one of its children exists.
    pub fn has_children(&self, space: &IndexSpace, cell: CellId) -> bool {
        if !self.contains(cell) {
            return false;
        }
        match space.children_of(cell) {
            // existence invariant: either all 8 children exist or none
            Some(children) => self.contains(children[0]),
            None => false,
        }
    }

    /// True if the cell exists and has no children.
    #[inline]
    pub fn is_leaf(&self, space: &IndexSpace, cell: CellId) -> bool {
        self.contains(cell) && !self.has_children(space, cell)
    }

    /// The smallest existing cell covering `indices` whose refinement
    /// level lies within `[min_level, max_level]`, found by bisecting the
    /// level range. Returns `None` if no such cell exists or the indices
    /// are outside the grid.
    pub fn existing_cell_at(
        &self,
        space: &IndexSpace,
        indices: Indices,
        min_level: u8,
        max_level: u8,
    ) -> Option<CellId> {
        let max = space.length_in_indices();
        if indices[0] >= max[0] || indices[1] >= max[1] || indices[2] >= max[2] {
            return None;
        }
        if min_level > max_level {
            return None;
        }

        let mid_level = (min_level + max_level) / 2;
        let mid = space.cell_at(indices, mid_level)?;

        if self.contains(mid) {
            if mid_level < max_level {
                // prefer the smallest existing cell
                match self.existing_cell_at(space, indices, mid_level + 1, max_level) {
                    Some(smaller) => Some(smaller),
                    None => Some(mid),
                }
            } else {
                Some(mid)
            }
        } else if mid_level > min_level {
            self.existing_cell_at(space, indices, min_level, mid_level - 1)
        } else {
            None
        }
    }

    /// Unique existing leaves within the inclusive index box and refinement
    /// level range, ordered first in x, then y, then z.
    pub fn leaves_in_box(
        &self,
        space: &IndexSpace,
        indices_min: Indices,
        indices_max: Indices,
        min_level: u8,
        max_level: u8,
    ) -> Vec<CellId> {
        let step = space.size_at_level(max_level);
        let mut result = Vec::new();
        let mut seen = HashSet::new();

        let mut iz = indices_min[2];
        while iz <= indices_max[2] {
            let mut iy = indices_min[1];
            while iy <= indices_max[1] {
                let mut ix = indices_min[0];
                while ix <= indices_max[0] {
                    let cell = self.existing_cell_at(space, [ix, iy, iz], min_level, max_level);
                    if let Some(cell) = cell {
                        // cells with children may exist above max_level searches;
                        // only leaves count
                        if !self.has_children(space, cell) && seen.insert(cell) {
                            result.push(cell);
                        }
                    }
                    ix += step;
                }
                iy += step;
            }
            iz += step;
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> IndexSpace {
        IndexSpace::new([2, 2, 2], Some(2)).unwrap()
    }

    fn seeded(space: &IndexSpace) -> CellDirectory {
        let mut dir = CellDirectory::new();
        for raw in 1..=space.grid_length() {
            dir.insert(CellId::new(raw).unwrap(), 0);
        }
        dir
    }

    #[test]
    fn leaf_and_children_tests() {
        let s = space();
        let mut dir = seeded(&s);
        let root = CellId::new(1).unwrap();
        assert!(dir.is_leaf(&s, root));

        for child in s.children_of(root).unwrap() {
            dir.insert(child, 0);
        }
        assert!(dir.has_children(&s, root));
        assert!(!dir.is_leaf(&s, root));
        assert!(dir.is_leaf(&s, s.children_of(root).unwrap()[0]));
    }

    #[test]
    fn existing_cell_search_prefers_smallest() {
        let s = space();
        let mut dir = seeded(&s);
        let root = CellId::new(1).unwrap();
        let children = s.children_of(root).unwrap();
        for child in children {
            dir.insert(child, 0);
        }

        let r = s.max_refinement_level();
        assert_eq!(
            dir.existing_cell_at(&s, [0, 0, 0], 0, r),
            Some(children[0])
        );
        // a search capped at level 0 still finds the refined root
        assert_eq!(dir.existing_cell_at(&s, [0, 0, 0], 0, 0), Some(root));
        // unrefined root cell elsewhere
        let other = s.cell_at([4, 0, 0], 0).unwrap();
        assert_eq!(dir.existing_cell_at(&s, [4, 0, 0], 0, r), Some(other));
    }

    #[test]
    fn search_outside_grid_is_none() {
        let s = space();
        let dir = seeded(&s);
        assert_eq!(dir.existing_cell_at(&s, [8, 0, 0], 0, 2), None);
    }

    #[test]
    fn leaves_in_box_skips_refined_parents() {
        let s = space();
        let mut dir = seeded(&s);
        let root = CellId::new(1).unwrap();
        let children = s.children_of(root).unwrap();
        for child in children {
            dir.insert(child, 0);
        }

        // box covering the refined root's footprint at its own level range
        let leaves = dir.leaves_in_box(&s, [0, 0, 0], [3, 3, 3], 0, 1);
        assert_eq!(leaves.len(), 8);
        assert!(leaves.iter().all(|c| children.contains(c)));

        // x-then-y-then-z order
        assert_eq!(leaves[0], children[0]);
        assert_eq!(leaves[1], children[1]);
    }
}
