//! Neighbor-list construction and maintenance.
//!
//! A local leaf's `neighbors_of` list is slot-ordered: one entry per
//! template offset, except that a slot covered by smaller cells holds
//! their 8 leaves consecutively, and off-grid slots hold `None`. The
//! `neighbors_to` list is the reverse relation: every cell that lists the
//! leaf among its own neighbors. The relation is asymmetric only between
//! cells of different refinement levels, so the reverse list is built
//! from the forward list plus a one-level-coarser search.

use super::Grid;
use crate::algs::communicator::Communicator;
use crate::algs::exchange::ExchangePlan;
use crate::data::store::CellData;
use crate::grid_error::GridError;
use crate::invariant_violation;
use crate::topology::cell::CellId;
use crate::topology::index::Indices;
use crate::topology::neighborhood::Offset;
use hashbrown::HashSet;
use std::collections::{BTreeMap, BTreeSet};

impl<P: CellData, C: Communicator> Grid<P, C> {
    /// Shifts `indices` by every offset of `offsets`, scaled by
    /// `size_in_indices`, wrapping on periodic axes. Off-grid results on
    /// non-periodic axes become `None`.
    pub(crate) fn indices_from_neighborhood(
        &self,
        indices: Indices,
        size_in_indices: u64,
        offsets: &[Offset],
    ) -> Vec<Option<Indices>> {
        let grid_len = self.space.length_in_indices();
        let mut result = Vec::with_capacity(offsets.len());

        'offsets: for offset in offsets {
            let mut shifted = indices;
            for dim in 0..3 {
                let step = offset[dim];
                if step < 0 {
                    if self.periodic[dim] {
                        // the neighborhood may wrap around the grid several times
                        for _ in 0..(-step) {
                            if shifted[dim] >= size_in_indices {
                                shifted[dim] -= size_in_indices;
                            } else {
                                shifted[dim] = grid_len[dim] - size_in_indices;
                            }
                        }
                    } else {
                        let reach = (-step) as u64 * size_in_indices;
                        if indices[dim] < reach {
                            result.push(None);
                            continue 'offsets;
                        }
                        shifted[dim] -= reach;
                    }
                } else if step > 0 {
                    if self.periodic[dim] {
                        for _ in 0..step {
                            if shifted[dim] < grid_len[dim] - size_in_indices {
                                shifted[dim] += size_in_indices;
                            } else {
                                shifted[dim] = 0;
                            }
                        }
                    } else {
                        let reach = step as u64 * size_in_indices;
                        if indices[dim] + reach >= grid_len[dim] {
                            result.push(None);
                            continue 'offsets;
                        }
                        shifted[dim] += reach;
                    }
                }
            }
            result.push(Some(shifted));
        }
        result
    }

    /// Finds the existing leaves around `cell` by scanning the template,
    /// searching refinement levels within `max_diff` of the cell's own.
    ///
    /// Does not use stored lists, so it works for cells that just changed
    /// owner or whose children were just created. Finding no cell where
    /// the template demands one means an earlier invariant was broken and
    /// is fatal.
    pub(crate) fn find_neighbors_of(
        &self,
        cell: CellId,
        max_diff: u8,
        allow_children: bool,
    ) -> Vec<Option<CellId>> {
        let mut found = Vec::new();

        let Some(level) = self.space.level_of(cell) else {
            return found;
        };
        if !self.directory.contains(cell) {
            return found;
        }
        if !allow_children && self.directory.has_children(&self.space, cell) {
            return found;
        }

        let size = self.space.size_at_level(level);
        let indices = match self.space.indices_of(cell) {
            Some(indices) => indices,
            None => return found,
        };
        let min_level = level.saturating_sub(max_diff);
        let max_level = (level + max_diff).min(self.space.max_refinement_level());

        for target in self.indices_from_neighborhood(indices, size, self.neighborhood.offsets_of())
        {
            let Some(target) = target else {
                found.push(None);
                continue;
            };

            let neighbor = self
                .directory
                .existing_cell_at(&self.space, target, min_level, max_level)
                .unwrap_or_else(|| {
                    invariant_violation!(
                        "no existing cell at indices {target:?} within levels [{min_level}, {max_level}] next to cell {cell}"
                    )
                });

            let neighbor_level = self
                .space
                .level_of(neighbor)
                .unwrap_or_else(|| invariant_violation!("existing cell {neighbor} has no level"));

            if neighbor_level <= level {
                found.push(Some(neighbor));
            } else {
                // smaller neighbors: keep the full footprint of the slot so
                // slot arithmetic stays fixed-width
                let target_max = [
                    target[0] + size - 1,
                    target[1] + size - 1,
                    target[2] + size - 1,
                ];
                let smaller = self.directory.leaves_in_box(
                    &self.space,
                    target,
                    target_max,
                    min_level,
                    max_level,
                );
                if smaller.is_empty() {
                    invariant_violation!(
                        "no leaves inside {target:?}..{target_max:?} next to cell {cell}"
                    );
                }
                found.extend(smaller.into_iter().map(Some));
            }
        }
        found
    }

    /// Finds every leaf that considers `cell` a neighbor, without using
    /// stored lists: the union of a one-level-coarser search through the
    /// parent, per-child searches one level finer, and a same-level
    /// search. Sorted ascending.
    pub(crate) fn find_neighbors_to_full(&self, cell: CellId) -> Vec<CellId> {
        let mut unique = HashSet::new();

        let Some(level) = self.space.level_of(cell) else {
            return Vec::new();
        };
        if !self.directory.contains(cell) || self.directory.has_children(&self.space, cell) {
            return Vec::new();
        }

        // larger cells that reach this cell
        if level > 0 {
            if let Some(parent) = self.space.parent_of(cell) {
                self.collect_neighbors_to_at(parent, level - 1, &mut unique);
            }
        }

        // smaller cells that reach this cell
        if level < self.space.max_refinement_level() {
            if let Some(children) = self.space.children_of(cell) {
                for child in children {
                    self.collect_neighbors_to_at(child, level + 1, &mut unique);
                }
            }
        }

        // same-level cells
        self.collect_neighbors_to_at(cell, level, &mut unique);

        let mut result: Vec<CellId> = unique.into_iter().collect();
        result.sort_unstable();
        result
    }

    /// Adds to `unique` the existing leaves of exactly `level` reached by
    /// the reverse template from `probe`'s position.
    fn collect_neighbors_to_at(&self, probe: CellId, level: u8, unique: &mut HashSet<CellId>) {
        let Some(indices) = self.space.indices_of(probe) else {
            return;
        };
        let size = self.space.size_at_level(self.space.level_of(probe).unwrap_or(level));

        for target in self.indices_from_neighborhood(indices, size, self.neighborhood.offsets_to())
        {
            let Some(target) = target else { continue };
            let Some(found) = self.space.cell_at(target, level) else {
                continue;
            };
            if self.directory.is_leaf(&self.space, found) {
                unique.insert(found);
            }
        }
    }

    /// As [`find_neighbors_to_full`], but reuses the already-computed
    /// forward list for the same-or-smaller cases; only larger cells need
    /// a fresh search. Sorted ascending.
    ///
    /// [`find_neighbors_to_full`]: Grid::find_neighbors_to_full
    pub(crate) fn find_neighbors_to_using(
        &self,
        cell: CellId,
        neighbors_of: &[Option<CellId>],
    ) -> Vec<CellId> {
        let mut unique = HashSet::new();

        let Some(level) = self.space.level_of(cell) else {
            return Vec::new();
        };
        if !self.directory.contains(cell) || self.directory.has_children(&self.space, cell) {
            return Vec::new();
        }

        for neighbor in neighbors_of.iter().flatten() {
            if self.is_neighbor_of(*neighbor, cell) {
                unique.insert(*neighbor);
            }
        }

        if level > 0 {
            if let Some(parent) = self.space.parent_of(cell) {
                self.collect_neighbors_to_at(parent, level - 1, &mut unique);
            }
        }

        let mut result: Vec<CellId> = unique.into_iter().collect();
        result.sort_unstable();
        result
    }

    /// True if cell `a` considers cell `b` a neighbor, whether or not
    /// either exists.
    pub(crate) fn is_neighbor_of(&self, a: CellId, b: CellId) -> bool {
        let (Some(ia), Some(ib)) = (self.space.indices_of(a), self.space.indices_of(b)) else {
            return false;
        };
        let (Some(sa), Some(sb)) = (self.space.size_in_indices(a), self.space.size_in_indices(b))
        else {
            return false;
        };
        let grid_len = self.space.length_in_indices();

        let mut max_distance: u64 = 0;
        for dim in 0..3 {
            let distance = if ia[dim] <= ib[dim] {
                let direct = if ib[dim] <= ia[dim] + sa {
                    0
                } else {
                    ib[dim] - (ia[dim] + sa)
                };
                if self.periodic[dim] {
                    let to_end = grid_len[dim] - (ib[dim] + sb);
                    direct.min(ia[dim] + to_end)
                } else {
                    direct
                }
            } else {
                let direct = if ia[dim] <= ib[dim] + sb {
                    0
                } else {
                    ia[dim] - (ib[dim] + sb)
                };
                if self.periodic[dim] {
                    let to_end = grid_len[dim] - (ia[dim] + sa);
                    direct.min(ib[dim] + to_end)
                } else {
                    direct
                }
            };
            max_distance = max_distance.max(distance);
        }

        if self.neighborhood.size() == 0 {
            // face stencil: within reach and not merely diagonal
            max_distance < sa && self.space.overlapping_axes(a, b).unwrap_or(0) >= 2
        } else {
            max_distance < self.neighborhood.size() as u64 * sa
        }
    }

    /// Recomputes both neighbor lists of one local leaf.
    pub(crate) fn update_neighbors(&mut self, cell: CellId) {
        if self.directory.owner_of(cell) != Some(self.rank()) {
            return;
        }
        if self.directory.has_children(&self.space, cell) {
            return;
        }

        let of = self.find_neighbors_of(cell, 1, false);
        let to = self.find_neighbors_to_using(cell, &of);
        self.neighbors_of.insert(cell, of);
        self.neighbors_to.insert(cell, to);
    }

    /// Re-derives the remote-neighbor bookkeeping of one local leaf from
    /// its current lists.
    pub(crate) fn update_remote_neighbor_info(&mut self, cell: CellId) {
        if !self.cells.contains_key(&cell) {
            return;
        }
        // payloads of just-removed cells linger until their transfers finish
        if !self.directory.contains(cell) {
            return;
        }
        if self.directory.has_children(&self.space, cell) {
            return;
        }

        self.cells_with_remote_neighbors.remove(&cell);

        let me = self.rank();
        let (Some(of), Some(to)) = (self.neighbors_of.get(&cell), self.neighbors_to.get(&cell))
        else {
            invariant_violation!("neighbor lists of local cell {cell} are missing");
        };

        let mut remote = Vec::new();
        for neighbor in of.iter().flatten() {
            if self.directory.owner_of(*neighbor) != Some(me) {
                remote.push(*neighbor);
            }
        }
        for neighbor in to {
            if self.directory.owner_of(*neighbor) != Some(me) {
                remote.push(*neighbor);
            }
        }

        if !remote.is_empty() {
            self.cells_with_remote_neighbors.insert(cell);
            self.remote_cells_with_local_neighbors.extend(remote);
        }
    }

    /// Rebuilds the remote-neighbor bookkeeping of every local leaf.
    pub(crate) fn update_remote_neighbor_info_all(&mut self) {
        self.cells_with_remote_neighbors.clear();
        self.remote_cells_with_local_neighbors.clear();

        let local: Vec<CellId> = self.cells.keys().copied().collect();
        for cell in local {
            if self.directory.has_children(&self.space, cell) {
                continue;
            }
            self.update_remote_neighbor_info(cell);
        }
    }

    /// Recomputes the per-peer send and receive lists of neighbor-data
    /// updates from the current remote-neighbor bookkeeping.
    pub(crate) fn recalculate_ghost_plan(&mut self) -> Result<(), GridError> {
        let me = self.rank();
        let mut to_send: BTreeMap<usize, BTreeSet<CellId>> = BTreeMap::new();
        let mut to_receive: BTreeMap<usize, BTreeSet<CellId>> = BTreeMap::new();

        for cell in &self.cells_with_remote_neighbors {
            let (Some(of), Some(to)) = (self.neighbors_of.get(cell), self.neighbors_to.get(cell))
            else {
                invariant_violation!("neighbor lists of local cell {cell} are missing");
            };

            // data arrives from remote cells this one observes
            for neighbor in of.iter().flatten() {
                match self.directory.owner_of(*neighbor) {
                    Some(owner) if owner != me => {
                        to_receive.entry(owner).or_default().insert(*neighbor);
                    }
                    Some(_) => {}
                    None => invariant_violation!("neighbor {neighbor} of {cell} does not exist"),
                }
            }

            // data goes to ranks whose cells observe this one
            for neighbor in to {
                match self.directory.owner_of(*neighbor) {
                    Some(owner) if owner != me => {
                        to_send.entry(owner).or_default().insert(*cell);
                    }
                    Some(_) => {}
                    None => invariant_violation!("neighbor {neighbor} of {cell} does not exist"),
                }
            }
        }

        let mut plan = ExchangePlan::new();
        for (peer, cells) in to_send {
            for cell in cells {
                plan.add_send(peer, cell);
            }
        }
        for (peer, cells) in to_receive {
            for cell in cells {
                plan.add_receive(peer, cell);
            }
        }
        plan.finalize()?;
        self.ghost_plan = plan;
        Ok(())
    }

    /// Checks every stored neighbor list against a fresh recomputation.
    pub fn verify_neighbors(&self) -> bool {
        for (cell, stored) in &self.neighbors_of {
            let fresh = self.find_neighbors_of(*cell, 1, false);
            if *stored != fresh {
                tracing::error!(%cell, "stored neighbors_of diverges from recomputation");
                return false;
            }
            let fresh_to = self.find_neighbors_to_using(*cell, &fresh);
            match self.neighbors_to.get(cell) {
                Some(stored_to) if *stored_to == fresh_to => {}
                _ => {
                    tracing::error!(%cell, "stored neighbors_to diverges from recomputation");
                    return false;
                }
            }
        }
        true
    }

    /// Checks the remote-neighbor bookkeeping against the neighbor lists.
    pub fn verify_remote_neighbor_info(&self) -> bool {
        let me = self.rank();
        for (cell, of) in &self.neighbors_of {
            let empty = Vec::new();
            let to = self.neighbors_to.get(cell).unwrap_or(&empty);
            let has_remote = of
                .iter()
                .flatten()
                .chain(to.iter())
                .any(|n| self.directory.owner_of(*n) != Some(me));
            if has_remote != self.cells_with_remote_neighbors.contains(cell) {
                tracing::error!(%cell, "cells_with_remote_neighbors out of date");
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use crate::algs::communicator::NoComm;
    use crate::algs::exchange::TransferMode;
    use crate::geometry::UniformGeometry;
    use crate::grid::{Grid, GridBuilder};
    use crate::topology::cell::CellId;
    use std::sync::Arc;

    fn grid(
        length: [u64; 3],
        max_level: u8,
        size: u32,
        periodic: [bool; 3],
    ) -> Grid<f64, NoComm> {
        let builder = GridBuilder::new()
            .length(length[0], length[1], length[2])
            .maximum_refinement_level(max_level)
            .neighborhood_size(size)
            .periodic(periodic[0], periodic[1], periodic[2])
            .transfer_mode(TransferMode::Bulk);
        let space = builder.index_space().unwrap();
        builder
            .build(NoComm, Arc::new(UniformGeometry::unit(&space)))
            .unwrap()
    }

    fn cell(raw: u64) -> CellId {
        CellId::new(raw).unwrap()
    }

    #[test]
    fn offsets_leave_the_grid_as_none() {
        let g = grid([4, 1, 1], 0, 1, [false; 3]);
        let shifted =
            g.indices_from_neighborhood([0, 0, 0], 1, &[[-1, 0, 0], [1, 0, 0], [3, 0, 0]]);
        assert_eq!(shifted, vec![None, Some([1, 0, 0]), Some([3, 0, 0])]);
        let too_far = g.indices_from_neighborhood([0, 0, 0], 1, &[[4, 0, 0]]);
        assert_eq!(too_far, vec![None]);
    }

    #[test]
    fn periodic_offsets_wrap_repeatedly() {
        let g = grid([4, 1, 1], 0, 2, [true, false, false]);
        let shifted = g.indices_from_neighborhood(
            [0, 0, 0],
            1,
            &[[-1, 0, 0], [-2, 0, 0], [5, 0, 0], [0, 1, 0]],
        );
        // wrapping runs one cell at a time, any number of times around
        assert_eq!(
            shifted,
            vec![Some([3, 0, 0]), Some([2, 0, 0]), Some([1, 0, 0]), None]
        );
    }

    #[test]
    fn same_size_face_cells_are_neighbors() {
        let g = grid([4, 4, 4], 0, 1, [false; 3]);
        assert!(g.is_neighbor_of(cell(1), cell(2)));
        assert!(g.is_neighbor_of(cell(2), cell(1)));
        // two steps apart exceeds the radius
        assert!(!g.is_neighbor_of(cell(1), cell(3)));
    }

    #[test]
    fn face_stencil_excludes_diagonals() {
        let g = grid([4, 4, 4], 0, 0, [false; 3]);
        let a = cell(1); // (0, 0, 0)
        let face = cell(2); // (1, 0, 0)
        let edge = cell(6); // (1, 1, 0)
        let corner = cell(22); // (1, 1, 1)
        assert!(g.is_neighbor_of(a, face));
        assert!(!g.is_neighbor_of(a, edge));
        assert!(!g.is_neighbor_of(a, corner));
    }

    #[test]
    fn periodic_distance_takes_the_short_way_around() {
        let g = grid([8, 1, 1], 0, 1, [true, false, false]);
        let first = cell(1);
        let last = cell(8);
        assert!(g.is_neighbor_of(first, last));
        assert!(g.is_neighbor_of(last, first));
        assert!(!g.is_neighbor_of(first, cell(4)));
    }

    #[test]
    fn smaller_neighbors_fill_a_whole_slot() {
        let mut g = grid([2, 1, 1], 1, 1, [false; 3]);
        g.refine_completely(cell(1));
        g.stop_refining().unwrap();

        let list = g.find_neighbors_of(cell(2), 1, false);
        let real: Vec<CellId> = list.iter().flatten().copied().collect();
        assert_eq!(real.len(), 8, "one refined slot expands to 8 leaves");
        // expansion preserves x-then-y-then-z order
        let space = g.index_space();
        assert_eq!(space.indices_of(real[0]).unwrap(), [0, 0, 0]);
        assert_eq!(space.indices_of(real[1]).unwrap(), [1, 0, 0]);

        // a larger neighbor is reported once from the child's side
        let child = g.children_of(cell(1)).unwrap()[1];
        let from_child = g.find_neighbors_of(child, 1, false);
        assert!(from_child.iter().flatten().any(|n| *n == cell(2)));
    }

    #[test]
    fn asymmetric_sight_between_levels() {
        let mut g = grid([2, 1, 1], 1, 1, [false; 3]);
        g.refine_completely(cell(1));
        g.stop_refining().unwrap();

        // the big cell sees every child, but only facing children see it
        let far_child = g.children_of(cell(1)).unwrap()[0];
        let near_child = g.children_of(cell(1)).unwrap()[1];
        assert!(g.is_neighbor_of(cell(2), far_child));
        assert!(g.is_neighbor_of(cell(2), near_child));
        assert!(g.is_neighbor_of(near_child, cell(2)));
        assert!(!g.is_neighbor_of(far_child, cell(2)));
    }
}
