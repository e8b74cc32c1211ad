//! The refinement engine: staging of refine/unrefine requests and the
//! collective that executes them.
//!
//! Requests accumulate locally between collectives. `stop_refining` then
//! (1) induces extra refines until the one-level difference between
//! neighbors holds globally, (2) propagates unrefine vetoes, (3) drops
//! unrefines that conflict with refines, and (4) applies everything:
//! children are created on their parent's rank, payloads of refined cells
//! move to a staging store, payloads of removed leaves travel to the
//! parent's owner, and every affected neighbor list is rebuilt.

use super::Grid;
use crate::algs::communicator::{tags, Communicator};
use crate::algs::exchange::{self, all_gather_cells, ExchangePlan};
use crate::data::store::CellData;
use crate::grid_error::GridError;
use crate::invariant_violation;
use crate::topology::cell::CellId;
use hashbrown::HashSet;

impl<P: CellData, C: Communicator> Grid<P, C> {
    /// Requests that the given local leaf be replaced by its 8 children.
    ///
    /// Takes priority over unrefining. Takes effect at the next
    /// `stop_refining`; does nothing for the sentinel-free invalid cases
    /// (cell unknown, not local, already refined). At the maximum
    /// refinement level the request turns into [`dont_unrefine`].
    ///
    /// [`dont_unrefine`]: Grid::dont_unrefine
    pub fn refine_completely(&mut self, cell: CellId) {
        if !self.directory.contains(cell) || !self.cells.contains_key(&cell) {
            return;
        }
        let Some(level) = self.space.level_of(cell) else {
            return;
        };
        if self.directory.has_children(&self.space, cell) {
            return;
        }
        if level == self.space.max_refinement_level() {
            self.dont_unrefine(cell);
            return;
        }

        self.cells_to_refine.insert(cell);

        // a refine vetoes pending unrefines of its own sibling group and
        // of every same-or-larger neighbor's group
        if let Some(siblings) = self.space.siblings_of(cell) {
            for sibling in siblings {
                self.cells_to_unrefine.remove(&sibling);
            }
        }

        let mut neighbors: Vec<CellId> = Vec::new();
        if let Some(of) = self.neighbors_of.get(&cell) {
            neighbors.extend(of.iter().flatten().copied());
        }
        if let Some(to) = self.neighbors_to.get(&cell) {
            neighbors.extend(to.iter().copied());
        }
        for neighbor in neighbors {
            if self.space.level_of(neighbor).is_some_and(|l| l <= level) {
                if let Some(siblings) = self.space.siblings_of(neighbor) {
                    for sibling in siblings {
                        self.cells_to_unrefine.remove(&sibling);
                    }
                }
            }
        }
    }

    /// As [`refine_completely`], for the smallest existing cell at the
    /// given coordinates; outside-grid coordinates are a no-op.
    ///
    /// [`refine_completely`]: Grid::refine_completely
    pub fn refine_completely_at(&mut self, x: f64, y: f64, z: f64) {
        if let Some(cell) = self.existing_cell_at(x, y, z) {
            self.refine_completely(cell);
        }
    }

    /// Requests that the given local leaf and its siblings be replaced by
    /// their parent.
    ///
    /// Refines win conflicts. The request is dropped unless every sibling
    /// is an unrequested, unpinned leaf and the parent would still differ
    /// by at most one level from its prospective neighbors. At most one
    /// sibling per group is recorded.
    pub fn unrefine_completely(&mut self, cell: CellId) {
        if !self.directory.contains(cell) || !self.cells.contains_key(&cell) {
            return;
        }
        let Some(level) = self.space.level_of(cell) else {
            return;
        };
        if level == 0 || self.directory.has_children(&self.space, cell) {
            return;
        }

        let Some(siblings) = self.space.siblings_of(cell) else {
            return;
        };
        for sibling in &siblings {
            if self.directory.has_children(&self.space, *sibling) {
                return;
            }
            if self.cells_to_refine.contains(sibling)
                || self.cells_not_to_unrefine.contains(sibling)
            {
                return;
            }
        }

        // the parent must still satisfy the one-level rule afterwards
        let Some(parent) = self.space.parent_of(cell) else {
            return;
        };
        let parent_level = level - 1;
        for neighbor in self.find_neighbors_of(parent, 2, true).iter().flatten() {
            let Some(neighbor_level) = self.space.level_of(*neighbor) else {
                continue;
            };
            if neighbor_level > parent_level + 1 {
                return;
            }
            if neighbor_level == parent_level + 1 && self.cells_to_refine.contains(neighbor) {
                return;
            }
        }

        for sibling in &siblings {
            if self.cells_to_unrefine.contains(sibling) {
                return;
            }
        }

        self.cells_to_unrefine.insert(cell);
    }

    /// As [`unrefine_completely`], for the smallest existing cell at the
    /// given coordinates.
    ///
    /// [`unrefine_completely`]: Grid::unrefine_completely
    pub fn unrefine_completely_at(&mut self, x: f64, y: f64, z: f64) {
        if let Some(cell) = self.existing_cell_at(x, y, z) {
            self.unrefine_completely(cell);
        }
    }

    /// Prevents the given local leaf and its siblings from being
    /// unrefined during the next `stop_refining`.
    pub fn dont_unrefine(&mut self, cell: CellId) {
        if !self.directory.contains(cell) || !self.cells.contains_key(&cell) {
            return;
        }
        let Some(level) = self.space.level_of(cell) else {
            return;
        };
        if level == 0 || self.directory.has_children(&self.space, cell) {
            return;
        }

        let Some(siblings) = self.space.siblings_of(cell) else {
            return;
        };
        // one veto per sibling group is enough
        for sibling in &siblings {
            if self.cells_not_to_unrefine.contains(sibling) {
                return;
            }
        }
        for sibling in &siblings {
            self.cells_to_unrefine.remove(sibling);
        }
        self.cells_not_to_unrefine.insert(cell);
    }

    /// As [`dont_unrefine`], for the smallest existing cell at the given
    /// coordinates.
    ///
    /// [`dont_unrefine`]: Grid::dont_unrefine
    pub fn dont_unrefine_at(&mut self, x: f64, y: f64, z: f64) {
        if let Some(cell) = self.existing_cell_at(x, y, z) {
            self.dont_unrefine(cell);
        }
    }

    /// Executes all refines and unrefines requested so far. Collective.
    ///
    /// Returns the cells created on this rank, ascending. Payloads of
    /// removed leaves move to the rank of their parent and stay readable
    /// through [`removed_cells`] / [`payload`] until the next balance.
    ///
    /// [`removed_cells`]: Grid::removed_cells
    /// [`payload`]: Grid::payload
    pub fn stop_refining(&mut self) -> Result<Vec<CellId>, GridError> {
        tracing::debug!(
            refines = self.cells_to_refine.len(),
            unrefines = self.cells_to_unrefine.len(),
            vetoes = self.cells_not_to_unrefine.len(),
            "stop_refining"
        );

        self.induce_refines();

        self.cells_not_to_unrefine = Self::all_to_all_cell_set(&self.comm, &self.cells_not_to_unrefine);
        self.override_unrefines();
        self.cells_not_to_unrefine.clear();

        self.execute_refines()
    }

    /// Cells removed by the last unrefinement whose parent is on this
    /// rank; their payloads are readable until the next balance.
    pub fn removed_cells(&self) -> Vec<CellId> {
        let mut cells: Vec<CellId> = self.unrefined_data.keys().copied().collect();
        cells.sort_unstable();
        cells
    }

    /// Drops the staged payloads of refined and unrefined cells.
    pub fn clear_refined_unrefined_data(&mut self) {
        self.refined_data.clear();
        self.unrefined_data.clear();
    }

    /// Merges every rank's copy of a cell set. Collective.
    fn all_to_all_cell_set(comm: &C, set: &HashSet<CellId>) -> HashSet<CellId> {
        let mut local: Vec<CellId> = set.iter().copied().collect();
        local.sort_unstable();
        let mut merged = set.clone();
        for cells in all_gather_cells(comm, &local) {
            merged.extend(cells);
        }
        merged
    }

    /// Grows `cells_to_refine` until no neighbor anywhere is more than
    /// one level coarser than a refined cell. Collective; loops until a
    /// global fixed point.
    fn induce_refines(&mut self) {
        let me = self.rank();
        let mut new_refines: Vec<CellId> = self.cells_to_refine.iter().copied().collect();
        new_refines.sort_unstable();

        loop {
            let all_new = all_gather_cells(&self.comm, &new_refines);
            if all_new.iter().all(Vec::is_empty) {
                break;
            }

            let mut induced: HashSet<CellId> = HashSet::new();

            // neighbors of locally refined cells
            for refined in &all_new[me] {
                let Some(level) = self.space.level_of(*refined) else {
                    continue;
                };
                let mut neighbors: Vec<CellId> = Vec::new();
                if let Some(of) = self.neighbors_of.get(refined) {
                    neighbors.extend(of.iter().flatten().copied());
                }
                if let Some(to) = self.neighbors_to.get(refined) {
                    neighbors.extend(to.iter().copied());
                }
                for neighbor in neighbors {
                    if self.directory.owner_of(neighbor) != Some(me) {
                        continue;
                    }
                    if self.space.level_of(neighbor).is_some_and(|l| l < level)
                        && !self.cells_to_refine.contains(&neighbor)
                    {
                        induced.insert(neighbor);
                    }
                }
            }

            // local cells bordering cells refined by other ranks
            for (rank, refines) in all_new.iter().enumerate() {
                if rank == me {
                    continue;
                }
                for refined in refines {
                    if !self.remote_cells_with_local_neighbors.contains(refined) {
                        continue;
                    }
                    let Some(level) = self.space.level_of(*refined) else {
                        continue;
                    };
                    for local in &self.cells_with_remote_neighbors {
                        if self.space.level_of(*local).is_some_and(|l| l < level)
                            && !self.cells_to_refine.contains(local)
                            && self.is_neighbor_of(*local, *refined)
                        {
                            induced.insert(*local);
                        }
                    }
                }
            }

            new_refines = induced.iter().copied().collect();
            new_refines.sort_unstable();
            self.cells_to_refine.extend(induced);
        }

        self.cells_to_refine = Self::all_to_all_cell_set(&self.comm, &self.cells_to_refine);
    }

    /// Drops unrefines that would break the one-level rule given the
    /// (global) refine set, then replicates the survivors. Collective;
    /// `cells_to_refine` and `cells_not_to_unrefine` must already be
    /// identical on every rank.
    fn override_unrefines(&mut self) {
        let max_diff: u8 = 1;
        let mut survivors: HashSet<CellId> = HashSet::new();

        'candidates: for unrefined in &self.cells_to_unrefine {
            let Some(parent) = self.space.parent_of(*unrefined) else {
                continue;
            };
            let Some(siblings) = self.space.children_of(parent) else {
                continue;
            };
            for sibling in siblings {
                if self.cells_to_refine.contains(&sibling)
                    || self.cells_not_to_unrefine.contains(&sibling)
                {
                    continue 'candidates;
                }
            }

            let Some(parent_level) = self.space.level_of(parent) else {
                continue;
            };
            for neighbor in self.find_neighbors_of(parent, 2, true).iter().flatten() {
                if self
                    .space
                    .level_of(*neighbor)
                    .is_some_and(|l| l == parent_level + max_diff)
                    && self.cells_to_refine.contains(neighbor)
                {
                    continue 'candidates;
                }
            }

            survivors.insert(*unrefined);
        }

        self.cells_to_unrefine = Self::all_to_all_cell_set(&self.comm, &survivors);
    }

    /// Applies the (globally replicated) refine and unrefine sets.
    fn execute_refines(&mut self) -> Result<Vec<CellId>, GridError> {
        let me = self.rank();
        let mut new_cells: Vec<CellId> = Vec::new();

        self.remote_data.clear();
        self.refined_data.clear();
        self.unrefined_data.clear();

        // neighbor lists to rebuild once the topology has settled
        let mut update_neighbors: HashSet<CellId> = HashSet::new();

        let mut to_refine: Vec<CellId> = self.cells_to_refine.iter().copied().collect();
        to_refine.sort_unstable();

        for refined in &to_refine {
            let owner = self.directory.owner_of(*refined).unwrap_or_else(|| {
                invariant_violation!("cell {refined} to refine does not exist")
            });
            let children = self.space.children_of(*refined).unwrap_or_else(|| {
                invariant_violation!("cell {refined} to refine has no children in the id space")
            });

            if owner == me {
                let payload = self.cells.remove(refined).unwrap_or_else(|| {
                    invariant_violation!("local cell {refined} to refine has no payload")
                });
                self.refined_data.insert(*refined, payload);
            }

            for child in children {
                self.directory.insert(child, owner);
                if owner == me {
                    self.cells.insert(child, P::default());
                    new_cells.push(child);
                }
            }

            // children inherit the pin request and the weight
            if let Some(target) = self.pins.remove(refined) {
                for child in children {
                    self.pins.insert(child, target);
                }
            }
            if let Some(target) = self.new_pins.remove(refined) {
                for child in children {
                    self.new_pins.insert(child, target);
                }
            }
            if owner == me {
                if let Some(weight) = self.cell_weights.remove(refined) {
                    for child in children {
                        self.cell_weights.insert(child, weight);
                    }
                }
            }

            if owner == me {
                update_neighbors.extend(children);
                let mut around: Vec<CellId> = Vec::new();
                if let Some(of) = self.neighbors_of.get(refined) {
                    around.extend(of.iter().flatten().copied());
                }
                if let Some(to) = self.neighbors_to.get(refined) {
                    around.extend(to.iter().copied());
                }
                for neighbor in around {
                    if self.directory.owner_of(neighbor) == Some(me) {
                        update_neighbors.insert(neighbor);
                    }
                }
            }

            // local cells in reach of a remotely refined cell
            if self.remote_cells_with_local_neighbors.contains(refined) {
                for neighbor in self.find_neighbors_of(*refined, 2, true).iter().flatten() {
                    if self.directory.owner_of(*neighbor) == Some(me) {
                        update_neighbors.insert(*neighbor);
                    }
                }
            }
        }

        // expand the one-recorded-sibling convention to whole groups
        let mut parents_of_unrefined: HashSet<CellId> = HashSet::new();
        let mut all_to_unrefine: HashSet<CellId> = HashSet::new();
        for unrefined in &self.cells_to_unrefine {
            let parent = self.space.parent_of(*unrefined).unwrap_or_else(|| {
                invariant_violation!("cell {unrefined} to unrefine has no parent")
            });
            if parent == *unrefined {
                invariant_violation!("cell {unrefined} to unrefine is a root cell");
            }
            parents_of_unrefined.insert(parent);
            let siblings = self.space.children_of(parent).unwrap_or_else(|| {
                invariant_violation!("parent {parent} has no children in the id space")
            });
            all_to_unrefine.extend(siblings);
        }

        // the parent takes over the first pinned sibling's pin
        let mut parents_sorted: Vec<CellId> = parents_of_unrefined.iter().copied().collect();
        parents_sorted.sort_unstable();
        for parent in &parents_sorted {
            let Some(siblings) = self.space.children_of(*parent) else {
                continue;
            };
            if let Some(target) = siblings.iter().find_map(|s| self.pins.get(s)).copied() {
                self.pins.insert(*parent, target);
            }
            if let Some(target) = siblings.iter().find_map(|s| self.new_pins.get(s)).copied() {
                self.new_pins.insert(*parent, target);
            }
        }

        let mut to_unrefine_sorted: Vec<CellId> = all_to_unrefine.iter().copied().collect();
        to_unrefine_sorted.sort_unstable();

        // remove the leaves, stage or ship their payloads
        let mut plan = ExchangePlan::new();
        for unrefined in &to_unrefine_sorted {
            let parent = self
                .space
                .parent_of(*unrefined)
                .unwrap_or_else(|| invariant_violation!("cell {unrefined} has no parent"));
            let owner = self.directory.owner_of(*unrefined).unwrap_or_else(|| {
                invariant_violation!("cell {unrefined} to unrefine does not exist")
            });
            let parent_owner = self.directory.owner_of(parent).unwrap_or_else(|| {
                invariant_violation!("parent {parent} of unrefined cell does not exist")
            });

            self.directory.remove(*unrefined);
            update_neighbors.remove(unrefined);
            self.pins.remove(unrefined);
            self.new_pins.remove(unrefined);
            self.cell_weights.remove(unrefined);

            if owner == me && parent_owner == me {
                let payload = self.cells.get(unrefined).cloned().unwrap_or_else(|| {
                    invariant_violation!("local cell {unrefined} to unrefine has no payload")
                });
                self.unrefined_data.insert(*unrefined, payload);
            } else if owner == me {
                plan.add_send(parent_owner, *unrefined);
            } else if parent_owner == me {
                plan.add_receive(owner, *unrefined);
            }
        }
        plan.finalize()?;

        let mut transfer = exchange::start_transfers(
            &self.comm,
            self.transfer_mode,
            tags::UNREFINE_BASE,
            &plan,
            &self.cells,
        )?;

        // parents of removed groups become leaves again
        for parent in &parents_sorted {
            let new_of = self.find_neighbors_of(*parent, 1, false);
            for neighbor in new_of.iter().flatten() {
                if self.directory.owner_of(*neighbor) == Some(me) {
                    update_neighbors.insert(*neighbor);
                }
            }
            let new_to = self.find_neighbors_to_full(*parent);
            for neighbor in &new_to {
                if self.directory.owner_of(*neighbor) == Some(me) {
                    update_neighbors.insert(*neighbor);
                }
            }

            if self.directory.owner_of(*parent) == Some(me) {
                self.cells.insert(*parent, P::default());
                self.neighbors_of.insert(*parent, new_of);
                self.neighbors_to.insert(*parent, new_to);
            }
        }

        let mut update_sorted: Vec<CellId> = update_neighbors.iter().copied().collect();
        update_sorted.sort_unstable();
        for cell in update_sorted {
            self.update_neighbors(cell);
        }

        // refined cells are interior nodes now, removed cells are gone
        for refined in &to_refine {
            if self.directory.owner_of(*refined) == Some(me) {
                self.neighbors_of.remove(refined);
                self.neighbors_to.remove(refined);
            }
        }
        for unrefined in &to_unrefine_sorted {
            self.neighbors_of.remove(unrefined);
            self.neighbors_to.remove(unrefined);
        }

        self.update_remote_neighbor_info_all();

        exchange::wait_receives_into(&mut transfer, &mut self.unrefined_data);
        exchange::wait_sends(&mut transfer);

        for unrefined in &to_unrefine_sorted {
            self.cells.remove(unrefined);
        }

        self.cells_to_refine.clear();
        self.cells_to_unrefine.clear();

        self.recalculate_ghost_plan()?;

        #[cfg(any(debug_assertions, feature = "check-invariants"))]
        {
            assert!(self.verify_neighbors(), "neighbor lists are inconsistent");
            assert!(
                self.verify_remote_neighbor_info(),
                "remote neighbor info is inconsistent"
            );
        }

        new_cells.sort_unstable();
        Ok(new_cells)
    }
}
