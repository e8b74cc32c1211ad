//! The partition planner: pins, the load-balancer run, and the payload
//! migration that realizes a new partition.
//!
//! A planner run folds staged pin deltas into the replicated pin table,
//! asks the balancer for proposals (unless suppressed), lets pins win
//! every conflict, and materializes per-peer send/receive lists plus the
//! replicated new ownership. The move itself ships payloads, rewrites the
//! directory identically on every rank, and rebuilds neighbor state.
//! Pending refines and unrefines are discarded by a move, as are the
//! staged payloads of earlier refines.

use super::{Grid, LB_METHOD_NONE};
use crate::algs::communicator::{tags, Communicator};
use crate::algs::exchange::{self, all_gather_cell_pairs, ExchangePlan};
use crate::algs::partition::{BalanceCell, BalanceView, Migration};
use crate::data::store::CellData;
use crate::grid_error::GridError;
use crate::invariant_violation;
use crate::topology::cell::CellId;
use std::collections::BTreeMap;

/// Wire encoding of an unpin request in the staged pin delta.
const UNPIN: u64 = u64::MAX;

impl<P: CellData, C: Communicator> Grid<P, C> {
    /// Pins a local leaf to the given rank: it migrates there (if
    /// necessary) and stays there across load balancing until unpinned
    /// or refined away. No-op if the cell is not a local leaf or the
    /// rank does not exist.
    pub fn pin(&mut self, cell: CellId, rank: usize) {
        if !self.cells.contains_key(&cell) {
            return;
        }
        if self.directory.has_children(&self.space, cell) {
            return;
        }
        if rank >= self.size() {
            return;
        }
        // staging an already-satisfied pin would be a pointless delta
        if self.pins.get(&cell) == Some(&rank) {
            return;
        }
        self.new_pins.insert(cell, Some(rank));
    }

    /// Pins a local leaf to this rank.
    pub fn pin_to_self(&mut self, cell: CellId) {
        self.pin(cell, self.rank());
    }

    /// Releases the pin of a local leaf, letting it migrate freely again.
    pub fn unpin(&mut self, cell: CellId) {
        if !self.cells.contains_key(&cell) {
            return;
        }
        if self.directory.has_children(&self.space, cell) {
            return;
        }
        if self.pins.contains_key(&cell) {
            self.new_pins.insert(cell, None);
        } else {
            self.new_pins.remove(&cell);
        }
    }

    /// Unpins every leaf owned by this rank.
    pub fn unpin_local_cells(&mut self) {
        let local: Vec<CellId> = self.cells.keys().copied().collect();
        for cell in local {
            self.unpin(cell);
        }
    }

    /// Drops all pins of all ranks. Must be called simultaneously on
    /// every rank since the pin table is replicated.
    pub fn unpin_all_cells(&mut self) {
        self.new_pins.clear();
        self.pins.clear();
    }

    /// Cells this rank will receive in the staged migration; available
    /// between a planner run (or prepare) and the move so payloads can be
    /// prepared.
    pub fn added_cells(&self) -> Vec<CellId> {
        let mut cells: Vec<CellId> = self.added_cells.iter().copied().collect();
        cells.sort_unstable();
        cells
    }

    /// Cells this rank will hand off in the staged migration.
    pub fn removed_cells_by_balance(&self) -> Vec<CellId> {
        let mut cells: Vec<CellId> = self.removed_by_balance.iter().copied().collect();
        cells.sort_unstable();
        cells
    }

    /// Repartitions with the load balancer and moves payloads.
    /// Collective; discards pending refines and unrefines.
    pub fn balance_load(&mut self) -> Result<(), GridError> {
        tracing::debug!("balance_load");
        self.make_new_partition(true)?;
        self.finish_move()
    }

    /// Completes a balance prepared by [`prepare_to_balance_load`].
    ///
    /// [`prepare_to_balance_load`]: Grid::prepare_to_balance_load
    pub fn balance_load_prepared(&mut self) -> Result<(), GridError> {
        self.finish_move()
    }

    /// Moves only pinned cells, ignoring the balancer. Collective.
    pub fn migrate_cells(&mut self) -> Result<(), GridError> {
        tracing::debug!("migrate_cells");
        self.make_new_partition(false)?;
        self.finish_move()
    }

    /// Completes a migration prepared by [`prepare_to_migrate_cells`].
    ///
    /// [`prepare_to_migrate_cells`]: Grid::prepare_to_migrate_cells
    pub fn migrate_cells_prepared(&mut self) -> Result<(), GridError> {
        self.finish_move()
    }

    /// Plans a balance and runs one early payload round-trip over the
    /// plan so receivers learn payload shapes before the real transfer.
    /// Must be followed by [`balance_load_prepared`]. Collective.
    ///
    /// [`balance_load_prepared`]: Grid::balance_load_prepared
    pub fn prepare_to_balance_load(&mut self) -> Result<(), GridError> {
        self.make_new_partition(true)?;
        self.prepare_to_move_cells()
    }

    /// As [`prepare_to_balance_load`] but honoring only pins.
    ///
    /// [`prepare_to_balance_load`]: Grid::prepare_to_balance_load
    pub fn prepare_to_migrate_cells(&mut self) -> Result<(), GridError> {
        self.make_new_partition(false)?;
        self.prepare_to_move_cells()
    }

    /// Folds the all-gathered pin deltas into the replicated pin table,
    /// in rank order. Collective.
    fn update_pins(&mut self) {
        let mut delta: Vec<(CellId, u64)> = self
            .new_pins
            .iter()
            .map(|(cell, target)| (*cell, target.map_or(UNPIN, |r| r as u64)))
            .collect();
        delta.sort_unstable_by_key(|(cell, _)| *cell);

        for per_rank in all_gather_cell_pairs(&self.comm, &delta) {
            for (cell, target) in per_rank {
                if target == UNPIN {
                    self.pins.remove(&cell);
                } else {
                    self.pins.insert(cell, target as usize);
                }
            }
        }
        self.new_pins.clear();
    }

    /// Everything the balancer may look at for this rank's cells.
    fn balance_cells(&self) -> Vec<BalanceCell> {
        let mut cells: Vec<CellId> = self.cells.keys().copied().collect();
        cells.sort_unstable();

        cells
            .into_iter()
            .map(|cell| {
                let coordinates = self
                    .cell_bounds(cell)
                    .map(|b| b.center())
                    .unwrap_or([0.0; 3]);
                let edges = self
                    .neighbors_of
                    .get(&cell)
                    .map(|list| {
                        list.iter()
                            .flatten()
                            .filter_map(|n| self.directory.owner_of(*n).map(|o| (*n, o)))
                            .collect()
                    })
                    .unwrap_or_default();
                BalanceCell {
                    cell,
                    weight: self.cell_weight(cell),
                    coordinates,
                    edges,
                }
            })
            .collect()
    }

    /// All leaves of the grid with their owners, ascending.
    fn sorted_leaves_with_owners(&self) -> Vec<(CellId, usize)> {
        let mut leaves: Vec<(CellId, usize)> = self
            .directory
            .iter()
            .filter(|(cell, _)| !self.directory.has_children(&self.space, *cell))
            .collect();
        leaves.sort_unstable_by_key(|(cell, _)| *cell);
        leaves
    }

    /// Builds the migration plan: balancer proposals (all-gathered so
    /// every rank sees the same set) overridden by pins, materialized as
    /// sorted, tagged per-peer lists plus the replicated new ownership.
    fn make_new_partition(&mut self, use_balancer: bool) -> Result<(), GridError> {
        self.update_pins();
        let me = self.rank();

        let mut proposal_pairs: Vec<(CellId, u64)> = Vec::new();
        if use_balancer && self.balancer_method != LB_METHOD_NONE {
            let all_leaves = self.sorted_leaves_with_owners();
            let view = BalanceView {
                rank: me,
                size: self.comm.size(),
                cells: self.balance_cells(),
                all_leaves: &all_leaves,
                hierarchy: &self.hierarchy,
            };
            let moves: Vec<Migration> = self.balancer.propose(&view);
            proposal_pairs = moves
                .into_iter()
                .map(|m| (m.cell, m.receiver as u64))
                .collect();
            proposal_pairs.sort_unstable_by_key(|(cell, _)| *cell);
        }

        // replicate proposals, then let pins win every conflict
        let mut new_owner: BTreeMap<CellId, usize> = BTreeMap::new();
        for per_rank in all_gather_cell_pairs(&self.comm, &proposal_pairs) {
            for (cell, receiver) in per_rank {
                let receiver = receiver as usize;
                if receiver >= self.size() || self.pins.contains_key(&cell) {
                    continue;
                }
                if !self.directory.is_leaf(&self.space, cell) {
                    tracing::warn!(%cell, "balancer proposed moving a non-leaf cell");
                    continue;
                }
                if self.directory.owner_of(cell) != Some(receiver) {
                    new_owner.insert(cell, receiver);
                }
            }
        }
        for (cell, target) in &self.pins {
            if !self.directory.is_leaf(&self.space, *cell) {
                continue;
            }
            if self.directory.owner_of(*cell) != Some(*target) {
                new_owner.insert(*cell, *target);
            }
        }

        self.added_cells.clear();
        self.removed_by_balance.clear();

        let mut plan = ExchangePlan::new();
        for (cell, receiver) in &new_owner {
            let owner = self.directory.owner_of(*cell).unwrap_or_else(|| {
                invariant_violation!("cell {cell} staged for migration does not exist")
            });
            if owner == me {
                plan.add_send(*receiver, *cell);
                self.removed_by_balance.insert(*cell);
            }
            if *receiver == me {
                plan.add_receive(owner, *cell);
                self.added_cells.insert(*cell);
            }
        }
        plan.finalize()?;

        tracing::debug!(
            moves = new_owner.len(),
            sends = plan.send_cell_count(),
            receives = plan.receive_cell_count(),
            "new partition planned"
        );
        self.pending_migration = Some((plan, new_owner.into_iter().collect()));
        Ok(())
    }

    /// One payload round-trip over the staged plan; receivers keep the
    /// transferred payloads so shape-dependent setups can be made before
    /// the real move.
    fn prepare_to_move_cells(&mut self) -> Result<(), GridError> {
        self.cells_with_remote_neighbors.clear();
        self.remote_cells_with_local_neighbors.clear();
        self.remote_data.clear();
        self.cells_to_refine.clear();
        self.refined_data.clear();
        self.cells_to_unrefine.clear();
        self.unrefined_data.clear();

        let Some((plan, _)) = &self.pending_migration else {
            return Ok(());
        };
        let mut transfer = exchange::start_transfers(
            &self.comm,
            self.transfer_mode,
            tags::MIGRATE_BASE,
            plan,
            &self.cells,
        )?;
        exchange::wait_receives_into(&mut transfer, &mut self.cells);
        exchange::wait_sends(&mut transfer);
        Ok(())
    }

    fn finish_move(&mut self) -> Result<(), GridError> {
        self.move_cells_apply()?;
        self.added_cells.clear();
        self.removed_by_balance.clear();
        Ok(())
    }

    /// Ships payloads per the staged plan, rewrites ownership, and
    /// rebuilds neighbor state.
    fn move_cells_apply(&mut self) -> Result<(), GridError> {
        self.cell_weights.clear();
        self.cells_with_remote_neighbors.clear();
        self.remote_cells_with_local_neighbors.clear();
        self.remote_data.clear();
        self.cells_to_refine.clear();
        self.refined_data.clear();
        self.cells_to_unrefine.clear();
        self.unrefined_data.clear();
        self.cells_not_to_unrefine.clear();

        let (plan, moves) = self
            .pending_migration
            .take()
            .unwrap_or((ExchangePlan::new(), Vec::new()));

        let mut transfer = exchange::start_transfers(
            &self.comm,
            self.transfer_mode,
            tags::MIGRATE_BASE,
            &plan,
            &self.cells,
        )?;

        // the new ownership is replicated; apply it identically everywhere
        for (cell, receiver) in &moves {
            self.directory.insert(*cell, *receiver);
        }

        let mut added: Vec<CellId> = self.added_cells.iter().copied().collect();
        added.sort_unstable();
        for cell in &added {
            if self.directory.has_children(&self.space, *cell) {
                continue;
            }
            let of = self.find_neighbors_of(*cell, 1, false);
            let to = self.find_neighbors_to_full(*cell);
            self.neighbors_of.insert(*cell, of);
            self.neighbors_to.insert(*cell, to);
        }

        exchange::wait_receives_into(&mut transfer, &mut self.cells);
        exchange::wait_sends(&mut transfer);

        let mut removed: Vec<CellId> = self.removed_by_balance.iter().copied().collect();
        removed.sort_unstable();
        for cell in &removed {
            self.cells.remove(cell);
            self.neighbors_of.remove(cell);
            self.neighbors_to.remove(cell);
        }

        self.update_remote_neighbor_info_all();
        self.recalculate_ghost_plan()?;

        #[cfg(any(debug_assertions, feature = "check-invariants"))]
        {
            assert!(self.verify_neighbors(), "neighbor lists are inconsistent");
            assert!(
                self.verify_remote_neighbor_info(),
                "remote neighbor info is inconsistent"
            );
            assert!(self.pins_satisfied(), "pin requests were not honored");
        }

        Ok(())
    }

    /// True when every pinned cell lives on its requested rank.
    pub fn pins_satisfied(&self) -> bool {
        self.pins
            .iter()
            .all(|(cell, target)| self.directory.owner_of(*cell) == Some(*target))
    }
}
