//! The distributed grid: local cell storage, neighbor tracking, and the
//! collective operations that keep every rank's view consistent.
//!
//! Each rank of the communicator owns a subset of the leaf cells. The
//! directory of existing cells and their owners is replicated, neighbor
//! lists are kept per local leaf, and ghost copies of remote neighbors'
//! payloads are refreshed on demand. Refinement, unrefinement and
//! repartitioning are collective: every rank must enter them together.

mod balance;
mod neighbors;
mod refine;

use crate::algs::communicator::{tags, Communicator};
use crate::algs::exchange::{self, ExchangePlan, Transfer, TransferMode};
use crate::algs::partition::{LoadBalancer, PartitionHierarchy, SfcPartitioner, RESERVED_OPTIONS};
use crate::data::directory::CellDirectory;
use crate::data::store::CellData;
use crate::geometry::{CellBounds, Geometry};
use crate::grid_error::GridError;
use crate::topology::cell::CellId;
use crate::topology::index::IndexSpace;
use crate::topology::neighborhood::Neighborhood;
use hashbrown::{HashMap, HashSet};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Load-balancer method that suppresses balancing entirely.
pub const LB_METHOD_NONE: &str = "NONE";

/// Configuration of a [`Grid`] under construction.
#[derive(Clone, Debug)]
pub struct GridBuilder {
    length: [u64; 3],
    neighborhood_size: u32,
    max_refinement_level: Option<u8>,
    periodic: [bool; 3],
    balancer_method: String,
    sfc_caching_batches: u64,
    transfer_mode: TransferMode,
}

impl Default for GridBuilder {
    fn default() -> Self {
        Self {
            length: [1, 1, 1],
            neighborhood_size: 1,
            max_refinement_level: None,
            periodic: [false; 3],
            balancer_method: "SFC".to_string(),
            sfc_caching_batches: 1,
            transfer_mode: TransferMode::Bulk,
        }
    }
}

impl GridBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size of the grid in unrefined cells.
    pub fn length(mut self, x: u64, y: u64, z: u64) -> Self {
        self.length = [x, y, z];
        self
    }

    /// Radius of the neighborhood template; 0 means the 6-face stencil.
    pub fn neighborhood_size(mut self, size: u32) -> Self {
        self.neighborhood_size = size;
        self
    }

    /// Caps the refinement level; the default auto-maximizes it.
    pub fn maximum_refinement_level(mut self, level: u8) -> Self {
        self.max_refinement_level = Some(level);
        self
    }

    /// Wrap-around adjacency per axis.
    pub fn periodic(mut self, x: bool, y: bool, z: bool) -> Self {
        self.periodic = [x, y, z];
        self
    }

    /// Name passed to the load balancer; [`LB_METHOD_NONE`] suppresses
    /// balancing.
    pub fn load_balancer_method(mut self, method: &str) -> Self {
        self.balancer_method = method.to_string();
        self
    }

    /// Memory-versus-speed knob for the initial enumeration of root
    /// cells; must be at least 1.
    pub fn sfc_caching_batches(mut self, batches: u64) -> Self {
        self.sfc_caching_batches = batches;
        self
    }

    /// Wire shape of payload transfers.
    pub fn transfer_mode(mut self, mode: TransferMode) -> Self {
        self.transfer_mode = mode;
        self
    }

    /// The id space these settings describe; lets callers construct a
    /// geometry before building the grid.
    pub fn index_space(&self) -> Result<IndexSpace, GridError> {
        IndexSpace::new(self.length, self.max_refinement_level)
    }

    /// Builds the grid with the default space-filling-order balancer.
    pub fn build<P, C>(
        self,
        comm: C,
        geometry: Arc<dyn Geometry>,
    ) -> Result<Grid<P, C>, GridError>
    where
        P: CellData,
        C: Communicator,
    {
        let balancer: Box<dyn LoadBalancer> = Box::new(SfcPartitioner);
        self.build_with_balancer(comm, geometry, balancer)
    }

    /// Builds the grid with a caller-provided load balancer.
    pub fn build_with_balancer<P, C>(
        self,
        comm: C,
        geometry: Arc<dyn Geometry>,
        balancer: Box<dyn LoadBalancer>,
    ) -> Result<Grid<P, C>, GridError>
    where
        P: CellData,
        C: Communicator,
    {
        if self.sfc_caching_batches == 0 {
            return Err(GridError::ZeroSfcBatches);
        }
        if self.transfer_mode == TransferMode::Bulk && P::FIXED_LEN.is_none() {
            return Err(GridError::VariablePayloadInBulkMode);
        }

        let space = IndexSpace::new(self.length, self.max_refinement_level)?;
        let neighborhood = Neighborhood::new(self.neighborhood_size);
        let rank = comm.rank();
        let size = comm.size() as u64;

        tracing::debug!(
            lengths = ?self.length,
            max_level = space.max_refinement_level(),
            rank,
            "building grid"
        );

        let mut grid = Grid {
            space,
            neighborhood,
            geometry,
            comm,
            periodic: self.periodic,
            transfer_mode: self.transfer_mode,
            balancer_method: self.balancer_method,
            balancer,
            directory: CellDirectory::new(),
            cells: HashMap::new(),
            neighbors_of: HashMap::new(),
            neighbors_to: HashMap::new(),
            cells_with_remote_neighbors: HashSet::new(),
            remote_cells_with_local_neighbors: HashSet::new(),
            remote_data: HashMap::new(),
            refined_data: HashMap::new(),
            unrefined_data: HashMap::new(),
            cells_to_refine: HashSet::new(),
            cells_to_unrefine: HashSet::new(),
            cells_not_to_unrefine: HashSet::new(),
            cell_weights: HashMap::new(),
            pins: HashMap::new(),
            new_pins: HashMap::new(),
            added_cells: HashSet::new(),
            removed_by_balance: HashSet::new(),
            ghost_plan: ExchangePlan::new(),
            ghost_transfer: Transfer::idle(),
            pending_migration: None,
            hierarchy: PartitionHierarchy::new(),
            top_options: BTreeMap::new(),
        };

        // deal root cells to ranks in contiguous space-filling (id) order;
        // some ranks get one fewer when the total does not divide evenly
        let total = grid.space.grid_length();
        let per_rank = if total < size {
            1
        } else {
            total.div_ceil(size)
        };
        let ranks_with_fewer = per_rank * size - total;

        let batch = total.div_ceil(self.sfc_caching_batches).max(1);
        let mut next_id: u64 = 1;
        for owner in 0..size {
            let count = if owner < ranks_with_fewer {
                per_rank - 1
            } else {
                per_rank
            };
            let mut remaining = count;
            while remaining > 0 {
                let chunk = remaining.min(batch);
                for raw in next_id..next_id + chunk {
                    // ids 1..=grid_length are valid by construction
                    let cell = unsafe { CellId::new_unchecked(raw) };
                    grid.directory.insert(cell, owner as usize);
                    if owner as usize == rank {
                        grid.cells.insert(cell, P::default());
                    }
                }
                next_id += chunk;
                remaining -= chunk;
            }
        }
        debug_assert_eq!(next_id, total + 1);

        let local: Vec<CellId> = grid.cells.keys().copied().collect();
        for cell in &local {
            let of = grid.find_neighbors_of(*cell, 1, false);
            let to = grid.find_neighbors_to_using(*cell, &of);
            grid.neighbors_of.insert(*cell, of);
            grid.neighbors_to.insert(*cell, to);
        }
        grid.update_remote_neighbor_info_all();
        grid.recalculate_ghost_plan()?;

        #[cfg(any(debug_assertions, feature = "check-invariants"))]
        assert!(grid.verify_neighbors(), "neighbor lists are inconsistent");

        Ok(grid)
    }
}

/// A distributed, adaptively refinable Cartesian grid.
///
/// `P` is the user payload stored per owned leaf cell; `C` is the
/// message-passing backend.
pub struct Grid<P: CellData, C: Communicator> {
    pub(crate) space: IndexSpace,
    pub(crate) neighborhood: Neighborhood,
    pub(crate) geometry: Arc<dyn Geometry>,
    pub(crate) comm: C,
    pub(crate) periodic: [bool; 3],
    pub(crate) transfer_mode: TransferMode,
    pub(crate) balancer_method: String,
    pub(crate) balancer: Box<dyn LoadBalancer>,

    /// Replicated `cell -> owner` map of all existing cells.
    pub(crate) directory: CellDirectory,
    /// Payloads of locally owned leaves.
    pub(crate) cells: HashMap<CellId, P>,
    /// Slot-ordered neighbor list per local leaf; `None` marks an
    /// off-grid, non-periodic slot.
    pub(crate) neighbors_of: HashMap<CellId, Vec<Option<CellId>>>,
    /// Cells that consider a local leaf their neighbor.
    pub(crate) neighbors_to: HashMap<CellId, Vec<CellId>>,
    pub(crate) cells_with_remote_neighbors: HashSet<CellId>,
    pub(crate) remote_cells_with_local_neighbors: HashSet<CellId>,
    /// Ghost copies of remote neighbors' payloads.
    pub(crate) remote_data: HashMap<CellId, P>,
    /// Payloads of cells replaced by their children, until the next
    /// balance.
    pub(crate) refined_data: HashMap<CellId, P>,
    /// Payloads of removed leaves whose parent is local, until the next
    /// balance.
    pub(crate) unrefined_data: HashMap<CellId, P>,

    pub(crate) cells_to_refine: HashSet<CellId>,
    pub(crate) cells_to_unrefine: HashSet<CellId>,
    pub(crate) cells_not_to_unrefine: HashSet<CellId>,

    pub(crate) cell_weights: HashMap<CellId, f64>,
    /// Replicated pin table; `update_pins` folds in the staged deltas.
    pub(crate) pins: HashMap<CellId, usize>,
    /// Staged pin deltas; `None` requests removal.
    pub(crate) new_pins: HashMap<CellId, Option<usize>>,
    pub(crate) added_cells: HashSet<CellId>,
    pub(crate) removed_by_balance: HashSet<CellId>,

    /// Send/receive lists for neighbor-data updates.
    pub(crate) ghost_plan: ExchangePlan,
    pub(crate) ghost_transfer: Transfer<C>,
    /// Migration plan plus the replicated new ownership, staged by the
    /// planner until the move completes.
    pub(crate) pending_migration: Option<(ExchangePlan, Vec<(CellId, usize)>)>,

    pub(crate) hierarchy: PartitionHierarchy,
    pub(crate) top_options: BTreeMap<String, String>,
}

impl<P: CellData, C: Communicator> Grid<P, C> {
    /// Rank of this process in the communicator.
    #[inline]
    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    /// Number of ranks in the communicator.
    #[inline]
    pub fn size(&self) -> usize {
        self.comm.size()
    }

    /// The id algebra of this grid.
    #[inline]
    pub fn index_space(&self) -> &IndexSpace {
        &self.space
    }

    /// Size of the grid in unrefined cells.
    #[inline]
    pub fn length(&self) -> [u64; 3] {
        self.space.length()
    }

    #[inline]
    pub fn max_refinement_level(&self) -> u8 {
        self.space.max_refinement_level()
    }

    #[inline]
    pub fn neighborhood_size(&self) -> u32 {
        self.neighborhood.size()
    }

    /// All leaf cells owned by this rank, ascending.
    pub fn cells(&self) -> Vec<CellId> {
        let mut cells: Vec<CellId> = self.cells.keys().copied().collect();
        cells.sort_unstable();
        cells
    }

    /// All leaf cells of the whole grid, ascending.
    pub fn all_cells(&self) -> Vec<CellId> {
        let mut cells: Vec<CellId> = self
            .directory
            .iter()
            .filter(|(cell, _)| !self.directory.has_children(&self.space, *cell))
            .map(|(cell, _)| cell)
            .collect();
        cells.sort_unstable();
        cells
    }

    /// Number of leaf cells owned by this rank.
    #[inline]
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Iterates over locally owned leaves and their payloads.
    pub fn iter(&self) -> impl Iterator<Item = (CellId, &P)> {
        self.cells.iter().map(|(c, p)| (*c, p))
    }

    /// Local leaves all of whose neighbors are local, ascending.
    pub fn cells_with_local_neighbors(&self) -> Vec<CellId> {
        let mut cells: Vec<CellId> = self
            .cells
            .keys()
            .filter(|c| !self.cells_with_remote_neighbors.contains(*c))
            .copied()
            .collect();
        cells.sort_unstable();
        cells
    }

    /// Local leaves with at least one neighbor on another rank,
    /// ascending.
    pub fn cells_with_remote_neighbor(&self) -> Vec<CellId> {
        let mut cells: Vec<CellId> = self.cells_with_remote_neighbors.iter().copied().collect();
        cells.sort_unstable();
        cells
    }

    /// Remote leaves that consider at least one local leaf their
    /// neighbor, ascending.
    pub fn remote_cells_with_local_neighbors(&self) -> Vec<CellId> {
        let mut cells: Vec<CellId> = self
            .remote_cells_with_local_neighbors
            .iter()
            .copied()
            .collect();
        cells.sort_unstable();
        cells
    }

    /// The slot-ordered neighbor list of a local leaf. Entries are `None`
    /// where the template leaves the grid (non-periodic), and a slot
    /// holding smaller neighbors occupies 8 consecutive entries.
    pub fn neighbors_of(&self, cell: CellId) -> Option<&[Option<CellId>]> {
        self.neighbors_of.get(&cell).map(Vec::as_slice)
    }

    /// Cells that consider the given local leaf their neighbor.
    pub fn neighbors_to(&self, cell: CellId) -> Option<&[CellId]> {
        self.neighbors_to.get(&cell).map(Vec::as_slice)
    }

    /// Neighbors of a local leaf at one template offset; several cells
    /// when the slot holds smaller neighbors, `[None]` when the slot is
    /// off-grid.
    pub fn neighbors_of_at_offset(&self, cell: CellId, i: i32, j: i32, k: i32) -> Vec<Option<CellId>> {
        let mut found = Vec::new();
        let Some(list) = self.neighbors_of.get(&cell) else {
            return found;
        };
        if i == 0 && j == 0 && k == 0 {
            return found;
        }
        let Some(level) = self.space.level_of(cell) else {
            return found;
        };

        let mut index = 0usize;
        for offset in self.neighborhood.offsets_of() {
            if index >= list.len() {
                break;
            }
            // a smaller-neighbor slot spans 8 list entries
            let smaller = match list[index] {
                Some(n) => self.space.level_of(n).map(|l| l > level).unwrap_or(false),
                None => false,
            };
            let width = if smaller { 8 } else { 1 };
            if *offset == [i, j, k] {
                found.extend_from_slice(&list[index..index + width]);
                break;
            }
            index += width;
        }
        found
    }

    /// Neighbors of the given local leaf owned by other ranks.
    pub fn remote_neighbors_of(&self, cell: CellId) -> Vec<CellId> {
        let mut result = Vec::new();
        let Some(list) = self.neighbors_of.get(&cell) else {
            return result;
        };
        for neighbor in list.iter().flatten() {
            if self.directory.owner_of(*neighbor) != Some(self.rank()) {
                result.push(*neighbor);
            }
        }
        result
    }

    /// True if the cell exists and is owned by this rank.
    pub fn is_local(&self, cell: CellId) -> bool {
        self.directory.owner_of(cell) == Some(self.rank())
    }

    /// Owner rank of the cell, or `None` if it does not exist.
    #[inline]
    pub fn owner_of(&self, cell: CellId) -> Option<usize> {
        self.directory.owner_of(cell)
    }

    /// Parent of the cell; a level-0 cell is its own parent.
    pub fn parent_of(&self, cell: CellId) -> Option<CellId> {
        self.space.parent_of(cell)
    }

    /// The cell and its siblings, regardless of which rank owns them.
    pub fn siblings_of(&self, cell: CellId) -> Option<Vec<CellId>> {
        if !self.directory.contains(cell) {
            return None;
        }
        self.space.siblings_of(cell)
    }

    /// The 8 children of the cell if they currently exist.
    pub fn children_of(&self, cell: CellId) -> Option<[CellId; 8]> {
        if !self.directory.has_children(&self.space, cell) {
            return None;
        }
        self.space.children_of(cell)
    }

    /// The smallest existing cell at the given physical coordinates.
    pub fn existing_cell_at(&self, x: f64, y: f64, z: f64) -> Option<CellId> {
        let indices = self.geometry.indices_at(x, y, z)?;
        self.directory
            .existing_cell_at(&self.space, indices, 0, self.space.max_refinement_level())
    }

    /// Physical bounds of the cell.
    pub fn cell_bounds(&self, cell: CellId) -> Option<CellBounds> {
        let indices = self.space.indices_of(cell)?;
        let size = self.space.size_in_indices(cell)?;
        Some(self.geometry.bounds(indices, size))
    }

    /// Looks up the payload of a cell: the local store first, then ghost
    /// copies, then the refined and unrefined staging stores.
    pub fn payload(&self, cell: CellId) -> Option<&P> {
        self.cells
            .get(&cell)
            .or_else(|| self.remote_data.get(&cell))
            .or_else(|| self.refined_data.get(&cell))
            .or_else(|| self.unrefined_data.get(&cell))
    }

    /// Mutable payload of a locally owned leaf.
    pub fn payload_mut(&mut self, cell: CellId) -> Option<&mut P> {
        self.cells.get_mut(&cell)
    }

    /// Scalar load-balancing weight of a local leaf; 1.0 unless set.
    pub fn cell_weight(&self, cell: CellId) -> f64 {
        self.cell_weights.get(&cell).copied().unwrap_or(1.0)
    }

    /// Sets the load-balancing weight of a local leaf; ignored for cells
    /// this rank does not own.
    pub fn set_cell_weight(&mut self, cell: CellId, weight: f64) {
        if self.cells.contains_key(&cell) {
            self.cell_weights.insert(cell, weight);
        }
    }

    /// Number of explicitly weighted local cells.
    pub fn cell_weight_count(&self) -> usize {
        self.cell_weights.len()
    }

    // --- ghost exchange ---------------------------------------------------

    /// Number of cell payloads this rank sends during a neighbor-data
    /// update.
    pub fn update_send_cell_count(&self) -> u64 {
        self.ghost_plan.send_cell_count()
    }

    /// Number of cell payloads this rank receives during a neighbor-data
    /// update.
    pub fn update_receive_cell_count(&self) -> u64 {
        self.ghost_plan.receive_cell_count()
    }

    /// Refreshes ghost copies of remote neighbors' payloads. Collective.
    pub fn update_remote_neighbor_data(&mut self) -> Result<(), GridError> {
        self.start_remote_neighbor_data_update()?;
        self.wait_neighbor_data_update()
    }

    /// Posts the sends and receives of a neighbor-data update and returns
    /// without waiting, enabling compute/communication overlap.
    /// Collective.
    pub fn start_remote_neighbor_data_update(&mut self) -> Result<(), GridError> {
        tracing::trace!(
            sends = self.ghost_plan.send_cell_count(),
            receives = self.ghost_plan.receive_cell_count(),
            "starting neighbor data update"
        );
        self.ghost_transfer = exchange::start_transfers(
            &self.comm,
            self.transfer_mode,
            tags::NEIGHBOR_BASE,
            &self.ghost_plan,
            &self.cells,
        )?;
        Ok(())
    }

    /// Blocks until all neighbor-data receives have completed and
    /// installs them into the ghost store.
    pub fn wait_neighbor_data_update_receives(&mut self) -> Result<(), GridError> {
        let mut transfer = std::mem::replace(&mut self.ghost_transfer, Transfer::idle());
        exchange::wait_receives_into(&mut transfer, &mut self.remote_data);
        self.ghost_transfer = transfer;
        Ok(())
    }

    /// Blocks until all neighbor-data sends have completed.
    pub fn wait_neighbor_data_update_sends(&mut self) -> Result<(), GridError> {
        let mut transfer = std::mem::replace(&mut self.ghost_transfer, Transfer::idle());
        exchange::wait_sends(&mut transfer);
        Ok(())
    }

    /// Waits for receives, then sends, of a started neighbor-data update.
    pub fn wait_neighbor_data_update(&mut self) -> Result<(), GridError> {
        self.wait_neighbor_data_update_receives()?;
        self.wait_neighbor_data_update_sends()
    }

    // --- partitioning options --------------------------------------------

    /// Sets a top-level (non-hierarchical) partitioning option; reserved
    /// keys are ignored.
    pub fn set_partitioning_option(&mut self, name: &str, value: &str) {
        if RESERVED_OPTIONS.contains(name) {
            tracing::debug!(name, "ignoring reserved partitioning option");
            return;
        }
        self.top_options.insert(name.to_string(), value.to_string());
    }

    /// Value of a top-level partitioning option.
    pub fn partitioning_option(&self, name: &str) -> Option<&str> {
        self.top_options.get(name).map(String::as_str)
    }

    /// Appends a hierarchical partitioning level spanning `processes`
    /// ranks per part.
    pub fn add_partitioning_level(&mut self, processes: usize) {
        self.hierarchy.add_level(processes);
    }

    /// Removes a hierarchical partitioning level.
    pub fn remove_partitioning_level(&mut self, level: usize) {
        self.hierarchy.remove_level(level);
    }

    /// Adds an option to one hierarchy level; reserved keys are ignored.
    pub fn add_partitioning_option(&mut self, level: usize, name: &str, value: &str) {
        self.hierarchy.add_option(level, name, value);
    }

    /// Removes an option from one hierarchy level.
    pub fn remove_partitioning_option(&mut self, level: usize, name: &str) {
        self.hierarchy.remove_option(level, name);
    }

    /// Option names of one hierarchy level.
    pub fn partitioning_options(&self, level: usize) -> Result<Vec<&str>, GridError> {
        self.hierarchy
            .option_names(level)
            .ok_or(GridError::NoSuchPartitioningLevel(level))
    }

    /// Value of an option of one hierarchy level.
    ///
    /// Consults only that level's table. Asking for a key that is set in
    /// the top-level table but not at the level is rejected rather than
    /// silently answered from the wrong table.
    pub fn partitioning_option_value(
        &self,
        level: usize,
        name: &str,
    ) -> Result<Option<&str>, GridError> {
        if level >= self.hierarchy.level_count() {
            return Err(GridError::NoSuchPartitioningLevel(level));
        }
        match self.hierarchy.option_value(level, name) {
            Some(value) => Ok(Some(value)),
            None if self.top_options.contains_key(name) => {
                Err(GridError::CrossTablePartitioningOption(name.to_string()))
            }
            None => Ok(None),
        }
    }
}
