//! Load-balancer adapter: the seam between the grid and whatever decides
//! where cells should live.
//!
//! The grid hands the balancer a [`BalanceView`] — local cells with
//! weights, coordinates and edge lists, the global leaf list, and the
//! hierarchical-partitioning configuration — and receives back proposed
//! migrations of local cells. Proposals are all-gathered by the planner,
//! so a balancer only ever reasons about cells this rank owns.

use crate::topology::cell::CellId;
use once_cell::sync::Lazy;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::collections::HashSet;

/// One proposed move of a locally owned cell to another rank.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Migration {
    pub cell: CellId,
    pub receiver: usize,
}

/// One local cell as seen by the balancer.
#[derive(Clone, Debug)]
pub struct BalanceCell {
    pub cell: CellId,
    /// User-assigned scalar weight, 1.0 by default.
    pub weight: f64,
    /// Physical center of the cell.
    pub coordinates: [f64; 3],
    /// Neighboring leaves with their current owners.
    pub edges: Vec<(CellId, usize)>,
}

/// Everything a balancer may consult when proposing migrations.
pub struct BalanceView<'a> {
    pub rank: usize,
    pub size: usize,
    /// Local leaves in ascending id order.
    pub cells: Vec<BalanceCell>,
    /// Every leaf in the grid with its owner, ascending id order.
    pub all_leaves: &'a [(CellId, usize)],
    pub hierarchy: &'a PartitionHierarchy,
}

impl BalanceView<'_> {
    /// Hypergraph form in compressed-edge format: one hyperedge per local
    /// cell consisting of the cell and its neighbors. Returns
    /// `(hyperedge ids, connection start offsets, connections)`.
    pub fn hyperedges(&self) -> (Vec<CellId>, Vec<usize>, Vec<CellId>) {
        let mut edges = Vec::with_capacity(self.cells.len());
        let mut offsets = Vec::with_capacity(self.cells.len());
        let mut connections = Vec::new();
        for entry in &self.cells {
            edges.push(entry.cell);
            offsets.push(connections.len());
            connections.push(entry.cell);
            connections.extend(entry.edges.iter().map(|(n, _)| *n));
        }
        (edges, offsets, connections)
    }
}

/// Decides where locally owned cells should migrate.
pub trait LoadBalancer: Send {
    fn propose(&mut self, view: &BalanceView<'_>) -> Vec<Migration>;
}

/// Balances by cutting the ascending-id (space-filling) order of all
/// leaves into `size` equal contiguous chunks.
///
/// Deterministic and identical on every rank, so migrations proposed by
/// different ranks never conflict.
#[derive(Clone, Copy, Debug, Default)]
pub struct SfcPartitioner;

impl LoadBalancer for SfcPartitioner {
    fn propose(&mut self, view: &BalanceView<'_>) -> Vec<Migration> {
        let total = view.all_leaves.len();
        if total == 0 || view.size < 2 {
            return Vec::new();
        }

        view.cells
            .par_iter()
            .filter_map(|entry| {
                let position = view
                    .all_leaves
                    .binary_search_by_key(&entry.cell, |(c, _)| *c)
                    .ok()?;
                let receiver = position * view.size / total;
                (receiver != view.rank).then_some(Migration {
                    cell: entry.cell,
                    receiver,
                })
            })
            .collect()
    }
}

/// Option keys the grid manages itself; user attempts to set them are
/// ignored.
pub static RESERVED_OPTIONS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "ID_SIZE",
        "LOCAL_ID_SIZE",
        "RETURN_LISTS",
        "WEIGHT_DIM",
        "EDGE_WEIGHT_DIM",
        "AUTO_MIGRATE",
        "GLOBAL_PART_COUNT",
        "LOCAL_PART_COUNT",
    ]
    .into_iter()
    .collect()
});

#[derive(Clone, Debug, Default)]
struct HierarchyLevel {
    processes: usize,
    options: BTreeMap<String, String>,
}

/// Hierarchical partitioning configuration: a stack of levels, each with
/// a process count per part and its own option bag.
#[derive(Clone, Debug, Default)]
pub struct PartitionHierarchy {
    levels: Vec<HierarchyLevel>,
}

impl PartitionHierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Appends a level whose parts each span `processes` ranks. Ignored if
    /// `processes` is zero.
    pub fn add_level(&mut self, processes: usize) {
        if processes == 0 {
            tracing::debug!("ignoring partitioning level with zero processes per part");
            return;
        }
        self.levels.push(HierarchyLevel {
            processes,
            options: BTreeMap::new(),
        });
    }

    /// Removes the given level; out-of-range levels are ignored.
    pub fn remove_level(&mut self, level: usize) {
        if level < self.levels.len() {
            self.levels.remove(level);
        }
    }

    /// The part this rank belongs to at the given level: rank divided by
    /// the product of processes-per-part up to and including that level.
    pub fn part_number(&self, rank: usize, level: usize) -> Option<usize> {
        if level >= self.levels.len() {
            return None;
        }
        let mut span = 1usize;
        for l in &self.levels[..=level] {
            span = span.saturating_mul(l.processes);
        }
        Some(rank / span)
    }

    /// Adds (or overwrites) an option of the given level. Reserved keys
    /// and out-of-range levels are ignored; returns whether the option
    /// was stored.
    pub fn add_option(&mut self, level: usize, name: &str, value: &str) -> bool {
        if RESERVED_OPTIONS.contains(name) {
            tracing::debug!(name, "ignoring reserved partitioning option");
            return false;
        }
        match self.levels.get_mut(level) {
            Some(l) => {
                l.options.insert(name.to_string(), value.to_string());
                true
            }
            None => false,
        }
    }

    /// Removes an option of the given level if present.
    pub fn remove_option(&mut self, level: usize, name: &str) {
        if let Some(l) = self.levels.get_mut(level) {
            l.options.remove(name);
        }
    }

    /// Option names configured for the given level.
    pub fn option_names(&self, level: usize) -> Option<Vec<&str>> {
        self.levels
            .get(level)
            .map(|l| l.options.keys().map(String::as_str).collect())
    }

    /// Value of an option of the given level. This consults only that
    /// level's table, never the grid's top-level option table.
    pub fn option_value(&self, level: usize, name: &str) -> Option<&str> {
        self.levels
            .get(level)
            .and_then(|l| l.options.get(name))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(raw: u64) -> CellId {
        CellId::new(raw).unwrap()
    }

    #[test]
    fn part_numbers_divide_rank_space() {
        let mut h = PartitionHierarchy::new();
        h.add_level(2);
        h.add_level(3);
        // level 0 groups pairs of ranks, level 1 groups six
        assert_eq!(h.part_number(0, 0), Some(0));
        assert_eq!(h.part_number(3, 0), Some(1));
        assert_eq!(h.part_number(5, 1), Some(0));
        assert_eq!(h.part_number(6, 1), Some(1));
        assert_eq!(h.part_number(0, 2), None);
    }

    #[test]
    fn reserved_options_are_ignored() {
        let mut h = PartitionHierarchy::new();
        h.add_level(2);
        assert!(!h.add_option(0, "RETURN_LISTS", "ALL"));
        assert_eq!(h.option_value(0, "RETURN_LISTS"), None);
        assert!(h.add_option(0, "IMBALANCE_TOL", "1.05"));
        assert_eq!(h.option_value(0, "IMBALANCE_TOL"), Some("1.05"));
    }

    #[test]
    fn per_level_lookup_does_not_leak_across_levels() {
        let mut h = PartitionHierarchy::new();
        h.add_level(2);
        h.add_level(2);
        h.add_option(0, "METHOD", "graph");
        assert_eq!(h.option_value(1, "METHOD"), None);
        assert_eq!(h.option_names(1).unwrap().len(), 0);
    }

    #[test]
    fn sfc_partitioner_cuts_even_chunks() {
        let all: Vec<(CellId, usize)> = (1..=8).map(|raw| (cell(raw), 0)).collect();
        let hierarchy = PartitionHierarchy::new();
        let view = BalanceView {
            rank: 0,
            size: 2,
            cells: (1..=8)
                .map(|raw| BalanceCell {
                    cell: cell(raw),
                    weight: 1.0,
                    coordinates: [0.0; 3],
                    edges: Vec::new(),
                })
                .collect(),
            all_leaves: &all,
            hierarchy: &hierarchy,
        };
        let mut balancer = SfcPartitioner;
        let moves = balancer.propose(&view);
        // the upper half of the id order belongs to rank 1
        assert_eq!(moves.len(), 4);
        assert!(moves.iter().all(|m| m.receiver == 1 && m.cell.get() > 4));
    }

    #[test]
    fn hyperedges_are_cell_plus_neighbors() {
        let hierarchy = PartitionHierarchy::new();
        let all = vec![(cell(1), 0), (cell(2), 0)];
        let view = BalanceView {
            rank: 0,
            size: 1,
            cells: vec![BalanceCell {
                cell: cell(1),
                weight: 1.0,
                coordinates: [0.0; 3],
                edges: vec![(cell(2), 0)],
            }],
            all_leaves: &all,
            hierarchy: &hierarchy,
        };
        let (edges, offsets, connections) = view.hyperedges();
        assert_eq!(edges, vec![cell(1)]);
        assert_eq!(offsets, vec![0]);
        assert_eq!(connections, vec![cell(1), cell(2)]);
    }
}
