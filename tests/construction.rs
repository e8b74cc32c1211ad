//! Root-grid construction across ranks: cell dealing, neighbor lists,
//! and remote-neighbor bookkeeping.

mod common;

use amr_grid::prelude::*;
use common::{build_grid, covered_volume, grid_volume, run_ranks};
use std::sync::Arc;

#[test]
fn single_rank_owns_everything() {
    let grid = build_grid(NoComm, [4, 4, 4], 0, 1, TransferMode::Bulk);
    assert_eq!(grid.cell_count(), 64);
    assert_eq!(grid.cells(), grid.all_cells());
    assert!(grid.cells_with_remote_neighbor().is_empty());
    assert_eq!(grid.cells_with_local_neighbors().len(), 64);
    assert_eq!(covered_volume(&grid), grid_volume(&grid));
}

#[test]
fn two_ranks_split_a_4x4x4_grid() {
    let results = run_ranks(2, |comm| {
        let grid = build_grid(comm, [4, 4, 4], 0, 1, TransferMode::Bulk);

        // a corner root cell sees 7 of its 26 template slots
        let corner = CellId::new(1).unwrap();
        if grid.is_local(corner) {
            let list = grid.neighbors_of(corner).unwrap();
            assert_eq!(list.len(), 26);
            assert_eq!(list.iter().flatten().count(), 7);
            assert_eq!(list.iter().filter(|slot| slot.is_none()).count(), 19);
        }

        (
            grid.rank(),
            grid.cell_count(),
            grid.cells_with_remote_neighbor().len(),
            covered_volume(&grid) == grid_volume(&grid),
        )
    });

    for (rank, owned, remote_touching, covered) in results {
        assert_eq!(owned, 32, "rank {rank} should own half the cells");
        assert!(remote_touching > 0, "rank {rank} must touch the other half");
        assert!(covered);
    }
}

#[test]
fn uneven_totals_leave_some_ranks_short() {
    let results = run_ranks(3, |comm| {
        let grid = build_grid(comm, [7, 1, 1], 0, 1, TransferMode::Bulk);
        grid.cell_count()
    });
    let mut counts = results.clone();
    counts.sort_unstable();
    assert_eq!(counts.iter().sum::<usize>(), 7);
    assert_eq!(counts, vec![2, 2, 3]);
}

#[test]
fn face_stencil_has_six_slots() {
    let grid = build_grid(NoComm, [3, 3, 3], 0, 0, TransferMode::Bulk);
    let center = grid.existing_cell_at(1.5, 1.5, 1.5).unwrap();
    let list = grid.neighbors_of(center).unwrap();
    assert_eq!(list.len(), 6);
    assert_eq!(list.iter().flatten().count(), 6);

    // the -z slot of the template comes first
    let below = grid.neighbors_of_at_offset(center, 0, 0, -1);
    assert_eq!(below.len(), 1);
    assert_eq!(below[0], Some(grid.existing_cell_at(1.5, 1.5, 0.5).unwrap()));
}

#[test]
fn periodic_axis_wraps_neighbors() {
    let builder = GridBuilder::new()
        .length(4, 1, 1)
        .maximum_refinement_level(0)
        .neighborhood_size(1)
        .periodic(true, false, false);
    let space = builder.index_space().unwrap();
    let grid = builder
        .build::<f64, _>(NoComm, Arc::new(UniformGeometry::unit(&space)))
        .unwrap();

    let first = CellId::new(1).unwrap();
    let last = CellId::new(4).unwrap();
    let list = grid.neighbors_of(first).unwrap();
    assert!(list.contains(&Some(last)), "wrap-around neighbor missing");
    // y and z stay clamped
    assert!(list.iter().any(Option::is_none));
}

#[test]
fn neighbor_symmetry_on_construction() {
    let grid = build_grid(NoComm, [3, 3, 3], 1, 1, TransferMode::Bulk);
    let cells = grid.cells();
    for &a in &cells {
        for &b in &cells {
            if a == b {
                continue;
            }
            let sees = |x: CellId, y: CellId| {
                grid.neighbors_of(x)
                    .unwrap()
                    .iter()
                    .flatten()
                    .any(|n| *n == y)
                    || grid.neighbors_to(x).unwrap().contains(&y)
            };
            assert_eq!(sees(a, b), sees(b, a), "asymmetry between {a} and {b}");
        }
    }
}

#[test]
fn existing_cell_lookup_respects_bounds() {
    let grid = build_grid(NoComm, [2, 2, 2], 0, 1, TransferMode::Bulk);
    assert_eq!(grid.existing_cell_at(0.1, 0.1, 0.1), Some(CellId::new(1).unwrap()));
    assert_eq!(grid.existing_cell_at(-0.1, 0.1, 0.1), None);
    assert_eq!(grid.existing_cell_at(2.1, 0.1, 0.1), None);
}

#[test]
fn builder_rejects_bad_settings() {
    let space_err = GridBuilder::new().length(0, 1, 1).index_space();
    assert!(space_err.is_err());

    let builder = GridBuilder::new().length(2, 2, 2).sfc_caching_batches(0);
    let space = GridBuilder::new().length(2, 2, 2).index_space().unwrap();
    let result = builder.build::<f64, _>(NoComm, Arc::new(UniformGeometry::unit(&space)));
    assert!(matches!(result, Err(GridError::ZeroSfcBatches)));
}
