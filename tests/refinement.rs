//! Collective refinement: local refines, induced refines across ranks,
//! unrefine overrides, and payload staging.

mod common;

use amr_grid::prelude::*;
use common::{build_grid, covered_volume, grid_volume, run_ranks};

#[test]
fn refining_one_cell_creates_its_children() {
    let mut grid = build_grid(NoComm, [2, 2, 2], 1, 1, TransferMode::Bulk);
    let cell = CellId::new(1).unwrap();
    *grid.payload_mut(cell).unwrap() = 42.0;

    grid.refine_completely(cell);
    let created = grid.stop_refining().unwrap();

    assert_eq!(created.len(), 8);
    assert_eq!(grid.children_of(cell).map(|c| c.to_vec()), Some(created.clone()));
    assert_eq!(grid.cell_count(), 7 + 8);
    assert!(!grid.cells().contains(&cell));

    // the parent's payload stays readable in the refined staging store
    assert_eq!(grid.payload(cell), Some(&42.0));
    for child in &created {
        assert_eq!(grid.payload(*child), Some(&0.0));
    }

    assert_eq!(covered_volume(&grid), grid_volume(&grid));
}

#[test]
fn refine_request_is_idempotent_until_executed() {
    let mut grid = build_grid(NoComm, [2, 2, 2], 1, 1, TransferMode::Bulk);
    let cell = CellId::new(1).unwrap();
    grid.refine_completely(cell);
    grid.refine_completely(cell);
    assert_eq!(grid.stop_refining().unwrap().len(), 8);

    // refining an already refined cell is a no-op
    grid.refine_completely(cell);
    assert!(grid.stop_refining().unwrap().is_empty());
}

#[test]
fn invalid_refine_requests_are_ignored() {
    let mut grid = build_grid(NoComm, [2, 2, 2], 1, 1, TransferMode::Bulk);
    // outside the grid
    grid.refine_completely_at(5.0, 0.5, 0.5);
    // at the maximum refinement level the request becomes an unrefine veto
    let cell = CellId::new(1).unwrap();
    grid.refine_completely(cell);
    grid.stop_refining().unwrap();
    let child = grid.children_of(cell).unwrap()[0];
    grid.refine_completely(child);
    assert!(grid.stop_refining().unwrap().is_empty());
}

#[test]
fn refinement_updates_neighbor_lists_of_neighbors() {
    let results = run_ranks(2, |comm| {
        let mut grid = build_grid(comm, [4, 4, 4], 1, 1, TransferMode::Bulk);
        let refined = CellId::new(1).unwrap();

        if grid.is_local(refined) {
            grid.refine_completely(refined);
        }
        let created = grid.stop_refining().unwrap();

        // the directory agrees everywhere
        assert!(grid.children_of(refined).is_some());
        let children = grid.children_of(refined).unwrap();

        // every local neighbor of the refined cell now lists children
        let observer = grid.existing_cell_at(1.5, 0.5, 0.5).unwrap();
        assert_eq!(grid.index_space().level_of(observer), Some(0));
        if grid.is_local(observer) {
            let list = grid.neighbors_of(observer).unwrap();
            let seen: Vec<CellId> = list.iter().flatten().copied().collect();
            assert!(
                children.iter().filter(|c| seen.contains(c)).count() >= 4,
                "observer should see the near children"
            );
        }

        (grid.rank(), created.len(), covered_volume(&grid) == grid_volume(&grid))
    });

    let created_total: usize = results.iter().map(|(_, n, _)| n).sum();
    assert_eq!(created_total, 8, "children appear on exactly one rank");
    assert!(results.iter().all(|(_, _, covered)| *covered));
}

#[test]
fn induced_refinement_crosses_ranks() {
    let results = run_ranks(2, |comm| {
        let mut grid = build_grid(comm, [8, 1, 1], 2, 1, TransferMode::Bulk);
        // rank 0 owns root cells 1..=4, rank 1 owns 5..=8
        let boundary = CellId::new(4).unwrap();
        let across = CellId::new(5).unwrap();
        assert_eq!(grid.owner_of(boundary), Some(0));
        assert_eq!(grid.owner_of(across), Some(1));

        // first refinement keeps the level difference at one
        if grid.is_local(boundary) {
            grid.refine_completely(boundary);
        }
        grid.stop_refining().unwrap();
        assert!(grid.children_of(boundary).is_some());
        assert!(grid.children_of(across).is_none());

        // refining the child that touches rank 1 forces cell 5 to refine
        let touching = grid
            .children_of(boundary)
            .unwrap()
            .into_iter()
            .max_by_key(|c| grid.index_space().indices_of(*c).unwrap()[0])
            .unwrap();
        if grid.is_local(touching) {
            grid.refine_completely(touching);
        }
        let created = grid.stop_refining().unwrap();

        assert!(
            grid.children_of(across).is_some(),
            "2:1 balance must force cell 5 to refine"
        );

        // no neighbor pair differs by more than one level
        let space = grid.index_space();
        for cell in grid.cells() {
            let level = space.level_of(cell).unwrap();
            for neighbor in grid.neighbors_of(cell).unwrap().iter().flatten() {
                let diff = (space.level_of(*neighbor).unwrap() as i16 - level as i16).abs();
                assert!(diff <= 1, "cells {cell} and {neighbor} differ by {diff}");
            }
        }

        (grid.rank(), created.len(), covered_volume(&grid) == grid_volume(&grid))
    });

    // rank 0 created the 8 grandchildren, rank 1 the 8 induced children
    assert_eq!(results[0].1, 8);
    assert_eq!(results[1].1, 8);
    assert!(results.iter().all(|(_, _, covered)| *covered));
}

#[test]
fn refine_wins_over_unrefine() {
    let results = run_ranks(2, |comm| {
        let mut grid = build_grid(comm, [4, 1, 1], 2, 1, TransferMode::Bulk);
        // rank 0 owns cells 1..=2, rank 1 owns 3..=4
        let left = CellId::new(2).unwrap();
        let right = CellId::new(3).unwrap();

        if grid.is_local(left) {
            grid.refine_completely(left);
        }
        if grid.is_local(right) {
            grid.refine_completely(right);
        }
        grid.stop_refining().unwrap();

        // pick facing level-1 leaves on each side of the rank boundary
        let space = grid.index_space();
        let c1 = grid
            .children_of(left)
            .unwrap()
            .into_iter()
            .max_by_key(|c| space.indices_of(*c).unwrap()[0])
            .unwrap();
        let c2 = grid
            .children_of(right)
            .unwrap()
            .into_iter()
            .min_by_key(|c| space.indices_of(*c).unwrap()[0])
            .unwrap();

        if grid.is_local(c1) {
            grid.refine_completely(c1);
        }
        if grid.is_local(c2) {
            grid.unrefine_completely(c2);
        }
        grid.stop_refining().unwrap();

        // the refine went through and the conflicting unrefine did not
        assert!(grid.children_of(c1).is_some());
        assert!(grid.owner_of(c2).is_some());
        assert!(grid.children_of(right).is_some());
        grid.rank()
    });
    assert_eq!(results, vec![0, 1]);
}

#[test]
fn unrefining_merges_siblings_and_stages_payloads() {
    let mut grid = build_grid(NoComm, [2, 1, 1], 1, 1, TransferMode::Bulk);
    let parent = CellId::new(1).unwrap();
    grid.refine_completely(parent);
    let children = grid.stop_refining().unwrap();
    for (i, child) in children.iter().enumerate() {
        *grid.payload_mut(*child).unwrap() = i as f64 + 1.0;
    }

    grid.unrefine_completely(children[3]);
    let created = grid.stop_refining().unwrap();
    assert!(created.is_empty());

    // all siblings are gone, the parent is a leaf again
    assert!(grid.children_of(parent).is_none());
    assert!(grid.cells().contains(&parent));
    assert_eq!(grid.payload(parent), Some(&0.0));

    // their payloads stay readable until the next balance
    let removed = grid.removed_cells();
    assert_eq!(removed.len(), 8);
    assert_eq!(grid.payload(removed[3]), Some(&4.0));

    grid.clear_refined_unrefined_data();
    assert!(grid.removed_cells().is_empty());
    assert_eq!(covered_volume(&grid), grid_volume(&grid));
}

#[test]
fn dont_unrefine_vetoes_the_request() {
    let mut grid = build_grid(NoComm, [2, 1, 1], 1, 1, TransferMode::Bulk);
    let parent = CellId::new(1).unwrap();
    grid.refine_completely(parent);
    let children = grid.stop_refining().unwrap();

    grid.dont_unrefine(children[0]);
    grid.unrefine_completely(children[1]);
    grid.stop_refining().unwrap();

    assert!(grid.children_of(parent).is_some(), "veto must hold");
}

#[test]
fn unrefined_payloads_travel_to_the_parents_rank() {
    let results = run_ranks(2, |comm| {
        let mut grid = build_grid(comm, [2, 1, 1], 1, 1, TransferMode::Bulk);
        let parent = CellId::new(2).unwrap();
        assert_eq!(grid.owner_of(parent), Some(1));

        if grid.is_local(parent) {
            grid.refine_completely(parent);
        }
        let created = grid.stop_refining().unwrap();

        // move one child to rank 0 so the later unrefine must ship data
        let moved = grid.index_space().children_of(parent).unwrap()[0];
        if grid.is_local(moved) {
            *grid.payload_mut(moved).unwrap() = 7.5;
            grid.pin(moved, 0);
        }
        grid.migrate_cells().unwrap();
        assert_eq!(grid.owner_of(moved), Some(0));
        if grid.rank() == 0 {
            *grid.payload_mut(moved).unwrap() = 7.5;
        }

        let survivor = created.iter().find(|c| **c != moved).copied();
        if let Some(cell) = survivor.filter(|c| grid.is_local(*c)) {
            grid.unrefine_completely(cell);
        } else if grid.is_local(moved) {
            grid.unrefine_completely(moved);
        }
        grid.stop_refining().unwrap();

        assert!(grid.children_of(parent).is_none());
        // rank 1 owns the parent, so it holds every removed payload
        if grid.rank() == 1 {
            assert_eq!(grid.removed_cells().len(), 8);
            assert_eq!(grid.payload(moved), Some(&7.5));
        } else {
            assert!(grid.removed_cells().is_empty());
        }
        grid.rank()
    });
    assert_eq!(results, vec![0, 1]);
}

#[test]
fn neighbor_symmetry_holds_after_refinement() {
    let mut grid = build_grid(NoComm, [2, 2, 2], 2, 1, TransferMode::Bulk);
    grid.refine_completely(CellId::new(1).unwrap());
    grid.stop_refining().unwrap();
    let child = grid.children_of(CellId::new(1).unwrap()).unwrap()[7];
    grid.refine_completely(child);
    grid.stop_refining().unwrap();

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
