//! Shared scaffolding for multi-rank integration tests: every rank runs
//! on its own thread with a `ThreadComm` world.
#![allow(dead_code)]

use amr_grid::prelude::*;
use std::sync::Arc;

/// Runs `f` once per rank on separate threads and returns the results in
/// rank order.
pub fn run_ranks<F, R>(size: usize, f: F) -> Vec<R>
where
    F: Fn(ThreadComm) -> R + Send + Sync + Clone + 'static,
    R: Send + 'static,
{
    let mut world = ThreadComm::world(size);
    let mut handles = Vec::new();
    while let Some(comm) = world.pop() {
        let rank = comm.rank();
        let f = f.clone();
        handles.push((rank, std::thread::spawn(move || f(comm))));
    }
    handles.sort_by_key(|(rank, _)| *rank);
    handles
        .into_iter()
        .map(|(rank, handle)| {
            handle
                .join()
                .unwrap_or_else(|_| panic!("rank {rank} panicked"))
        })
        .collect()
}

/// Builds an `f64`-payload grid from the given settings.
pub fn build_grid<C: Communicator>(
    comm: C,
    length: [u64; 3],
    max_level: u8,
    neighborhood_size: u32,
    mode: TransferMode,
) -> Grid<f64, C> {
    let builder = GridBuilder::new()
        .length(length[0], length[1], length[2])
        .maximum_refinement_level(max_level)
        .neighborhood_size(neighborhood_size)
        .transfer_mode(mode);
    let space = builder.index_space().expect("valid settings");
    builder
        .build(comm, Arc::new(UniformGeometry::unit(&space)))
        .expect("grid builds")
}

/// The union of a grid's leaf footprints, in index-space volume; equals
/// the whole root grid exactly when coverage holds.
pub fn covered_volume<C: Communicator>(grid: &Grid<f64, C>) -> u128 {
    let space = grid.index_space();
    grid.all_cells()
        .into_iter()
        .map(|cell| {
            let size = space.size_in_indices(cell).expect("leaf is valid") as u128;
            size * size * size
        })
        .sum()
}

/// Total index-space volume of the root grid.
pub fn grid_volume<C: Communicator>(grid: &Grid<f64, C>) -> u128 {
    let len = grid.index_space().length_in_indices();
    len[0] as u128 * len[1] as u128 * len[2] as u128
}
