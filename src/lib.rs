//! # amr-grid
//!
//! amr-grid is a distributed, adaptively refinable Cartesian grid for
//! parallel scientific simulations. Each rank of a communicator owns a
//! subset of the leaf cells of an octree-refined 3D block, with
//! up-to-date neighbor lists across ranks, ghost exchange of neighbor
//! payloads, collective refinement under a one-level balance rule, and
//! pin-aware repartitioning.
//!
//! ## Features
//! - Reversible cell-id algebra: O(levels) id ↔ (indices, level)
//!   navigation with parent/child/sibling arithmetic
//! - Slot-ordered neighbor lists with periodic boundaries and a
//!   configurable template radius
//! - Collective `stop_refining` with induced refines and unrefine
//!   overrides, keeping neighbors within one refinement level
//! - Split-phase ghost exchange (`start` / `wait receives` / `wait
//!   sends`) for compute/communication overlap
//! - Pluggable message passing (serial, one-thread-per-rank, MPI) and a
//!   pluggable load balancer with pin precedence
//! - Legacy-VTK output of the local leaves
//!
//! ## Usage
//! Add `amr-grid` as a dependency and enable features as needed:
//!
//! ```toml
//! [dependencies]
//! amr-grid = "0.1"
//! # Optional features:
//! # features = ["mpi-support", "check-invariants"]
//! ```
//!
//! A grid is configured by a [`grid::GridBuilder`], an injected
//! [`geometry::Geometry`] and a [`algs::communicator::Communicator`]:
//!
//! ```rust
//! use amr_grid::prelude::*;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), amr_grid::grid_error::GridError> {
//! let builder = GridBuilder::new().length(4, 4, 4).neighborhood_size(1);
//! let space = builder.index_space()?;
//! let mut grid = builder.build::<f64, _>(NoComm, Arc::new(UniformGeometry::unit(&space)))?;
//!
//! let cell = grid.existing_cell_at(0.5, 0.5, 0.5).unwrap();
//! grid.refine_completely(cell);
//! let created = grid.stop_refining()?;
//! assert_eq!(created.len(), 8);
//! # Ok(())
//! # }
//! ```

pub mod algs;
pub mod data;
pub mod geometry;
pub mod grid;
pub mod grid_error;
pub mod io;
pub mod topology;

/// A convenient prelude importing the most-used types.
pub mod prelude {
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::algs::communicator::{CommTag, Communicator, NoComm, ThreadComm, Wait};
    pub use crate::algs::exchange::TransferMode;
    pub use crate::algs::partition::{
        BalanceCell, BalanceView, LoadBalancer, Migration, SfcPartitioner,
    };
    pub use crate::data::store::CellData;
    pub use crate::geometry::{CellBounds, Geometry, UniformGeometry};
    pub use crate::grid::{Grid, GridBuilder, LB_METHOD_NONE};
    pub use crate::grid_error::GridError;
    pub use crate::topology::cell::CellId;
    pub use crate::topology::index::IndexSpace;
}
