//! Grid I/O helpers.

pub mod vtk;
