//! Legacy VTK (`.vtk`) writer for the grid's local leaves.
//!
//! Produces an ASCII legacy file with an `UNSTRUCTURED_GRID` dataset of
//! voxels: every leaf contributes its own 8 corner points (no point
//! sharing between cells), written in ascending cell order. One file per
//! rank; stitching files of different ranks together is a viewer-side
//! concern.

use crate::algs::communicator::Communicator;
use crate::data::store::CellData;
use crate::grid::Grid;
use crate::grid_error::GridError;
use crate::invariant_violation;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// VTK cell type of an axis-aligned box with implicit corner ordering.
const VTK_VOXEL: u8 = 11;

/// Writes this rank's leaves to `writer` in legacy VTK format.
///
/// Corner order per cell: (xmin,ymin,zmin), (xmax,ymin,zmin),
/// (xmin,ymax,zmin), (xmax,ymax,zmin), then the same square at zmax.
pub fn write_vtk<W, P, C>(mut writer: W, grid: &Grid<P, C>) -> Result<(), GridError>
where
    W: Write,
    P: CellData,
    C: Communicator,
{
    let cells = grid.cells();

    writeln!(writer, "# vtk DataFile Version 2.0")?;
    writeln!(writer, "Cartesian cell refinable grid")?;
    writeln!(writer, "ASCII")?;
    writeln!(writer, "DATASET UNSTRUCTURED_GRID")?;

    writeln!(writer, "POINTS {} float", cells.len() * 8)?;
    for cell in &cells {
        let bounds = grid
            .cell_bounds(*cell)
            .unwrap_or_else(|| invariant_violation!("local leaf {cell} has no bounds"));
        for z in [bounds.min[2], bounds.max[2]] {
            for y in [bounds.min[1], bounds.max[1]] {
                for x in [bounds.min[0], bounds.max[0]] {
                    writeln!(writer, "{x} {y} {z}")?;
                }
            }
        }
    }

    writeln!(writer, "CELLS {} {}", cells.len(), cells.len() * 9)?;
    for index in 0..cells.len() {
        write!(writer, "8")?;
        for corner in 0..8 {
            write!(writer, " {}", index * 8 + corner)?;
        }
        writeln!(writer)?;
    }

    writeln!(writer, "CELL_TYPES {}", cells.len())?;
    for _ in &cells {
        writeln!(writer, "{VTK_VOXEL}")?;
    }

    Ok(())
}

/// Writes this rank's leaves to the file at `path`.
pub fn write_vtk_file<P, C>(path: &Path, grid: &Grid<P, C>) -> Result<(), GridError>
where
    P: CellData,
    C: Communicator,
{
    let file = File::create(path)?;
    write_vtk(BufWriter::new(file), grid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::geometry::UniformGeometry;
    use crate::grid::GridBuilder;
    use std::sync::Arc;

    #[test]
    fn voxel_layout_for_two_root_cells() {
        let builder = GridBuilder::new()
            .length(2, 1, 1)
            .maximum_refinement_level(0)
            .neighborhood_size(1);
        let space = builder.index_space().unwrap();
        let grid = builder
            .build::<f64, _>(NoComm, Arc::new(UniformGeometry::unit(&space)))
            .unwrap();

        let mut out = Vec::new();
        write_vtk(&mut out, &grid).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "# vtk DataFile Version 2.0");
        assert_eq!(lines[3], "DATASET UNSTRUCTURED_GRID");
        assert_eq!(lines[4], "POINTS 16 float");
        // first cell spans [0,1]x[0,1]x[0,1]
        assert_eq!(lines[5], "0 0 0");
        assert_eq!(lines[6], "1 0 0");
        assert_eq!(lines[7], "0 1 0");
        // second cell starts at x = 1
        assert_eq!(lines[13], "1 0 0");

        let cells_at = lines.iter().position(|l| l.starts_with("CELLS")).unwrap();
        assert_eq!(lines[cells_at], "CELLS 2 18");
        assert_eq!(lines[cells_at + 1], "8 0 1 2 3 4 5 6 7");
        assert_eq!(lines[cells_at + 2], "8 8 9 10 11 12 13 14 15");

        let types_at = lines
            .iter()
            .position(|l| l.starts_with("CELL_TYPES"))
            .unwrap();
        assert_eq!(lines[types_at], "CELL_TYPES 2");
        assert_eq!(lines[types_at + 1], "11");
    }
}
