//! Grid indexer seam.
//!
//! The pipeline never looks inside a cell index; everything it needs from
//! the hierarchical grid goes through [`GridIndexer`]. [`H3Grid`] is the
//! production indexer, [`QuadGrid`] a planar quadtree with the same contract.

mod h3;
mod quad;

pub use h3::H3Grid;
pub use quad::QuadGrid;

use std::collections::BTreeSet;

use geo::{BooleanOps, ChaikinSmoothing, ConvexHull};
use geo_types::{Coord, MultiPolygon, Polygon};

use crate::error::{PipelineError, Result};
use crate::geometry::{CellId, Region};

/// Hierarchical grid operations consumed by the pipeline.
pub trait GridIndexer: Send + Sync {
    /// Finest resolution the grid supports.
    fn max_resolution(&self) -> u8;

    /// Approximate number of children one resolution down.
    fn aperture(&self) -> u32;

    fn resolution(&self, cell: CellId) -> Result<u8>;

    /// Ancestor of `cell` at the coarser (or equal) `resolution`.
    fn parent(&self, cell: CellId, resolution: u8) -> Result<CellId>;

    /// Descendants of `cell` at the finer (or equal) `resolution`, ascending.
    fn children(&self, cell: CellId, resolution: u8) -> Result<Vec<CellId>>;

    /// Cell outline as a lon/lat polygon.
    fn cell_polygon(&self, cell: CellId) -> Result<Polygon<f64>>;

    /// Cell centre as a lon/lat coordinate.
    fn cell_center(&self, cell: CellId) -> Result<Coord<f64>>;

    /// Cells at `resolution` sharing area with `region`, ascending.
    fn cells_covering(&self, region: &Region, resolution: u8) -> Result<Vec<CellId>>;

    /// Chaikin iterations applied by [`GridIndexer::render_smoothed`].
    fn smoothing_iterations(&self) -> usize {
        1
    }

    /// Convex hull over the outlines of `cells`.
    fn convex_hull(&self, cells: &[CellId]) -> Result<Region> {
        if cells.is_empty() {
            return Err(PipelineError::UnsupportedGeometry(
                "convex hull of an empty cell set".into(),
            ));
        }
        let outlines = cells
            .iter()
            .map(|c| self.cell_polygon(*c))
            .collect::<Result<Vec<_>>>()?;
        Region::new(MultiPolygon::new(outlines).convex_hull())
    }

    /// Union of the outlines of `cells`, which share one resolution.
    fn dissolve(&self, cells: &BTreeSet<CellId>) -> Result<MultiPolygon<f64>> {
        let outlines = cells
            .iter()
            .map(|c| self.cell_polygon(*c))
            .collect::<Result<Vec<_>>>()?;
        Ok(union_all(outlines))
    }

    /// Dissolves `cells` (aligned to `resolution`) into smoothed polygons.
    fn render_smoothed(&self, cells: &[CellId], resolution: u8) -> Result<Vec<Region>> {
        let aligned = align_cells(self, cells, resolution)?;
        let iterations = self.smoothing_iterations();
        self.dissolve(&aligned)?
            .into_iter()
            .map(|p| {
                if iterations == 0 {
                    Region::new(p)
                } else {
                    Region::new(p.chaikin_smoothing(iterations))
                }
            })
            .collect()
    }
}

/// Brings every cell to `resolution`: coarser cells expand into children,
/// finer cells collapse into their parent.
pub fn align_cells<G: GridIndexer + ?Sized>(
    grid: &G,
    cells: &[CellId],
    resolution: u8,
) -> Result<BTreeSet<CellId>> {
    let mut aligned = BTreeSet::new();
    for &cell in cells {
        let r = grid.resolution(cell)?;
        if r == resolution {
            aligned.insert(cell);
        } else if r < resolution {
            aligned.extend(grid.children(cell, resolution)?);
        } else {
            aligned.insert(grid.parent(cell, resolution)?);
        }
    }
    Ok(aligned)
}

/// Unions polygons pairwise, layer by layer, to keep each union small.
fn union_all(polygons: Vec<Polygon<f64>>) -> MultiPolygon<f64> {
    let mut layer: Vec<MultiPolygon<f64>> = polygons
        .into_iter()
        .map(|p| MultiPolygon::new(vec![p]))
        .collect();
    while layer.len() > 1 {
        layer = layer
            .chunks(2)
            .map(|pair| match pair {
                [a, b] => a.union(b),
                [a] => a.clone(),
                _ => MultiPolygon::new(vec![]),
            })
            .collect();
    }
    layer.pop().unwrap_or_else(|| MultiPolygon::new(vec![]))
}
