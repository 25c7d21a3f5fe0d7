use std::collections::BTreeSet;

use geo_types::{Coord, LineString, MultiPolygon, Polygon};
use h3o::geom::{ContainmentMode, TilerBuilder};
use h3o::{CellIndex, LatLng, Resolution};

use super::GridIndexer;
use crate::error::{PipelineError, Result};
use crate::geometry::{CellId, Region};

/// H3 grid indexer backed by `h3o`.
///
/// Cell outlines crossing the antimeridian are not split.
#[derive(Debug, Clone, Copy)]
pub struct H3Grid {
    smoothing: usize,
}

impl Default for H3Grid {
    fn default() -> Self {
        Self::new()
    }
}

impl H3Grid {
    pub fn new() -> Self {
        Self { smoothing: 1 }
    }

    pub fn with_smoothing(mut self, iterations: usize) -> Self {
        self.smoothing = iterations;
        self
    }
}

fn index(cell: CellId) -> Result<CellIndex> {
    CellIndex::try_from(cell.0).map_err(|_| PipelineError::InvalidCell(cell.0))
}

fn h3_resolution(resolution: u8) -> Result<Resolution> {
    Resolution::try_from(resolution)
        .map_err(|e| PipelineError::Config(format!("invalid H3 resolution {resolution}: {e}")))
}

impl GridIndexer for H3Grid {
    fn max_resolution(&self) -> u8 {
        15
    }

    fn aperture(&self) -> u32 {
        7
    }

    fn resolution(&self, cell: CellId) -> Result<u8> {
        Ok(u8::from(index(cell)?.resolution()))
    }

    fn parent(&self, cell: CellId, resolution: u8) -> Result<CellId> {
        let idx = index(cell)?;
        idx.parent(h3_resolution(resolution)?)
            .map(|p| CellId(u64::from(p)))
            .ok_or_else(|| {
                PipelineError::Config(format!(
                    "parent resolution {resolution} is finer than cell {cell}"
                ))
            })
    }

    fn children(&self, cell: CellId, resolution: u8) -> Result<Vec<CellId>> {
        let idx = index(cell)?;
        if resolution < u8::from(idx.resolution()) {
            return Err(PipelineError::Config(format!(
                "child resolution {resolution} is coarser than cell {cell}"
            )));
        }
        let mut out: Vec<CellId> = idx
            .children(h3_resolution(resolution)?)
            .map(|c| CellId(u64::from(c)))
            .collect();
        out.sort_unstable();
        Ok(out)
    }

    fn cell_polygon(&self, cell: CellId) -> Result<Polygon<f64>> {
        let boundary = index(cell)?.boundary();
        let ring: Vec<Coord<f64>> = boundary
            .iter()
            .map(|ll| Coord {
                x: ll.lng(),
                y: ll.lat(),
            })
            .collect();
        Ok(Polygon::new(LineString::new(ring), vec![]))
    }

    fn cell_center(&self, cell: CellId) -> Result<Coord<f64>> {
        let ll = LatLng::from(index(cell)?);
        Ok(Coord {
            x: ll.lng(),
            y: ll.lat(),
        })
    }

    /// Tiles the region with every cell touching it, then keeps the cells
    /// whose outline shares area with the region.
    fn cells_covering(&self, region: &Region, resolution: u8) -> Result<Vec<CellId>> {
        let mut tiler = TilerBuilder::new(h3_resolution(resolution)?)
            .containment_mode(ContainmentMode::Covers)
            .build();
        tiler
            .add(region.polygon().clone())
            .map_err(|e| PipelineError::UnsupportedGeometry(format!("cannot tile region: {e}")))?;

        let mut cells = Vec::new();
        for idx in tiler.into_coverage() {
            let cell = CellId(u64::from(idx));
            if region.overlaps(&self.cell_polygon(cell)?) {
                cells.push(cell);
            }
        }
        cells.sort_unstable();
        cells.dedup();
        Ok(cells)
    }

    fn dissolve(&self, cells: &BTreeSet<CellId>) -> Result<MultiPolygon<f64>> {
        let indexes = cells.iter().map(|c| index(*c)).collect::<Result<Vec<_>>>()?;
        h3o::geom::dissolve(indexes)
            .map_err(|e| PipelineError::UnsupportedGeometry(format!("cannot dissolve cells: {e}")))
    }

    fn smoothing_iterations(&self) -> usize {
        self.smoothing
    }
}
