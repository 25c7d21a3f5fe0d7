use geo_types::{Coord, Polygon, Rect};

use super::GridIndexer;
use crate::error::{PipelineError, Result};
use crate::geometry::{CellId, Region};

const RES_SHIFT: u32 = 58;
const AXIS_BITS: u32 = 29;
const AXIS_MASK: u64 = (1 << AXIS_BITS) - 1;
const MAX_RESOLUTION: u8 = 28;

/// Planar quadtree grid over a fixed extent.
///
/// Resolution `r` splits the extent into `2^r x 2^r` cells. A cell index packs
/// the resolution into the top six bits followed by the column and row.
#[derive(Debug, Clone, Copy)]
pub struct QuadGrid {
    extent: Rect<f64>,
    smoothing: usize,
}

impl QuadGrid {
    pub fn new(extent: Rect<f64>) -> Self {
        Self {
            extent,
            smoothing: 1,
        }
    }

    pub fn with_smoothing(mut self, iterations: usize) -> Self {
        self.smoothing = iterations;
        self
    }

    /// Index of the cell in column `x`, row `y` at `resolution`.
    pub fn cell_at(&self, resolution: u8, x: u64, y: u64) -> CellId {
        CellId(((resolution as u64) << RES_SHIFT) | ((x & AXIS_MASK) << AXIS_BITS) | (y & AXIS_MASK))
    }

    fn decode(&self, cell: CellId) -> Result<(u8, u64, u64)> {
        let resolution = (cell.0 >> RES_SHIFT) as u8;
        let x = (cell.0 >> AXIS_BITS) & AXIS_MASK;
        let y = cell.0 & AXIS_MASK;
        if resolution > MAX_RESOLUTION || x >= 1 << resolution || y >= 1 << resolution {
            return Err(PipelineError::InvalidCell(cell.0));
        }
        Ok((resolution, x, y))
    }

    fn cell_size(&self, resolution: u8) -> (f64, f64) {
        let n = (1u64 << resolution) as f64;
        (self.extent.width() / n, self.extent.height() / n)
    }

    fn check_resolution(&self, resolution: u8) -> Result<()> {
        if resolution > MAX_RESOLUTION {
            return Err(PipelineError::Config(format!(
                "quad grid resolution {resolution} exceeds {MAX_RESOLUTION}"
            )));
        }
        Ok(())
    }
}

/// Column range covering `[lo, hi]` along one axis, clamped to the grid.
fn axis_range(lo: f64, hi: f64, origin: f64, size: f64, n: u64) -> Option<(u64, u64)> {
    let first = ((lo - origin) / size).floor();
    let last = ((hi - origin) / size).floor();
    if last < 0.0 || first >= n as f64 {
        return None;
    }
    let first = first.max(0.0) as u64;
    let last = (last as u64).min(n - 1);
    Some((first, last))
}

impl GridIndexer for QuadGrid {
    fn max_resolution(&self) -> u8 {
        MAX_RESOLUTION
    }

    fn aperture(&self) -> u32 {
        4
    }

    fn resolution(&self, cell: CellId) -> Result<u8> {
        Ok(self.decode(cell)?.0)
    }

    fn parent(&self, cell: CellId, resolution: u8) -> Result<CellId> {
        let (r, x, y) = self.decode(cell)?;
        if resolution > r {
            return Err(PipelineError::Config(format!(
                "parent resolution {resolution} is finer than cell resolution {r}"
            )));
        }
        let shift = r - resolution;
        Ok(self.cell_at(resolution, x >> shift, y >> shift))
    }

    fn children(&self, cell: CellId, resolution: u8) -> Result<Vec<CellId>> {
        let (r, x, y) = self.decode(cell)?;
        self.check_resolution(resolution)?;
        if resolution < r {
            return Err(PipelineError::Config(format!(
                "child resolution {resolution} is coarser than cell resolution {r}"
            )));
        }
        let shift = resolution - r;
        let span = 1u64 << shift;
        let mut out = Vec::with_capacity((span * span) as usize);
        for cx in (x << shift)..((x << shift) + span) {
            for cy in (y << shift)..((y << shift) + span) {
                out.push(self.cell_at(resolution, cx, cy));
            }
        }
        Ok(out)
    }

    fn cell_polygon(&self, cell: CellId) -> Result<Polygon<f64>> {
        let (r, x, y) = self.decode(cell)?;
        let (w, h) = self.cell_size(r);
        let min = Coord {
            x: self.extent.min().x + x as f64 * w,
            y: self.extent.min().y + y as f64 * h,
        };
        let max = Coord {
            x: min.x + w,
            y: min.y + h,
        };
        Ok(Rect::new(min, max).to_polygon())
    }

    fn cell_center(&self, cell: CellId) -> Result<Coord<f64>> {
        let (r, x, y) = self.decode(cell)?;
        let (w, h) = self.cell_size(r);
        Ok(Coord {
            x: self.extent.min().x + (x as f64 + 0.5) * w,
            y: self.extent.min().y + (y as f64 + 0.5) * h,
        })
    }

    fn cells_covering(&self, region: &Region, resolution: u8) -> Result<Vec<CellId>> {
        self.check_resolution(resolution)?;
        let n = 1u64 << resolution;
        let (w, h) = self.cell_size(resolution);
        let b = region.bounds();

        let Some((x0, x1)) = axis_range(b.min().x, b.max().x, self.extent.min().x, w, n) else {
            return Ok(Vec::new());
        };
        let Some((y0, y1)) = axis_range(b.min().y, b.max().y, self.extent.min().y, h, n) else {
            return Ok(Vec::new());
        };

        let mut cells = Vec::new();
        for x in x0..=x1 {
            for y in y0..=y1 {
                let cell = self.cell_at(resolution, x, y);
                if region.overlaps(&self.cell_polygon(cell)?) {
                    cells.push(cell);
                }
            }
        }
        Ok(cells)
    }

    fn smoothing_iterations(&self) -> usize {
        self.smoothing
    }
}
