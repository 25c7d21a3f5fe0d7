//! Windowed cell walker.
//!
//! Tiles a region with coarse grid cells ("windows") and fetches the
//! observations of each window's descendants at the target resolution, one
//! window at a time, so memory stays bounded by `fetch_max_rows`.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use geo::Contains;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::geometry::{CellId, Region};
use crate::grid::GridIndexer;
use crate::source::tableset::{QueryTemplate, TableSet, uncompact};
use crate::source::{Observation, TimeSeriesSource};

/// What to do when a window returns more than `fetch_max_rows` rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OversizePolicy {
    /// Replace the window by its children and fetch again.
    #[default]
    Split,
    /// Keep the first `fetch_max_rows` rows and flag the result.
    Truncate,
}

#[derive(Debug, Clone)]
pub struct WalkOptions {
    pub target_resolution: u8,
    pub fetch_max_rows: usize,
    /// Rows one target cell is expected to hold across all timestamps.
    pub expected_rows_per_cell: usize,
    /// Fixed window resolution; derived from the limits when unset.
    pub window_resolution: Option<u8>,
    pub oversize_policy: OversizePolicy,
    pub max_split_depth: u8,
    pub fetch_template: QueryTemplate,
    pub prefetch_template: Option<QueryTemplate>,
}

impl WalkOptions {
    pub fn new(target_resolution: u8, fetch_template: QueryTemplate) -> Self {
        Self {
            target_resolution,
            fetch_max_rows: 1_000_000,
            expected_rows_per_cell: 100,
            window_resolution: None,
            oversize_policy: OversizePolicy::Split,
            max_split_depth: 4,
            fetch_template,
            prefetch_template: None,
        }
    }
}

/// A coarse cell whose descendants are fetched together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Window {
    cell: CellId,
    resolution: u8,
}

impl Window {
    pub fn new(cell: CellId, resolution: u8) -> Self {
        Self { cell, resolution }
    }

    pub fn cell(&self) -> CellId {
        self.cell
    }

    pub fn resolution(&self) -> u8 {
        self.resolution
    }

    /// Identifier stored alongside the window's output.
    pub fn id(&self) -> String {
        self.cell.to_string()
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cell)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SkipReason {
    /// No descendant cell overlaps the region.
    NoCells,
    /// The prefetch query found no rows, the fetch was not issued.
    PrefetchEmpty,
    /// The fetch returned no observations.
    NoRows,
    /// Observations exist but no scene footprint covers them.
    EmptyCompleteness,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NoCells => "no_cells",
            SkipReason::PrefetchEmpty => "prefetch_empty",
            SkipReason::NoRows => "no_rows",
            SkipReason::EmptyCompleteness => "empty_completeness",
        }
    }
}

/// Observations of one window. Consumed once by [`ObservationBatch::into_rows`].
#[derive(Debug, Default)]
pub struct ObservationBatch {
    rows: Vec<Observation>,
}

impl ObservationBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn into_rows(self) -> Vec<Observation> {
        self.rows
    }
}

impl IntoIterator for ObservationBatch {
    type Item = Observation;
    type IntoIter = std::vec::IntoIter<Observation>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

/// The outcome of fetching one window.
#[derive(Debug)]
pub struct ResultSet {
    sequence: usize,
    window: Window,
    queried_cells: Vec<CellId>,
    elapsed: Duration,
    skip_reason: Option<SkipReason>,
    truncated: bool,
    batch: ObservationBatch,
}

impl ResultSet {
    /// Position of the window in the walk, starting at 0.
    pub fn sequence(&self) -> usize {
        self.sequence
    }

    pub fn window(&self) -> Window {
        self.window
    }

    /// Target-resolution cells the fetch was issued for.
    pub fn queried_cells(&self) -> &[CellId] {
        &self.queried_cells
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        self.skip_reason
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    pub fn into_batch(self) -> ObservationBatch {
        self.batch
    }
}

/// A window that could not be fetched. The walk continues after it.
#[derive(Debug, thiserror::Error)]
#[error("window {window}: {error}")]
pub struct WindowFailure {
    pub window: Window,
    pub sequence: usize,
    #[source]
    pub error: PipelineError,
}

enum Visit {
    Done(ResultSet),
    Split(Vec<Window>),
}

/// Coarsest resolution whose windows are expected to stay under the fetch
/// limit, or the configured override.
pub fn choose_window_resolution<G: GridIndexer + ?Sized>(grid: &G, options: &WalkOptions) -> Result<u8> {
    let target = options.target_resolution;
    if target > grid.max_resolution() {
        return Err(PipelineError::Config(format!(
            "target resolution {target} exceeds the grid maximum {}",
            grid.max_resolution()
        )));
    }
    if let Some(r) = options.window_resolution {
        if r > target {
            return Err(PipelineError::Config(format!(
                "window resolution {r} is finer than the target resolution {target}"
            )));
        }
        return Ok(r);
    }

    let aperture = f64::from(grid.aperture());
    let expected = options.expected_rows_per_cell as f64;
    (0..=target)
        .find(|r| aperture.powi(i32::from(target - r)) * expected <= options.fetch_max_rows as f64)
        .ok_or_else(|| {
            PipelineError::Config(format!(
                "expected_rows_per_cell {} exceeds fetch_max_rows {}",
                options.expected_rows_per_cell, options.fetch_max_rows
            ))
        })
}

/// Lazily walks the windows of a region in ascending cell order.
pub struct WindowWalker<'a, S: ?Sized, G: ?Sized> {
    source: &'a S,
    grid: &'a G,
    region: &'a Region,
    tableset: &'a TableSet,
    options: WalkOptions,
    window_resolution: u8,
    pending: VecDeque<(Window, u8)>,
    sequence: usize,
    splits: usize,
}

impl<'a, S, G> WindowWalker<'a, S, G>
where
    S: TimeSeriesSource + ?Sized,
    G: GridIndexer + ?Sized,
{
    pub fn new(
        source: &'a S,
        grid: &'a G,
        region: &'a Region,
        tableset: &'a TableSet,
        options: WalkOptions,
    ) -> Result<Self> {
        if options.fetch_max_rows == 0 {
            return Err(PipelineError::Config("fetch_max_rows must be positive".into()));
        }
        let window_resolution = choose_window_resolution(grid, &options)?;
        if !tableset.has_base(options.target_resolution) {
            return Err(PipelineError::Config(format!(
                "tableset {} has no base table at resolution {}",
                tableset.basename(),
                options.target_resolution
            )));
        }

        let mut cells = grid.cells_covering(region, window_resolution)?;
        cells.sort_unstable();
        debug!(
            windows = cells.len(),
            window_resolution,
            target_resolution = options.target_resolution,
            "Enumerated windows"
        );
        let pending = cells
            .into_iter()
            .map(|c| (Window::new(c, window_resolution), 0))
            .collect();

        Ok(Self {
            source,
            grid,
            region,
            tableset,
            options,
            window_resolution,
            pending,
            sequence: 0,
            splits: 0,
        })
    }

    pub fn window_resolution(&self) -> u8 {
        self.window_resolution
    }

    /// Windows still queued, including split children.
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    /// Windows replaced by their children so far.
    pub fn splits(&self) -> usize {
        self.splits
    }

    /// Fetches the next window. Returns `None` once every window was visited.
    pub async fn next(&mut self) -> Option<std::result::Result<ResultSet, WindowFailure>> {
        loop {
            let (window, depth) = self.pending.pop_front()?;
            let sequence = self.sequence;
            match self.visit(window, depth, sequence).await {
                Ok(Visit::Done(result)) => {
                    self.sequence += 1;
                    return Some(Ok(result));
                }
                Ok(Visit::Split(children)) => {
                    self.splits += 1;
                    for child in children.into_iter().rev() {
                        self.pending.push_front((child, depth + 1));
                    }
                }
                Err(error) => {
                    self.sequence += 1;
                    return Some(Err(WindowFailure {
                        window,
                        sequence,
                        error,
                    }));
                }
            }
        }
    }

    async fn visit(&self, window: Window, depth: u8, sequence: usize) -> Result<Visit> {
        let started = Instant::now();
        let done = |cells: Vec<CellId>, rows: Vec<Observation>, skip: Option<SkipReason>, truncated: bool| {
            Visit::Done(ResultSet {
                sequence,
                window,
                queried_cells: cells,
                elapsed: started.elapsed(),
                skip_reason: skip,
                truncated,
                batch: ObservationBatch { rows },
            })
        };

        let cells = self.descendant_cells(window)?;
        if cells.is_empty() {
            debug!(%window, "No cells overlap the region");
            return Ok(done(cells, Vec::new(), Some(SkipReason::NoCells), false));
        }

        if let Some(template) = &self.options.prefetch_template {
            if !self.prefetch(window, &cells, template).await? {
                debug!(%window, "Prefetch found no rows");
                return Ok(done(cells, Vec::new(), Some(SkipReason::PrefetchEmpty), false));
            }
        }

        let query = self
            .tableset
            .build_select_query(self.grid, &cells, &self.options.fetch_template)?;
        let max = self.options.fetch_max_rows;
        let fetched = self.source.fetch(&query, max + 1).await?;
        let capped = fetched.len() > max;
        // Compacted rows expand to every queried child, so the ceiling
        // applies to the uncompacted rows.
        let mut rows = uncompact(self.grid, fetched, &cells)?;

        let mut truncated = false;
        if capped || rows.len() > max {
            match self.options.oversize_policy {
                OversizePolicy::Split
                    if window.resolution < self.options.target_resolution
                        && depth < self.options.max_split_depth =>
                {
                    let children = self.split(window)?;
                    warn!(%window, limit = max, children = children.len(), "Result size exceeded, splitting window");
                    return Ok(Visit::Split(children));
                }
                OversizePolicy::Split => {
                    return Err(PipelineError::ResultSizeExceeded {
                        window: window.id(),
                        limit: max,
                    });
                }
                OversizePolicy::Truncate => {
                    rows.sort_by(|a, b| a.fetch_order().cmp(&b.fetch_order()));
                    rows.truncate(max);
                    truncated = true;
                    warn!(%window, limit = max, "Result size exceeded, truncating");
                }
            }
        }

        debug!(
            %window,
            rows = rows.len(),
            cells = cells.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Fetched window"
        );
        Ok(done(cells, rows, None, truncated))
    }

    /// Target-resolution descendants of `window` overlapping the region.
    fn descendant_cells(&self, window: Window) -> Result<Vec<CellId>> {
        let children = self
            .grid
            .children(window.cell, self.options.target_resolution)?;
        let outline = self.grid.cell_polygon(window.cell)?;
        if self.region.polygon().contains(&outline) {
            return Ok(children);
        }

        let mut cells = Vec::with_capacity(children.len());
        for child in children {
            if self.region.overlaps(&self.grid.cell_polygon(child)?) {
                cells.push(child);
            }
        }
        Ok(cells)
    }

    /// Existence check against the finest base table not finer than the
    /// window, falling back to the queried cells.
    async fn prefetch(&self, window: Window, cells: &[CellId], template: &QueryTemplate) -> Result<bool> {
        let query = match self.tableset.base_at_or_above(window.resolution) {
            Some(r) => {
                let probe = self.grid.parent(window.cell, r)?;
                self.tableset.build_select_query(self.grid, &[probe], template)?
            }
            None => self.tableset.build_select_query(self.grid, cells, template)?,
        };
        self.source.has_rows(&query).await
    }

    fn split(&self, window: Window) -> Result<Vec<Window>> {
        let resolution = window.resolution + 1;
        let mut children = Vec::new();
        for child in self.grid.children(window.cell, resolution)? {
            if self.region.overlaps(&self.grid.cell_polygon(child)?) {
                children.push(Window::new(child, resolution));
            }
        }
        Ok(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::QuadGrid;
    use crate::memory::MemorySource;
    use crate::source::WaterCoverage;
    use crate::source::tableset::DEFAULT_FETCH_TEMPLATE;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use geo_types::{Coord, Rect, polygon};

    fn grid() -> QuadGrid {
        QuadGrid::new(Rect::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 1.0, y: 1.0 }))
    }

    fn region() -> Region {
        Region::new(polygon![(x: 0.0, y: 0.0), (x: 0.5, y: 0.0), (x: 0.5, y: 0.5), (x: 0.0, y: 0.5)]).unwrap()
    }

    fn options() -> WalkOptions {
        let mut o = WalkOptions::new(3, QueryTemplate::new(DEFAULT_FETCH_TEMPLATE).unwrap());
        o.window_resolution = Some(1);
        o
    }

    fn rows_for(cells: &[CellId], per_cell: usize) -> Vec<Observation> {
        let t0 = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        cells
            .iter()
            .flat_map(|c| {
                (0..per_cell).map(move |i| Observation {
                    scene_id: format!("s{i}"),
                    cell: *c,
                    recorded_at: t0 + ChronoDuration::days(i as i64),
                    coverage: WaterCoverage::new(0.5, 0.0, 0.0),
                })
            })
            .collect()
    }

    #[test]
    fn test_window_resolution_from_limits() {
        let g = grid();
        let mut o = options();
        o.window_resolution = None;
        o.target_resolution = 6;
        o.expected_rows_per_cell = 10;
        o.fetch_max_rows = 1_000;
        // 4^2 * 10 = 160 <= 1000 < 4^3 * 10
        assert_eq!(choose_window_resolution(&g, &o).unwrap(), 4);

        o.expected_rows_per_cell = 2_000;
        assert!(choose_window_resolution(&g, &o).is_err());

        o.window_resolution = Some(7);
        assert!(choose_window_resolution(&g, &o).is_err());
    }

    #[tokio::test]
    async fn test_walk_visits_each_window_once() {
        let g = grid();
        let region = region();
        let tableset = TableSet::new("water").with_base(3);
        let cells = g.children(g.cell_at(1, 0, 0), 3).unwrap();
        let source = MemorySource::new().with_table("water_03_base", rows_for(&cells, 2));

        let mut walker = WindowWalker::new(&source, &g, &region, &tableset, options()).unwrap();
        let mut seen = Vec::new();
        while let Some(result) = walker.next().await {
            let rs = result.unwrap();
            assert_eq!(rs.sequence(), seen.len());
            assert_eq!(rs.queried_cells().len(), 16);
            assert_eq!(rs.len(), 32);
            seen.push(rs.window());
        }
        assert_eq!(seen, vec![Window::new(g.cell_at(1, 0, 0), 1)]);
        assert!(walker.next().await.is_none());
    }

    #[tokio::test]
    async fn test_prefetch_empty_skips_fetch() {
        let g = grid();
        let region = region();
        let tableset = TableSet::new("water").with_base(1).with_base(3);
        let source = MemorySource::new()
            .with_table("water_01_base", Vec::new())
            .with_table("water_03_base", Vec::new());

        let mut o = options();
        o.prefetch_template = Some(QueryTemplate::new(DEFAULT_FETCH_TEMPLATE).unwrap());
        let mut walker = WindowWalker::new(&source, &g, &region, &tableset, o).unwrap();

        let rs = walker.next().await.unwrap().unwrap();
        assert_eq!(rs.skip_reason(), Some(SkipReason::PrefetchEmpty));
        assert_eq!(source.prefetch_count(), 1);
        assert_eq!(source.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_truncate_policy_flags_result() {
        let g = grid();
        let region = region();
        let tableset = TableSet::new("water").with_base(3);
        let cells = g.children(g.cell_at(1, 0, 0), 3).unwrap();
        let source = MemorySource::new().with_table("water_03_base", rows_for(&cells, 10));

        let mut o = options();
        o.fetch_max_rows = 100;
        o.oversize_policy = OversizePolicy::Truncate;
        let mut walker = WindowWalker::new(&source, &g, &region, &tableset, o).unwrap();

        let rs = walker.next().await.unwrap().unwrap();
        assert!(rs.is_truncated());
        assert_eq!(rs.len(), 100);
    }

    #[tokio::test]
    async fn test_compacted_rows_count_against_the_ceiling() {
        let g = grid();
        let region = region();
        let tableset = TableSet::new("water").with_base(3).with_compacted(1);
        // 50 rows on the window cell expand to 50 rows per target cell.
        let compacted = rows_for(&[g.cell_at(1, 0, 0)], 50);
        let source = MemorySource::new()
            .with_table("water_03_base", Vec::new())
            .with_table("water_01_compacted", compacted);

        let mut o = options();
        o.fetch_max_rows = 100;
        let mut walker = WindowWalker::new(&source, &g, &region, &tableset, o.clone()).unwrap();
        let mut total = 0;
        while let Some(result) = walker.next().await {
            let rs = result.unwrap();
            assert!(rs.len() <= 100);
            assert!(!rs.is_truncated());
            total += rs.len();
        }
        assert_eq!(total, 16 * 50);
        assert_eq!(walker.splits(), 5);

        o.oversize_policy = OversizePolicy::Truncate;
        let mut walker = WindowWalker::new(&source, &g, &region, &tableset, o).unwrap();
        let rs = walker.next().await.unwrap().unwrap();
        assert!(rs.is_truncated());
        assert_eq!(rs.len(), 100);
    }

    #[tokio::test]
    async fn test_truncation_ignores_storage_order() {
        let g = grid();
        let region = region();
        let tableset = TableSet::new("water").with_base(3);
        let cells = g.children(g.cell_at(1, 0, 0), 3).unwrap();
        let rows = rows_for(&cells, 13);
        let mut reversed = rows.clone();
        reversed.reverse();

        let mut o = options();
        o.fetch_max_rows = 100;
        o.oversize_policy = OversizePolicy::Truncate;

        let mut kept = Vec::new();
        for table in [rows, reversed] {
            let source = MemorySource::new().with_table("water_03_base", table);
            let mut walker = WindowWalker::new(&source, &g, &region, &tableset, o.clone()).unwrap();
            let rs = walker.next().await.unwrap().unwrap();
            assert!(rs.is_truncated());
            kept.push(rs.into_batch().into_rows());
        }
        assert_eq!(kept[0].len(), 100);
        assert_eq!(kept[0], kept[1]);
    }

    #[tokio::test]
    async fn test_unsplittable_window_fails_but_walk_continues() {
        let g = grid();
        let region = Region::new(polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 0.5), (x: 0.0, y: 0.5)]).unwrap();
        let tableset = TableSet::new("water").with_base(3);
        let crowded = g.children(g.cell_at(1, 0, 0), 3).unwrap();
        let source = MemorySource::new().with_table("water_03_base", rows_for(&crowded, 10));

        let mut o = options();
        o.fetch_max_rows = 100;
        o.max_split_depth = 0;
        let mut walker = WindowWalker::new(&source, &g, &region, &tableset, o).unwrap();

        let failure = walker.next().await.unwrap().unwrap_err();
        assert!(matches!(failure.error, PipelineError::ResultSizeExceeded { limit: 100, .. }));
        let next = walker.next().await.unwrap().unwrap();
        assert_eq!(next.window(), Window::new(g.cell_at(1, 1, 0), 1));
        assert_eq!(next.sequence(), 1);
    }

    #[tokio::test]
    async fn test_missing_base_table_is_config_error() {
        let g = grid();
        let region = region();
        let tableset = TableSet::new("water").with_base(2);
        let source = MemorySource::new();
        assert!(matches!(
            WindowWalker::new(&source, &g, &region, &tableset, options()),
            Err(PipelineError::Config(_))
        ));
    }
}
