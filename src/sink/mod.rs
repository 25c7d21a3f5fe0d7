//! Vectorizer and polygon sink.

mod postgres;

pub use postgres::PostgresSink;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::Result;
use crate::geometry::CellId;
use crate::grid::GridIndexer;
use crate::walker::Window;

/// One result polygon tagged with the window that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRow {
    pub window_id: String,
    /// Polygon as WKB.
    pub geometry: Vec<u8>,
}

/// Destination for result polygons.
#[async_trait]
pub trait PolygonSink: Send + Sync {
    /// Creates the output table and spatial index if they do not exist.
    async fn bootstrap(&self) -> Result<()>;

    /// Writes all rows of one window in a single transaction. Either every
    /// row becomes visible or none does.
    async fn write_window(&self, window_id: &str, rows: Vec<OutputRow>) -> Result<usize>;
}

/// Vectorizes the positive `cells` of `window` and hands them to `sink`.
///
/// Returns the number of polygons written.
#[tracing::instrument(skip_all, fields(window = %window.id(), cells = cells.len()))]
pub async fn emit<G: GridIndexer + ?Sized, S: PolygonSink + ?Sized>(
    window: &Window,
    cells: &[CellId],
    grid: &G,
    resolution: u8,
    sink: &S,
) -> Result<usize> {
    if cells.is_empty() {
        info!("Found no polygons");
        return Ok(0);
    }

    let window_id = window.id();
    let rows: Vec<OutputRow> = grid
        .render_smoothed(cells, resolution)?
        .iter()
        .map(|region| OutputRow {
            window_id: window_id.clone(),
            geometry: region.to_wkb(),
        })
        .collect();
    debug!(polygons = rows.len(), "Rendered polygons");

    let written = sink.write_window(&window_id, rows).await?;
    info!(polygons = written, "Found polygons");
    Ok(written)
}
