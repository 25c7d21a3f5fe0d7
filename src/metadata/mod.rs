//! Scene-footprint metadata.
//!
//! Observations are sparse: a scene that saw no water over a cell stores no
//! row for it. The metadata source answers which `(scene, cell, timestamp)`
//! combinations were actually observed so the gaps can be filled with zeros.

mod postgres;

pub use postgres::{DEFAULT_FOOTPRINT_QUERY, PostgresMetadata};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use geo::Intersects;
use geo_types::{Coord, Point};

use crate::error::Result;
use crate::geometry::{CellId, Region};

/// A scene's capture time and ground footprint.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneFootprint {
    pub scene_id: String,
    pub recorded_at: DateTime<Utc>,
    pub footprint: Region,
}

/// A scene that covered a cell at a timestamp, with or without a detection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CompletenessRow {
    pub scene_id: String,
    pub cell: CellId,
    pub recorded_at: DateTime<Utc>,
}

/// A cell together with the point used for the cell-in-footprint test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellCentre {
    pub cell: CellId,
    pub centre: Coord<f64>,
}

/// Everything the metadata source needs to derive completeness rows.
#[derive(Debug, Clone)]
pub struct CompletenessRequest {
    /// Convex hull of the observed cells.
    pub hull: Region,
    /// Distinct timestamps seen in the observations.
    pub timestamps: Vec<DateTime<Utc>>,
    /// Observed cells with their centres.
    pub cells: Vec<CellCentre>,
}

/// Abstraction over the scene metadata store.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Completeness rows for scenes intersecting `req.hull` and recorded at
    /// one of `req.timestamps`, one per scene and contained cell.
    async fn completeness(&self, req: &CompletenessRequest) -> Result<Vec<CompletenessRow>>;
}

/// Derives completeness rows from already loaded footprints.
pub fn footprint_completeness(
    footprints: &[SceneFootprint],
    req: &CompletenessRequest,
) -> Vec<CompletenessRow> {
    let mut rows = Vec::new();
    for scene in footprints {
        if !req.timestamps.contains(&scene.recorded_at)
            || !scene.footprint.polygon().intersects(req.hull.polygon())
        {
            continue;
        }
        for c in &req.cells {
            if scene.footprint.polygon().intersects(&Point::from(c.centre)) {
                rows.push(CompletenessRow {
                    scene_id: scene.scene_id.clone(),
                    cell: c.cell,
                    recorded_at: scene.recorded_at,
                });
            }
        }
    }
    rows
}
