//! Gap-fill joiner.
//!
//! Rebuilds complete per-cell time series: every scene that covered a cell
//! contributes a row, with zero coverage where the scene stored no
//! observation.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::Result;
use crate::geometry::CellId;
use crate::grid::GridIndexer;
use crate::metadata::{CellCentre, CompletenessRequest, MetadataSource};
use crate::source::{Observation, WaterCoverage};

/// A completeness row with the coverage joined onto it.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedRow {
    pub scene_id: String,
    pub cell: CellId,
    pub recorded_at: DateTime<Utc>,
    pub coverage: WaterCoverage,
    /// `false` when the coverage was filled in with zeros.
    pub matched: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GapFill {
    /// Joined rows sorted by `(cell, recorded_at, scene_id)`.
    Rows(Vec<JoinedRow>),
    /// No scene footprint covers the observed cells.
    EmptyCompleteness,
}

/// Left-joins `observations` onto the completeness rows reported by
/// `metadata`.
///
/// Several observations for the same `(scene, cell, timestamp)` each produce
/// their own joined row.
pub async fn fill_gaps<G, M>(observations: Vec<Observation>, grid: &G, metadata: &M) -> Result<GapFill>
where
    G: GridIndexer + ?Sized,
    M: MetadataSource + ?Sized,
{
    if observations.is_empty() {
        return Ok(GapFill::EmptyCompleteness);
    }

    let cells: BTreeSet<CellId> = observations.iter().map(|o| o.cell).collect();
    let timestamps: BTreeSet<DateTime<Utc>> = observations.iter().map(|o| o.recorded_at).collect();
    let cells: Vec<CellId> = cells.into_iter().collect();

    let hull = grid.convex_hull(&cells)?;
    let centres = cells
        .iter()
        .map(|c| Ok(CellCentre { cell: *c, centre: grid.cell_center(*c)? }))
        .collect::<Result<Vec<_>>>()?;
    let req = CompletenessRequest {
        hull,
        timestamps: timestamps.into_iter().collect(),
        cells: centres,
    };

    let universe = metadata.completeness(&req).await?;
    if universe.is_empty() {
        debug!(cells = cells.len(), "No scene footprint covers the observed cells");
        return Ok(GapFill::EmptyCompleteness);
    }

    let mut by_key: HashMap<(&str, CellId, DateTime<Utc>), Vec<WaterCoverage>> = HashMap::new();
    for o in &observations {
        by_key
            .entry((o.scene_id.as_str(), o.cell, o.recorded_at))
            .or_default()
            .push(o.coverage);
    }

    let mut rows = Vec::with_capacity(universe.len());
    let mut filled = 0usize;
    for key in universe {
        match by_key.get(&(key.scene_id.as_str(), key.cell, key.recorded_at)) {
            Some(coverages) => {
                for coverage in coverages {
                    rows.push(JoinedRow {
                        scene_id: key.scene_id.clone(),
                        cell: key.cell,
                        recorded_at: key.recorded_at,
                        coverage: *coverage,
                        matched: true,
                    });
                }
            }
            None => {
                filled += 1;
                rows.push(JoinedRow {
                    scene_id: key.scene_id,
                    cell: key.cell,
                    recorded_at: key.recorded_at,
                    coverage: WaterCoverage::default(),
                    matched: false,
                });
            }
        }
    }
    rows.sort_by(|a, b| {
        (a.cell, a.recorded_at, &a.scene_id).cmp(&(b.cell, b.recorded_at, &b.scene_id))
    });
    debug!(rows = rows.len(), filled, "Joined observations onto completeness rows");
    Ok(GapFill::Rows(rows))
}
