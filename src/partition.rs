//! Region partitioner and worker pool.
//!
//! The region is cut into area-balanced pieces, one per worker, and every
//! piece is processed by its own task. Tasks share nothing mutable: each
//! owns its sub-region and reports back over a channel.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use geo::{Area, BooleanOps, BoundingRect};
use geo_types::{Coord, MultiPolygon, Polygon, Rect};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{Instrument, error, info, warn};

use crate::error::{PipelineError, Result};
use crate::geometry::Region;
use crate::report::RegionReport;

/// Pieces smaller than this share of the parent area are dropped.
const SLIVER_RATIO: f64 = 1e-9;

/// Steps of the bisection search for a balanced cut.
const CUT_SEARCH_STEPS: usize = 40;

#[derive(Debug, Clone)]
pub struct SubRegion {
    pub index: usize,
    pub region: Region,
}

#[derive(Debug, Clone, Copy)]
pub struct PartitionOptions {
    pub worker_count: usize,
    /// Abort every other sub-region once one fails.
    pub fail_fast: bool,
}

#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    pub index: usize,
    pub report: RegionReport,
}

/// Cuts `region` into pieces of roughly equal area, at least `parts` of
/// them when the shape allows.
///
/// Cuts run across the longer side of the bounding box. A cut through a
/// concave region can leave several pieces on one side; each becomes its
/// own sub-region.
pub fn split_region(region: &Region, parts: usize) -> Result<Vec<Region>> {
    if parts == 0 {
        return Err(PipelineError::Config("cannot split a region into 0 parts".into()));
    }
    let min_area = region.area() * SLIVER_RATIO;
    let mut out = Vec::with_capacity(parts);
    bisect(region.polygon().clone(), parts, min_area, &mut out)?;
    Ok(out)
}

fn bisect(polygon: Polygon<f64>, parts: usize, min_area: f64, out: &mut Vec<Region>) -> Result<()> {
    if parts <= 1 {
        out.push(Region::new(polygon)?);
        return Ok(());
    }
    let Some(bounds) = polygon.bounding_rect() else {
        return Err(PipelineError::UnsupportedGeometry("polygon has no bounding box".into()));
    };

    let first_parts = parts / 2;
    let share = first_parts as f64 / parts as f64;
    let wanted = polygon.unsigned_area() * share;
    let vertical = bounds.width() >= bounds.height();
    let (start, end) = if vertical {
        (bounds.min().x, bounds.max().x)
    } else {
        (bounds.min().y, bounds.max().y)
    };

    let (mut lo, mut hi) = (start, end);
    for _ in 0..CUT_SEARCH_STEPS {
        let mid = (lo + hi) / 2.0;
        if clip(&polygon, bounds, vertical, start, mid).unsigned_area() < wanted {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    let cut = (lo + hi) / 2.0;

    let halves = [
        (clip(&polygon, bounds, vertical, start, cut), first_parts),
        (clip(&polygon, bounds, vertical, cut, end), parts - first_parts),
    ];
    for (half, half_parts) in halves {
        let pieces: Vec<Polygon<f64>> = half
            .into_iter()
            .filter(|p| p.unsigned_area() > min_area)
            .collect();
        let total: f64 = pieces.iter().map(|p| p.unsigned_area()).sum();
        for piece in pieces {
            let n = ((half_parts as f64) * piece.unsigned_area() / total).round() as usize;
            bisect(piece, n.max(1), min_area, out)?;
        }
    }
    Ok(())
}

/// The part of `polygon` between `from` and `to` along the cut axis.
fn clip(polygon: &Polygon<f64>, bounds: Rect<f64>, vertical: bool, from: f64, to: f64) -> MultiPolygon<f64> {
    let pad = bounds.width().max(bounds.height());
    let slab = if vertical {
        Rect::new(
            Coord { x: from, y: bounds.min().y - pad },
            Coord { x: to, y: bounds.max().y + pad },
        )
    } else {
        Rect::new(
            Coord { x: bounds.min().x - pad, y: from },
            Coord { x: bounds.max().x + pad, y: to },
        )
    };
    polygon.intersection(&slab.to_polygon())
}

/// Splits `region` and runs `callback` once per piece, at most
/// `worker_count` at a time.
///
/// A callback that fails or panics yields a failed report for its own
/// sub-region only, unless `fail_fast` is set. Returns one outcome per
/// sub-region, ordered by index.
pub async fn partition_and_run<F, Fut>(
    options: PartitionOptions,
    region: &Region,
    callback: F,
) -> Result<Vec<WorkerOutcome>>
where
    F: Fn(SubRegion) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RegionReport>> + Send + 'static,
{
    if options.worker_count == 0 {
        return Err(PipelineError::Config("worker_count must be at least 1".into()));
    }

    if options.worker_count == 1 {
        let sub = SubRegion {
            index: 0,
            region: region.clone(),
        };
        let report = callback(sub)
            .instrument(tracing::info_span!("sub_region", index = 0))
            .await
            .unwrap_or_else(|e| RegionReport::failed(0, e.to_string()));
        return Ok(vec![WorkerOutcome { index: 0, report }]);
    }

    let pieces = split_region(region, options.worker_count)?;
    info!(
        sub_regions = pieces.len(),
        workers = options.worker_count,
        "Region partitioned"
    );

    let callback = Arc::new(callback);
    let semaphore = Arc::new(Semaphore::new(options.worker_count));
    let (tx, mut rx) = mpsc::unbounded_channel::<WorkerOutcome>();
    let mut tasks = JoinSet::new();
    let mut task_index = HashMap::new();

    for (index, piece) in pieces.into_iter().enumerate() {
        let callback = callback.clone();
        let semaphore = semaphore.clone();
        let tx = tx.clone();
        let span = tracing::info_span!("sub_region", index);

        let handle = tasks.spawn(
            async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let sub = SubRegion {
                    index,
                    region: piece,
                };
                let report = callback(sub)
                    .await
                    .unwrap_or_else(|e| RegionReport::failed(index, e.to_string()));
                let _ = tx.send(WorkerOutcome { index, report });
            }
            .instrument(span),
        );
        task_index.insert(handle.id(), index);
    }
    drop(tx);

    let mut outcomes: BTreeMap<usize, WorkerOutcome> = BTreeMap::new();
    let mut aborting = false;
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            if let Some(index) = task_index.get(&e.id()).copied() {
                let reason = if e.is_panic() {
                    format!("worker panicked: {}", panic_message(e))
                } else {
                    "aborted after another sub-region failed".to_string()
                };
                error!(index, reason = %reason, "Sub-region ended without a report");
                outcomes.insert(
                    index,
                    WorkerOutcome {
                        index,
                        report: RegionReport::failed(index, reason),
                    },
                );
            }
        }
        while let Ok(outcome) = rx.try_recv() {
            outcomes.insert(outcome.index, outcome);
        }

        if options.fail_fast && !aborting && outcomes.values().any(|o| o.report.is_failed()) {
            warn!("Sub-region failed, aborting the remaining sub-regions");
            aborting = true;
            tasks.abort_all();
        }
    }
    while let Ok(outcome) = rx.try_recv() {
        outcomes.insert(outcome.index, outcome);
    }

    Ok(outcomes.into_values().collect())
}

fn panic_message(e: tokio::task::JoinError) -> String {
    let payload = e.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
