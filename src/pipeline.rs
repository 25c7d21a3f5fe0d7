//! One sub-region's pass: walk, gap-fill, score, vectorize, write.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::gapfill::{GapFill, fill_gaps};
use crate::geometry::{CellId, Region};
use crate::grid::GridIndexer;
use crate::metadata::MetadataSource;
use crate::report::RegionReport;
use crate::score::score_and_classify;
use crate::sink::{PolygonSink, emit};
use crate::source::TimeSeriesSource;
use crate::source::tableset::TableSet;
use crate::walker::{ResultSet, SkipReason, WalkOptions, WindowWalker};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub walk: WalkOptions,
    /// Minimum mean certainty for a cell to count as water.
    pub threshold: f64,
    /// Stop the sub-region at its first failed window.
    pub fail_fast: bool,
}

enum Processed {
    Skipped(SkipReason),
    Written {
        positive: usize,
        polygons: usize,
    },
}

/// The collaborators and settings of one worker context.
pub struct Pipeline {
    source: Arc<dyn TimeSeriesSource>,
    metadata: Arc<dyn MetadataSource>,
    sink: Arc<dyn PolygonSink>,
    grid: Arc<dyn GridIndexer>,
    tableset: TableSet,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn TimeSeriesSource>,
        metadata: Arc<dyn MetadataSource>,
        sink: Arc<dyn PolygonSink>,
        grid: Arc<dyn GridIndexer>,
        tableset: TableSet,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            source,
            metadata,
            sink,
            grid,
            tableset,
            settings,
        }
    }

    /// Processes every window of `region` in order.
    ///
    /// Query failures and oversized windows are counted and skipped. A
    /// connection failure that survived the retries aborts the sub-region,
    /// as does any window failure when `fail_fast` is set.
    #[tracing::instrument(skip_all, fields(sub_region = index))]
    pub async fn run_region(&self, index: usize, region: &Region) -> RegionReport {
        let started = Instant::now();
        let mut report = RegionReport::new(index);

        let walker = WindowWalker::new(
            &*self.source,
            &*self.grid,
            region,
            &self.tableset,
            self.settings.walk.clone(),
        );
        let mut walker = match walker {
            Ok(w) => w,
            Err(e) => {
                error!(error = %e, "Could not start walking the sub-region");
                report.abort(&e);
                report.finish(started.elapsed().as_millis() as u64);
                return report;
            }
        };
        info!(
            windows = walker.remaining(),
            window_resolution = walker.window_resolution(),
            "Walking sub-region"
        );

        while let Some(next) = walker.next().await {
            let outcome = match next {
                Ok(result) => {
                    let window = result.window();
                    if result.is_truncated() {
                        report.windows_truncated += 1;
                    }
                    self.process(result).await.map_err(|e| (window, e))
                }
                Err(failure) => Err((failure.window, failure.error)),
            };

            match outcome {
                Ok(Processed::Skipped(reason)) => report.record_skip(reason),
                Ok(Processed::Written { positive, polygons }) => {
                    report.windows_processed += 1;
                    report.cells_positive += positive;
                    report.polygons_written += polygons;
                }
                Err((window, e)) => {
                    report.windows_failed += 1;
                    if e.is_connection() || self.settings.fail_fast {
                        error!(%window, error = %e, kind = e.kind(), "Window failed, aborting sub-region");
                        report.abort(&e);
                        break;
                    }
                    warn!(%window, error = %e, kind = e.kind(), "Window failed, continuing");
                }
            }
        }

        report.windows_split = walker.splits();
        report.finish(started.elapsed().as_millis() as u64);
        report
    }

    async fn process(&self, result: ResultSet) -> Result<Processed> {
        if let Some(reason) = result.skip_reason() {
            return Ok(Processed::Skipped(reason));
        }
        if result.is_empty() {
            return Ok(Processed::Skipped(SkipReason::NoRows));
        }

        let window = result.window();
        debug!(
            %window,
            rows = result.len(),
            elapsed_ms = result.elapsed().as_millis() as u64,
            "Processing window"
        );
        let rows = match fill_gaps(result.into_batch().into_rows(), &*self.grid, &*self.metadata).await? {
            GapFill::Rows(rows) => rows,
            GapFill::EmptyCompleteness => {
                info!(%window, "Skipping window without scene coverage");
                return Ok(Processed::Skipped(SkipReason::EmptyCompleteness));
            }
        };

        let positive: Vec<CellId> = score_and_classify(&rows, self.settings.threshold)
            .into_iter()
            .collect();
        let polygons = emit(
            &window,
            &positive,
            &*self.grid,
            self.settings.walk.target_resolution,
            &*self.sink,
        )
        .await?;
        Ok(Processed::Written {
            positive: positive.len(),
            polygons,
        })
    }
}
