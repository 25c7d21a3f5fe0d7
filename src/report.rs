//! Per-sub-region run reports.
//!
//! Reports are logged at the end of a run and can be appended to a CSV file.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::walker::SkipReason;
use csv::WriterBuilder;
use std::fs::OpenOptions;
use std::path::Path;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionStatus {
    #[default]
    Completed,
    /// The context stopped early, its remaining windows were not visited.
    Aborted,
    /// The context never produced a report (panic or cancellation).
    Failed,
}

/// What happened to one sub-region.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionReport {
    pub finished_at: DateTime<Utc>,
    pub sub_region: usize,
    pub status: RegionStatus,
    pub windows_processed: usize,
    pub skipped_no_cells: usize,
    pub skipped_prefetch_empty: usize,
    pub skipped_no_rows: usize,
    pub skipped_empty_completeness: usize,
    pub windows_failed: usize,
    pub windows_truncated: usize,
    pub windows_split: usize,
    pub cells_positive: usize,
    pub polygons_written: usize,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

impl RegionReport {
    pub fn new(sub_region: usize) -> Self {
        Self {
            finished_at: Utc::now(),
            sub_region,
            status: RegionStatus::Completed,
            windows_processed: 0,
            skipped_no_cells: 0,
            skipped_prefetch_empty: 0,
            skipped_no_rows: 0,
            skipped_empty_completeness: 0,
            windows_failed: 0,
            windows_truncated: 0,
            windows_split: 0,
            cells_positive: 0,
            polygons_written: 0,
            elapsed_ms: 0,
            error: None,
        }
    }

    /// Report for a context that ended without producing its own.
    pub fn failed(sub_region: usize, reason: impl Into<String>) -> Self {
        Self {
            status: RegionStatus::Failed,
            error: Some(reason.into()),
            ..Self::new(sub_region)
        }
    }

    pub fn abort(&mut self, error: &PipelineError) {
        self.status = RegionStatus::Aborted;
        self.error = Some(error.to_string());
    }

    pub fn record_skip(&mut self, reason: SkipReason) {
        match reason {
            SkipReason::NoCells => self.skipped_no_cells += 1,
            SkipReason::PrefetchEmpty => self.skipped_prefetch_empty += 1,
            SkipReason::NoRows => self.skipped_no_rows += 1,
            SkipReason::EmptyCompleteness => self.skipped_empty_completeness += 1,
        }
    }

    pub fn windows_skipped(&self) -> usize {
        self.skipped_no_cells
            + self.skipped_prefetch_empty
            + self.skipped_no_rows
            + self.skipped_empty_completeness
    }

    /// `true` when the sub-region has an output gap.
    pub fn is_failed(&self) -> bool {
        self.status != RegionStatus::Completed
    }

    pub fn finish(&mut self, elapsed_ms: u64) {
        self.elapsed_ms = elapsed_ms;
        self.finished_at = Utc::now();
    }
}

/// Totals across the sub-regions of one run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunTotals {
    pub sub_regions: usize,
    pub failed_regions: usize,
    pub windows_processed: usize,
    pub windows_skipped: usize,
    pub windows_failed: usize,
    pub polygons_written: usize,
}

impl RunTotals {
    pub fn from_reports(reports: &[RegionReport]) -> Self {
        reports.iter().fold(
            RunTotals {
                sub_regions: reports.len(),
                ..Default::default()
            },
            |mut t, r| {
                t.failed_regions += usize::from(r.is_failed());
                t.windows_processed += r.windows_processed;
                t.windows_skipped += r.windows_skipped();
                t.windows_failed += r.windows_failed;
                t.polygons_written += r.polygons_written;
                t
            },
        )
    }
}

/// Logs one line per sub-region and a run total, which is returned.
pub fn log_summary(reports: &[RegionReport]) -> RunTotals {
    for r in reports {
        let skipped = r.windows_skipped();
        if r.is_failed() {
            error!(
                sub_region = r.sub_region,
                status = ?r.status,
                processed = r.windows_processed,
                skipped,
                failed = r.windows_failed,
                error = r.error.as_deref().unwrap_or(""),
                "Sub-region did not complete"
            );
        } else if r.windows_failed > 0 || r.windows_truncated > 0 {
            warn!(
                sub_region = r.sub_region,
                processed = r.windows_processed,
                skipped,
                failed = r.windows_failed,
                truncated = r.windows_truncated,
                split = r.windows_split,
                polygons = r.polygons_written,
                "Sub-region completed with gaps"
            );
        } else {
            info!(
                sub_region = r.sub_region,
                processed = r.windows_processed,
                skipped,
                split = r.windows_split,
                polygons = r.polygons_written,
                elapsed_ms = r.elapsed_ms,
                "Sub-region completed"
            );
        }
    }

    let totals = RunTotals::from_reports(reports);
    info!(
        sub_regions = totals.sub_regions,
        failed_regions = totals.failed_regions,
        windows_processed = totals.windows_processed,
        windows_skipped = totals.windows_skipped,
        windows_failed = totals.windows_failed,
        polygons_written = totals.polygons_written,
        "Run summary"
    );
    totals
}

/// Appends a [`RegionReport`] as a row to a CSV file.
///
/// Creates the file with headers if it does not already exist.
pub fn append_record(path: &str, report: &RegionReport) -> Result<()> {
    let file_exists = Path::new(path).exists();
    debug!(path, file_exists, "Appending CSV record");

    let file = OpenOptions::new().append(true).create(true).open(path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists)
        .from_writer(file);

    writer.serialize(report)?;
    writer.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;

    fn temp_path(name: &str) -> String {
        format!("{}/{}", env::temp_dir().display(), name)
    }

    #[test]
    fn test_record_skip_counts_by_reason() {
        let mut r = RegionReport::new(0);
        r.record_skip(SkipReason::PrefetchEmpty);
        r.record_skip(SkipReason::PrefetchEmpty);
        r.record_skip(SkipReason::EmptyCompleteness);
        assert_eq!(r.skipped_prefetch_empty, 2);
        assert_eq!(r.windows_skipped(), 3);
        assert!(!r.is_failed());

        r.abort(&PipelineError::Connection("refused".into()));
        assert_eq!(r.status, RegionStatus::Aborted);
        assert!(r.is_failed());
    }

    #[test]
    fn test_log_summary_totals_mixed_reports() {
        let mut done = RegionReport::new(0);
        done.windows_processed = 5;
        done.windows_failed = 1;
        done.polygons_written = 7;
        done.record_skip(SkipReason::NoRows);
        done.record_skip(SkipReason::PrefetchEmpty);

        let mut aborted = RegionReport::new(1);
        aborted.windows_processed = 2;
        aborted.abort(&PipelineError::Connection("refused".into()));

        let totals = log_summary(&[done, aborted, RegionReport::failed(2, "panicked")]);
        assert_eq!(
            totals,
            RunTotals {
                sub_regions: 3,
                failed_regions: 2,
                windows_processed: 7,
                windows_skipped: 2,
                windows_failed: 1,
                polygons_written: 7,
            }
        );
        assert_eq!(log_summary(&[]), RunTotals::default());
    }

    #[test]
    fn test_append_record_writes_header_once() {
        let path = temp_path("hexwater_test_header.csv");
        let _ = fs::remove_file(&path);

        append_record(&path, &RegionReport::new(0)).unwrap();
        append_record(&path, &RegionReport::failed(1, "worker panicked")).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines.iter().filter(|l| l.contains("sub_region")).count(), 1);
        assert!(lines[2].contains("failed"));

        fs::remove_file(&path).unwrap();
    }
}
