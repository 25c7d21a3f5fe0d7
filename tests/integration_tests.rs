use std::sync::Arc;

use approx::assert_relative_eq;
use chrono::{DateTime, Duration, TimeZone, Utc};
use geo::BoundingRect;
use geo_types::{Coord, Rect, polygon};

use hexwater::gapfill::{GapFill, fill_gaps};
use hexwater::geometry::{CellId, Region, wkb};
use hexwater::grid::{GridIndexer, QuadGrid};
use hexwater::memory::{MemoryMetadata, MemorySink, MemorySource};
use hexwater::metadata::SceneFootprint;
use hexwater::partition::{PartitionOptions, SubRegion, partition_and_run};
use hexwater::pipeline::{Pipeline, PipelineSettings};
use hexwater::report::{RegionReport, RegionStatus};
use hexwater::score::cell_scores;
use hexwater::source::tableset::{DEFAULT_PREFETCH_TEMPLATE, QueryTemplate, TableSet};
use hexwater::source::{Observation, WaterCoverage};
use hexwater::walker::{WalkOptions, Window, WindowWalker};

const BASE_TABLE: &str = "water_03_base";

fn grid() -> QuadGrid {
    QuadGrid::new(Rect::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 1.0, y: 1.0 }))
}

fn square() -> Region {
    Region::new(polygon![(x: 0.0, y: 0.0), (x: 0.5, y: 0.0), (x: 0.5, y: 0.5), (x: 0.0, y: 0.5)]).unwrap()
}

fn strip() -> Region {
    Region::new(polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 0.5), (x: 0.0, y: 0.5)]).unwrap()
}

fn t1() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 6, 1, 10, 0, 0).unwrap()
}

fn t2() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2021, 6, 11, 10, 0, 0).unwrap()
}

fn obs(scene: &str, cell: CellId, at: DateTime<Utc>, coverage: WaterCoverage) -> Observation {
    Observation {
        scene_id: scene.to_string(),
        cell,
        recorded_at: at,
        coverage,
    }
}

/// A scene seeing the whole grid extent.
fn scene(id: &str, at: DateTime<Utc>) -> SceneFootprint {
    SceneFootprint {
        scene_id: id.to_string(),
        recorded_at: at,
        footprint: Region::new(polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 1.0)])
            .unwrap(),
    }
}

fn settings() -> PipelineSettings {
    let mut walk = WalkOptions::new(3, QueryTemplate::new(hexwater::source::tableset::DEFAULT_FETCH_TEMPLATE).unwrap());
    walk.window_resolution = Some(1);
    PipelineSettings {
        walk,
        threshold: 0.8,
        fail_fast: false,
    }
}

fn pipeline(
    source: Arc<MemorySource>,
    metadata: Arc<MemoryMetadata>,
    sink: Arc<MemorySink>,
    tableset: TableSet,
    settings: PipelineSettings,
) -> Pipeline {
    Pipeline::new(source, metadata, sink, Arc::new(grid()), tableset, settings)
}

#[tokio::test]
async fn test_single_strong_observation_is_written() {
    let g = grid();
    let cell = g.cell_at(3, 1, 0);
    let source = Arc::new(MemorySource::new().with_table(
        BASE_TABLE,
        vec![obs("s1", cell, t1(), WaterCoverage::new(0.9, 0.0, 0.0))],
    ));
    let metadata = Arc::new(MemoryMetadata::new(vec![scene("s1", t1())]));
    let sink = Arc::new(MemorySink::new());

    let p = pipeline(source, metadata, sink.clone(), TableSet::new("water").with_base(3), settings());
    let report = p.run_region(0, &square()).await;

    assert_eq!(report.status, RegionStatus::Completed);
    assert_eq!(report.windows_processed, 1);
    assert_eq!(report.cells_positive, 1);
    assert_eq!(report.polygons_written, 1);

    let rows = sink.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].window_id, Window::new(g.cell_at(1, 0, 0), 1).id());

    let bounds = wkb::decode(&rows[0].geometry).unwrap().bounding_rect().unwrap();
    let outline = g.cell_polygon(cell).unwrap().bounding_rect().unwrap();
    assert!(bounds.min().x >= outline.min().x - 1e-9 && bounds.max().x <= outline.max().x + 1e-9);
    assert!(bounds.min().y >= outline.min().y - 1e-9 && bounds.max().y <= outline.max().y + 1e-9);
}

#[tokio::test]
async fn test_window_without_footprint_writes_nothing() {
    let g = grid();
    let source = Arc::new(MemorySource::new().with_table(
        BASE_TABLE,
        vec![obs("s1", g.cell_at(3, 1, 0), t1(), WaterCoverage::new(0.9, 0.0, 0.0))],
    ));
    let metadata = Arc::new(MemoryMetadata::new(Vec::new()));
    let sink = Arc::new(MemorySink::new());

    let p = pipeline(source, metadata.clone(), sink.clone(), TableSet::new("water").with_base(3), settings());
    let report = p.run_region(0, &square()).await;

    assert_eq!(report.skipped_empty_completeness, 1);
    assert_eq!(report.windows_processed, 0);
    assert_eq!(metadata.request_count(), 1);
    assert_eq!(sink.write_count(), 0);
    assert!(sink.rows().is_empty());
}

#[tokio::test]
async fn test_missing_scene_counts_as_zero() {
    let g = grid();
    let weak = g.cell_at(3, 2, 0);
    let other = g.cell_at(3, 2, 1);
    let observations = vec![
        obs("s1", weak, t1(), WaterCoverage::new(0.0, 0.5, 0.0)),
        obs("s2", other, t2(), WaterCoverage::new(0.9, 0.0, 0.0)),
    ];
    let metadata = MemoryMetadata::new(vec![scene("s1", t1()), scene("s2", t2())]);

    let GapFill::Rows(rows) = fill_gaps(observations.clone(), &g, &metadata).await.unwrap() else {
        panic!("expected joined rows");
    };
    assert_eq!(rows.len(), 4);
    let scores = cell_scores(&rows);
    assert_relative_eq!(scores[&weak], 0.2125, epsilon = 1e-12);
    assert_relative_eq!(scores[&other], 0.675, epsilon = 1e-12);

    let source = Arc::new(MemorySource::new().with_table(BASE_TABLE, observations));
    let sink = Arc::new(MemorySink::new());
    let p = pipeline(
        source,
        Arc::new(metadata),
        sink.clone(),
        TableSet::new("water").with_base(3),
        settings(),
    );
    let report = p.run_region(0, &square()).await;

    assert_eq!(report.windows_processed, 1);
    assert_eq!(report.cells_positive, 0);
    assert!(sink.rows().is_empty());
}

fn crowded_rows(g: &QuadGrid, total: usize) -> (Vec<CellId>, Vec<Observation>) {
    let cells = g.children(g.cell_at(1, 0, 0), 3).unwrap();
    let rows = (0..total)
        .map(|k| {
            obs(
                &format!("s{k}"),
                cells[k % cells.len()],
                t1() + Duration::minutes(k as i64),
                WaterCoverage::new(0.5, 0.0, 0.0),
            )
        })
        .collect();
    (cells, rows)
}

#[tokio::test]
async fn test_oversized_window_splits_until_it_fits() {
    let g = grid();
    let (cells, rows) = crowded_rows(&g, 500);
    let source = MemorySource::new().with_table(BASE_TABLE, rows);
    let tableset = TableSet::new("water").with_base(3);
    let region = square();

    let mut options = settings().walk;
    options.fetch_max_rows = 100;
    let mut walker = WindowWalker::new(&source, &g, &region, &tableset, options.clone()).unwrap();

    let mut queried = Vec::new();
    let mut fetched = 0;
    while let Some(result) = walker.next().await {
        let rs = result.unwrap();
        assert!(rs.len() <= 100);
        assert!(!rs.is_truncated());
        fetched += rs.len();
        queried.extend_from_slice(rs.queried_cells());
    }
    queried.sort_unstable();
    assert_eq!(queried, cells);
    assert_eq!(fetched, 500);
    // one split at resolution 1, four at resolution 2
    assert_eq!(walker.splits(), 5);

    let mut s = settings();
    s.walk = options;
    let (_, rows) = crowded_rows(&g, 500);
    let p = pipeline(
        Arc::new(MemorySource::new().with_table(BASE_TABLE, rows)),
        Arc::new(MemoryMetadata::new(Vec::new())),
        Arc::new(MemorySink::new()),
        tableset,
        s,
    );
    let report = p.run_region(0, &region).await;
    assert_eq!(report.windows_split, 5);
    assert_eq!(report.skipped_empty_completeness, 16);
    assert_eq!(report.windows_failed, 0);
}

#[tokio::test]
async fn test_prefetch_skips_empty_windows() {
    let g = grid();
    let busy = g.cell_at(3, 1, 0);
    let source = Arc::new(
        MemorySource::new()
            .with_table("water_01_base", vec![obs("s1", g.cell_at(1, 0, 0), t1(), WaterCoverage::default())])
            .with_table(BASE_TABLE, vec![obs("s1", busy, t1(), WaterCoverage::new(0.9, 0.0, 0.0))]),
    );
    let metadata = Arc::new(MemoryMetadata::new(vec![scene("s1", t1())]));
    let sink = Arc::new(MemorySink::new());

    let mut s = settings();
    s.walk.prefetch_template = Some(QueryTemplate::new(DEFAULT_PREFETCH_TEMPLATE).unwrap());
    let tableset = TableSet::new("water").with_base(1).with_base(3);
    let p = pipeline(source.clone(), metadata, sink.clone(), tableset, s);
    let report = p.run_region(0, &strip()).await;

    assert_eq!(report.skipped_prefetch_empty, 1);
    assert_eq!(report.windows_processed, 1);
    assert_eq!(source.prefetch_count(), 2);
    assert_eq!(source.fetch_count(), 1);
    assert_eq!(sink.rows().len(), 1);
}

fn two_positive_windows() -> (Arc<MemorySource>, Arc<MemoryMetadata>, Window, Window) {
    let g = grid();
    let source = Arc::new(MemorySource::new().with_table(
        BASE_TABLE,
        vec![
            obs("s1", g.cell_at(3, 1, 0), t1(), WaterCoverage::new(0.9, 0.0, 0.0)),
            obs("s1", g.cell_at(3, 5, 1), t1(), WaterCoverage::new(1.0, 0.0, 0.0)),
        ],
    ));
    let metadata = Arc::new(MemoryMetadata::new(vec![scene("s1", t1())]));
    (
        source,
        metadata,
        Window::new(g.cell_at(1, 0, 0), 1),
        Window::new(g.cell_at(1, 1, 0), 1),
    )
}

#[tokio::test]
async fn test_failed_write_leaves_no_rows_for_that_window() {
    let (source, metadata, first, second) = two_positive_windows();
    let sink = Arc::new(MemorySink::new().failing_on(&first.id()));

    let p = pipeline(source, metadata, sink.clone(), TableSet::new("water").with_base(3), settings());
    let report = p.run_region(0, &strip()).await;

    assert_eq!(report.status, RegionStatus::Completed);
    assert_eq!(report.windows_failed, 1);
    assert_eq!(report.windows_processed, 1);
    assert_eq!(sink.write_count(), 2);

    let rows = sink.rows();
    assert_eq!(rows.len(), 1);
    assert!(rows.iter().all(|r| r.window_id == second.id()));
}

#[tokio::test]
async fn test_fail_fast_stops_at_first_failed_window() {
    let (source, metadata, first, _) = two_positive_windows();
    let sink = Arc::new(MemorySink::new().failing_on(&first.id()));

    let mut s = settings();
    s.fail_fast = true;
    let p = pipeline(source, metadata, sink.clone(), TableSet::new("water").with_base(3), s);
    let report = p.run_region(0, &strip()).await;

    assert_eq!(report.status, RegionStatus::Aborted);
    assert!(report.is_failed());
    assert_eq!(report.windows_failed, 1);
    assert_eq!(sink.write_count(), 1);
    assert!(sink.rows().is_empty());
}

#[tokio::test]
async fn test_workers_cover_the_whole_region() {
    let (source, metadata, first, second) = two_positive_windows();
    let sink = Arc::new(MemorySink::new());

    let options = PartitionOptions {
        worker_count: 2,
        fail_fast: false,
    };
    let callback = {
        let sink = sink.clone();
        move |sub: SubRegion| {
            let p = pipeline(
                source.clone(),
                metadata.clone(),
                sink.clone(),
                TableSet::new("water").with_base(3),
                settings(),
            );
            async move { Ok::<RegionReport, hexwater::error::PipelineError>(p.run_region(sub.index, &sub.region).await) }
        }
    };
    let outcomes = partition_and_run(options, &strip(), callback).await.unwrap();

    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| !o.report.is_failed()));
    assert_eq!(outcomes.iter().map(|o| o.report.polygons_written).sum::<usize>(), 2);

    let mut ids: Vec<_> = sink.rows().into_iter().map(|r| r.window_id).collect();
    ids.sort();
    let mut expected = vec![first.id(), second.id()];
    expected.sort();
    assert_eq!(ids, expected);
}
