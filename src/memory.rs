//! In-memory sources and sink.
//!
//! Used by the tests. They honour the same contracts
//! as the database adapters and count the calls they receive.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::error::{PipelineError, Result};
use crate::metadata::{CompletenessRequest, CompletenessRow, MetadataSource, SceneFootprint, footprint_completeness};
use crate::sink::{OutputRow, PolygonSink};
use crate::source::{Observation, SelectQuery, TimeSeriesSource};

/// Tables of observations keyed by table name.
#[derive(Debug, Default)]
pub struct MemorySource {
    tables: BTreeMap<String, Vec<Observation>>,
    fetches: AtomicUsize,
    prefetches: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, name: &str, rows: Vec<Observation>) -> Self {
        self.tables.insert(name.to_string(), rows);
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn prefetch_count(&self) -> usize {
        self.prefetches.load(Ordering::SeqCst)
    }

    fn matching(&self, query: &SelectQuery) -> Result<Vec<&Observation>> {
        let mut selected = Vec::new();
        for part in query.parts() {
            let rows = self
                .tables
                .get(&part.table)
                .ok_or_else(|| PipelineError::Query(format!("table {} does not exist", part.table)))?;
            let cells: HashSet<_> = part.cells.iter().copied().collect();
            selected.extend(rows.iter().filter(|o| cells.contains(&o.cell)));
        }
        Ok(selected)
    }
}

#[async_trait]
impl TimeSeriesSource for MemorySource {
    async fn fetch(&self, query: &SelectQuery, limit: usize) -> Result<Vec<Observation>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let mut rows = self.matching(query)?;
        rows.sort_by(|a, b| a.fetch_order().cmp(&b.fetch_order()));
        Ok(rows.into_iter().take(limit).cloned().collect())
    }

    async fn has_rows(&self, query: &SelectQuery) -> Result<bool> {
        self.prefetches.fetch_add(1, Ordering::SeqCst);
        Ok(!self.matching(query)?.is_empty())
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        Ok(self.tables.keys().cloned().collect())
    }
}

/// Scene footprints held in memory.
#[derive(Debug, Default)]
pub struct MemoryMetadata {
    scenes: Vec<SceneFootprint>,
    requests: AtomicUsize,
}

impl MemoryMetadata {
    pub fn new(scenes: Vec<SceneFootprint>) -> Self {
        Self {
            scenes,
            requests: AtomicUsize::new(0),
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataSource for MemoryMetadata {
    async fn completeness(&self, req: &CompletenessRequest) -> Result<Vec<CompletenessRow>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        Ok(footprint_completeness(&self.scenes, req))
    }
}

/// Collects written rows. Windows listed in `failing` fail their write
/// without storing anything, like a rolled back transaction.
#[derive(Debug, Default)]
pub struct MemorySink {
    rows: Mutex<Vec<OutputRow>>,
    failing: HashSet<String>,
    writes: AtomicUsize,
    bootstraps: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(mut self, window_id: &str) -> Self {
        self.failing.insert(window_id.to_string());
        self
    }

    pub fn rows(&self) -> Vec<OutputRow> {
        self.rows.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn bootstrap_count(&self) -> usize {
        self.bootstraps.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PolygonSink for MemorySink {
    async fn bootstrap(&self) -> Result<()> {
        self.bootstraps.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn write_window(&self, window_id: &str, rows: Vec<OutputRow>) -> Result<usize> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(window_id) {
            return Err(PipelineError::Query(format!("write of window {window_id} rolled back")));
        }
        let n = rows.len();
        self.rows
            .lock()
            .map_err(|_| PipelineError::Worker("sink mutex poisoned".into()))?
            .extend(rows);
        Ok(n)
    }
}
