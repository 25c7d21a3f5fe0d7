//! Columnar time-series source.
//!
//! [`TimeSeriesSource`] is the seam to the observation store. Queries are
//! rendered from templates by [`tableset`] and executed by an adapter such as
//! [`ClickhouseSource`].

mod clickhouse;
pub mod tableset;

pub use clickhouse::ClickhouseSource;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::geometry::CellId;

/// Fractions of a cell's area in the three water-certainty classes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WaterCoverage {
    pub class_90_100: f64,
    pub class_80_90: f64,
    pub class_70_80: f64,
}

impl WaterCoverage {
    pub fn new(class_90_100: f64, class_80_90: f64, class_70_80: f64) -> Self {
        Self {
            class_90_100,
            class_80_90,
            class_70_80,
        }
    }
}

/// One cell's water coverage as recorded by one scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub scene_id: String,
    pub cell: CellId,
    pub recorded_at: DateTime<Utc>,
    pub coverage: WaterCoverage,
}

impl Observation {
    /// Key of the order in which sources return rows.
    pub fn fetch_order(&self) -> (CellId, DateTime<Utc>, &str) {
        (self.cell, self.recorded_at, &self.scene_id)
    }
}

/// One `select` against a single table.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPart {
    pub table: String,
    pub resolution: u8,
    pub cells: Vec<CellId>,
    pub sql: String,
}

/// A rendered query: one part per table, combined with `union all`.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    parts: Vec<QueryPart>,
}

impl SelectQuery {
    pub fn new(parts: Vec<QueryPart>) -> Self {
        Self { parts }
    }

    pub fn parts(&self) -> &[QueryPart] {
        &self.parts
    }

    pub fn sql(&self) -> String {
        self.parts
            .iter()
            .map(|p| p.sql.as_str())
            .collect::<Vec<_>>()
            .join(" union all ")
    }
}

/// Abstraction over the observation store.
#[async_trait]
pub trait TimeSeriesSource: Send + Sync {
    /// Returns at most `limit` observations for `query`, ordered by
    /// [`Observation::fetch_order`] before the limit applies, so a capped
    /// fetch always keeps the same rows.
    async fn fetch(&self, query: &SelectQuery, limit: usize) -> Result<Vec<Observation>>;

    /// Returns `true` when `query` yields at least one row.
    async fn has_rows(&self, query: &SelectQuery) -> Result<bool>;

    /// Lists table names, used to discover tablesets.
    async fn list_tables(&self) -> Result<Vec<String>>;
}
