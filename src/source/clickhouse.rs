use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use super::{Observation, SelectQuery, TimeSeriesSource, WaterCoverage};
use crate::error::{PipelineError, Result};
use crate::fetch::{HttpClient, post_text};
use crate::geometry::CellId;

/// Output settings appended to every request: ISO timestamps and unquoted
/// 64-bit integers, so rows deserialize straight into [`CoverageRow`].
const FORMAT_PARAMS: &str =
    "date_time_output_format=iso&output_format_json_quote_64bit_integers=0";

#[derive(Debug, Deserialize)]
struct CoverageRow {
    h3index: u64,
    scene_id: String,
    recorded_at: DateTime<Utc>,
    #[serde(default)]
    area_percent_water_class_090_100: Option<f64>,
    #[serde(default)]
    area_percent_water_class_080_090: Option<f64>,
    #[serde(default)]
    area_percent_water_class_070_080: Option<f64>,
}

impl From<CoverageRow> for Observation {
    fn from(row: CoverageRow) -> Self {
        Observation {
            scene_id: row.scene_id,
            cell: CellId(row.h3index),
            recorded_at: row.recorded_at,
            coverage: WaterCoverage::new(
                row.area_percent_water_class_090_100.unwrap_or(0.0),
                row.area_percent_water_class_080_090.unwrap_or(0.0),
                row.area_percent_water_class_070_080.unwrap_or(0.0),
            ),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TableRow {
    name: String,
}

/// [`TimeSeriesSource`] speaking the ClickHouse HTTP interface.
pub struct ClickhouseSource<C> {
    client: C,
    url: String,
    database: Option<String>,
}

impl<C: HttpClient> ClickhouseSource<C> {
    pub fn new(client: C, base_url: &str) -> Self {
        Self {
            client,
            url: format!("{}/?{FORMAT_PARAMS}", base_url.trim_end_matches('/')),
            database: None,
        }
    }

    /// Restricts table discovery to one database.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    async fn query_rows<T: for<'de> Deserialize<'de>>(&self, sql: String) -> Result<Vec<T>> {
        let body = post_text(&self.client, &self.url, sql).await?;
        parse_json_each_row(&body)
    }
}

fn parse_json_each_row<T: for<'de> Deserialize<'de>>(body: &str) -> Result<Vec<T>> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line)
                .map_err(|e| PipelineError::Query(format!("malformed row {line:?}: {e}")))
        })
        .collect()
}

/// Orders on the full row key before limiting, matching
/// [`Observation::fetch_order`].
fn fetch_sql(query: &SelectQuery, limit: usize) -> String {
    format!(
        "select * from ({}) order by h3index, recorded_at, scene_id limit {limit} format JSONEachRow",
        query.sql()
    )
}

#[async_trait]
impl<C: HttpClient> TimeSeriesSource for ClickhouseSource<C> {
    async fn fetch(&self, query: &SelectQuery, limit: usize) -> Result<Vec<Observation>> {
        let rows: Vec<CoverageRow> = self.query_rows(fetch_sql(query, limit)).await?;
        debug!(rows = rows.len(), parts = query.parts().len(), "Fetched observations");
        Ok(rows.into_iter().map(Observation::from).collect())
    }

    async fn has_rows(&self, query: &SelectQuery) -> Result<bool> {
        let sql = format!(
            "select 1 as found from ({}) limit 1 format JSONEachRow",
            query.sql()
        );
        let body = post_text(&self.client, &self.url, sql).await?;
        Ok(body.lines().any(|line| !line.trim().is_empty()))
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let filter = match &self.database {
            Some(db) => format!("database = '{}'", db.replace('\'', "''")),
            None => "database = currentDatabase()".to_string(),
        };
        let sql = format!("select name from system.tables where {filter} format JSONEachRow");
        let rows: Vec<TableRow> = self.query_rows(sql).await?;
        Ok(rows.into_iter().map(|r| r.name).collect())
    }
}
