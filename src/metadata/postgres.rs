use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::debug;

use super::{CompletenessRequest, CompletenessRow, MetadataSource};
use crate::error::Result;
use crate::geometry::CellId;

/// Scenes intersecting the hull (`$1`, WKB) recorded at one of the
/// timestamps (`$2`). Must yield `scene_id`, `recorded_at` and `wkb_geom`.
pub const DEFAULT_FOOTPRINT_QUERY: &str = "select s.id::text as scene_id, s.recorded_at, \
     st_asbinary(st_force2d(s.footprint)) as wkb_geom \
     from scene s \
     where st_intersects(s.footprint, st_geomfromwkb($1, 4326)) \
     and s.recorded_at = any($2)";

#[derive(Debug, sqlx::FromRow)]
struct CompletenessRecord {
    scene_id: String,
    cell: i64,
    recorded_at: DateTime<Utc>,
}

/// [`MetadataSource`] backed by a PostGIS scene table.
pub struct PostgresMetadata {
    pool: PgPool,
    sql: String,
}

impl PostgresMetadata {
    pub fn new(pool: PgPool, footprint_query: &str) -> Self {
        // cells travel as three parallel arrays: id, lon, lat
        let sql = format!(
            "with footprints as ({footprint_query}) \
             select f.scene_id, c.cell, f.recorded_at \
             from footprints f \
             join unnest($3::bigint[], $4::float8[], $5::float8[]) as c(cell, lon, lat) \
             on st_intersects(st_geomfromwkb(f.wkb_geom, 4326), st_setsrid(st_makepoint(c.lon, c.lat), 4326))"
        );
        Self { pool, sql }
    }

    pub async fn connect(url: &str, footprint_query: &str) -> Result<Self> {
        let pool = PgPool::connect(url).await?;
        Ok(Self::new(pool, footprint_query))
    }
}

#[async_trait]
impl MetadataSource for PostgresMetadata {
    async fn completeness(&self, req: &CompletenessRequest) -> Result<Vec<CompletenessRow>> {
        // u64 cell ids are stored bit-for-bit in bigint
        let ids: Vec<i64> = req.cells.iter().map(|c| c.cell.0 as i64).collect();
        let lons: Vec<f64> = req.cells.iter().map(|c| c.centre.x).collect();
        let lats: Vec<f64> = req.cells.iter().map(|c| c.centre.y).collect();

        let records: Vec<CompletenessRecord> = sqlx::query_as(&self.sql)
            .bind(req.hull.to_wkb())
            .bind(&req.timestamps)
            .bind(ids)
            .bind(lons)
            .bind(lats)
            .fetch_all(&self.pool)
            .await?;
        debug!(rows = records.len(), "Fetched completeness rows");

        Ok(records
            .into_iter()
            .map(|r| CompletenessRow {
                scene_id: r.scene_id,
                cell: CellId(r.cell as u64),
                recorded_at: r.recorded_at,
            })
            .collect())
    }
}
