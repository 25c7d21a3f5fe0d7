use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;

use super::{OutputRow, PolygonSink};
use crate::error::{PipelineError, Result};
use crate::source::tableset::is_identifier;

/// [`PolygonSink`] writing into a PostGIS table.
pub struct PostgresSink {
    pool: PgPool,
    table: String,
}

impl PostgresSink {
    pub fn new(pool: PgPool, table: &str) -> Result<Self> {
        if !is_identifier(table) {
            return Err(PipelineError::Config(format!(
                "invalid output table name {table:?}"
            )));
        }
        Ok(Self {
            pool,
            table: table.to_string(),
        })
    }

    pub async fn connect(url: &str, table: &str) -> Result<Self> {
        let pool = PgPool::connect(url).await?;
        Self::new(pool, table)
    }
}

#[async_trait]
impl PolygonSink for PostgresSink {
    async fn bootstrap(&self) -> Result<()> {
        let table = &self.table;
        sqlx::query(&format!(
            "create table if not exists {table} (\
             id serial primary key, \
             window_id text not null, \
             geom geometry(Polygon, 4326))"
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "create index if not exists {table}_geom_idx on {table} using gist(geom)"
        ))
        .execute(&self.pool)
        .await?;
        debug!(table, "Output schema ready");
        Ok(())
    }

    async fn write_window(&self, window_id: &str, rows: Vec<OutputRow>) -> Result<usize> {
        let insert = format!(
            "insert into {} (window_id, geom) values ($1, st_geomfromwkb($2, 4326))",
            self.table
        );

        let mut tx = self.pool.begin().await?;
        for row in &rows {
            sqlx::query(&insert)
                .bind(window_id)
                .bind(&row.geometry)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_unsafe_table_names() {
        let pool = PgPool::connect_lazy("postgres://localhost/unused").unwrap();
        assert!(PostgresSink::new(pool.clone(), "water_results").is_ok());
        assert!(matches!(
            PostgresSink::new(pool, "results; drop table scene"),
            Err(PipelineError::Config(_))
        ));
    }
}
