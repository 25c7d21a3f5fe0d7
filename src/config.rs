//! Job and connection configuration.
//!
//! A job is a JSON file describing what to process; connection strings come
//! from the environment (optionally via `.env`).
//!
//! ```json
//! {
//!   "aoi": { "type": "Polygon", "coordinates": [[[11.08, 47.97], [11.28, 47.97], [11.28, 48.09], [11.08, 48.09], [11.08, 47.97]]] },
//!   "tableset": "water",
//!   "target_resolution": 13,
//!   "threshold": 0.8,
//!   "workers": 4
//! }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

use crate::error::PipelineError;
use crate::geometry::{GeometryInput, Region};
use crate::metadata::DEFAULT_FOOTPRINT_QUERY;
use crate::partition::PartitionOptions;
use crate::pipeline::PipelineSettings;
use crate::retry::RetryPolicy;
use crate::source::tableset::{DEFAULT_FETCH_TEMPLATE, QueryTemplate, is_identifier};
use crate::walker::{OversizePolicy, WalkOptions};

fn default_target_resolution() -> u8 {
    13
}

fn default_fetch_max_rows() -> usize {
    1_000_000
}

fn default_expected_rows_per_cell() -> usize {
    100
}

fn default_max_split_depth() -> u8 {
    4
}

fn default_threshold() -> f64 {
    0.8
}

fn default_output_table() -> String {
    "water_results".to_string()
}

fn default_smoothing() -> usize {
    1
}

fn default_workers() -> usize {
    1
}

fn default_http_timeout_secs() -> u64 {
    300
}

fn default_connect_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    /// Area of interest: a GeoJSON object, or GeoJSON/WKT text.
    pub aoi: serde_json::Value,
    pub tableset: String,
    #[serde(default = "default_target_resolution")]
    pub target_resolution: u8,
    #[serde(default = "default_fetch_max_rows")]
    pub fetch_max_rows: usize,
    #[serde(default = "default_expected_rows_per_cell")]
    pub expected_rows_per_cell: usize,
    #[serde(default)]
    pub window_resolution: Option<u8>,
    #[serde(default)]
    pub oversize_policy: OversizePolicy,
    #[serde(default = "default_max_split_depth")]
    pub max_split_depth: u8,
    #[serde(default)]
    pub fetch_template: Option<String>,
    #[serde(default)]
    pub prefetch_template: Option<String>,
    /// Values for `<[name]>` parameters in the templates.
    #[serde(default)]
    pub query_params: BTreeMap<String, String>,
    #[serde(default)]
    pub footprint_query: Option<String>,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_output_table")]
    pub output_table: String,
    #[serde(default = "default_smoothing")]
    pub smoothing_iterations: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl JobConfig {
    /// Loads and validates the job file at `path`.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read job file {}: {}", path, e))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: JobConfig = serde_json::from_str(content)
            .map_err(|e| anyhow::anyhow!("Failed to parse job file: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), PipelineError> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(PipelineError::Config(format!(
                "threshold {} is outside [0, 1]",
                self.threshold
            )));
        }
        if self.workers == 0 {
            return Err(PipelineError::Config("workers must be at least 1".into()));
        }
        if self.fetch_max_rows == 0 {
            return Err(PipelineError::Config("fetch_max_rows must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(PipelineError::Config("retry.max_attempts must be at least 1".into()));
        }
        for (what, name) in [("tableset", &self.tableset), ("output_table", &self.output_table)] {
            if !is_identifier(name) {
                return Err(PipelineError::Config(format!("invalid {what} name {name:?}")));
            }
        }
        self.walk_options()?;
        Ok(())
    }

    pub fn region(&self) -> std::result::Result<Region, PipelineError> {
        Region::from_input(GeometryInput::from_json(self.aoi.clone())?)
    }

    pub fn walk_options(&self) -> std::result::Result<WalkOptions, PipelineError> {
        let fetch = self.template(self.fetch_template.as_deref().unwrap_or(DEFAULT_FETCH_TEMPLATE))?;
        let prefetch = self
            .prefetch_template
            .as_deref()
            .map(|t| self.template(t))
            .transpose()?;

        let mut options = WalkOptions::new(self.target_resolution, fetch);
        options.fetch_max_rows = self.fetch_max_rows;
        options.expected_rows_per_cell = self.expected_rows_per_cell;
        options.window_resolution = self.window_resolution;
        options.oversize_policy = self.oversize_policy;
        options.max_split_depth = self.max_split_depth;
        options.prefetch_template = prefetch;
        Ok(options)
    }

    fn template(&self, text: &str) -> std::result::Result<QueryTemplate, PipelineError> {
        Ok(QueryTemplate::new(text)?.with_params(self.query_params.clone()))
    }

    pub fn pipeline_settings(&self) -> std::result::Result<PipelineSettings, PipelineError> {
        Ok(PipelineSettings {
            walk: self.walk_options()?,
            threshold: self.threshold,
            fail_fast: self.fail_fast,
        })
    }

    pub fn partition_options(&self) -> PartitionOptions {
        PartitionOptions {
            worker_count: self.workers,
            fail_fast: self.fail_fast,
        }
    }

    pub fn footprint_query(&self) -> &str {
        self.footprint_query.as_deref().unwrap_or(DEFAULT_FOOTPRINT_QUERY)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Endpoints and credentials, read from the environment.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub clickhouse_url: String,
    pub clickhouse_user: Option<String>,
    pub clickhouse_password: Option<String>,
    pub clickhouse_database: Option<String>,
    pub metadata_database_url: String,
    pub output_database_url: String,
}

impl ConnectionSettings {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            clickhouse_url: required("CLICKHOUSE_URL")?,
            clickhouse_user: std::env::var("CLICKHOUSE_USER").ok(),
            clickhouse_password: std::env::var("CLICKHOUSE_PASSWORD").ok(),
            clickhouse_database: std::env::var("CLICKHOUSE_DATABASE").ok(),
            metadata_database_url: required("METADATA_DATABASE_URL")?,
            output_database_url: required("OUTPUT_DATABASE_URL")?,
        })
    }
}

fn required(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| anyhow::anyhow!("{} must be set", name))
}
