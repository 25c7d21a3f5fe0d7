//! Error kinds shared by every pipeline stage.

use thiserror::Error;

/// Pipeline errors.
///
/// The variant decides how far a failure propagates: connection failures end
/// the owning sub-region context, query and size failures end only the
/// current window, geometry and configuration failures stop the run before
/// any context starts.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Source, metadata store or sink unreachable.
    #[error("connection failure: {0}")]
    Connection(String),

    /// Malformed template substitution or a source-side query error.
    #[error("query failure: {0}")]
    Query(String),

    /// A window could not be brought under the fetch ceiling.
    #[error("result size exceeded: window {window} returned more than {limit} rows")]
    ResultSizeExceeded { window: String, limit: usize },

    /// An input geometry could not be converted into a region.
    #[error("unsupported geometry: {0}")]
    UnsupportedGeometry(String),

    /// A cell index rejected by the grid indexer.
    #[error("invalid cell index: {0:x}")]
    InvalidCell(u64),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A worker context ended without producing a report.
    #[error("worker failed: {0}")]
    Worker(String),
}

impl PipelineError {
    /// Returns `true` for failures worth retrying with backoff.
    pub fn is_connection(&self) -> bool {
        matches!(self, PipelineError::Connection(_))
    }

    /// Short, stable label used in logs and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Connection(_) => "connection",
            PipelineError::Query(_) => "query",
            PipelineError::ResultSizeExceeded { .. } => "result_size_exceeded",
            PipelineError::UnsupportedGeometry(_) => "unsupported_geometry",
            PipelineError::InvalidCell(_) => "invalid_cell",
            PipelineError::Config(_) => "config",
            PipelineError::Worker(_) => "worker",
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            PipelineError::Connection(e.to_string())
        } else {
            PipelineError::Query(e.to_string())
        }
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => PipelineError::Connection(e.to_string()),
            other => PipelineError::Query(other.to_string()),
        }
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
