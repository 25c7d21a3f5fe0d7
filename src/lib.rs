pub mod config;
pub mod error;
pub mod fetch;
pub mod gapfill;
pub mod geometry;
pub mod grid;
pub mod memory;
pub mod metadata;
pub mod partition;
pub mod pipeline;
pub mod report;
pub mod retry;
pub mod score;
pub mod sink;
pub mod source;
pub mod walker;
