//! CLI entry point for hexwater.
//!
//! Provides subcommands for running a water-coverage job, preparing the
//! output table, listing the tablesets of the observation store and
//! previewing how a job would be partitioned.

use anyhow::Result;
use clap::{Parser, Subcommand};
use hexwater::{
    config::{ConnectionSettings, JobConfig},
    error::PipelineError,
    fetch::{BasicClient, auth::HeaderAuth},
    grid::{GridIndexer, H3Grid},
    metadata::PostgresMetadata,
    partition::{SubRegion, partition_and_run, split_region},
    pipeline::Pipeline,
    report::{append_record, log_summary},
    retry::{RetryPolicy, Retrying},
    sink::{PolygonSink, PostgresSink},
    source::{ClickhouseSource, TimeSeriesSource, tableset::find_tablesets},
    walker::choose_window_resolution,
};
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

type Source = Retrying<ClickhouseSource<HeaderAuth<BasicClient>>>;

#[derive(Parser)]
#[command(name = "hexwater")]
#[command(about = "Derives water polygons from per-cell water observations", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a job: walk, gap-fill, score and write polygons
    Run {
        /// Job file (JSON)
        #[arg(short, long)]
        job: String,

        /// Override the number of workers from the job file
        #[arg(short, long)]
        workers: Option<usize>,

        /// CSV file to append per-sub-region reports to
        #[arg(short, long)]
        report: Option<String>,
    },
    /// Create the output table and its spatial index
    Bootstrap {
        /// Job file (JSON), for the output table name
        #[arg(short, long)]
        job: String,
    },
    /// List the tablesets found in the observation store
    ListTablesets,
    /// Show how a job would be partitioned, without fetching anything
    Plan {
        /// Job file (JSON)
        #[arg(short, long)]
        job: String,

        #[arg(short, long)]
        workers: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/hexwater.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("hexwater.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            job,
            workers,
            report,
        } => {
            let mut job = JobConfig::load(&job)?;
            if let Some(w) = workers {
                job.workers = w;
                job.validate()?;
            }
            let failed = run(job, report.as_deref()).await?;
            if failed > 0 {
                anyhow::bail!("{} sub-region(s) did not complete", failed);
            }
        }
        Commands::Bootstrap { job } => {
            let job = JobConfig::load(&job)?;
            let conn = ConnectionSettings::from_env()?;
            let sink = Retrying::connect(job.retry, "connect_sink", || {
                PostgresSink::connect(&conn.output_database_url, &job.output_table)
            })
            .await?;
            sink.bootstrap().await?;
            info!(table = %job.output_table, "Output table ready");
        }
        Commands::ListTablesets => {
            let conn = ConnectionSettings::from_env()?;
            let source = clickhouse_source(
                &conn,
                Duration::from_secs(60),
                Duration::from_secs(10),
                RetryPolicy::default(),
            )?;
            let names = source.list_tables().await?;
            let tablesets = find_tablesets(&names[..]);
            info!(tables = names.len(), tablesets = tablesets.len(), "Tables listed");
            for (name, set) in &tablesets {
                info!(
                    tableset = %name,
                    base = ?set.base_resolutions(),
                    compacted = ?set.compacted_resolutions(),
                    "Tableset"
                );
            }
        }
        Commands::Plan { job, workers } => {
            let mut job = JobConfig::load(&job)?;
            if let Some(w) = workers {
                job.workers = w;
                job.validate()?;
            }
            plan(&job)?;
        }
    }

    Ok(())
}

fn clickhouse_source(
    conn: &ConnectionSettings,
    timeout: Duration,
    connect_timeout: Duration,
    retry: RetryPolicy,
) -> hexwater::error::Result<Source> {
    let http = BasicClient::new(timeout, connect_timeout)?;
    let http = HeaderAuth::clickhouse(
        http,
        conn.clickhouse_user.as_deref().unwrap_or("default"),
        conn.clickhouse_password.as_deref().unwrap_or(""),
    )?;
    let mut source = ClickhouseSource::new(http, &conn.clickhouse_url);
    if let Some(db) = &conn.clickhouse_database {
        source = source.with_database(db.clone());
    }
    Ok(Retrying::new(source, retry))
}

/// Runs a job and returns the number of sub-regions that did not complete.
#[tracing::instrument(skip_all, fields(tableset = %job.tableset, workers = job.workers))]
async fn run(job: JobConfig, report_path: Option<&str>) -> Result<usize> {
    let conn = Arc::new(ConnectionSettings::from_env()?);
    let region = job.region()?;
    let settings = job.pipeline_settings()?;

    let names = clickhouse_source(&conn, job.http_timeout(), job.connect_timeout(), job.retry)?
        .list_tables()
        .await?;
    let Some(tableset) = find_tablesets(&names[..]).remove(&job.tableset) else {
        anyhow::bail!("tableset {} not found in the observation store", job.tableset);
    };
    info!(
        base = ?tableset.base_resolutions(),
        compacted = ?tableset.compacted_resolutions(),
        "Tableset found"
    );

    let sink = Retrying::connect(job.retry, "connect_sink", || {
        PostgresSink::connect(&conn.output_database_url, &job.output_table)
    })
    .await?;
    sink.bootstrap().await?;

    let job = Arc::new(job);
    let callback = {
        let job = job.clone();
        move |sub: SubRegion| {
            let job = job.clone();
            let conn = conn.clone();
            let tableset = tableset.clone();
            let settings = settings.clone();
            async move {
                // Every context owns its own connections.
                let source =
                    clickhouse_source(&conn, job.http_timeout(), job.connect_timeout(), job.retry)?;
                let metadata = Retrying::connect(job.retry, "connect_metadata", || {
                    PostgresMetadata::connect(&conn.metadata_database_url, job.footprint_query())
                })
                .await?;
                let sink = Retrying::connect(job.retry, "connect_sink", || {
                    PostgresSink::connect(&conn.output_database_url, &job.output_table)
                })
                .await?;
                let grid = H3Grid::new().with_smoothing(job.smoothing_iterations);

                let pipeline = Pipeline::new(
                    Arc::new(source),
                    Arc::new(metadata),
                    Arc::new(sink),
                    Arc::new(grid),
                    tableset,
                    settings,
                );
                Ok::<_, PipelineError>(pipeline.run_region(sub.index, &sub.region).await)
            }
        }
    };

    let outcomes = partition_and_run(job.partition_options(), &region, callback).await?;
    let reports: Vec<_> = outcomes.into_iter().map(|o| o.report).collect();
    let totals = log_summary(&reports);

    if let Some(path) = report_path {
        for report in &reports {
            if let Err(e) = append_record(path, report) {
                error!(path, error = %e, "Failed to write report record");
            }
        }
    }

    Ok(totals.failed_regions)
}

/// Logs the sub-regions and window counts a job would produce.
fn plan(job: &JobConfig) -> Result<()> {
    let region = job.region()?;
    let grid = H3Grid::new().with_smoothing(job.smoothing_iterations);
    let options = job.walk_options()?;
    let window_resolution = choose_window_resolution(&grid, &options)?;

    let pieces = if job.workers > 1 {
        split_region(&region, job.workers)?
    } else {
        vec![region]
    };

    let mut total = 0;
    for (index, piece) in pieces.iter().enumerate() {
        let windows = grid.cells_covering(piece, window_resolution)?.len();
        total += windows;
        info!(sub_region = index, area = piece.area(), windows, "Planned sub-region");
    }
    if total == 0 {
        warn!("The area of interest covers no windows");
    }
    info!(
        sub_regions = pieces.len(),
        windows = total,
        window_resolution,
        target_resolution = options.target_resolution,
        "Plan summary"
    );
    Ok(())
}
