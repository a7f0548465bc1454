//! Coverage archiver.
//!
//! Downloads a WCS time series slice by slice and publishes:
//! - One tagged Cloud-Optimized GeoTIFF per slice
//! - A STAC-style collection document describing them
//!
//! Re-running over a partially archived series only processes the slices
//! whose COG is missing or invalid.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use cog_archive::inspect::RasterInfo;
use cog_archive::{
    parse_slices, ArchiveConfig, GdalCogValidator, ProcessRunner, RasterInspector, RunOrchestrator,
    RunSummary, SliceOutcome, TagSet, TimeSlice,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "archiver")]
#[command(about = "Archive a WCS time series as Cloud-Optimized GeoTIFFs with a STAC catalog")]
struct Cli {
    /// Log level (overridden by RUST_LOG)
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit JSON log lines
    #[arg(long, global = true, env = "JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch, build and publish the requested slices, then write the catalog
    Run(RunArgs),
    /// Check whether a file is a valid COG and dump its metadata
    Validate(ValidateArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// YAML configuration (defaults apply when omitted)
    #[arg(short, long, env = "ARCHIVE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for final COGs and the catalog
    #[arg(long, env = "ARCHIVE_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Root directory for staging files
    #[arg(long, env = "ARCHIVE_SCRATCH_DIR")]
    scratch_dir: Option<PathBuf>,

    /// First slice of the range
    #[arg(long, default_value = "1993", conflicts_with = "years")]
    from: i32,

    /// Last slice of the range (inclusive)
    #[arg(long, default_value = "2022", conflicts_with = "years")]
    to: i32,

    /// Explicit slices, e.g. "1993,2000-2005"
    #[arg(long)]
    years: Option<String>,

    /// Slices processed at the same time
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Serve Prometheus metrics on this port
    #[arg(long, env = "METRICS_PORT")]
    metrics_port: Option<u16>,
}

#[derive(Args, Debug)]
struct ValidateArgs {
    /// Raster to check
    path: PathBuf,

    /// YAML configuration (tool paths, bands and tags)
    #[arg(short, long, env = "ARCHIVE_CONFIG")]
    config: Option<PathBuf>,

    /// Also require the tags written for this slice
    #[arg(long)]
    year: Option<i32>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load environment from .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs)?;

    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Validate(args) => validate(args).await,
    }
}

fn init_tracing(log_level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let builder = fmt().with_env_filter(filter).with_target(true).with_level(true);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))
}

fn load_config(path: Option<&Path>) -> Result<ArchiveConfig> {
    match path {
        Some(path) => ArchiveConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(ArchiveConfig::default()),
    }
}

/// Apply command-line overrides and re-validate.
fn apply_overrides(config: &mut ArchiveConfig, args: &RunArgs) -> Result<()> {
    if let Some(dir) = &args.output_dir {
        config.output.dir = dir.clone();
    }
    if let Some(dir) = &args.scratch_dir {
        config.output.scratch_dir = dir.clone();
    }
    if let Some(n) = args.max_concurrent {
        config.processing.max_concurrent_slices = n;
    }
    config.validate().context("Invalid configuration")?;
    Ok(())
}

fn requested_slices(args: &RunArgs) -> Result<Vec<TimeSlice>> {
    let slices = match &args.years {
        Some(spec) => parse_slices(spec)?,
        None => TimeSlice::range(args.from, args.to)?,
    };
    if slices.is_empty() {
        bail!("No time slices requested");
    }
    Ok(slices)
}

async fn run(args: RunArgs) -> Result<ExitCode> {
    let mut config = load_config(args.config.as_deref())?;
    apply_overrides(&mut config, &args)?;
    let slices = requested_slices(&args)?;

    if let Some(port) = args.metrics_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!(port = port, "Prometheus metrics exporter listening");
    }

    let cancel = CancellationToken::new();
    let orchestrator = RunOrchestrator::from_config(config)?.with_cancellation(cancel.clone());

    // Ctrl+C stops new slices; running ones finish and clean up.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received shutdown signal, finishing in-flight slices");
            cancel.cancel();
        }
    });

    info!(
        run_id = %orchestrator.run_id(),
        first = %slices[0],
        last = %slices[slices.len() - 1],
        count = slices.len(),
        "Starting coverage archiver"
    );

    let summary = orchestrator.run(slices).await?;
    print_summary(&summary);

    Ok(if summary.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_summary(summary: &RunSummary) {
    println!("run {}", summary.run_id);
    for (slice, outcome) in &summary.outcomes {
        match outcome {
            SliceOutcome::Failed(failure) => println!("  {}  failed    {}", slice, failure),
            other => {
                let path = other
                    .artifact()
                    .map(|a| a.path.display().to_string())
                    .unwrap_or_default();
                println!("  {}  {:<16}  {}", slice, other.label(), path);
            }
        }
    }
    for slice in &summary.cancelled {
        println!("  {}  cancelled", slice);
    }
    println!("catalog {}", summary.catalog_path.display());
}

async fn validate(args: ValidateArgs) -> Result<ExitCode> {
    let config = load_config(args.config.as_deref())?;
    let tags = match args.year {
        Some(year) => Some(TagSet::for_slice(TimeSlice::new(year)?, &config.bands, &config.tags)),
        None => None,
    };

    let runner = Arc::new(ProcessRunner::new(1));
    let inspector = RasterInspector::new(runner, config.tools.gdalinfo.clone());
    let validator = GdalCogValidator::new(inspector).with_expected_bands(config.bands.len());

    let (validation, info) = validator
        .examine(&args.path, tags.as_ref())
        .await
        .with_context(|| format!("Failed to run validator on {}", args.path.display()))?;

    if validation.is_valid() {
        println!("{}: valid COG", args.path.display());
    } else {
        println!("{}: NOT a valid COG", args.path.display());
        for problem in &validation.problems {
            println!("  - {}", problem);
        }
    }

    match info {
        Some(info) => print_metadata(&info),
        None => warn!(path = %args.path.display(), "Metadata dump unavailable"),
    }

    Ok(if validation.is_valid() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_metadata(info: &RasterInfo) {
    println!("driver: {}", info.driver_short_name);
    if let [width, height] = info.size[..] {
        println!("size: {} x {}", width, height);
    }
    let crs = info.coordinate_system.as_ref().and_then(|c| c.name());
    println!("crs: {}", crs.unwrap_or("-"));
    if let Some([min_x, min_y, max_x, max_y]) = info.bounds() {
        println!("bounds: {} {} {} {}", min_x, min_y, max_x, max_y);
    }
    if let [origin_x, pixel_w, row_rot, origin_y, col_rot, pixel_h] = info.geo_transform[..] {
        println!(
            "transform: origin ({}, {}), pixel {} x {}, rotation ({}, {})",
            origin_x, origin_y, pixel_w, pixel_h, row_rot, col_rot
        );
    }
    println!("layout: {}", info.layout().unwrap_or("-"));
    println!("compression: {}", info.compression().unwrap_or("-"));

    if let Some(items) = info.metadata.get("").and_then(|d| d.as_object()) {
        println!("dataset tags:");
        for (key, value) in items {
            println!("  {} = {}", key, value.as_str().unwrap_or_default());
        }
    }

    println!("bands: {}", info.band_count());
    for band in &info.bands {
        println!(
            "  band {}: {} ({}), {}, block {:?}, {} overviews",
            band.band,
            band.metadata_item("", "NAME").unwrap_or("-"),
            band.metadata_item("", "DESCRIPTION").unwrap_or("-"),
            band.data_type.as_deref().unwrap_or("-"),
            band.block,
            band.overview_count()
        );
    }
}
