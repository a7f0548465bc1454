//! Archive configuration.
//!
//! One immutable [`ArchiveConfig`] is loaded from YAML (every section has
//! defaults matching the permanent-grassland phenology coverage) and then
//! handed to the orchestrator. Nothing reads configuration from globals.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::{CollectionMeta, ItemTemplate};
use crate::error::{ArchiveError, Result};
use crate::slice::BandSpec;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub coverage: CoverageConfig,
    pub bands: BandSpec,
    pub tags: TagConfig,
    pub output: OutputConfig,
    pub processing: ProcessingConfig,
    pub retry: RetryConfig,
    pub tools: ToolsConfig,
    pub collection: CollectionMeta,
    pub item: ItemTemplate,
}

/// Remote grid-coverage service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoverageConfig {
    pub base_url: String,
    pub coverage_id: String,
    pub service: String,
    pub version: String,
    /// Output encoding requested from the service
    pub format: String,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            base_url: "https://datacube.julius-kuehn.de/flf/ows".to_string(),
            coverage_id: "jki_phaseX201Xpermanentgreenland_annually".to_string(),
            service: "WCS".to_string(),
            version: "2.1.0".to_string(),
            format: "image/tiff".to_string(),
            request_timeout_secs: 600,
            connect_timeout_secs: 30,
        }
    }
}

impl CoverageConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Dataset-level tag values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TagConfig {
    /// Written as `DATASOURCE`
    pub data_source: String,
    /// Written as `DESCRIPTION`
    pub description: String,
}

impl Default for TagConfig {
    fn default() -> Self {
        Self {
            data_source: "JKI WCS".to_string(),
            description: "Grünland-Phänologie-Datensatz".to_string(),
        }
    }
}

/// Where artifacts go.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Final COGs and the catalog document
    pub dir: PathBuf,
    /// Root for per-run, per-slice staging areas
    pub scratch_dir: PathBuf,
    /// Prefix of output filenames and catalog item ids
    pub item_prefix: String,
    pub catalog_file: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("_permanentgreenland_cogs"),
            scratch_dir: std::env::temp_dir().join("cog-archive"),
            item_prefix: "permanentgreenland".to_string(),
            catalog_file: "stac_catalog.json".to_string(),
        }
    }
}

/// Raster processing parameters and resource bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub compression: String,
    /// Decimation factors of the overview pyramid
    pub overview_levels: Vec<u32>,
    pub resampling: String,
    /// Value of the COG driver's OVERVIEWS creation option
    pub cog_overviews: String,
    /// Slices processed at the same time (1 = sequential)
    pub max_concurrent_slices: usize,
    /// External tool processes running at the same time
    pub max_tool_processes: usize,
    /// Validate the packaged raster before publishing it
    pub verify_output: bool,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            compression: "DEFLATE".to_string(),
            overview_levels: vec![2, 4, 8, 16, 32],
            resampling: "average".to_string(),
            cog_overviews: "FORCE_USE_EXISTING".to_string(),
            max_concurrent_slices: 1,
            max_tool_processes: 2,
            verify_output: true,
        }
    }
}

/// Whole-slice retry policy for transport failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per slice, including the first one
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 2_000,
            max_delay_ms: 120_000,
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// External program names, resolved through `PATH` unless absolute.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub gdal_translate: String,
    pub gdaladdo: String,
    pub gdalinfo: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            gdal_translate: "gdal_translate".to_string(),
            gdaladdo: "gdaladdo".to_string(),
            gdalinfo: "gdalinfo".to_string(),
        }
    }
}

impl ArchiveConfig {
    /// Load a configuration from a YAML file and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ArchiveError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;

        let config: ArchiveConfig =
            serde_yaml::from_str(&content).map_err(|source| ArchiveError::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?;

        config.validate()?;
        debug!(
            coverage = %config.coverage.coverage_id,
            bands = config.bands.len(),
            path = %path.display(),
            "Loaded archive config"
        );
        Ok(config)
    }

    /// Reject configurations the pipeline cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.coverage.coverage_id.trim().is_empty() {
            return Err(invalid("coverage.coverage_id must not be empty"));
        }
        if self.bands.is_empty() {
            return Err(invalid("at least one band must be configured"));
        }

        let mut seen = HashSet::new();
        for band in self.bands.bands() {
            if band.name.trim().is_empty() {
                return Err(invalid("band names must not be empty"));
            }
            if !seen.insert(band.name.as_str()) {
                return Err(invalid(&format!("duplicate band name '{}'", band.name)));
            }
        }

        let levels = &self.processing.overview_levels;
        if levels.is_empty() {
            return Err(invalid("processing.overview_levels must not be empty"));
        }
        if levels.iter().any(|&l| l < 2) || levels.windows(2).any(|w| w[0] >= w[1]) {
            return Err(invalid(
                "processing.overview_levels must be strictly increasing factors >= 2",
            ));
        }
        if self.processing.max_concurrent_slices == 0 || self.processing.max_tool_processes == 0 {
            return Err(invalid("concurrency limits must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be at least 1"));
        }
        if self.output.item_prefix.contains(std::path::is_separator) {
            return Err(invalid("output.item_prefix must not contain path separators"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> ArchiveError {
    ArchiveError::InvalidConfig(message.to_string())
}
