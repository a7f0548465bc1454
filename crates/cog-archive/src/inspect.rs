//! Raster inspection and COG structural validation.
//!
//! Both are consumed, not built: `gdalinfo -json` does the reading, this
//! module only interprets its report.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{InspectError, ToolError, ValidationError};
use crate::tagger::TagSet;
use crate::tools::{ToolInvocation, ToolRunner};

/// Rasters up to this size in both dimensions may be stored untiled.
const UNTILED_LIMIT: u64 = 512;

/// Subset of the `gdalinfo -json` report the pipeline relies on.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RasterInfo {
    #[serde(default)]
    pub driver_short_name: String,
    #[serde(default)]
    pub size: Vec<u64>,
    #[serde(default)]
    pub coordinate_system: Option<CoordinateSystem>,
    #[serde(default)]
    pub geo_transform: Vec<f64>,
    #[serde(default)]
    pub corner_coordinates: Option<CornerCoordinates>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default)]
    pub bands: Vec<BandInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoordinateSystem {
    #[serde(default)]
    pub wkt: String,
}

impl CoordinateSystem {
    /// Name of the outermost WKT node, e.g. `ETRS89 / UTM zone 32N`.
    pub fn name(&self) -> Option<&str> {
        let start = self.wkt.find('"')? + 1;
        let len = self.wkt[start..].find('"')?;
        Some(&self.wkt[start..start + len])
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CornerCoordinates {
    #[serde(default)]
    pub upper_left: Vec<f64>,
    #[serde(default)]
    pub lower_right: Vec<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BandInfo {
    #[serde(default)]
    pub band: usize,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub block: Vec<u64>,
    #[serde(default, rename = "type")]
    pub data_type: Option<String>,
    #[serde(default)]
    pub overviews: Vec<Value>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl RasterInfo {
    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    /// Dataset metadata item in `domain` (`""` is the default domain).
    pub fn metadata_item(&self, domain: &str, key: &str) -> Option<&str> {
        lookup(&self.metadata, domain, key)
    }

    /// `IMAGE_STRUCTURE/LAYOUT`, reported as `COG` for cloud-optimized files.
    pub fn layout(&self) -> Option<&str> {
        self.metadata_item("IMAGE_STRUCTURE", "LAYOUT")
    }

    pub fn compression(&self) -> Option<&str> {
        self.metadata_item("IMAGE_STRUCTURE", "COMPRESSION")
    }

    /// `[min_x, min_y, max_x, max_y]` from the corner coordinates.
    pub fn bounds(&self) -> Option<[f64; 4]> {
        let corners = self.corner_coordinates.as_ref()?;
        match (&corners.upper_left[..], &corners.lower_right[..]) {
            ([left, top], [right, bottom]) => Some([
                left.min(*right),
                bottom.min(*top),
                left.max(*right),
                bottom.max(*top),
            ]),
            _ => None,
        }
    }
}

impl BandInfo {
    pub fn metadata_item(&self, domain: &str, key: &str) -> Option<&str> {
        lookup(&self.metadata, domain, key)
    }

    pub fn overview_count(&self) -> usize {
        self.overviews.len()
    }

    /// Block width spans the whole raster row: the band is stored in strips.
    fn is_striped(&self, raster_width: u64) -> bool {
        matches!(self.block[..], [width, _] if width >= raster_width)
    }
}

fn lookup<'a>(metadata: &'a HashMap<String, Value>, domain: &str, key: &str) -> Option<&'a str> {
    metadata.get(domain)?.get(key)?.as_str()
}

/// Reads raster structure through `gdalinfo -json`.
#[derive(Clone)]
pub struct RasterInspector {
    runner: Arc<dyn ToolRunner>,
    program: String,
}

impl RasterInspector {
    pub fn new(runner: Arc<dyn ToolRunner>, program: impl Into<String>) -> Self {
        Self {
            runner,
            program: program.into(),
        }
    }

    pub async fn inspect(&self, path: &Path) -> Result<RasterInfo, InspectError> {
        let invocation = ToolInvocation::new(&self.program).arg("-json").path(path);
        let output = self.runner.run(&invocation).await?;

        serde_json::from_slice(&output.stdout).map_err(|source| InspectError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Outcome of a structural COG check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CogValidation {
    pub problems: Vec<String>,
}

impl CogValidation {
    pub fn is_valid(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Structural validator for cloud-optimized rasters.
///
/// `Err` means the validator could not run at all; an unreadable or
/// malformed file is reported through [`CogValidation::problems`]. When
/// `tags` is given, the raster must also carry every one of them.
#[async_trait]
pub trait CogValidator: Send + Sync {
    async fn validate(&self, path: &Path, tags: Option<&TagSet>) -> Result<CogValidation, ValidationError>;
}

/// Validator built on the raster inspector.
///
/// Checks that the file opens, uses the COG layout, is internally tiled,
/// carries an internal overview pyramid and (optionally) has the expected
/// band count.
#[derive(Clone)]
pub struct GdalCogValidator {
    inspector: RasterInspector,
    expected_bands: Option<usize>,
}

impl GdalCogValidator {
    pub fn new(inspector: RasterInspector) -> Self {
        Self {
            inspector,
            expected_bands: None,
        }
    }

    pub fn with_expected_bands(mut self, bands: usize) -> Self {
        self.expected_bands = Some(bands);
        self
    }

    /// Judge an already inspected raster.
    pub fn check(&self, info: &RasterInfo, tags: Option<&TagSet>) -> CogValidation {
        let mut problems = Vec::new();

        match info.layout() {
            Some(layout) if layout.eq_ignore_ascii_case("COG") => {}
            Some(other) => problems.push(format!("layout is {}, not COG", other)),
            None => problems.push("no IMAGE_STRUCTURE/LAYOUT=COG marker".to_string()),
        }

        if info.bands.is_empty() {
            problems.push("raster has no bands".to_string());
        } else if info.bands.iter().any(|b| b.overview_count() == 0) {
            problems.push("missing internal overviews".to_string());
        }

        if let [width, height] = info.size[..] {
            if width > UNTILED_LIMIT || height > UNTILED_LIMIT {
                if let Some(band) = info.bands.iter().find(|b| b.is_striped(width)) {
                    problems.push(format!(
                        "band {} is not internally tiled (block {:?})",
                        band.band, band.block
                    ));
                }
            }
        }

        if let Some(expected) = self.expected_bands {
            if info.band_count() != expected {
                problems.push(format!(
                    "expected {} bands, found {}",
                    expected,
                    info.band_count()
                ));
            }
        }

        if let Some(tags) = tags {
            problems.extend(tags.problems(info));
        }

        CogValidation { problems }
    }

    /// Inspect `path` once and judge it.
    ///
    /// The report is returned alongside the verdict whenever the file could
    /// be read.
    pub async fn examine(
        &self,
        path: &Path,
        tags: Option<&TagSet>,
    ) -> Result<(CogValidation, Option<RasterInfo>), ValidationError> {
        if !path.exists() {
            let validation = CogValidation {
                problems: vec![format!("{} does not exist", path.display())],
            };
            return Ok((validation, None));
        }

        let problem = match self.inspector.inspect(path).await {
            Ok(info) => {
                let validation = self.check(&info, tags);
                debug!(path = %path.display(), valid = validation.is_valid(), "Validated COG");
                return Ok((validation, Some(info)));
            }
            // The inspector ran but could not read the file.
            Err(InspectError::Tool(err @ ToolError::Failed { .. })) => format!("unreadable: {}", err),
            Err(InspectError::Parse { source, .. }) => format!("unreadable inspector report: {}", source),
            Err(err) => return Err(err.into()),
        };
        Ok((
            CogValidation {
                problems: vec![problem],
            },
            None,
        ))
    }
}

#[async_trait]
impl CogValidator for GdalCogValidator {
    async fn validate(&self, path: &Path, tags: Option<&TagSet>) -> Result<CogValidation, ValidationError> {
        let (validation, _) = self.examine(path, tags).await?;
        Ok(validation)
    }
}
