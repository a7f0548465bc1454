//! Pyramid builder: raw raster -> internally tiled raster with overviews.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::config::{ProcessingConfig, ToolsConfig};
use crate::error::BuildError;
use crate::staging::remove_file_if_exists;
use crate::tools::{ToolInvocation, ToolRunner};

/// Tiled raster carrying its overview pyramid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TiledArtifact {
    pub path: PathBuf,
}

/// Converts a raw raster into a tiled, compressed raster and attaches an
/// averaged overview pyramid.
///
/// Either both steps succeed or the output path is removed again, so a
/// half-built file is never mistaken for a result. The raw input is only
/// read.
#[derive(Clone)]
pub struct PyramidBuilder {
    runner: Arc<dyn ToolRunner>,
    translate: String,
    addo: String,
    compression: String,
    resampling: String,
    levels: Vec<u32>,
}

impl PyramidBuilder {
    pub fn new(runner: Arc<dyn ToolRunner>, tools: &ToolsConfig, processing: &ProcessingConfig) -> Self {
        Self {
            runner,
            translate: tools.gdal_translate.clone(),
            addo: tools.gdaladdo.clone(),
            compression: processing.compression.clone(),
            resampling: processing.resampling.clone(),
            levels: processing.overview_levels.clone(),
        }
    }

    /// `gdal_translate -of GTiff -co TILED=YES -co COMPRESS=<c> <raw> <tiled>`
    pub fn tiling_invocation(&self, raw: &Path, tiled: &Path) -> ToolInvocation {
        ToolInvocation::new(&self.translate)
            .args(["-of", "GTiff"])
            .creation_option("TILED", "YES")
            .creation_option("COMPRESS", &self.compression)
            .path(raw)
            .path(tiled)
    }

    /// `gdaladdo -r <resampling> <tiled> 2 4 8 16 32`
    pub fn overview_invocation(&self, tiled: &Path) -> ToolInvocation {
        ToolInvocation::new(&self.addo)
            .args(["-r", self.resampling.as_str()])
            .path(tiled)
            .args(self.levels.iter().map(u32::to_string))
    }

    #[instrument(skip_all, fields(raw = %raw.display()))]
    pub async fn build(&self, raw: &Path, tiled: &Path) -> Result<TiledArtifact, BuildError> {
        if raw == tiled {
            return Err(BuildError::InPlace(tiled.to_path_buf()));
        }

        match self.run_steps(raw, tiled).await {
            Ok(()) => {
                info!(
                    tiled = %tiled.display(),
                    levels = ?self.levels,
                    "Built tiled raster with overviews"
                );
                Ok(TiledArtifact {
                    path: tiled.to_path_buf(),
                })
            }
            Err(e) => {
                if let Err(cleanup) = remove_file_if_exists(tiled).await {
                    warn!(path = %tiled.display(), error = %cleanup, "Failed to remove partial tiled raster");
                }
                Err(e)
            }
        }
    }

    async fn run_steps(&self, raw: &Path, tiled: &Path) -> Result<(), BuildError> {
        self.runner.run(&self.tiling_invocation(raw, tiled)).await?;
        if !tiled.exists() {
            return Err(BuildError::MissingOutput(tiled.to_path_buf()));
        }
        self.runner.run(&self.overview_invocation(tiled)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolError;
    use crate::tools::ToolOutput;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Copies on translate, fails on gdaladdo when asked to.
    struct ScriptedTools {
        fail_overviews: bool,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ToolRunner for ScriptedTools {
        async fn run(&self, inv: &ToolInvocation) -> Result<ToolOutput, ToolError> {
            self.calls.lock().unwrap().push(inv.tool_name().to_string());
            match inv.tool_name() {
                "gdal_translate" => {
                    let n = inv.args.len();
                    std::fs::copy(&inv.args[n - 2], &inv.args[n - 1]).unwrap();
                    Ok(ToolOutput::default())
                }
                "gdaladdo" if self.fail_overviews => Err(ToolError::Failed {
                    tool: "gdaladdo".into(),
                    exit_code: Some(1),
                    stderr: "disk full".into(),
                }),
                _ => Ok(ToolOutput::default()),
            }
        }
    }

    fn builder(fail_overviews: bool) -> (PyramidBuilder, Arc<ScriptedTools>) {
        let tools = Arc::new(ScriptedTools {
            fail_overviews,
            calls: Mutex::new(Vec::new()),
        });
        let builder = PyramidBuilder::new(
            tools.clone(),
            &ToolsConfig::default(),
            &ProcessingConfig::default(),
        );
        (builder, tools)
    }

    #[test]
    fn test_command_lines() {
        let (builder, _) = builder(false);
        let tiling = builder.tiling_invocation(Path::new("raw.tif"), Path::new("tiled.tif"));
        assert_eq!(
            tiling.to_string(),
            "gdal_translate -of GTiff -co TILED=YES -co COMPRESS=DEFLATE raw.tif tiled.tif"
        );

        let overviews = builder.overview_invocation(Path::new("tiled.tif"));
        assert_eq!(overviews.to_string(), "gdaladdo -r average tiled.tif 2 4 8 16 32");
    }

    #[tokio::test]
    async fn test_build_runs_both_steps() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw.tif");
        let tiled = dir.path().join("tiled.tif");
        std::fs::write(&raw, b"raw").unwrap();

        let (builder, tools) = builder(false);
        let artifact = builder.build(&raw, &tiled).await.unwrap();

        assert_eq!(artifact.path, tiled);
        assert!(tiled.exists());
        assert!(raw.exists());
        assert_eq!(*tools.calls.lock().unwrap(), vec!["gdal_translate", "gdaladdo"]);
    }

    #[tokio::test]
    async fn test_failed_overviews_remove_tiled_output() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw.tif");
        let tiled = dir.path().join("tiled.tif");
        std::fs::write(&raw, b"raw").unwrap();

        let (builder, _) = builder(true);
        let err = builder.build(&raw, &tiled).await.unwrap_err();

        assert!(matches!(err, BuildError::Tool(ToolError::Failed { .. })));
        assert!(!tiled.exists());
        assert!(raw.exists());
    }

    #[tokio::test]
    async fn test_refuses_in_place_build() {
        let (builder, tools) = builder(false);
        let path = Path::new("/tmp/same.tif");
        assert!(matches!(
            builder.build(path, path).await,
            Err(BuildError::InPlace(_))
        ));
        assert!(tools.calls.lock().unwrap().is_empty());
    }
}
