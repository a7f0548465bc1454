//! COG packager: repacks the tagged tiled raster into the final artifact.
//!
//! The COG driver writes to a hidden `.partial` sibling of the final path.
//! Only after the tool succeeded, the file is present and (optionally) it
//! passed structural validation is it renamed onto the final path. The
//! rename is atomic on one filesystem, so the final path never shows a
//! half-written raster.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::{ProcessingConfig, ToolsConfig};
use crate::error::PackageError;
use crate::inspect::CogValidator;
use crate::staging::remove_file_if_exists;
use crate::tagger::{sidecar_path, TagSet};
use crate::tools::{ToolInvocation, ToolRunner};

/// MIME type of the packaged artifacts.
pub const COG_MEDIA_TYPE: &str = "image/tiff; application=geotiff; profile=cog";

/// A published cloud-optimized raster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalArtifact {
    pub path: PathBuf,
}

impl FinalArtifact {
    /// Base filename, used as the catalog asset href.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(Clone)]
pub struct CogPackager {
    runner: Arc<dyn ToolRunner>,
    validator: Option<Arc<dyn CogValidator>>,
    translate: String,
    compression: String,
    overviews: String,
}

impl CogPackager {
    pub fn new(runner: Arc<dyn ToolRunner>, tools: &ToolsConfig, processing: &ProcessingConfig) -> Self {
        Self {
            runner,
            validator: None,
            translate: tools.gdal_translate.clone(),
            compression: processing.compression.clone(),
            overviews: processing.cog_overviews.clone(),
        }
    }

    /// Validate every packaged raster before publishing it.
    pub fn with_validator(mut self, validator: Arc<dyn CogValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Where the packager writes before publishing `final_path`.
    ///
    /// Unique per run so overlapping runs never share a write target.
    pub fn partial_path(final_path: &Path, run_id: Uuid) -> PathBuf {
        let mut name = OsString::from(".");
        name.push(final_path.file_name().unwrap_or_default());
        name.push(format!(".{}.partial", run_id.simple()));
        final_path.with_file_name(name)
    }

    /// `gdal_translate --config GDAL_PAM_ENABLED YES -of COG -co COMPRESS=<c> -co OVERVIEWS=<mode> <tiled> <out>`
    ///
    /// Tags reach the COG only through the tiled raster's auxiliary
    /// metadata, so PAM is forced on whatever the environment says.
    pub fn invocation(&self, tiled: &Path, out: &Path) -> ToolInvocation {
        ToolInvocation::new(&self.translate)
            .args(["--config", "GDAL_PAM_ENABLED", "YES"])
            .args(["-of", "COG"])
            .creation_option("COMPRESS", &self.compression)
            .creation_option("OVERVIEWS", &self.overviews)
            .path(tiled)
            .path(out)
    }

    #[instrument(skip_all, fields(final_path = %final_path.display()))]
    pub async fn package(
        &self,
        tiled: &Path,
        partial: &Path,
        final_path: &Path,
        tags: &TagSet,
    ) -> Result<FinalArtifact, PackageError> {
        match self.write_and_verify(tiled, partial, tags).await {
            Ok(()) => {}
            Err(e) => {
                discard(partial).await;
                return Err(e);
            }
        }

        if let Err(e) = fs::rename(partial, final_path).await {
            discard(partial).await;
            return Err(e.into());
        }
        if !final_path.exists() {
            return Err(PackageError::MissingOutput(final_path.to_path_buf()));
        }

        info!(path = %final_path.display(), "Published cloud-optimized raster");
        Ok(FinalArtifact {
            path: final_path.to_path_buf(),
        })
    }

    async fn write_and_verify(&self, tiled: &Path, partial: &Path, tags: &TagSet) -> Result<(), PackageError> {
        self.runner.run(&self.invocation(tiled, partial)).await?;

        if !partial.exists() {
            return Err(PackageError::MissingOutput(partial.to_path_buf()));
        }

        // GDAL spills metadata it cannot embed into a sidecar; nothing
        // may depend on one next to the published file.
        let stray = sidecar_path(partial);
        if stray.exists() {
            warn!(path = %stray.display(), "Packager left auxiliary metadata behind, removing");
            remove_file_if_exists(&stray).await?;
        }

        if let Some(validator) = &self.validator {
            let validation = validator.validate(partial, Some(tags)).await?;
            if !validation.is_valid() {
                return Err(PackageError::Invalid {
                    path: partial.to_path_buf(),
                    problems: validation.problems,
                });
            }
        }
        Ok(())
    }
}

async fn discard(partial: &Path) {
    for path in [partial.to_path_buf(), sidecar_path(partial)] {
        if let Err(e) = remove_file_if_exists(&path).await {
            warn!(path = %path.display(), error = %e, "Failed to remove partial COG");
        }
    }
}
