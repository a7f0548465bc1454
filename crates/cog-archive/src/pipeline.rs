//! Slice pipeline: fetch, build, tag and package one time slice.
//!
//! ```text
//! Idle -> Fetching -> Building -> Tagging -> Packaging -> Done
//!            \            \           \           \
//!             +------------+-----------+-----------+--> Failed
//! ```
//!
//! Every invocation owns a [`StagingArea`] unique to `(run_id, slice)`;
//! it is released on `Done` and on `Failed` alike. The final path is only
//! ever written by the packager's rename, so it is either absent or holds a
//! validated COG.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::catalog::item_id;
use crate::config::{ArchiveConfig, OutputConfig, TagConfig};
use crate::error::{PipelineError, Stage};
use crate::fetch::CoverageFetcher;
use crate::inspect::{CogValidator, GdalCogValidator, RasterInspector};
use crate::packager::{CogPackager, FinalArtifact};
use crate::pyramid::PyramidBuilder;
use crate::slice::{BandSpec, TimeSlice};
use crate::staging::StagingArea;
use crate::tagger::{MetadataTagger, TagSet};
use crate::tools::ToolRunner;

const RAW_FILE: &str = "raw.tif";
const TILED_FILE: &str = "tiled.tif";

/// Position of a slice in the pipeline state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceState {
    Idle,
    Fetching,
    Building,
    Tagging,
    Packaging,
    Done,
    Failed,
}

impl fmt::Display for SliceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SliceState::Idle => "idle",
            SliceState::Fetching => "fetching",
            SliceState::Building => "building",
            SliceState::Tagging => "tagging",
            SliceState::Packaging => "packaging",
            SliceState::Done => "done",
            SliceState::Failed => "failed",
        };
        f.write_str(name)
    }
}

impl From<Stage> for SliceState {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Fetching => SliceState::Fetching,
            Stage::Building => SliceState::Building,
            Stage::Tagging => SliceState::Tagging,
            Stage::Packaging => SliceState::Packaging,
        }
    }
}

/// Why a slice failed.
#[derive(Debug)]
pub struct SliceFailure {
    pub stage: Stage,
    pub error: PipelineError,
}

impl SliceFailure {
    pub fn new(stage: Stage, error: impl Into<PipelineError>) -> Self {
        Self {
            stage,
            error: error.into(),
        }
    }
}

impl fmt::Display for SliceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed while {}: {}", self.stage, self.error)
    }
}

/// Result of processing one slice.
#[derive(Debug)]
pub enum SliceOutcome {
    /// A valid artifact already existed; nothing was fetched or run.
    AlreadyComplete(FinalArtifact),
    Succeeded(FinalArtifact),
    Failed(SliceFailure),
}

impl SliceOutcome {
    /// Metric and summary label.
    pub fn label(&self) -> &'static str {
        match self {
            SliceOutcome::AlreadyComplete(_) => "already_complete",
            SliceOutcome::Succeeded(_) => "succeeded",
            SliceOutcome::Failed(_) => "failed",
        }
    }

    /// The published artifact, for outcomes that belong in the catalog.
    pub fn artifact(&self) -> Option<&FinalArtifact> {
        match self {
            SliceOutcome::AlreadyComplete(a) | SliceOutcome::Succeeded(a) => Some(a),
            SliceOutcome::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&SliceFailure> {
        match self {
            SliceOutcome::Failed(f) => Some(f),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SliceOutcome::Failed(_))
    }
}

/// Runs the four stages for one slice at a time. Shared between
/// concurrent slices; it holds no per-slice state.
pub struct SlicePipeline {
    fetcher: Arc<dyn CoverageFetcher>,
    builder: PyramidBuilder,
    tagger: MetadataTagger,
    packager: CogPackager,
    validator: Arc<dyn CogValidator>,
    bands: BandSpec,
    tags: TagConfig,
    output: OutputConfig,
}

impl SlicePipeline {
    /// Wire the stages from configuration.
    ///
    /// Every external tool goes through `runner`, so its concurrency bound
    /// applies across all slices.
    pub fn new(config: &ArchiveConfig, fetcher: Arc<dyn CoverageFetcher>, runner: Arc<dyn ToolRunner>) -> Self {
        let inspector = RasterInspector::new(runner.clone(), config.tools.gdalinfo.clone());
        let validator: Arc<dyn CogValidator> = Arc::new(
            GdalCogValidator::new(inspector.clone()).with_expected_bands(config.bands.len()),
        );

        let mut packager = CogPackager::new(runner.clone(), &config.tools, &config.processing);
        if config.processing.verify_output {
            packager = packager.with_validator(validator.clone());
        }

        Self {
            fetcher,
            builder: PyramidBuilder::new(runner, &config.tools, &config.processing),
            tagger: MetadataTagger::new(inspector, config.tags.clone()),
            packager,
            validator,
            bands: config.bands.clone(),
            tags: config.tags.clone(),
            output: config.output.clone(),
        }
    }

    /// `<output.dir>/<prefix>_<slice>.tif`
    pub fn final_path(&self, slice: TimeSlice) -> PathBuf {
        self.output
            .dir
            .join(format!("{}.tif", item_id(&self.output.item_prefix, slice)))
    }

    /// Process `slice` as part of run `run_id`. Never panics on stage
    /// failures and never leaves staging files behind.
    pub async fn process(&self, slice: TimeSlice, run_id: Uuid) -> SliceOutcome {
        let started = Instant::now();
        let final_path = self.final_path(slice);
        transition(slice, SliceState::Idle);

        if let Some(artifact) = self.existing_artifact(slice, &final_path).await {
            return SliceOutcome::AlreadyComplete(artifact);
        }

        let mut staging = match StagingArea::acquire(&self.output.scratch_dir, run_id, slice).await {
            Ok(area) => area,
            Err(e) => {
                error!(slice = %slice, error = %e, "Cannot create staging area");
                return SliceOutcome::Failed(SliceFailure::new(Stage::Fetching, PipelineError::Staging(e)));
            }
        };
        let partial = CogPackager::partial_path(&final_path, run_id);
        staging.track(partial.clone());

        let result = self.run_stages(slice, &staging, &partial, &final_path).await;

        if let Err(e) = staging.release().await {
            warn!(slice = %slice, error = %e, "Staging cleanup incomplete");
        }

        let elapsed = started.elapsed();
        metrics::histogram!("archive_slice_duration_seconds").record(elapsed.as_secs_f64());

        match result {
            Ok(artifact) => {
                transition(slice, SliceState::Done);
                info!(
                    slice = %slice,
                    path = %artifact.path.display(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Slice archived"
                );
                SliceOutcome::Succeeded(artifact)
            }
            Err(failure) => {
                transition(slice, SliceState::Failed);
                error!(
                    slice = %slice,
                    stage = %failure.stage,
                    error = %failure.error,
                    "Slice failed"
                );
                SliceOutcome::Failed(failure)
            }
        }
    }

    async fn run_stages(
        &self,
        slice: TimeSlice,
        staging: &StagingArea,
        partial: &Path,
        final_path: &Path,
    ) -> Result<FinalArtifact, SliceFailure> {
        let raw = staging.file(RAW_FILE);
        let tiled = staging.file(TILED_FILE);

        transition(slice, SliceState::Fetching);
        let fetched = self
            .fetcher
            .fetch(slice, &raw)
            .await
            .map_err(|e| SliceFailure::new(Stage::Fetching, e))?;
        debug!(slice = %slice, bytes = fetched.bytes, "Raw slice staged");

        transition(slice, SliceState::Building);
        let tiled = self
            .builder
            .build(&fetched.path, &tiled)
            .await
            .map_err(|e| SliceFailure::new(Stage::Building, e))?;

        transition(slice, SliceState::Tagging);
        let tags = self
            .tagger
            .tag(&tiled.path, slice, &self.bands)
            .await
            .map_err(|e| SliceFailure::new(Stage::Tagging, e))?;

        transition(slice, SliceState::Packaging);
        self.packager
            .package(&tiled.path, partial, final_path, &tags)
            .await
            .map_err(|e| SliceFailure::new(Stage::Packaging, e))
    }

    /// A valid, correctly tagged artifact already at `final_path`, if
    /// there is one.
    ///
    /// Anything else is reprocessed; the packager replaces it by rename.
    async fn existing_artifact(&self, slice: TimeSlice, final_path: &Path) -> Option<FinalArtifact> {
        if !final_path.exists() {
            return None;
        }

        let tags = TagSet::for_slice(slice, &self.bands, &self.tags);
        match self.validator.validate(final_path, Some(&tags)).await {
            Ok(validation) if validation.is_valid() => {
                info!(slice = %slice, path = %final_path.display(), "Valid artifact exists, skipping");
                Some(FinalArtifact {
                    path: final_path.to_path_buf(),
                })
            }
            Ok(validation) => {
                warn!(
                    slice = %slice,
                    path = %final_path.display(),
                    problems = ?validation.problems,
                    "Existing artifact is invalid, reprocessing"
                );
                None
            }
            Err(e) => {
                warn!(slice = %slice, error = %e, "Cannot validate existing artifact, reprocessing");
                None
            }
        }
    }
}

fn transition(slice: TimeSlice, state: SliceState) {
    debug!(slice = %slice, state = %state, "Slice state");
}
