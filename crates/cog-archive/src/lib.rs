//! Time-series coverage archiver.
//!
//! Turns a remote WCS time series into one tagged Cloud-Optimized GeoTIFF
//! per time slice plus a STAC-style collection document.
//!
//! # Architecture
//!
//! Data flows strictly downward:
//!
//! - [`RunOrchestrator`] iterates the slices, bounds concurrency, retries
//!   transport failures and writes the catalog.
//! - [`SlicePipeline`] runs fetch, build, tag and package for one slice and
//!   owns its staging files.
//! - The stages: [`WcsFetcher`], [`PyramidBuilder`], [`MetadataTagger`],
//!   [`CogPackager`]. Raster work is delegated to GDAL command-line tools
//!   through a [`ToolRunner`].
//! - [`CatalogBuilder`] collects one item per published slice.

pub mod catalog;
pub mod config;
pub mod error;
pub mod fetch;
pub mod inspect;
pub mod orchestrator;
pub mod packager;
pub mod pipeline;
pub mod pyramid;
pub mod slice;
pub mod staging;
pub mod tagger;
pub mod tools;

// Re-exports
pub use catalog::{CatalogBuilder, CatalogCollection, CatalogItem, CollectionMeta, ItemTemplate};
pub use config::ArchiveConfig;
pub use error::{
    ArchiveError, BuildError, FetchError, PackageError, PipelineError, Result, Stage, TagError,
    ToolError, ValidationError,
};
pub use fetch::{CoverageFetcher, FetchedSlice, WcsFetcher};
pub use inspect::{CogValidation, CogValidator, GdalCogValidator, RasterInfo, RasterInspector};
pub use orchestrator::{RunOrchestrator, RunSummary};
pub use packager::{CogPackager, FinalArtifact};
pub use pipeline::{SliceFailure, SliceOutcome, SlicePipeline, SliceState};
pub use pyramid::{PyramidBuilder, TiledArtifact};
pub use slice::{parse_slices, Band, BandSpec, TimeSlice};
pub use staging::{reclaim_abandoned, Reclaimed, RunLock, StagingArea};
pub use tagger::{MetadataTagger, TagSet};
pub use tools::{ProcessRunner, ToolInvocation, ToolOutput, ToolRunner};
