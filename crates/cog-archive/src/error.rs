//! Error types for the archive pipeline.
//!
//! Every stage has its own error enum so a slice failure can be reported
//! with the exact stage and cause. [`PipelineError`] is what the slice
//! pipeline hands back to the orchestrator; [`ArchiveError`] covers the
//! library surface outside a single slice (configuration, catalog output).

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Result type for archive operations outside a single slice.
pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Failure to retrieve one time slice from the coverage service.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("coverage service returned HTTP {status} for {url}")]
    Status { status: u16, url: String },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("failed to write staging file: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of an external raster tool.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{tool} exited with code {exit_code:?}: {stderr}")]
    Failed {
        tool: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("failed to launch {tool}: {source}")]
    Launch {
        tool: String,
        #[source]
        source: std::io::Error,
    },
}

impl ToolError {
    /// Name of the tool that failed.
    pub fn tool(&self) -> &str {
        match self {
            ToolError::Failed { tool, .. } | ToolError::Launch { tool, .. } => tool,
        }
    }
}

/// Failure to read raster metadata through the inspector.
#[derive(Debug, Error)]
pub enum InspectError {
    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("unreadable inspector output for {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure while tiling the raw raster or computing its overviews.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("pyramid output must differ from input: {0}")]
    InPlace(PathBuf),

    #[error("tiled raster was not produced at {0}")]
    MissingOutput(PathBuf),
}

/// Failure while writing dataset and band tags.
#[derive(Debug, Error)]
pub enum TagError {
    #[error("raster has {found} bands but the band list defines {expected}")]
    BandCountMismatch { expected: usize, found: usize },

    #[error("cannot read band layout: {0}")]
    Inspect(#[from] InspectError),

    #[error("cannot encode tag document: {0}")]
    Encode(String),

    #[error("tag write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure while repacking into the cloud-optimized layout.
#[derive(Debug, Error)]
pub enum PackageError {
    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("packager reported success but {0} is missing")]
    MissingOutput(PathBuf),

    #[error("packaged raster {path} failed validation: {}", .problems.join("; "))]
    Invalid { path: PathBuf, problems: Vec<String> },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("cannot publish final artifact: {0}")]
    Io(#[from] std::io::Error),
}

/// The COG validator itself could not run. Advisory only.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error(transparent)]
    Inspect(#[from] InspectError),
}

/// Pipeline stage a slice was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetching,
    Building,
    Tagging,
    Packaging,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Fetching => "fetching",
            Stage::Building => "building",
            Stage::Tagging => "tagging",
            Stage::Packaging => "packaging",
        };
        f.write_str(name)
    }
}

/// Underlying cause of a failed slice.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Tag(#[from] TagError),

    #[error(transparent)]
    Package(#[from] PackageError),

    #[error("staging area unavailable: {0}")]
    Staging(#[source] std::io::Error),
}

impl PipelineError {
    /// Whether re-running the whole slice can reasonably succeed.
    ///
    /// Only transport-level fetch failures qualify. HTTP status errors,
    /// tool failures and band layout mismatches are deterministic.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Fetch(FetchError::Transport(_)))
    }

    /// HTTP status of a failed fetch, if that is what happened.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            PipelineError::Fetch(FetchError::Status { status, .. }) => Some(*status),
            _ => None,
        }
    }
}

/// Errors outside a single slice's pipeline.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Failed to read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid time slice: {0}")]
    InvalidSlice(String),

    #[error("Failed to create HTTP client: {0}")]
    HttpClient(String),

    #[error("Failed to serialize catalog: {0}")]
    CatalogEncode(#[from] serde_json::Error),

    #[error("Failed to take run lock {path}: {source}")]
    RunLock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
