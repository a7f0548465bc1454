//! Coverage fetcher: one GetCoverage request per time slice, streamed to disk.
//!
//! The response body is written chunk by chunk to a `.part` sibling of the
//! destination and renamed into place only after the whole transfer
//! succeeded. On any failure the partial file is removed, so the
//! destination either holds a complete response or does not exist.
//!
//! No retries happen here; whole-slice retry is an orchestrator policy.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{header, Client, Url};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use crate::config::CoverageConfig;
use crate::error::{ArchiveError, FetchError};
use crate::slice::TimeSlice;
use crate::staging::remove_file_if_exists;

/// A raw slice that landed completely on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedSlice {
    pub path: PathBuf,
    pub bytes: u64,
}

/// Retrieves one time slice of gridded data into a local file.
#[async_trait]
pub trait CoverageFetcher: Send + Sync {
    /// Fetch `slice` into `destination`.
    ///
    /// `destination` exists afterwards only if this returns `Ok`.
    async fn fetch(&self, slice: TimeSlice, destination: &Path) -> Result<FetchedSlice, FetchError>;
}

/// Fetcher speaking the WCS GetCoverage key-value protocol.
pub struct WcsFetcher {
    client: Client,
    config: CoverageConfig,
}

impl WcsFetcher {
    pub fn new(config: CoverageConfig) -> Result<Self, ArchiveError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .pool_max_idle_per_host(4)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| ArchiveError::HttpClient(e.to_string()))?;

        // Fail on a malformed base URL now rather than once per slice.
        Url::parse(&config.base_url)
            .map_err(|e| ArchiveError::InvalidConfig(format!("coverage.base_url: {}", e)))?;

        Ok(Self { client, config })
    }

    /// GetCoverage request URL for a slice.
    pub fn request_url(&self, slice: TimeSlice) -> Result<Url, FetchError> {
        let subset = slice.subset();
        let params = [
            ("SERVICE", self.config.service.as_str()),
            ("VERSION", self.config.version.as_str()),
            ("REQUEST", "GetCoverage"),
            ("COVERAGEID", self.config.coverage_id.as_str()),
            ("FORMAT", self.config.format.as_str()),
            ("SUBSET", subset.as_str()),
        ];
        Url::parse_with_params(&self.config.base_url, params)
            .map_err(|e| FetchError::Transport(format!("invalid request URL: {}", e)))
    }

    async fn transfer(&self, url: Url, part_path: &Path) -> Result<u64, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let expected = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());

        let mut file = File::create(part_path).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        let mut since_log = 0u64;
        let log_interval = 16 * 1024 * 1024;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| FetchError::Transport(e.to_string()))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            since_log += chunk.len() as u64;

            if since_log >= log_interval {
                since_log = 0;
                debug!(downloaded = written, total = ?expected, "Download progress");
            }
        }

        file.flush().await?;
        file.sync_all().await?;

        if let Some(expected) = expected {
            if written != expected {
                return Err(FetchError::Transport(format!(
                    "body truncated: expected {} bytes, got {}",
                    expected, written
                )));
            }
        }

        Ok(written)
    }
}

#[async_trait]
impl CoverageFetcher for WcsFetcher {
    #[instrument(skip_all, fields(slice = %slice))]
    async fn fetch(&self, slice: TimeSlice, destination: &Path) -> Result<FetchedSlice, FetchError> {
        let url = self.request_url(slice)?;
        let part_path = part_path(destination);
        let started = Instant::now();

        info!(url = %url, "Requesting coverage slice");

        match self.transfer(url, &part_path).await {
            Ok(bytes) => {
                if let Err(e) = fs::rename(&part_path, destination).await {
                    let _ = remove_file_if_exists(&part_path).await;
                    return Err(e.into());
                }
                metrics::counter!("archive_fetch_bytes_total").increment(bytes);
                info!(
                    path = %destination.display(),
                    bytes = bytes,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Coverage slice downloaded"
                );
                Ok(FetchedSlice {
                    path: destination.to_path_buf(),
                    bytes,
                })
            }
            Err(e) => {
                if let Err(cleanup) = remove_file_if_exists(&part_path).await {
                    warn!(path = %part_path.display(), error = %cleanup, "Failed to remove partial download");
                }
                warn!(error = %e, "Coverage slice download failed");
                Err(e)
            }
        }
    }
}

fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}
