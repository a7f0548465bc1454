//! Fakes shared by the integration tests.
//!
//! `FakeGdal` simulates the four GDAL programs on the text payloads from
//! `test_utils::fixtures`; `FakeFetcher` stands in for the WCS client when
//! a test needs transport failures or controlled timing.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cog_archive::{
    ArchiveConfig, CoverageFetcher, FetchError, FetchedSlice, TimeSlice, ToolError, ToolInvocation,
    ToolOutput, ToolRunner,
};
use test_utils::{fake_raster, gdalinfo_for, ArchiveDirs, COG_MARKER};
use tokio_util::sync::CancellationToken;

/// Configuration pointing at the test directories, with near-instant retries.
pub fn test_config(dirs: &ArchiveDirs) -> ArchiveConfig {
    let mut config = ArchiveConfig::default();
    config.output.dir = dirs.output();
    config.output.scratch_dir = dirs.scratch();
    config.retry.initial_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config
}

pub fn slices(years: &[i32]) -> Vec<TimeSlice> {
    years.iter().map(|&y| TimeSlice::new(y).unwrap()).collect()
}

/// Simulated GDAL step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    /// `gdal_translate -of GTiff`
    Tile,
    /// `gdaladdo`
    Overviews,
    /// `gdalinfo -json`
    Inspect,
    /// `gdal_translate -of COG`
    Package,
}

impl Step {
    fn of(invocation: &ToolInvocation) -> Step {
        match invocation.tool_name() {
            "gdaladdo" => Step::Overviews,
            "gdalinfo" => Step::Inspect,
            _ if invocation.has_arg("COG") => Step::Package,
            _ => Step::Tile,
        }
    }
}

/// Simulates GDAL on fake rasters.
///
/// - tiling copies the input
/// - overviews only require the target to exist
/// - packaging writes `COG` + input + the tag sidecar, if any
/// - inspection reports the band count and tags found in the file
#[derive(Default)]
pub struct FakeGdal {
    calls: Mutex<Vec<Step>>,
    failing: Mutex<Option<Step>>,
    broken_cog_layout: Mutex<bool>,
    drops_tags: Mutex<bool>,
}

impl FakeGdal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every invocation of `step` exit with status 1.
    pub fn fail(&self, step: Step) {
        *self.failing.lock().unwrap() = Some(step);
    }

    pub fn heal(&self) {
        *self.failing.lock().unwrap() = None;
    }

    /// Package without the COG layout, as a misconfigured driver would.
    pub fn break_cog_layout(&self) {
        *self.broken_cog_layout.lock().unwrap() = true;
    }

    /// Package without reading the tag sidecar, as GDAL does with PAM off.
    pub fn drop_tags(&self) {
        *self.drops_tags.lock().unwrap() = true;
    }

    pub fn calls(&self) -> Vec<Step> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, step: Step) -> usize {
        self.calls().iter().filter(|s| **s == step).count()
    }

    /// Calls that produce or modify rasters.
    pub fn writes(&self) -> usize {
        self.calls().iter().filter(|s| **s != Step::Inspect).count()
    }

    fn simulate(&self, step: Step, args: &[PathBuf]) -> std::io::Result<Vec<u8>> {
        match step {
            Step::Tile => {
                let [.., input, output] = args else {
                    return Err(bad_args());
                };
                std::fs::copy(input, output)?;
                Ok(Vec::new())
            }
            Step::Overviews => {
                let target = &args[2];
                std::fs::metadata(target)?;
                Ok(Vec::new())
            }
            Step::Package => {
                let [.., input, output] = args else {
                    return Err(bad_args());
                };
                let mut content = Vec::new();
                if !*self.broken_cog_layout.lock().unwrap() {
                    content.extend_from_slice(format!("{}\n", COG_MARKER).as_bytes());
                }
                content.extend_from_slice(&std::fs::read(input)?);

                let mut sidecar = input.clone().into_os_string();
                sidecar.push(".aux.xml");
                if !*self.drops_tags.lock().unwrap() {
                    if let Ok(tags) = std::fs::read(PathBuf::from(sidecar)) {
                        content.extend_from_slice(&tags);
                    }
                }
                std::fs::write(output, content)?;
                Ok(Vec::new())
            }
            Step::Inspect => {
                let path = args.last().ok_or_else(bad_args)?;
                let content = std::fs::read(path)?;
                Ok(serde_json::to_vec(&gdalinfo_for(&content)).unwrap())
            }
        }
    }
}

fn bad_args() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidInput, "unexpected arguments")
}

#[async_trait]
impl ToolRunner for FakeGdal {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput, ToolError> {
        let step = Step::of(invocation);
        self.calls.lock().unwrap().push(step);

        let failed = |stderr: String| ToolError::Failed {
            tool: invocation.tool_name().to_string(),
            exit_code: Some(1),
            stderr,
        };

        if *self.failing.lock().unwrap() == Some(step) {
            return Err(failed("ERROR 1: simulated failure".to_string()));
        }

        let args: Vec<PathBuf> = invocation.args.iter().map(PathBuf::from).collect();
        match self.simulate(step, &args) {
            Ok(stdout) => Ok(ToolOutput {
                stdout,
                stderr: String::new(),
            }),
            Err(e) => Err(failed(e.to_string())),
        }
    }
}

/// In-process coverage source.
///
/// Writes six-band fake rasters, optionally after a per-slice delay, and
/// can fail the first attempts of a slice with a transport error.
#[derive(Default)]
pub struct FakeFetcher {
    attempts: Mutex<HashMap<i32, usize>>,
    transport_failures: Mutex<HashMap<i32, usize>>,
    delays: Mutex<HashMap<i32, Duration>>,
    cancel_on: Mutex<Option<(i32, CancellationToken)>>,
    total: AtomicUsize,
}

impl FakeFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the first `times` fetches of `year` with a transport error.
    pub fn drop_connection(&self, year: i32, times: usize) {
        self.transport_failures.lock().unwrap().insert(year, times);
    }

    pub fn delay(&self, year: i32, delay: Duration) {
        self.delays.lock().unwrap().insert(year, delay);
    }

    /// Cancel `token` while `year` is being fetched.
    pub fn cancel_during(&self, year: i32, token: CancellationToken) {
        *self.cancel_on.lock().unwrap() = Some((year, token));
    }

    pub fn attempts(&self, year: i32) -> usize {
        self.attempts.lock().unwrap().get(&year).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CoverageFetcher for FakeFetcher {
    async fn fetch(&self, slice: TimeSlice, destination: &Path) -> Result<FetchedSlice, FetchError> {
        let year = slice.year();
        self.total.fetch_add(1, Ordering::SeqCst);
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let entry = attempts.entry(year).or_default();
            *entry += 1;
            *entry
        };

        if let Some((cancel_year, token)) = self.cancel_on.lock().unwrap().as_ref() {
            if *cancel_year == year {
                token.cancel();
            }
        }

        let delay = self.delays.lock().unwrap().get(&year).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failures = self.transport_failures.lock().unwrap().get(&year).copied().unwrap_or(0);
        if attempt <= failures {
            return Err(FetchError::Transport("connection reset by peer".to_string()));
        }

        let payload = fake_raster(test_utils::GRASSLAND_BANDS);
        tokio::fs::write(destination, &payload).await?;
        Ok(FetchedSlice {
            path: destination.to_path_buf(),
            bytes: payload.len() as u64,
        })
    }
}
