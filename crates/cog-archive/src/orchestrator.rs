//! Run orchestrator: drives the slice pipeline over a time series.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::catalog::{write_catalog, CatalogBuilder};
use crate::config::ArchiveConfig;
use crate::error::{ArchiveError, Result};
use crate::fetch::WcsFetcher;
use crate::pipeline::{SliceFailure, SliceOutcome, SlicePipeline};
use crate::slice::TimeSlice;
use crate::staging::{reclaim_abandoned, RunLock};
use crate::tools::ProcessRunner;

/// What happened during one run.
#[derive(Debug)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub outcomes: BTreeMap<TimeSlice, SliceOutcome>,
    /// Slices never started because the run was cancelled
    pub cancelled: Vec<TimeSlice>,
    pub catalog_path: PathBuf,
}

impl RunSummary {
    pub fn failed(&self) -> Vec<(TimeSlice, &SliceFailure)> {
        self.outcomes
            .iter()
            .filter_map(|(slice, outcome)| outcome.failure().map(|f| (*slice, f)))
            .collect()
    }

    pub fn count(&self, label: &str) -> usize {
        self.outcomes.values().filter(|o| o.label() == label).count()
    }

    /// True when no slice failed. Cancelled slices do not count as failures.
    pub fn is_success(&self) -> bool {
        !self.outcomes.values().any(SliceOutcome::is_failed)
    }
}

pub struct RunOrchestrator {
    config: Arc<ArchiveConfig>,
    pipeline: Arc<SlicePipeline>,
    cancel: CancellationToken,
    run_id: Uuid,
}

impl RunOrchestrator {
    pub fn new(config: Arc<ArchiveConfig>, pipeline: SlicePipeline) -> Self {
        Self {
            config,
            pipeline: Arc::new(pipeline),
            cancel: CancellationToken::new(),
            run_id: Uuid::new_v4(),
        }
    }

    /// Orchestrator backed by the WCS fetcher and real GDAL processes.
    pub fn from_config(config: ArchiveConfig) -> Result<Self> {
        config.validate()?;
        let fetcher = Arc::new(WcsFetcher::new(config.coverage.clone())?);
        let runner = Arc::new(ProcessRunner::new(config.processing.max_tool_processes));
        let pipeline = SlicePipeline::new(&config, fetcher, runner);
        Ok(Self::new(Arc::new(config), pipeline))
    }

    /// Use an externally owned token, e.g. one tied to Ctrl-C.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn pipeline(&self) -> &SlicePipeline {
        &self.pipeline
    }

    /// Process `slices` and write the catalog for those that are published.
    ///
    /// Up to `processing.max_concurrent_slices` slices run at once.
    /// Cancellation stops new slices from starting; slices already running
    /// finish, including their cleanup.
    #[instrument(skip_all, fields(run_id = %self.run_id))]
    pub async fn run(&self, slices: Vec<TimeSlice>) -> Result<RunSummary> {
        let slices: Vec<TimeSlice> = slices.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        let output = &self.config.output;
        fs::create_dir_all(&output.dir).await?;
        fs::create_dir_all(&output.scratch_dir).await?;
        let locks = self.lock_run()?;
        self.reclaim_abandoned().await;

        let max_concurrent = self.config.processing.max_concurrent_slices.max(1);
        info!(
            slices = slices.len(),
            max_concurrent = max_concurrent,
            output = %output.dir.display(),
            "Starting archive run"
        );

        let cancel = self.cancel.clone();
        let mut results = stream::iter(slices.iter().copied())
            .take_while(move |_| futures::future::ready(!cancel.is_cancelled()))
            .map(|slice| async move { (slice, self.process_with_retry(slice).await) })
            .buffer_unordered(max_concurrent);

        let mut catalog = CatalogBuilder::new(
            self.config.collection.clone(),
            self.config.item.clone(),
            output.item_prefix.clone(),
        );
        let mut outcomes = BTreeMap::new();

        while let Some((slice, outcome)) = results.next().await {
            metrics::counter!("archive_slices_total", "outcome" => outcome.label()).increment(1);
            if let Some(artifact) = outcome.artifact() {
                catalog.record(slice, artifact);
            }
            outcomes.insert(slice, outcome);
        }
        drop(results);

        let cancelled: Vec<TimeSlice> = slices
            .iter()
            .filter(|s| !outcomes.contains_key(*s))
            .copied()
            .collect();
        if !cancelled.is_empty() {
            warn!(count = cancelled.len(), "Run cancelled before all slices started");
        }

        let catalog_path = write_catalog(&catalog.emit(), &output.dir.join(&output.catalog_file)).await?;

        // Sibling slices remove their own directories; only the empty run
        // directory can be left.
        let _ = fs::remove_dir(output.scratch_dir.join(self.run_id.to_string())).await;
        for lock in locks {
            lock.release();
        }

        let summary = RunSummary {
            run_id: self.run_id,
            outcomes,
            cancelled,
            catalog_path,
        };
        info!(
            succeeded = summary.count("succeeded"),
            already_complete = summary.count("already_complete"),
            failed = summary.count("failed"),
            cancelled = summary.cancelled.len(),
            "Archive run finished"
        );
        Ok(summary)
    }

    /// Mark this run alive next to its staging files and its partials.
    fn lock_run(&self) -> Result<Vec<RunLock>> {
        let output = &self.config.output;
        let mut dirs = vec![&output.dir];
        if output.scratch_dir != output.dir {
            dirs.push(&output.scratch_dir);
        }

        dirs.into_iter()
            .map(|dir| {
                RunLock::acquire(dir, self.run_id).map_err(|source| ArchiveError::RunLock {
                    path: dir.clone(),
                    source,
                })
            })
            .collect()
    }

    /// Delete what killed runs left in the scratch and output directories.
    async fn reclaim_abandoned(&self) {
        let scratch = self.config.output.scratch_dir.clone();
        let output = self.config.output.dir.clone();
        let run_id = self.run_id;

        match tokio::task::spawn_blocking(move || reclaim_abandoned(&scratch, &output, run_id)).await {
            Ok(Ok(reclaimed)) if reclaimed.is_empty() => {}
            Ok(Ok(reclaimed)) => {
                for path in reclaimed.staging_dirs.iter().chain(&reclaimed.partials) {
                    debug!(path = %path.display(), "Removed leftover of abandoned run");
                }
                info!(
                    staging_dirs = reclaimed.staging_dirs.len(),
                    partials = reclaimed.partials.len(),
                    "Reclaimed leftovers of abandoned runs"
                );
            }
            Ok(Err(e)) => warn!(error = %e, "Failed to reclaim leftovers of abandoned runs"),
            Err(e) => warn!(error = %e, "Reclaim task failed"),
        }
    }

    /// Whole-slice retry with exponential backoff. Only transport failures
    /// are retried.
    async fn process_with_retry(&self, slice: TimeSlice) -> SliceOutcome {
        let retry = &self.config.retry;
        let mut delay = retry.initial_delay();
        let mut attempt = 1;

        loop {
            let outcome = self.pipeline.process(slice, self.run_id).await;

            let retryable = outcome.failure().is_some_and(|f| f.error.is_retryable());
            if !retryable || attempt >= retry.max_attempts {
                return outcome;
            }

            warn!(
                slice = %slice,
                attempt = attempt,
                max_attempts = retry.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Transport failure, retrying slice"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(slice = %slice, "Run cancelled, not retrying");
                    return outcome;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            delay = std::cmp::min(delay * 2, retry.max_delay());
            attempt += 1;
        }
    }
}
