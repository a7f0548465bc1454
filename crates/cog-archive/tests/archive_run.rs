//! End-to-end runs against the fake WCS server and simulated GDAL tools.

mod common;

use std::sync::Arc;
use std::time::Duration;

use cog_archive::catalog::read_catalog;
use cog_archive::staging::RunLock;
use cog_archive::{
    ArchiveConfig, CogPackager, FetchError, PackageError, PipelineError, RunOrchestrator,
    SliceOutcome, SlicePipeline, Stage, TagError, WcsFetcher,
};
use uuid::Uuid;
use common::{slices, test_config, FakeFetcher, FakeGdal, Step};
use test_utils::{assert_no_files, list_files, ArchiveDirs, FakeWcs};
use tokio_test::assert_ok;

fn orchestrator_with_wcs(config: ArchiveConfig, wcs: &FakeWcs, gdal: &Arc<FakeGdal>) -> RunOrchestrator {
    let mut config = config;
    config.coverage.base_url = wcs.base_url();
    let fetcher = Arc::new(WcsFetcher::new(config.coverage.clone()).unwrap());
    let pipeline = SlicePipeline::new(&config, fetcher, gdal.clone());
    RunOrchestrator::new(Arc::new(config), pipeline)
}

fn orchestrator_with_fetcher(
    config: ArchiveConfig,
    fetcher: &Arc<FakeFetcher>,
    gdal: &Arc<FakeGdal>,
) -> RunOrchestrator {
    let pipeline = SlicePipeline::new(&config, fetcher.clone(), gdal.clone());
    RunOrchestrator::new(Arc::new(config), pipeline)
}

#[tokio::test]
async fn test_two_slices_end_to_end() {
    let dirs = ArchiveDirs::new();
    let wcs = FakeWcs::start().await;
    let gdal = FakeGdal::new();
    let orchestrator = orchestrator_with_wcs(test_config(&dirs), &wcs, &gdal);

    let summary = assert_ok!(orchestrator.run(slices(&[2021, 2020])).await);

    assert!(summary.is_success());
    assert_eq!(summary.outcomes.len(), 2);
    for outcome in summary.outcomes.values() {
        assert!(matches!(outcome, SliceOutcome::Succeeded(_)));
    }

    let catalog = read_catalog(&summary.catalog_path).await.unwrap();
    let ids: Vec<&str> = catalog.features.iter().map(|f| f.id.as_str()).collect();
    assert_eq!(ids, vec!["permanentgreenland_2020", "permanentgreenland_2021"]);

    for (feature, outcome) in catalog.features.iter().zip(summary.outcomes.values()) {
        let artifact = outcome.artifact().unwrap();
        let href = &feature.data_asset().unwrap().href;
        assert_eq!(href, &artifact.file_name());
        assert!(dirs.output().join(href).exists());
    }

    // Tags travelled into the packaged file.
    let cog = std::fs::read_to_string(dirs.output().join("permanentgreenland_2020.tif")).unwrap();
    assert!(cog.starts_with("COG"));
    assert!(cog.contains(r#"<MDI key="YEAR">2020</MDI>"#));
    assert!(cog.contains(r#"<MDI key="NAME">sse26</MDI>"#));

    assert_no_files!(dirs.scratch());
    assert_eq!(list_files(dirs.output()).len(), 3);
}

#[tokio::test]
async fn test_http_500_fails_only_that_slice() {
    let dirs = ArchiveDirs::new();
    let wcs = FakeWcs::start().await;
    wcs.fail_slice(2021, 500);
    let gdal = FakeGdal::new();
    let orchestrator = orchestrator_with_wcs(test_config(&dirs), &wcs, &gdal);

    let summary = orchestrator.run(slices(&[2020, 2021])).await.unwrap();

    assert!(!summary.is_success());
    let outcomes: Vec<_> = summary.outcomes.iter().collect();
    assert!(matches!(outcomes[0].1, SliceOutcome::Succeeded(_)));
    match outcomes[1].1 {
        SliceOutcome::Failed(failure) => {
            assert_eq!(failure.stage, Stage::Fetching);
            assert!(matches!(
                failure.error,
                PipelineError::Fetch(FetchError::Status { status: 500, .. })
            ));
        }
        other => panic!("expected 2021 to fail, got {:?}", other),
    }

    // Status errors are not retried.
    assert_eq!(wcs.requests().iter().filter(|&&y| y == 2021).count(), 1);

    let catalog = read_catalog(&summary.catalog_path).await.unwrap();
    assert_eq!(catalog.features.len(), 1);
    assert_eq!(catalog.features[0].id, "permanentgreenland_2020");

    assert!(!dirs.output().join("permanentgreenland_2021.tif").exists());
    assert_no_files!(dirs.scratch());
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let dirs = ArchiveDirs::new();
    let wcs = FakeWcs::start().await;
    let gdal = FakeGdal::new();

    let first = orchestrator_with_wcs(test_config(&dirs), &wcs, &gdal);
    first.run(slices(&[2020, 2021])).await.unwrap();
    let requests = wcs.request_count();
    let writes = gdal.writes();
    let before = std::fs::read(dirs.output().join("permanentgreenland_2020.tif")).unwrap();

    let second = orchestrator_with_wcs(test_config(&dirs), &wcs, &gdal);
    let summary = second.run(slices(&[2020, 2021])).await.unwrap();

    assert!(summary.is_success());
    for outcome in summary.outcomes.values() {
        assert!(matches!(outcome, SliceOutcome::AlreadyComplete(_)));
    }
    assert_eq!(wcs.request_count(), requests);
    assert_eq!(gdal.writes(), writes);
    assert_eq!(
        std::fs::read(dirs.output().join("permanentgreenland_2020.tif")).unwrap(),
        before
    );

    // Already complete slices stay in the catalog.
    let catalog = read_catalog(&summary.catalog_path).await.unwrap();
    assert_eq!(catalog.features.len(), 2);
}

#[tokio::test]
async fn test_invalid_existing_artifact_is_rebuilt() {
    let dirs = ArchiveDirs::new();
    let fetcher = FakeFetcher::new();
    let gdal = FakeGdal::new();
    std::fs::create_dir_all(dirs.output()).unwrap();
    let final_path = dirs.output().join("permanentgreenland_2020.tif");
    std::fs::write(&final_path, b"truncated").unwrap();

    let orchestrator = orchestrator_with_fetcher(test_config(&dirs), &fetcher, &gdal);
    let summary = orchestrator.run(slices(&[2020])).await.unwrap();

    assert!(matches!(
        summary.outcomes.values().next(),
        Some(SliceOutcome::Succeeded(_))
    ));
    assert_eq!(fetcher.attempts(2020), 1);
    assert!(std::fs::read_to_string(&final_path).unwrap().starts_with("COG"));
}

#[tokio::test]
async fn test_untagged_existing_artifact_is_rebuilt() {
    let dirs = ArchiveDirs::new();
    let fetcher = FakeFetcher::new();
    let gdal = FakeGdal::new();
    std::fs::create_dir_all(dirs.output()).unwrap();
    let final_path = dirs.output().join("permanentgreenland_2020.tif");
    // Structurally a valid six-band COG, but without any tags.
    std::fs::write(&final_path, b"COG\nRAW bands=6\n").unwrap();

    let orchestrator = orchestrator_with_fetcher(test_config(&dirs), &fetcher, &gdal);
    let summary = orchestrator.run(slices(&[2020])).await.unwrap();

    assert!(matches!(
        summary.outcomes.values().next(),
        Some(SliceOutcome::Succeeded(_))
    ));
    assert_eq!(fetcher.attempts(2020), 1);
    let cog = std::fs::read_to_string(&final_path).unwrap();
    assert!(cog.contains(r#"<MDI key="YEAR">2020</MDI>"#));
}

#[tokio::test]
async fn test_existing_artifact_tagged_for_another_slice_is_rebuilt() {
    let dirs = ArchiveDirs::new();
    let fetcher = FakeFetcher::new();
    let gdal = FakeGdal::new();

    let first = orchestrator_with_fetcher(test_config(&dirs), &fetcher, &gdal);
    first.run(slices(&[2019])).await.unwrap();
    std::fs::copy(
        dirs.output().join("permanentgreenland_2019.tif"),
        dirs.output().join("permanentgreenland_2020.tif"),
    )
    .unwrap();

    let second = orchestrator_with_fetcher(test_config(&dirs), &fetcher, &gdal);
    let summary = second.run(slices(&[2019, 2020])).await.unwrap();

    let labels: Vec<&str> = summary.outcomes.values().map(SliceOutcome::label).collect();
    assert_eq!(labels, vec!["already_complete", "succeeded"]);
    assert_eq!(fetcher.attempts(2020), 1);
}

#[tokio::test]
async fn test_packaging_that_loses_tags_fails() {
    let dirs = ArchiveDirs::new();
    let fetcher = FakeFetcher::new();
    let gdal = FakeGdal::new();
    gdal.drop_tags();

    let orchestrator = orchestrator_with_fetcher(test_config(&dirs), &fetcher, &gdal);
    let summary = orchestrator.run(slices(&[2020])).await.unwrap();
    let failure = summary.failed()[0].1;

    assert_eq!(failure.stage, Stage::Packaging);
    match &failure.error {
        PipelineError::Package(PackageError::Invalid { problems, .. }) => {
            assert!(problems.contains(&"missing tag YEAR".to_string()));
            assert!(problems.contains(&"band 1: missing tag NAME".to_string()));
        }
        other => panic!("expected a validation failure, got {:?}", other),
    }
    assert!(!dirs.output().join("permanentgreenland_2020.tif").exists());
    assert_no_files!(dirs.scratch());
}

/// Files a killed run `run_id` leaves behind for slice 2020.
fn leave_crash_leftovers(dirs: &ArchiveDirs, run_id: Uuid) -> (std::path::PathBuf, std::path::PathBuf) {
    let final_path = dirs.output().join("permanentgreenland_2020.tif");
    let partial = CogPackager::partial_path(&final_path, run_id);
    let staged = dirs.scratch().join(run_id.to_string()).join("2020");
    std::fs::create_dir_all(&staged).unwrap();
    std::fs::create_dir_all(dirs.output()).unwrap();
    std::fs::write(&partial, b"COG\nhalf").unwrap();
    std::fs::write(staged.join("raw.tif"), b"RAW bands=6\n").unwrap();
    (partial, staged.join("raw.tif"))
}

#[tokio::test]
async fn test_leftovers_of_killed_runs_are_reclaimed() {
    let dirs = ArchiveDirs::new();
    let fetcher = FakeFetcher::new();
    let gdal = FakeGdal::new();
    let (partial, raw) = leave_crash_leftovers(&dirs, Uuid::new_v4());

    let orchestrator = orchestrator_with_fetcher(test_config(&dirs), &fetcher, &gdal);
    let summary = orchestrator.run(slices(&[2020])).await.unwrap();

    assert!(summary.is_success());
    assert!(!partial.exists());
    assert!(!raw.exists());
    assert_no_files!(dirs.scratch());
    assert_eq!(
        list_files(dirs.output()),
        vec![
            dirs.output().join("permanentgreenland_2020.tif"),
            dirs.output().join("stac_catalog.json")
        ]
    );
}

#[tokio::test]
async fn test_files_of_live_runs_are_left_alone() {
    let dirs = ArchiveDirs::new();
    let fetcher = FakeFetcher::new();
    let gdal = FakeGdal::new();
    let other_run = Uuid::new_v4();
    let (partial, raw) = leave_crash_leftovers(&dirs, other_run);
    let output_lock = RunLock::acquire(&dirs.output(), other_run).unwrap();
    let scratch_lock = RunLock::acquire(&dirs.scratch(), other_run).unwrap();

    let orchestrator = orchestrator_with_fetcher(test_config(&dirs), &fetcher, &gdal);
    let summary = orchestrator.run(slices(&[2020])).await.unwrap();

    assert!(summary.is_success());
    assert!(partial.exists());
    assert!(raw.exists());

    output_lock.release();
    scratch_lock.release();
}

async fn run_with_failing_step(step: Step) -> (ArchiveDirs, SliceOutcome) {
    let dirs = ArchiveDirs::new();
    let fetcher = FakeFetcher::new();
    let gdal = FakeGdal::new();
    gdal.fail(step);

    let orchestrator = orchestrator_with_fetcher(test_config(&dirs), &fetcher, &gdal);
    let mut summary = orchestrator.run(slices(&[2020])).await.unwrap();
    let outcome = summary.outcomes.pop_first().unwrap().1;
    (dirs, outcome)
}

#[tokio::test]
async fn test_induced_failures_leave_nothing_behind() {
    let cases = [
        (Step::Tile, Stage::Building),
        (Step::Overviews, Stage::Building),
        (Step::Inspect, Stage::Tagging),
        (Step::Package, Stage::Packaging),
    ];

    for (step, expected_stage) in cases {
        let (dirs, outcome) = run_with_failing_step(step).await;

        let failure = outcome
            .failure()
            .unwrap_or_else(|| panic!("{:?} should fail the slice", step));
        assert_eq!(failure.stage, expected_stage, "failing step {:?}", step);
        assert!(!failure.error.is_retryable());

        assert!(!dirs.output().join("permanentgreenland_2020.tif").exists());
        assert_no_files!(dirs.scratch());
        // Only the (empty) catalog is left in the output directory.
        assert_eq!(
            list_files(dirs.output()),
            vec![dirs.output().join("stac_catalog.json")]
        );
    }
}

#[tokio::test]
async fn test_band_count_mismatch_is_fatal() {
    let dirs = ArchiveDirs::new();
    let wcs = FakeWcs::start().await;
    wcs.set_bands(2020, 5);
    let gdal = FakeGdal::new();
    let orchestrator = orchestrator_with_wcs(test_config(&dirs), &wcs, &gdal);

    let summary = orchestrator.run(slices(&[2020])).await.unwrap();
    let failure = summary.failed()[0].1;

    assert_eq!(failure.stage, Stage::Tagging);
    assert!(matches!(
        failure.error,
        PipelineError::Tag(TagError::BandCountMismatch {
            expected: 6,
            found: 5
        })
    ));
    assert_eq!(wcs.request_count(), 1);
    assert_eq!(gdal.count(Step::Package), 0);
    assert_no_files!(dirs.scratch());
}

#[tokio::test]
async fn test_packaged_file_must_pass_validation() {
    let dirs = ArchiveDirs::new();
    let fetcher = FakeFetcher::new();
    let gdal = FakeGdal::new();
    gdal.break_cog_layout();

    let orchestrator = orchestrator_with_fetcher(test_config(&dirs), &fetcher, &gdal);
    let summary = orchestrator.run(slices(&[2020])).await.unwrap();
    let failure = summary.failed()[0].1;

    assert_eq!(failure.stage, Stage::Packaging);
    assert!(matches!(
        failure.error,
        PipelineError::Package(PackageError::Invalid { .. })
    ));
    assert!(!dirs.output().join("permanentgreenland_2020.tif").exists());
    assert_no_files!(dirs.scratch());
}

#[tokio::test]
async fn test_catalog_order_is_independent_of_completion_order() {
    let dirs = ArchiveDirs::new();
    let fetcher = FakeFetcher::new();
    // Earlier years finish last.
    for (i, year) in (2017..=2020).enumerate() {
        fetcher.delay(year, Duration::from_millis(80 - 20 * i as u64));
    }
    let gdal = FakeGdal::new();
    let mut config = test_config(&dirs);
    config.processing.max_concurrent_slices = 4;

    let orchestrator = orchestrator_with_fetcher(config, &fetcher, &gdal);
    let summary = orchestrator.run(slices(&[2020, 2019, 2018, 2017])).await.unwrap();
    assert!(summary.is_success());

    let catalog = read_catalog(&summary.catalog_path).await.unwrap();
    let ids: Vec<String> = catalog.features.into_iter().map(|f| f.id).collect();
    assert_eq!(
        ids,
        vec![
            "permanentgreenland_2017",
            "permanentgreenland_2018",
            "permanentgreenland_2019",
            "permanentgreenland_2020"
        ]
    );
    assert_no_files!(dirs.scratch());
}

#[tokio::test]
async fn test_transport_failures_are_retried() {
    let dirs = ArchiveDirs::new();
    let fetcher = FakeFetcher::new();
    fetcher.drop_connection(2020, 2);
    let gdal = FakeGdal::new();

    let orchestrator = orchestrator_with_fetcher(test_config(&dirs), &fetcher, &gdal);
    let summary = orchestrator.run(slices(&[2020])).await.unwrap();

    assert!(summary.is_success());
    assert_eq!(fetcher.attempts(2020), 3);
    assert_no_files!(dirs.scratch());
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let dirs = ArchiveDirs::new();
    let fetcher = FakeFetcher::new();
    fetcher.drop_connection(2020, 10);
    let gdal = FakeGdal::new();
    let mut config = test_config(&dirs);
    config.retry.max_attempts = 2;

    let orchestrator = orchestrator_with_fetcher(config, &fetcher, &gdal);
    let summary = orchestrator.run(slices(&[2020])).await.unwrap();

    let failure = summary.failed()[0].1;
    assert_eq!(failure.stage, Stage::Fetching);
    assert!(failure.error.is_retryable());
    assert_eq!(fetcher.attempts(2020), 2);
}

#[tokio::test]
async fn test_cancellation_stops_new_slices() {
    let dirs = ArchiveDirs::new();
    let fetcher = FakeFetcher::new();
    let gdal = FakeGdal::new();

    let orchestrator = orchestrator_with_fetcher(test_config(&dirs), &fetcher, &gdal);
    fetcher.cancel_during(2020, orchestrator.cancellation_token());

    let summary = orchestrator.run(slices(&[2020, 2021, 2022])).await.unwrap();

    // The in-flight slice finishes; nothing new starts.
    assert!(matches!(
        summary.outcomes.values().next(),
        Some(SliceOutcome::Succeeded(_))
    ));
    assert_eq!(summary.outcomes.len(), 1);
    assert_eq!(
        summary.cancelled.iter().map(|s| s.year()).collect::<Vec<_>>(),
        vec![2021, 2022]
    );
    assert!(summary.is_success());
    assert_eq!(fetcher.total(), 1);

    let catalog = read_catalog(&summary.catalog_path).await.unwrap();
    assert_eq!(catalog.features.len(), 1);
    assert_no_files!(dirs.scratch());
}
