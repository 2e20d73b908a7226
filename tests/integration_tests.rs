//! Integration tests for BuildOrchestrator
//!
//! These tests drive complete runs against a mock release server and local
//! base images, checking stage transitions, callback ordering, partial
//! failure handling and the files left in the work directory.

use skyimager::bootparams;
use skyimager::builder::{read_boot_params, ImageBuilder, ImageWriter};
use skyimager::config::ImagerSettings;
use skyimager::error::ImagerError;
use skyimager::fetch::ImageFetcher;
use skyimager::models::{ArtifactStatus, BootIndex, BootParams, BuildArtifact, BuildConfig, RunStatus};
use skyimager::orchestrator::{
    BuildEvent, BuildManifest, BuildObserver, BuildOrchestrator, BuildStage, ChannelObserver,
};
use skyimager::release::ReleaseCatalog;
use sha2::{Digest, Sha256};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};

const UNREACHABLE_API: &str = "http://127.0.0.1:9/releases";

/// Records every callback as a short string.
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn stages(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| e.strip_prefix("stage:").map(str::to_string))
            .collect()
    }

    fn progress(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| e.strip_prefix("progress:").map(str::to_string))
            .collect()
    }

    fn errors(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.starts_with("error:"))
            .collect()
    }
}

impl BuildObserver for Recorder {
    fn on_stage(&self, stage: BuildStage) {
        self.events.lock().unwrap().push(format!("stage:{}", stage));
    }

    fn on_progress(&self, _stage: BuildStage, detail: &str) {
        self.events.lock().unwrap().push(format!("progress:{}", detail));
    }

    fn on_error(&self, err: &ImagerError) {
        self.events.lock().unwrap().push(format!("error:{}", err.kind()));
    }

    fn on_artifact(&self, artifact: &BuildArtifact) {
        self.events
            .lock()
            .unwrap()
            .push(format!("artifact:{}:{:?}", artifact.index, artifact.status));
    }
}

/// Fails every unit.
struct BrokenWriter;

impl ImageWriter for BrokenWriter {
    fn build(&self, _base: &Path, params: &BootParams, _dest: &Path) -> Result<BuildArtifact, ImagerError> {
        Err(ImagerError::Build(format!("no space left for image {}", params.index)))
    }
}

/// Real builder, except for the listed indexes.
struct FlakyWriter {
    fail: Vec<BootIndex>,
}

impl ImageWriter for FlakyWriter {
    fn build(&self, base: &Path, params: &BootParams, dest: &Path) -> Result<BuildArtifact, ImagerError> {
        if self.fail.contains(&params.index) {
            return Err(ImagerError::Build(format!("simulated failure for {}", params.index)));
        }
        ImageBuilder::new().build(base, params, dest)
    }
}

/// Real builder that holds every unit until released.
struct GatedWriter {
    open: Arc<AtomicBool>,
}

impl ImageWriter for GatedWriter {
    fn build(&self, base: &Path, params: &BootParams, dest: &Path) -> Result<BuildArtifact, ImagerError> {
        while !self.open.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(5));
        }
        ImageBuilder::new().build(base, params, dest)
    }
}

fn settings(api: &str) -> ImagerSettings {
    ImagerSettings {
        release_api_url: api.to_string(),
        network_timeout_secs: 5,
        download_attempts: 1,
        retry_delay_ms: 10,
        max_workers: Some(2),
        ..ImagerSettings::default()
    }
}

fn orchestrator(
    api: &str,
    writer: Arc<dyn ImageWriter>,
    observer: Arc<dyn BuildObserver>,
    cancel: watch::Receiver<bool>,
) -> BuildOrchestrator {
    let settings = settings(api);
    let client = reqwest::Client::new();
    let catalog = ReleaseCatalog::from_settings(&settings, client.clone()).unwrap();
    let fetcher = ImageFetcher::from_settings(&settings, client).unwrap();
    BuildOrchestrator::new(
        settings,
        Arc::new(catalog),
        Arc::new(fetcher),
        writer,
        observer,
        cancel,
    )
}

fn no_cancel() -> watch::Receiver<bool> {
    skyimager::net::never_cancel()
}

/// Disk image with a valid MBR signature and some payload.
fn base_image_bytes() -> Vec<u8> {
    let mut data = vec![0u8; 8192];
    data[510] = 0x55;
    data[511] = 0xAA;
    for (i, b) in data[512..].iter_mut().enumerate() {
        *b = (i % 199) as u8;
    }
    data
}

fn write_base_image(dir: &Path) -> PathBuf {
    let path = dir.join("Skybian-local.img");
    std::fs::write(&path, base_image_bytes()).unwrap();
    path
}

fn config(work_dir: &Path, base: &str, visors: u32, hypervisor: bool) -> BuildConfig {
    BuildConfig::new(work_dir, base)
        .with_visors(visors)
        .with_hypervisor(hypervisor)
        .with_gateway(Some(Ipv4Addr::new(192, 168, 0, 1)))
        .with_key_seed("5eed")
}

fn release_listing(server_url: &str) -> String {
    format!(
        r#"[
            {{
                "tag_name": "v0.1.0",
                "published_at": "2020-06-01T00:00:00Z",
                "draft": false,
                "assets": [
                    {{"name": "Skybian-v0.1.0.img", "browser_download_url": "{url}/dl/v0.1.0/Skybian-v0.1.0.img", "size": 8192}},
                    {{"name": "Skybian-v0.1.0.img.sha256", "browser_download_url": "{url}/dl/v0.1.0/Skybian-v0.1.0.img.sha256", "size": 64}}
                ]
            }},
            {{
                "tag_name": "v0.0.9",
                "published_at": "2020-01-01T00:00:00Z",
                "draft": false,
                "assets": [
                    {{"name": "Skybian-v0.0.9.img", "browser_download_url": "{url}/dl/v0.0.9/Skybian-v0.0.9.img", "size": 8192}}
                ]
            }}
        ]"#,
        url = server_url
    )
}

#[tokio::test]
async fn test_full_pipeline_from_latest_release() {
    let mut server = mockito::Server::new_async().await;
    let image = base_image_bytes();
    let sha = hex::encode(Sha256::digest(&image));

    server
        .mock("GET", "/releases")
        .with_status(200)
        .with_body(release_listing(&server.url()))
        .create_async()
        .await;
    let download = server
        .mock("GET", "/dl/v0.1.0/Skybian-v0.1.0.img")
        .with_status(200)
        .with_body(image.clone())
        .expect(1)
        .create_async()
        .await;
    server
        .mock("GET", "/dl/v0.1.0/Skybian-v0.1.0.img.sha256")
        .with_status(200)
        .with_body(format!("{}  Skybian-v0.1.0.img\n", sha))
        .create_async()
        .await;

    let work = TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::default());
    let orch = orchestrator(
        &format!("{}/releases", server.url()),
        Arc::new(ImageBuilder::new()),
        recorder.clone(),
        no_cancel(),
    );

    let cfg = config(work.path(), "latest", 2, true);
    let report = orch.run(&cfg).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.base_image, work.path().join("Skybian-v0.1.0.img"));
    assert_eq!(report.succeeded(), 3);
    assert_eq!(report.summary, "3 image(s) built");
    assert_eq!(
        recorder.stages(),
        vec!["validating-config", "fetching-base", "generating-params", "building", "completed"]
    );
    assert!(recorder.errors().is_empty());
    assert_eq!(orch.current_stage().await, BuildStage::Completed);

    let expected = bootparams::generate(&cfg).unwrap();
    let indexes: Vec<_> = report.artifacts.iter().map(|a| a.index).collect();
    assert_eq!(
        indexes,
        vec![BootIndex::Visor(0), BootIndex::Visor(1), BootIndex::Hypervisor]
    );
    for (artifact, params) in report.artifacts.iter().zip(&expected) {
        assert_eq!(artifact.path, work.path().join("images").join(params.index.file_name()));
        assert_eq!(&read_boot_params(&artifact.path).unwrap(), params);
    }

    let manifest = BuildManifest::load(&work.path().join("images")).unwrap();
    assert_eq!(manifest.status, RunStatus::Completed);
    assert_eq!(manifest.entries.len(), 3);
    assert_eq!(manifest.base_image_sha256, sha);
    assert!(manifest.stale_images.is_empty());

    download.assert_async().await;
}

#[tokio::test]
async fn test_second_run_reuses_downloaded_base_image() {
    let mut server = mockito::Server::new_async().await;
    let image = base_image_bytes();
    let sha = hex::encode(Sha256::digest(&image));

    server
        .mock("GET", "/releases")
        .with_status(200)
        .with_body(release_listing(&server.url()))
        .create_async()
        .await;
    let download = server
        .mock("GET", "/dl/v0.1.0/Skybian-v0.1.0.img")
        .with_status(200)
        .with_body(image)
        .expect(1)
        .create_async()
        .await;
    server
        .mock("GET", "/dl/v0.1.0/Skybian-v0.1.0.img.sha256")
        .with_status(200)
        .with_body(sha)
        .create_async()
        .await;

    let work = TempDir::new().unwrap();
    let orch = orchestrator(
        &format!("{}/releases", server.url()),
        Arc::new(ImageBuilder::new()),
        Arc::new(Recorder::default()),
        no_cancel(),
    );
    let cfg = config(work.path(), "v0.1.0", 1, false);

    let first = orch.run(&cfg).await.unwrap();
    let second = orch.run(&cfg).await.unwrap();
    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(
        read_boot_params(&first.artifacts[0].path).unwrap(),
        bootparams::generate(&cfg).unwrap()[0]
    );
    download.assert_async().await;
}

#[tokio::test]
async fn test_empty_catalog_fails_during_fetch() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/releases")
        .with_status(200)
        .with_body("[]")
        .create_async()
        .await;

    let work = TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::default());
    let orch = orchestrator(
        &format!("{}/releases", server.url()),
        Arc::new(ImageBuilder::new()),
        recorder.clone(),
        no_cancel(),
    );

    let err = orch.run(&config(work.path(), "latest", 3, true)).await.unwrap_err();
    assert!(matches!(err, ImagerError::EmptyCatalog(_)));
    assert_eq!(
        recorder.stages(),
        vec!["validating-config", "fetching-base", "failed"]
    );

    // Exactly one error, reported before the transition to Failed.
    let events = recorder.events();
    assert_eq!(recorder.errors(), vec!["error:empty-catalog".to_string()]);
    let error_at = events.iter().position(|e| e == "error:empty-catalog").unwrap();
    let failed_at = events.iter().position(|e| e == "stage:failed").unwrap();
    assert!(error_at < failed_at);
    assert!(!work.path().join("images").exists());
}

#[tokio::test]
async fn test_unknown_release_tag() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/releases")
        .with_status(200)
        .with_body(release_listing(&server.url()))
        .create_async()
        .await;

    let work = TempDir::new().unwrap();
    let orch = orchestrator(
        &format!("{}/releases", server.url()),
        Arc::new(ImageBuilder::new()),
        Arc::new(Recorder::default()),
        no_cancel(),
    );
    let err = orch.run(&config(work.path(), "v9.9.9", 1, false)).await.unwrap_err();
    assert!(matches!(err, ImagerError::InvalidConfig(_)));
    assert_eq!(orch.current_stage().await, BuildStage::Failed);
}

#[tokio::test]
async fn test_release_server_down() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/releases")
        .with_status(503)
        .create_async()
        .await;

    let work = TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::default());
    let orch = orchestrator(
        &format!("{}/releases", server.url()),
        Arc::new(ImageBuilder::new()),
        recorder.clone(),
        no_cancel(),
    );
    let err = orch.run(&config(work.path(), "latest", 1, true)).await.unwrap_err();
    assert!(matches!(err, ImagerError::Network(_)));
    assert!(err.is_retryable());
    assert_eq!(recorder.errors(), vec!["error:network".to_string()]);
}

#[tokio::test]
async fn test_invalid_config_never_touches_network() {
    let mut server = mockito::Server::new_async().await;
    let listing = server
        .mock("GET", "/releases")
        .with_status(200)
        .with_body("[]")
        .expect(0)
        .create_async()
        .await;

    let work = TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::default());
    let orch = orchestrator(
        &format!("{}/releases", server.url()),
        Arc::new(ImageBuilder::new()),
        recorder.clone(),
        no_cancel(),
    );

    let cfg = config(work.path(), "latest", 3, true).with_gateway(None);
    let err = orch.run(&cfg).await.unwrap_err();
    assert!(matches!(err, ImagerError::InvalidConfig(_)));
    assert_eq!(recorder.stages(), vec!["validating-config", "failed"]);
    assert_eq!(recorder.errors(), vec!["error:invalid-config".to_string()]);
    listing.assert_async().await;
}

#[tokio::test]
async fn test_all_builds_fail() {
    let src = TempDir::new().unwrap();
    let base = write_base_image(src.path());
    let work = TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::default());
    let orch = orchestrator(UNREACHABLE_API, Arc::new(BrokenWriter), recorder.clone(), no_cancel());

    let report = orch
        .run(&config(work.path(), base.to_str().unwrap(), 2, true))
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.artifacts.len(), 3);
    assert!(report
        .artifacts
        .iter()
        .all(|a| a.status == ArtifactStatus::Failed && a.error.is_some()));
    assert_eq!(report.summary, "all 3 image builds failed");
    assert_eq!(recorder.errors(), vec!["error:build".to_string()]);
    assert_eq!(recorder.stages().last().map(String::as_str), Some("failed"));
    assert_eq!(orch.current_stage().await, BuildStage::Failed);

    let artifact_events = recorder
        .events()
        .into_iter()
        .filter(|e| e.starts_with("artifact:"))
        .count();
    assert_eq!(artifact_events, 3);
}

#[tokio::test]
async fn test_partial_failure_is_isolated() {
    let src = TempDir::new().unwrap();
    let base = write_base_image(src.path());
    let work = TempDir::new().unwrap();
    let writer = FlakyWriter {
        fail: vec![BootIndex::Visor(1)],
    };
    let orch = orchestrator(
        UNREACHABLE_API,
        Arc::new(writer),
        Arc::new(Recorder::default()),
        no_cancel(),
    );

    let cfg = config(work.path(), base.to_str().unwrap(), 2, true);
    let report = orch.run(&cfg).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.succeeded(), 2);
    assert_eq!(report.failed(), 1);
    assert!(report.summary.contains("1 failed"));

    let failed = &report.artifacts[1];
    assert_eq!(failed.index, BootIndex::Visor(1));
    assert!(failed.error.as_deref().unwrap().contains("simulated failure"));
    assert!(!failed.path.exists());

    for artifact in report.artifacts.iter().filter(|a| a.is_success()) {
        assert!(read_boot_params(&artifact.path).is_ok());
    }

    let manifest = BuildManifest::load(&cfg.images_dir()).unwrap();
    assert_eq!(manifest.artifacts, report.artifacts);
}

#[tokio::test]
async fn test_zero_units_completes() {
    let src = TempDir::new().unwrap();
    let base = write_base_image(src.path());
    let work = TempDir::new().unwrap();
    let orch = orchestrator(
        UNREACHABLE_API,
        Arc::new(ImageBuilder::new()),
        Arc::new(Recorder::default()),
        no_cancel(),
    );

    let report = orch
        .run(&config(work.path(), base.to_str().unwrap(), 0, false))
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert!(report.artifacts.is_empty());
    assert_eq!(report.summary, "no images requested");
}

#[tokio::test]
async fn test_cancelled_units_are_recorded() {
    let src = TempDir::new().unwrap();
    let base = write_base_image(src.path());
    let work = TempDir::new().unwrap();
    let (_tx, cancel) = watch::channel(true);
    let orch = orchestrator(
        UNREACHABLE_API,
        Arc::new(ImageBuilder::new()),
        Arc::new(Recorder::default()),
        cancel,
    );

    let report = orch
        .run(&config(work.path(), base.to_str().unwrap(), 2, false))
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Failed);
    assert!(report
        .artifacts
        .iter()
        .all(|a| a.error.as_deref().unwrap_or("").contains("cancelled")));
}

#[tokio::test]
async fn test_concurrent_run_on_same_directory_rejected() {
    let src = TempDir::new().unwrap();
    let base = write_base_image(src.path());
    let work = TempDir::new().unwrap();
    let open = Arc::new(AtomicBool::new(false));

    let first = Arc::new(orchestrator(
        UNREACHABLE_API,
        Arc::new(GatedWriter { open: open.clone() }),
        Arc::new(Recorder::default()),
        no_cancel(),
    ));
    let cfg = config(work.path(), base.to_str().unwrap(), 1, false);

    let running = {
        let first = first.clone();
        let cfg = cfg.clone();
        tokio::spawn(async move { first.run(&cfg).await })
    };

    for _ in 0..200 {
        if first.current_stage().await == BuildStage::Building {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(first.current_stage().await, BuildStage::Building);

    let recorder = Arc::new(Recorder::default());
    let second = orchestrator(
        UNREACHABLE_API,
        Arc::new(ImageBuilder::new()),
        recorder.clone(),
        no_cancel(),
    );
    let err = second.run(&cfg).await.unwrap_err();
    assert!(matches!(err, ImagerError::AlreadyRunning(_)));
    assert_eq!(recorder.errors(), vec!["error:already-running".to_string()]);
    assert_eq!(second.current_stage().await, BuildStage::Idle);

    open.store(true, Ordering::SeqCst);
    let report = running.await.unwrap().unwrap();
    assert_eq!(report.status, RunStatus::Completed);

    // The directory is free again once the first run is over.
    let again = second.run(&cfg).await.unwrap();
    assert_eq!(again.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_channel_observer_receives_run_events() {
    let src = TempDir::new().unwrap();
    let base = write_base_image(src.path());
    let work = TempDir::new().unwrap();
    let (tx, mut rx) = mpsc::channel(256);
    let orch = orchestrator(
        UNREACHABLE_API,
        Arc::new(ImageBuilder::new()),
        Arc::new(ChannelObserver::new(tx)),
        no_cancel(),
    );

    orch.run(&config(work.path(), base.to_str().unwrap(), 1, true))
        .await
        .unwrap();
    drop(orch);

    let mut stages = Vec::new();
    let mut artifacts = 0;
    while let Ok(event) = rx.try_recv() {
        match event {
            BuildEvent::Stage(stage) => stages.push(stage),
            BuildEvent::Artifact(_) => artifacts += 1,
            BuildEvent::Error(e) => panic!("unexpected error event: {}", e),
            BuildEvent::Progress(..) => {}
        }
    }
    assert_eq!(stages.first(), Some(&BuildStage::ValidatingConfig));
    assert_eq!(stages.last(), Some(&BuildStage::Completed));
    assert_eq!(artifacts, 2);
}

#[tokio::test]
async fn test_dropped_run_does_not_block_the_next_one() {
    let src = TempDir::new().unwrap();
    let base = write_base_image(src.path());
    let work = TempDir::new().unwrap();
    let open = Arc::new(AtomicBool::new(false));
    let recorder = Arc::new(Recorder::default());
    let orch = orchestrator(
        UNREACHABLE_API,
        Arc::new(GatedWriter { open: open.clone() }),
        recorder.clone(),
        no_cancel(),
    );
    let cfg = config(work.path(), base.to_str().unwrap(), 1, false);

    // The gate is closed, so the run can only end by being dropped.
    let abandoned = tokio::time::timeout(Duration::from_millis(500), orch.run(&cfg)).await;
    assert!(abandoned.is_err());
    assert_eq!(orch.current_stage().await, BuildStage::Building);

    open.store(true, Ordering::SeqCst);
    let report = orch.run(&cfg).await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(orch.current_stage().await, BuildStage::Completed);
    assert!(recorder.errors().is_empty());
}

#[tokio::test]
async fn test_smaller_rerun_reports_leftover_images() {
    let src = TempDir::new().unwrap();
    let base = write_base_image(src.path());
    let work = TempDir::new().unwrap();
    let recorder = Arc::new(Recorder::default());
    let orch = orchestrator(
        UNREACHABLE_API,
        Arc::new(ImageBuilder::new()),
        recorder.clone(),
        no_cancel(),
    );

    let larger = config(work.path(), base.to_str().unwrap(), 3, false);
    orch.run(&larger).await.unwrap();
    assert!(recorder.progress().iter().all(|p| !p.contains("earlier run")));

    let smaller = config(work.path(), base.to_str().unwrap(), 1, false);
    let report = orch.run(&smaller).await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.artifacts.len(), 1);

    let images = smaller.images_dir();
    let manifest = BuildManifest::load(&images).unwrap();
    assert_eq!(manifest.artifacts.len(), 1);
    assert_eq!(
        manifest.stale_images,
        vec![images.join("1.img"), images.join("2.img")]
    );
    assert!(recorder
        .progress()
        .iter()
        .any(|p| p.contains("2 image(s) from an earlier run")));
}
