//! Build Orchestration: 5-stage image build pipeline
//! (ValidatingConfig -> FetchingBase -> GeneratingParams -> Building -> Completed|Failed).
//!
//! Config, catalog and fetch errors abort the run. Per-image build errors are
//! recorded in their artifact and only decide the final status when every
//! image failed.

pub mod events;
pub mod manifest;
pub mod state;

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use tokio::sync::{watch, RwLock, Semaphore};
use tokio::task::JoinSet;

pub use events::{BuildEvent, BuildObserver, ChannelObserver, LogObserver, NullObserver};
pub use manifest::{BuildManifest, ManifestEntry, MANIFEST_FILE};
pub use state::{BuildStage, OrchestrationState};

use crate::bootparams;
use crate::builder::{ImageBuilder, ImageWriter};
use crate::config::{validator, ImagerSettings};
use crate::error::ImagerError;
use crate::fetch::{self, ImageFetcher};
use crate::models::{
    BaseImageRef, BaseImageSource, BootIndex, BootParams, BuildArtifact, BuildConfig,
    BuildReport, RunStatus,
};
use crate::net;
use crate::release::ReleaseCatalog;

/// Work directories with a run in flight, process-wide.
static ACTIVE_RUNS: Lazy<Mutex<HashSet<PathBuf>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Holds a work directory in [`ACTIVE_RUNS`] until dropped.
struct RunGuard {
    dir: PathBuf,
}

impl RunGuard {
    fn acquire(dir: PathBuf) -> Result<Self, ImagerError> {
        let mut active = ACTIVE_RUNS
            .lock()
            .map_err(|_| ImagerError::Internal("run registry poisoned".to_string()))?;
        if !active.insert(dir.clone()) {
            return Err(ImagerError::AlreadyRunning(dir));
        }
        Ok(RunGuard { dir })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut active = ACTIVE_RUNS.lock().unwrap_or_else(|p| p.into_inner());
        active.remove(&self.dir);
    }
}

/// Marks an orchestrator busy for as long as one `run` future is alive.
struct InFlight<'a> {
    busy: &'a AtomicBool,
}

impl<'a> InFlight<'a> {
    fn enter(busy: &'a AtomicBool) -> Option<Self> {
        busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight { busy })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// Drives one build run at a time through the stage machine.
pub struct BuildOrchestrator {
    /// Shared state, readable while a run is in flight
    state: Arc<RwLock<OrchestrationState>>,

    catalog: Arc<ReleaseCatalog>,

    fetcher: Arc<ImageFetcher>,

    writer: Arc<dyn ImageWriter>,

    observer: Arc<dyn BuildObserver>,

    /// `true` cancels network work and units that have not started
    cancel_rx: watch::Receiver<bool>,

    settings: ImagerSettings,

    busy: AtomicBool,
}

impl BuildOrchestrator {
    pub fn new(
        settings: ImagerSettings,
        catalog: Arc<ReleaseCatalog>,
        fetcher: Arc<ImageFetcher>,
        writer: Arc<dyn ImageWriter>,
        observer: Arc<dyn BuildObserver>,
        cancel_rx: watch::Receiver<bool>,
    ) -> Self {
        BuildOrchestrator {
            state: Arc::new(RwLock::new(OrchestrationState::new())),
            catalog,
            fetcher,
            writer,
            observer,
            cancel_rx,
            settings,
            busy: AtomicBool::new(false),
        }
    }

    /// Wire the HTTP catalog, fetcher and image builder from settings.
    pub fn from_settings(
        settings: ImagerSettings,
        observer: Arc<dyn BuildObserver>,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<Self, ImagerError> {
        let client = net::http_client()?;
        let catalog = ReleaseCatalog::from_settings(&settings, client.clone())?;
        let fetcher = ImageFetcher::from_settings(&settings, client)?;
        Ok(BuildOrchestrator::new(
            settings,
            Arc::new(catalog),
            Arc::new(fetcher),
            Arc::new(ImageBuilder::new()),
            observer,
            cancel_rx,
        ))
    }

    pub fn catalog(&self) -> &ReleaseCatalog {
        &self.catalog
    }

    pub async fn current_stage(&self) -> BuildStage {
        self.state.read().await.stage
    }

    pub async fn snapshot(&self) -> OrchestrationState {
        self.state.read().await.clone()
    }

    /// Run the full pipeline for `config`.
    ///
    /// Returns `Err` for fatal errors (config, catalog, fetch, disk, internal).
    /// A run whose images all failed returns `Ok` with a `Failed` report.
    pub async fn run(&self, config: &BuildConfig) -> Result<BuildReport, ImagerError> {
        let key = validator::resolve_work_dir(&config.work_dir)
            .unwrap_or_else(|_| config.work_dir.clone());

        let _guard = match RunGuard::acquire(key) {
            Ok(guard) => guard,
            Err(e) => {
                log::warn!("[Orchestrator] [REJECT] {}", e);
                self.observer.on_error(&e);
                return Err(e);
            }
        };

        let _busy = match InFlight::enter(&self.busy) {
            Some(busy) => busy,
            None => {
                let err = ImagerError::AlreadyRunning(config.work_dir.clone());
                log::warn!("[Orchestrator] [REJECT] This orchestrator is already running a build");
                self.observer.on_error(&err);
                return Err(err);
            }
        };

        if let Some(stage) = self.state.write().await.begin_run() {
            log::warn!(
                "[Orchestrator] [RECOVER] Previous run was dropped in stage {}",
                stage
            );
        }

        log::info!(
            "[Orchestrator] [START] {} visor(s), hypervisor: {}, work dir {}",
            config.visors,
            config.hypervisor,
            config.work_dir.display()
        );

        self.enter(BuildStage::ValidatingConfig).await?;
        let config = match validator::validate_build_config(config) {
            Ok(config) => config,
            Err(e) => return Err(self.fail(e).await),
        };

        self.enter(BuildStage::FetchingBase).await?;
        let base_image = match self.fetch_base(&config).await {
            Ok(path) => path,
            Err(e) => return Err(self.fail(e).await),
        };

        self.enter(BuildStage::GeneratingParams).await?;
        let params = match bootparams::generate(&config) {
            Ok(params) => params,
            Err(e) => {
                let err = ImagerError::Internal(format!(
                    "boot parameter generation failed on a validated config: {}",
                    e
                ));
                return Err(self.fail(err).await);
            }
        };
        self.observer.on_progress(
            BuildStage::GeneratingParams,
            &format!("generated {} boot parameter set(s)", params.len()),
        );

        self.enter(BuildStage::Building).await?;
        let artifacts = match self.build_all(&config, &base_image, &params).await {
            Ok(artifacts) => artifacts,
            Err(e) => return Err(self.fail(e).await),
        };

        self.finish(&config, base_image, &params, artifacts).await
    }

    async fn enter(&self, stage: BuildStage) -> Result<(), ImagerError> {
        if let Err(msg) = self.state.write().await.transition_to(stage) {
            let err = ImagerError::Internal(msg);
            self.observer.on_error(&err);
            return Err(err);
        }
        log::debug!("[Orchestrator] [STAGE] -> {}", stage);
        self.observer.on_stage(stage);
        Ok(())
    }

    /// Report `err` once, move to `Failed` and hand the error back.
    async fn fail(&self, err: ImagerError) -> ImagerError {
        log::error!("[Orchestrator] [FAILED] {}", err);
        self.observer.on_error(&err);
        {
            let mut state = self.state.write().await;
            state.record_error(err.to_string());
            if let Err(msg) = state.transition_to(BuildStage::Failed) {
                log::error!("[Orchestrator] [FAILED] {}", msg);
            }
        }
        self.observer.on_stage(BuildStage::Failed);
        err
    }

    async fn fetch_base(&self, config: &BuildConfig) -> Result<PathBuf, ImagerError> {
        let timeout = self.settings.network_timeout();
        let reference = BaseImageRef::parse(&config.base_image);

        let source = match reference {
            BaseImageRef::Url(url) => BaseImageSource::Url(url),
            BaseImageRef::Local(path) => BaseImageSource::Local(path),
            release_ref => {
                self.observer.on_progress(
                    BuildStage::FetchingBase,
                    &format!("resolving release '{}'", config.base_image.trim()),
                );
                let release = self
                    .catalog
                    .resolve(&release_ref, &self.cancel_rx, timeout)
                    .await?;
                BaseImageSource::Release(release)
            }
        };

        self.observer.on_progress(
            BuildStage::FetchingBase,
            &format!("fetching base image from {}", describe_source(&source)),
        );
        let path = self
            .fetcher
            .fetch(&source, &config.work_dir, &self.cancel_rx)
            .await?;
        self.observer.on_progress(
            BuildStage::FetchingBase,
            &format!("base image ready at {}", path.display()),
        );
        Ok(path)
    }

    /// Build every unit on a bounded pool. Unit failures land in the artifacts.
    async fn build_all(
        &self,
        config: &BuildConfig,
        base_image: &Path,
        params: &[BootParams],
    ) -> Result<Vec<BuildArtifact>, ImagerError> {
        self.state.write().await.set_units(params.len());
        if params.is_empty() {
            return Ok(Vec::new());
        }

        let images_dir = config.images_dir();
        std::fs::create_dir_all(&images_dir).map_err(|e| ImagerError::disk(&images_dir, e))?;

        let workers = self.settings.worker_count(params.len());
        log::info!(
            "[Build] [POOL] {} image(s) on {} worker(s)",
            params.len(),
            workers
        );
        let semaphore = Arc::new(Semaphore::new(workers));

        let mut expected: BTreeMap<BootIndex, PathBuf> = BTreeMap::new();
        let mut tasks = JoinSet::new();
        for p in params {
            let dest = images_dir.join(p.index.file_name());
            expected.insert(p.index, dest.clone());

            let semaphore = semaphore.clone();
            let writer = self.writer.clone();
            let base = base_image.to_path_buf();
            let cancel = self.cancel_rx.clone();
            let p = p.clone();
            tasks.spawn(async move {
                let pending = BuildArtifact::pending(dest.clone(), p.index);
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return pending.failed(format!("worker pool closed: {}", e)),
                };
                if net::is_cancelled(&cancel) {
                    return pending.failed("cancelled before the build started");
                }
                let index = p.index;
                match tokio::task::spawn_blocking(move || writer.build(&base, &p, &dest)).await {
                    Ok(Ok(artifact)) => artifact,
                    Ok(Err(e)) => pending.failed(e.to_string()),
                    Err(e) => pending.failed(format!("worker for image {} crashed: {}", index, e)),
                }
            });
        }

        let total = expected.len();
        let mut done: BTreeMap<BootIndex, BuildArtifact> = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            let artifact = match joined {
                Ok(artifact) => artifact,
                Err(e) => {
                    log::error!("[Build] [POOL] Worker task lost: {}", e);
                    continue;
                }
            };
            self.state.write().await.record_unit(artifact.is_success());
            self.observer.on_artifact(&artifact);
            self.observer.on_progress(
                BuildStage::Building,
                &format!("{}/{} image(s) finished", done.len() + 1, total),
            );
            done.insert(artifact.index, artifact);
        }

        Ok(expected
            .into_iter()
            .map(|(index, path)| {
                done.remove(&index).unwrap_or_else(|| {
                    let lost = BuildArtifact::pending(path, index).failed("worker task was lost");
                    self.observer.on_artifact(&lost);
                    lost
                })
            })
            .collect())
    }

    async fn finish(
        &self,
        config: &BuildConfig,
        base_image: PathBuf,
        params: &[BootParams],
        artifacts: Vec<BuildArtifact>,
    ) -> Result<BuildReport, ImagerError> {
        let total = artifacts.len();
        let succeeded = artifacts.iter().filter(|a| a.is_success()).count();
        let failed = total - succeeded;

        let status = if total > 0 && succeeded == 0 {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        let summary = summarize(total, succeeded, failed);

        if total > 0 {
            let images_dir = config.images_dir();
            let stale = stale_images(&images_dir, &artifacts);
            if !stale.is_empty() {
                let names: Vec<String> = stale.iter().map(|p| p.display().to_string()).collect();
                log::warn!(
                    "[Orchestrator] [STALE] {} image(s) from an earlier run remain: {}",
                    stale.len(),
                    names.join(", ")
                );
                self.observer.on_progress(
                    BuildStage::Building,
                    &format!(
                        "{} image(s) from an earlier run remain in {}",
                        stale.len(),
                        images_dir.display()
                    ),
                );
            }

            let base_sha256 = match digest(&base_image).await {
                Ok(sum) => sum,
                Err(e) => return Err(self.fail(e).await),
            };
            let mut manifest =
                BuildManifest::new(config, &base_image, base_sha256, params, &artifacts, status);
            manifest.stale_images = stale;
            if let Err(e) = manifest.save(&images_dir) {
                return Err(self.fail(e).await);
            }
        }

        match status {
            RunStatus::Completed => {
                self.enter(BuildStage::Completed).await?;
                log::info!("[Orchestrator] [DONE] {}", summary);
            }
            RunStatus::Failed => {
                self.fail(ImagerError::Build(summary.clone())).await;
            }
        }

        Ok(BuildReport {
            status,
            base_image,
            artifacts,
            summary,
        })
    }
}

async fn digest(path: &Path) -> Result<String, ImagerError> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || fetch::sha256_file(&owned))
        .await
        .map_err(|e| ImagerError::Internal(format!("checksum task failed: {}", e)))?
}

/// `.img` files in `images_dir` not written successfully by this run.
fn stale_images(images_dir: &Path, artifacts: &[BuildArtifact]) -> Vec<PathBuf> {
    let fresh: HashSet<&Path> = artifacts
        .iter()
        .filter(|a| a.is_success())
        .map(|a| a.path.as_path())
        .collect();
    let entries = match std::fs::read_dir(images_dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::debug!("[Orchestrator] [STALE] Cannot list {}: {}", images_dir.display(), e);
            return Vec::new();
        }
    };
    let mut stale: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && path.extension().map_or(false, |ext| ext == "img"))
        .filter(|path| !fresh.contains(path.as_path()))
        .collect();
    stale.sort();
    stale
}

fn describe_source(source: &BaseImageSource) -> String {
    match source {
        BaseImageSource::Release(release) => format!("release {}", release),
        BaseImageSource::Url(url) => url.clone(),
        BaseImageSource::Local(path) => path.display().to_string(),
    }
}

/// Human-readable result line for a run.
pub fn summarize(total: usize, succeeded: usize, failed: usize) -> String {
    if total == 0 {
        "no images requested".to_string()
    } else if failed == 0 {
        format!("{} image(s) built", succeeded)
    } else if succeeded == 0 {
        format!("all {} image builds failed", total)
    } else {
        format!(
            "{} of {} image(s) built, {} failed",
            succeeded, total, failed
        )
    }
}
