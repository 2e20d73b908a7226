//! Callback surface between the orchestrator and whatever presents it.

use crate::error::ImagerError;
use crate::models::BuildArtifact;
use crate::orchestrator::state::BuildStage;
use tokio::sync::mpsc;

/// Receives run notifications. Every method defaults to a no-op.
pub trait BuildObserver: Send + Sync {
    fn on_stage(&self, _stage: BuildStage) {}

    fn on_progress(&self, _stage: BuildStage, _detail: &str) {}

    /// Called exactly once per failure, before the transition it causes.
    fn on_error(&self, _err: &ImagerError) {}

    fn on_artifact(&self, _artifact: &BuildArtifact) {}
}

/// Ignores everything.
pub struct NullObserver;

impl BuildObserver for NullObserver {}

/// Writes every notification to the `log` facade.
pub struct LogObserver;

impl BuildObserver for LogObserver {
    fn on_stage(&self, stage: BuildStage) {
        log::info!("[Orchestrator] [STAGE] {}", stage);
    }

    fn on_progress(&self, stage: BuildStage, detail: &str) {
        log::info!("[Orchestrator] [{}] {}", stage, detail);
    }

    fn on_error(&self, err: &ImagerError) {
        log::error!("[Orchestrator] [ERROR] ({}) {}", err.kind(), err);
    }

    fn on_artifact(&self, artifact: &BuildArtifact) {
        match &artifact.error {
            None => log::info!(
                "[Orchestrator] [ARTIFACT] {} -> {}",
                artifact.index,
                artifact.path.display()
            ),
            Some(detail) => log::warn!(
                "[Orchestrator] [ARTIFACT] {} failed: {}",
                artifact.index,
                detail
            ),
        }
    }
}

/// Event sent over a [`ChannelObserver`].
#[derive(Debug, Clone, PartialEq)]
pub enum BuildEvent {
    Stage(BuildStage),
    Progress(BuildStage, String),
    Error(ImagerError),
    Artifact(BuildArtifact),
}

/// Forwards notifications to a tokio channel, e.g. for a UI thread.
///
/// Uses `try_send`; events are dropped when the receiver lags behind a full
/// channel or has gone away.
pub struct ChannelObserver {
    tx: mpsc::Sender<BuildEvent>,
}

impl ChannelObserver {
    pub fn new(tx: mpsc::Sender<BuildEvent>) -> Self {
        ChannelObserver { tx }
    }

    fn send(&self, event: BuildEvent) {
        if let Err(e) = self.tx.try_send(event) {
            log::debug!("[Orchestrator] [EVENT] Dropped event: {}", e);
        }
    }
}

impl BuildObserver for ChannelObserver {
    fn on_stage(&self, stage: BuildStage) {
        self.send(BuildEvent::Stage(stage));
    }

    fn on_progress(&self, stage: BuildStage, detail: &str) {
        self.send(BuildEvent::Progress(stage, detail.to_string()));
    }

    fn on_error(&self, err: &ImagerError) {
        self.send(BuildEvent::Error(err.clone()));
    }

    fn on_artifact(&self, artifact: &BuildArtifact) {
        self.send(BuildEvent::Artifact(artifact.clone()));
    }
}
