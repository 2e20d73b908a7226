//! Run stage tracking for the build orchestrator.
//!
//! - `BuildStage`: discrete stages of one run
//! - `OrchestrationState`: current stage plus unit counters, shared behind a lock

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Stage of a build run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildStage {
    /// No run in progress
    Idle,

    /// Checking the BuildConfig invariants
    ValidatingConfig,

    /// Resolving the release and downloading the base image
    FetchingBase,

    /// Deriving per-image boot parameters
    GeneratingParams,

    /// Writing final images on the worker pool
    Building,

    /// At least one image was built
    Completed,

    /// Fatal error, or every image failed
    Failed,
}

impl BuildStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStage::Idle => "idle",
            BuildStage::ValidatingConfig => "validating-config",
            BuildStage::FetchingBase => "fetching-base",
            BuildStage::GeneratingParams => "generating-params",
            BuildStage::Building => "building",
            BuildStage::Completed => "completed",
            BuildStage::Failed => "failed",
        }
    }

    /// Get all valid transitions FROM this stage.
    pub fn valid_next_stages(&self) -> Vec<BuildStage> {
        match self {
            BuildStage::Idle => vec![BuildStage::ValidatingConfig],
            BuildStage::ValidatingConfig => vec![BuildStage::FetchingBase, BuildStage::Failed],
            BuildStage::FetchingBase => vec![BuildStage::GeneratingParams, BuildStage::Failed],
            BuildStage::GeneratingParams => vec![BuildStage::Building, BuildStage::Failed],
            BuildStage::Building => vec![BuildStage::Completed, BuildStage::Failed],
            BuildStage::Completed | BuildStage::Failed => vec![BuildStage::Idle],
        }
    }

    pub fn can_transition_to(&self, next: BuildStage) -> bool {
        self.valid_next_stages().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildStage::Completed | BuildStage::Failed)
    }
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the orchestrator's progress through a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationState {
    pub stage: BuildStage,

    /// Images requested by the current run
    pub units_total: usize,

    pub units_succeeded: usize,

    pub units_failed: usize,

    /// Start of the current run
    pub start_time: Option<SystemTime>,

    pub last_update_time: SystemTime,

    /// Message of the error that failed the run
    pub error: Option<String>,
}

impl Default for OrchestrationState {
    fn default() -> Self {
        OrchestrationState {
            stage: BuildStage::Idle,
            units_total: 0,
            units_succeeded: 0,
            units_failed: 0,
            start_time: None,
            last_update_time: SystemTime::now(),
            error: None,
        }
    }
}

impl OrchestrationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a run is between `Idle` and a terminal stage.
    pub fn is_running(&self) -> bool {
        !(self.stage == BuildStage::Idle || self.stage.is_terminal())
    }

    /// Reset counters and return to `Idle` so a new run can start.
    ///
    /// Returns the stage a previous run was left in when its future was
    /// dropped before reaching a terminal stage.
    pub fn begin_run(&mut self) -> Option<BuildStage> {
        let abandoned = self.is_running().then_some(self.stage);
        *self = OrchestrationState {
            start_time: Some(SystemTime::now()),
            ..OrchestrationState::default()
        };
        abandoned
    }

    /// Attempt to move to the next stage.
    pub fn transition_to(&mut self, next: BuildStage) -> Result<(), String> {
        if !self.stage.can_transition_to(next) {
            return Err(format!(
                "Invalid stage transition: {} -> {}",
                self.stage, next
            ));
        }
        self.stage = next;
        self.last_update_time = SystemTime::now();
        Ok(())
    }

    pub fn set_units(&mut self, total: usize) {
        self.units_total = total;
        self.last_update_time = SystemTime::now();
    }

    pub fn record_unit(&mut self, success: bool) {
        if success {
            self.units_succeeded += 1;
        } else {
            self.units_failed += 1;
        }
        self.last_update_time = SystemTime::now();
    }

    pub fn record_error(&mut self, error: String) {
        self.error = Some(error);
        self.last_update_time = SystemTime::now();
    }

    /// Finished units as a percentage of the run.
    pub fn progress_percent(&self) -> u32 {
        if self.units_total == 0 {
            return if self.stage.is_terminal() { 100 } else { 0 };
        }
        let done = self.units_succeeded + self.units_failed;
        ((done * 100) / self.units_total).min(100) as u32
    }
}
