//! Campaign specifications and the run-time execution aggregate.
//!
//! [`CampaignExecution`] holds the counters the sequencer maintains while
//! a campaign runs. All mutators become no-ops once the execution is
//! terminal, so a finished execution always reads the same.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::job::{validate_batch, JobResult, JobSpec, JobState};
use crate::types::{CampaignId, JobId, Timestamp};

// ---------------------------------------------------------------------------
// Specification
// ---------------------------------------------------------------------------

fn default_continue_on_failure() -> bool {
    true
}

/// Failure policy and timing for a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Keep launching jobs after one fails (sequential mode only).
    #[serde(default = "default_continue_on_failure")]
    pub continue_on_failure: bool,
    /// Bound on the whole campaign in minutes. `0` means unbounded.
    #[serde(default)]
    pub timeout_minutes: u32,
    /// Launch every job at once instead of in list order.
    #[serde(default)]
    pub parallel: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            continue_on_failure: default_continue_on_failure(),
            timeout_minutes: 0,
            parallel: false,
        }
    }
}

impl ExecutionConfig {
    /// Campaign-level deadline, if one is configured.
    pub fn campaign_timeout(&self) -> Option<Duration> {
        (self.timeout_minutes > 0)
            .then(|| Duration::from_secs(u64::from(self.timeout_minutes) * 60))
    }
}

/// An ordered batch of jobs executed and reported as one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignSpec {
    pub name: String,
    pub jobs: Vec<JobSpec>,
    #[serde(default)]
    pub execution_config: ExecutionConfig,
}

/// Validate a campaign before it starts.
///
/// The name must be non-empty, the job list must be non-empty, and the
/// jobs must pass batch validation (which includes unique ids).
pub fn validate_campaign_spec(spec: &CampaignSpec) -> Result<(), CoreError> {
    if spec.name.trim().is_empty() {
        return Err(CoreError::Validation(
            "Campaign name must not be empty".to_string(),
        ));
    }
    if spec.jobs.is_empty() {
        return Err(CoreError::Validation(
            "Campaign must include at least one job".to_string(),
        ));
    }
    validate_batch(&spec.jobs)
}

// ---------------------------------------------------------------------------
// Execution state
// ---------------------------------------------------------------------------

/// Campaign status. A campaign is `Running` from the moment its execution
/// exists until it reaches one of the two terminal values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Running,
    Completed,
    Failed,
}

impl CampaignStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Why a campaign stopped before every job ran to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HaltReason {
    /// A job failed with `continue_on_failure == false`.
    StoppedOnFailure { index: usize },
    /// The campaign-level timeout elapsed.
    CampaignTimeout,
    /// The caller cancelled the campaign.
    Cancelled,
}

/// Per-job view inside a campaign execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub script_name: String,
    /// `None` until the job is attempted; stays `None` for jobs that were
    /// never launched.
    pub state: Option<JobState>,
    pub result: Option<JobResult>,
}

/// Run-time aggregate of one campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignExecution {
    pub id: CampaignId,
    pub name: String,
    pub status: CampaignStatus,
    pub parallel: bool,
    /// Index of the job currently running in sequential mode.
    pub current_index: Option<usize>,
    pub total_jobs: usize,
    pub completed_count: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub jobs: Vec<JobSnapshot>,
    pub started_at: Timestamp,
    pub completed_at: Option<Timestamp>,
    pub halt_reason: Option<HaltReason>,
}

impl CampaignExecution {
    /// Fresh `Running` execution with zeroed counters.
    pub fn new(id: CampaignId, spec: &CampaignSpec) -> Self {
        Self {
            id,
            name: spec.name.clone(),
            status: CampaignStatus::Running,
            parallel: spec.execution_config.parallel,
            current_index: None,
            total_jobs: spec.jobs.len(),
            completed_count: 0,
            success_count: 0,
            failed_count: 0,
            jobs: spec
                .jobs
                .iter()
                .map(|job| JobSnapshot {
                    job_id: job.id.clone(),
                    script_name: job.script_name.clone(),
                    state: None,
                    result: None,
                })
                .collect(),
            started_at: Utc::now(),
            completed_at: None,
            halt_reason: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_halted(&self) -> bool {
        self.halt_reason.is_some()
    }

    /// Position of a job in the campaign by its id.
    pub fn index_of(&self, job_id: &str) -> Option<usize> {
        self.jobs.iter().position(|j| j.job_id == job_id)
    }

    /// Completion percentage (0-100).
    pub fn progress_percent(&self) -> u8 {
        if self.total_jobs == 0 {
            return 100;
        }
        ((self.completed_count * 100) / self.total_jobs).min(100) as u8
    }

    /// Mark a job as being launched. In sequential mode this also moves
    /// `current_index`.
    pub fn begin_job(&mut self, index: usize) {
        if self.is_terminal() || self.is_halted() {
            return;
        }
        if !self.parallel {
            self.current_index = Some(index);
        }
        self.set_state(index, JobState::Pending);
    }

    /// Update the non-terminal state of a running job.
    pub fn set_state(&mut self, index: usize, state: JobState) {
        if self.is_terminal() {
            return;
        }
        if let Some(job) = self.jobs.get_mut(index) {
            job.state = Some(state);
        }
    }

    /// Store a job's terminal result.
    ///
    /// Counters move only while the campaign is neither terminal nor
    /// halted; later results are kept in the snapshot for completeness.
    /// Returns `true` when the counters were updated.
    pub fn record_result(&mut self, index: usize, result: JobResult) -> bool {
        if self.is_terminal() {
            return false;
        }
        let Some(job) = self.jobs.get_mut(index) else {
            return false;
        };
        if job.result.is_some() {
            return false;
        }

        let success = result.success;
        job.state = Some(result.terminal_state());
        job.result = Some(result);

        if self.halt_reason.is_some() {
            return false;
        }
        self.completed_count += 1;
        if success {
            self.success_count += 1;
        } else {
            self.failed_count += 1;
        }
        true
    }

    /// Record the first reason the campaign stops early. Later reasons are
    /// ignored.
    pub fn halt(&mut self, reason: HaltReason) {
        if self.is_terminal() || self.halt_reason.is_some() {
            return;
        }
        self.halt_reason = Some(reason);
    }

    /// Move to the terminal status and stamp the completion time.
    ///
    /// The campaign is `Completed` only when every job ran and succeeded;
    /// an early halt, any failure, or a job without a result makes it
    /// `Failed`.
    pub fn finish(&mut self) {
        if self.is_terminal() {
            return;
        }
        self.status = if self.halt_reason.is_some()
            || self.failed_count > 0
            || self.success_count < self.total_jobs
        {
            CampaignStatus::Failed
        } else {
            CampaignStatus::Completed
        };
        self.completed_at = Some(Utc::now());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
