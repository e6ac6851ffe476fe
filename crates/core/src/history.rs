//! Immutable history records for finished jobs and campaigns.
//!
//! Records are derived once from already-final state and never edited.
//! A correction is a new record.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::campaign::{CampaignExecution, CampaignStatus, HaltReason};
use crate::error::CoreError;
use crate::job::{FailureKind, JobResult, JobSpec};
use crate::types::Timestamp;

/// Default page size for history listing.
pub const DEFAULT_LIMIT: usize = 50;

/// Maximum page size for history listing.
pub const MAX_LIMIT: usize = 500;

/// What a history record summarizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    Job,
    Campaign,
}

/// Append-only summary of one terminal job or campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Campaign records reuse the campaign id, so recording the same
    /// execution twice yields the same id.
    pub id: Uuid,
    pub kind: HistoryKind,
    /// Job id or campaign id of the recorded subject.
    pub subject_id: String,
    /// Script name for jobs, campaign name for campaigns.
    pub name: String,
    pub started_at: Timestamp,
    pub completed_at: Timestamp,
    pub success: bool,
    pub total_jobs: usize,
    pub success_count: usize,
    pub failed_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halt_reason: Option<HaltReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_success: Option<bool>,
    pub execution_time_ms: u64,
    /// Links to externally stored reports, in job order.
    #[serde(default)]
    pub report_urls: Vec<String>,
}

impl HistoryRecord {
    /// Summarize a terminal campaign execution.
    ///
    /// Counts are copied, not recomputed. Fails if the execution is still
    /// running.
    pub fn from_campaign(execution: &CampaignExecution) -> Result<Self, CoreError> {
        let completed_at = match (execution.is_terminal(), execution.completed_at) {
            (true, Some(at)) => at,
            _ => {
                return Err(CoreError::Conflict(format!(
                    "Campaign {} is still running and cannot be recorded",
                    execution.id
                )))
            }
        };

        let execution_time_ms = (completed_at - execution.started_at)
            .num_milliseconds()
            .max(0) as u64;

        Ok(Self {
            id: execution.id,
            kind: HistoryKind::Campaign,
            subject_id: execution.id.to_string(),
            name: execution.name.clone(),
            started_at: execution.started_at,
            completed_at,
            success: execution.status == CampaignStatus::Completed,
            total_jobs: execution.total_jobs,
            success_count: execution.success_count,
            failed_count: execution.failed_count,
            halt_reason: execution.halt_reason,
            failure: None,
            script_success: None,
            execution_time_ms,
            report_urls: execution
                .jobs
                .iter()
                .filter_map(|j| j.result.as_ref()?.report_url.clone())
                .collect(),
        })
    }

    /// Summarize a single terminal job.
    ///
    /// `started_at` is when the caller launched the job; the completion time
    /// is derived from the result's execution time.
    pub fn from_job(spec: &JobSpec, result: &JobResult, started_at: Timestamp) -> Self {
        let completed_at = started_at
            + chrono::Duration::milliseconds(
                i64::try_from(result.execution_time_ms).unwrap_or(i64::MAX),
            );
        Self {
            id: Uuid::new_v4(),
            kind: HistoryKind::Job,
            subject_id: spec.id.clone(),
            name: spec.script_name.clone(),
            started_at,
            completed_at,
            success: result.success,
            total_jobs: 1,
            success_count: usize::from(result.success),
            failed_count: usize::from(!result.success),
            halt_reason: None,
            failure: result.failure,
            script_success: result.script_success,
            execution_time_ms: result.execution_time_ms,
            report_urls: result.report_url.iter().cloned().collect(),
        }
    }
}

/// Criteria for listing history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryFilter {
    #[serde(default)]
    pub kind: Option<HistoryKind>,
    #[serde(default)]
    pub success: Option<bool>,
    /// Only records completed at or after this instant.
    #[serde(default)]
    pub since: Option<Timestamp>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl HistoryFilter {
    pub fn matches(&self, record: &HistoryRecord) -> bool {
        self.kind.map_or(true, |k| k == record.kind)
            && self.success.map_or(true, |s| s == record.success)
            && self.since.map_or(true, |since| record.completed_at >= since)
    }

    /// Page size, clamped to `1..=MAX_LIMIT`.
    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::Utc;

    use super::*;
    use crate::campaign::{CampaignSpec, ExecutionConfig};

    fn spec() -> CampaignSpec {
        CampaignSpec {
            name: "smoke".into(),
            jobs: vec![
                JobSpec::new("a", "a.py", "h", "d"),
                JobSpec::new("b", "b.py", "h", "d"),
            ],
            execution_config: ExecutionConfig::default(),
        }
    }

    #[test]
    fn running_campaign_cannot_be_recorded() {
        let exec = CampaignExecution::new(Uuid::new_v4(), &spec());
        assert_matches!(HistoryRecord::from_campaign(&exec), Err(CoreError::Conflict(_)));
    }

    #[test]
    fn campaign_record_copies_final_state() {
        let mut exec = CampaignExecution::new(Uuid::new_v4(), &spec());
        let mut first = JobResult::from_output(true, String::new(), String::new(), 0, None, 3);
        first.report_url = Some("https://reports/a.html".into());
        exec.record_result(0, first);
        exec.record_result(1, JobResult::timed_out(9));
        exec.finish();

        let record = HistoryRecord::from_campaign(&exec).expect("terminal campaign");
        assert_eq!(record.id, exec.id);
        assert_eq!(record.kind, HistoryKind::Campaign);
        assert!(!record.success);
        assert_eq!((record.success_count, record.failed_count), (1, 1));
        assert_eq!(record.report_urls, vec!["https://reports/a.html".to_string()]);
    }

    #[test]
    fn job_record() {
        let job = JobSpec::new("j", "zap.py", "h", "d");
        let result = JobResult::from_output(
            true,
            "SCRIPT_SUCCESS:false".into(),
            String::new(),
            0,
            Some("https://r/j".into()),
            1500,
        );
        let started = Utc::now();
        let record = HistoryRecord::from_job(&job, &result, started);

        assert_eq!(record.kind, HistoryKind::Job);
        assert_eq!(record.subject_id, "j");
        assert!(record.success);
        assert_eq!(record.script_success, Some(false));
        assert_eq!(record.completed_at - record.started_at, chrono::Duration::milliseconds(1500));
    }

    #[test]
    fn filter_matching_and_limits() {
        let job = JobSpec::new("j", "zap.py", "h", "d");
        let record = HistoryRecord::from_job(&job, &JobResult::cancelled(1), Utc::now());

        assert!(HistoryFilter::default().matches(&record));
        assert!(HistoryFilter { success: Some(false), ..Default::default() }.matches(&record));
        assert!(!HistoryFilter { kind: Some(HistoryKind::Campaign), ..Default::default() }
            .matches(&record));

        assert_eq!(HistoryFilter::default().effective_limit(), DEFAULT_LIMIT);
        assert_eq!(HistoryFilter { limit: Some(0), ..Default::default() }.effective_limit(), 1);
        assert_eq!(
            HistoryFilter { limit: Some(10_000), ..Default::default() }.effective_limit(),
            MAX_LIMIT
        );
    }
}
