//! Campaign execution.
//!
//! The sequencer owns a campaign's [`CampaignExecution`] for its whole
//! run and publishes every change through a [`watch`] channel, so readers
//! always see a consistent snapshot without blocking the run.
//!
//! Sequential campaigns run jobs strictly in list order. Parallel
//! campaigns hand the whole list to a fresh [`ExecutionPool`]. In both
//! modes a campaign timeout or cancellation halts the campaign; results
//! that arrive after the halt are stored on the job snapshot but no
//! longer move the counters.

use std::future::pending;
use std::sync::Arc;

use testbench_core::campaign::{CampaignExecution, CampaignSpec, HaltReason};
use testbench_core::job::{JobResult, JobSpec, JobState};
use testbench_core::types::{CampaignId, JobId};
use testbench_events::{EngineEvent, EventBus};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::history::HistoryRecorder;
use crate::pool::{EachCallback, ExecutionPool};
use crate::tracker::JobTracker;

/// Sender side of a campaign's progress channel.
pub type ProgressSender = Arc<watch::Sender<CampaignExecution>>;

pub struct CampaignSequencer {
    tracker: Arc<JobTracker>,
    recorder: Arc<HistoryRecorder>,
    events: Arc<EventBus>,
}

impl CampaignSequencer {
    pub fn new(
        tracker: Arc<JobTracker>,
        recorder: Arc<HistoryRecorder>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            tracker,
            recorder,
            events,
        }
    }

    /// Create the progress channel for a new campaign, seeded with a
    /// fresh `Running` execution.
    pub fn progress_channel(
        id: CampaignId,
        spec: &CampaignSpec,
    ) -> (ProgressSender, watch::Receiver<CampaignExecution>) {
        let (tx, rx) = watch::channel(CampaignExecution::new(id, spec));
        (Arc::new(tx), rx)
    }

    /// Run the campaign to a terminal state and record it in history.
    ///
    /// Returns the final execution, which is also the last value sent on
    /// `progress`.
    pub async fn run(
        &self,
        spec: &CampaignSpec,
        progress: ProgressSender,
        cancel: &CancellationToken,
    ) -> CampaignExecution {
        let (id, total_jobs) = {
            let exec = progress.borrow();
            (exec.id, exec.total_jobs)
        };
        let config = spec.execution_config;
        let deadline = config.campaign_timeout().map(|t| Instant::now() + t);

        tracing::info!(
            campaign_id = %id,
            name = %spec.name,
            total_jobs,
            parallel = config.parallel,
            continue_on_failure = config.continue_on_failure,
            timeout_minutes = config.timeout_minutes,
            "Campaign started",
        );
        self.events.publish(EngineEvent::CampaignStarted {
            campaign_id: id,
            name: spec.name.clone(),
            total_jobs,
        });

        if config.parallel {
            self.run_parallel(spec, &progress, deadline, cancel).await;
        } else {
            self.run_sequential(spec, &progress, deadline, cancel).await;
        }

        progress.send_modify(CampaignExecution::finish);
        let execution = progress.borrow().clone();

        tracing::info!(
            campaign_id = %id,
            status = ?execution.status,
            halt_reason = ?execution.halt_reason,
            success_count = execution.success_count,
            failed_count = execution.failed_count,
            "Campaign finished",
        );
        if let Err(e) = self.recorder.record_campaign(&execution).await {
            tracing::error!(campaign_id = %id, error = %e, "Failed to record campaign history");
        }
        self.events.publish(EngineEvent::finished(&execution));

        execution
    }

    // ---- private helpers ----

    async fn run_sequential(
        &self,
        spec: &CampaignSpec,
        progress: &ProgressSender,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) {
        let id = progress.borrow().id;

        for (index, job) in spec.jobs.iter().enumerate() {
            if cancel.is_cancelled() {
                halt(progress, HaltReason::Cancelled);
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                halt(progress, HaltReason::CampaignTimeout);
                break;
            }

            progress.send_modify(|e| e.begin_job(index));
            self.publish_job_started(id, job);

            let job_cancel = cancel.child_token();
            let on_state = |state: JobState| progress.send_modify(|e| e.set_state(index, state));
            let tracked = self
                .tracker
                .start_observed(job, &job_cancel, Some(&on_state), None);
            tokio::pin!(tracked);

            let (result, halted) = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    (tracked.as_mut().await, Some(HaltReason::Cancelled))
                }
                _ = sleep_until(deadline) => {
                    job_cancel.cancel();
                    (tracked.as_mut().await, Some(HaltReason::CampaignTimeout))
                }
                result = tracked.as_mut() => (result, None),
            };

            if let Some(reason) = halted {
                halt(progress, reason);
                self.store_result(id, progress, index, result);
                break;
            }

            let success = result.success;
            self.store_result(id, progress, index, result);

            if !success && !spec.execution_config.continue_on_failure {
                tracing::info!(
                    campaign_id = %id,
                    index,
                    job_id = %job.id,
                    "Stopping campaign on failed job",
                );
                halt(progress, HaltReason::StoppedOnFailure { index });
                break;
            }
        }
    }

    async fn run_parallel(
        &self,
        spec: &CampaignSpec,
        progress: &ProgressSender,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) {
        let id = progress.borrow().id;
        let pool = ExecutionPool::new(Arc::clone(&self.tracker));

        progress.send_modify(|e| (0..e.total_jobs).for_each(|i| e.begin_job(i)));
        for job in &spec.jobs {
            self.publish_job_started(id, job);
        }

        let on_each: EachCallback = {
            let progress = Arc::clone(progress);
            let events = Arc::clone(&self.events);
            let cancel = cancel.clone();
            Arc::new(move |job_id: &JobId, result: &JobResult| {
                let mut counted = false;
                progress.send_modify(|e| {
                    // Trackers may resolve before this task observes the
                    // cancellation; halt first so their results don't count.
                    if cancel.is_cancelled() {
                        e.halt(HaltReason::Cancelled);
                    }
                    if let Some(index) = e.index_of(job_id) {
                        counted = e.record_result(index, result.clone());
                    }
                });
                if counted {
                    events.publish(job_finished(id, job_id.clone(), result));
                    events.publish(EngineEvent::progress(&progress.borrow()));
                }
            })
        };

        let batch_cancel = cancel.child_token();
        let batch = pool.run_all(spec.jobs.clone(), Some(on_each), &batch_cancel);
        tokio::pin!(batch);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                halt(progress, HaltReason::Cancelled);
                batch.as_mut().await
            }
            _ = sleep_until(deadline) => {
                halt(progress, HaltReason::CampaignTimeout);
                batch_cancel.cancel();
                batch.as_mut().await
            }
            outcome = batch.as_mut() => outcome,
        };

        // The pool is private to this campaign and the spec was validated
        // up front, so a rejection here is a bug; the missing results make
        // the campaign finish as Failed.
        if let Err(e) = outcome {
            tracing::error!(campaign_id = %id, error = %e, "Parallel batch rejected");
        }
    }

    fn publish_job_started(&self, campaign_id: CampaignId, job: &JobSpec) {
        self.events.publish(EngineEvent::JobStarted {
            campaign_id: Some(campaign_id),
            job_id: job.id.clone(),
            script_name: job.script_name.clone(),
        });
    }

    /// Store a sequential job's result and publish it if it counted.
    fn store_result(
        &self,
        campaign_id: CampaignId,
        progress: &ProgressSender,
        index: usize,
        result: JobResult,
    ) {
        let job_id = progress.borrow().jobs[index].job_id.clone();
        let finished = job_finished(campaign_id, job_id, &result);

        let mut counted = false;
        progress.send_modify(|e| counted = e.record_result(index, result));
        if counted {
            self.events.publish(finished);
            self.events.publish(EngineEvent::progress(&progress.borrow()));
        }
    }
}

fn halt(progress: &ProgressSender, reason: HaltReason) {
    progress.send_modify(|e| {
        if !e.is_halted() {
            tracing::warn!(campaign_id = %e.id, reason = ?reason, "Campaign halted");
        }
        e.halt(reason);
    });
}

fn job_finished(campaign_id: CampaignId, job_id: String, result: &JobResult) -> EngineEvent {
    EngineEvent::JobFinished {
        campaign_id: Some(campaign_id),
        job_id,
        success: result.success,
        failure: result.failure,
        execution_time_ms: result.execution_time_ms,
    }
}

/// Resolves at `deadline`, or never when the campaign is unbounded.
async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => pending().await,
    }
}
