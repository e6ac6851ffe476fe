//! Follows one remote job from submission to a terminal [`JobResult`].
//!
//! Every expected failure (submission error, executor-reported failure,
//! timeout, cancellation) resolves to a failed result. The tracker never
//! returns an error to its caller.

use std::sync::Arc;
use std::time::Duration;

use testbench_core::job::{FailureKind, JobResult, JobSpec, JobState};
use testbench_executor::client::{RemoteExecutor, Submission, TaskHandle, TaskStatus};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{PollProfile, TrackerConfig};

/// Invoked exactly once with the terminal result, before
/// [`JobTracker::start`] returns.
pub type CompletionCallback = Box<dyn FnOnce(&JobResult) + Send>;

/// Observer for non-terminal state changes (`Pending`, `Started`).
pub type StateObserver<'a> = &'a (dyn Fn(JobState) + Send + Sync);

pub struct JobTracker {
    executor: Arc<dyn RemoteExecutor>,
    config: TrackerConfig,
}

impl JobTracker {
    pub fn new(executor: Arc<dyn RemoteExecutor>, config: TrackerConfig) -> Self {
        Self { executor, config }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Run `spec` to completion.
    ///
    /// Cancelling `cancel` while the job is being polled sends a
    /// best-effort remote cancel and resolves with a `Cancelled` failure.
    pub async fn start(
        &self,
        spec: &JobSpec,
        cancel: &CancellationToken,
        on_complete: Option<CompletionCallback>,
    ) -> JobResult {
        self.start_observed(spec, cancel, None, on_complete).await
    }

    /// [`start`](Self::start) with an observer for intermediate states.
    pub async fn start_observed(
        &self,
        spec: &JobSpec,
        cancel: &CancellationToken,
        on_state: Option<StateObserver<'_>>,
        on_complete: Option<CompletionCallback>,
    ) -> JobResult {
        let result = self.run(spec, cancel, on_state).await;

        tracing::info!(
            job_id = %spec.id,
            success = result.success,
            failure = result.failure.map(FailureKind::code),
            execution_time_ms = result.execution_time_ms,
            "Job finished",
        );

        if let Some(callback) = on_complete {
            callback(&result);
        }
        result
    }

    // ---- private helpers ----

    async fn run(
        &self,
        spec: &JobSpec,
        cancel: &CancellationToken,
        on_state: Option<StateObserver<'_>>,
    ) -> JobResult {
        let started = Instant::now();
        notify(on_state, JobState::Pending);

        if cancel.is_cancelled() {
            return JobResult::cancelled(0);
        }

        match self.executor.submit(spec).await {
            Err(e) => {
                tracing::warn!(job_id = %spec.id, error = %e, "Job submission failed");
                JobResult::failed(FailureKind::Submission, e.to_string(), elapsed_ms(started))
            }
            Ok(Submission::Finished(output)) => output.into_job_result(elapsed_ms(started)),
            Ok(Submission::Task(handle)) => {
                tracing::info!(
                    job_id = %spec.id,
                    task_id = %handle.task_id,
                    script = %spec.script_name,
                    "Job submitted, polling for completion",
                );
                notify(on_state, JobState::Started);
                let profile = self.config.profile(spec.parameters.profile);
                self.poll_until_terminal(spec, &handle, profile, started, cancel)
                    .await
            }
        }
    }

    async fn poll_until_terminal(
        &self,
        spec: &JobSpec,
        handle: &TaskHandle,
        profile: PollProfile,
        started: Instant,
        cancel: &CancellationToken,
    ) -> JobResult {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.cancel_remote(spec, handle).await;
                    return JobResult::cancelled(elapsed_ms(started));
                }
                _ = tokio::time::sleep(next_poll_delay(profile, started)) => {}
            }

            match self.executor.poll_status(&handle.task_id).await {
                Ok(TaskStatus::Completed(output)) => {
                    return output.into_job_result(elapsed_ms(started));
                }
                Ok(TaskStatus::Failed(message)) => {
                    return JobResult::failed(
                        FailureKind::ExecutorReported,
                        message,
                        elapsed_ms(started),
                    );
                }
                Ok(TaskStatus::Started) => {}
                Ok(TaskStatus::Other(status)) => {
                    tracing::debug!(
                        task_id = %handle.task_id,
                        status = %status,
                        "Unrecognized task status",
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        job_id = %spec.id,
                        task_id = %handle.task_id,
                        error = %e,
                        "Status poll failed, will retry",
                    );
                }
            }

            if started.elapsed() >= profile.max_wait {
                tracing::warn!(
                    job_id = %spec.id,
                    task_id = %handle.task_id,
                    max_wait_secs = profile.max_wait.as_secs(),
                    "Job exceeded its max wait",
                );
                return JobResult::timed_out(elapsed_ms(started));
            }
        }
    }

    async fn cancel_remote(&self, spec: &JobSpec, handle: &TaskHandle) {
        tracing::info!(job_id = %spec.id, task_id = %handle.task_id, "Cancelling remote task");
        if let Err(e) = self.executor.cancel(&handle.task_id).await {
            tracing::warn!(task_id = %handle.task_id, error = %e, "Remote cancel failed");
        }
    }
}

fn notify(on_state: Option<StateObserver<'_>>, state: JobState) {
    if let Some(observer) = on_state {
        observer(state);
    }
}

/// One poll interval, cut short so the last poll lands on the max wait.
fn next_poll_delay(profile: PollProfile, started: Instant) -> Duration {
    let remaining = profile.max_wait.saturating_sub(started.elapsed());
    profile.poll_interval.min(remaining)
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
