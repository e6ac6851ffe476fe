//! Typed remote executor interface.
//!
//! [`RemoteExecutor`] is the seam between the engine and whatever runs the
//! scripts. [`ExecutorApi`] implements it over HTTP; tests implement it
//! with scripted fakes.

use async_trait::async_trait;
use chrono::Utc;
use testbench_core::job::JobSpec;
use testbench_core::types::Timestamp;

use crate::api::{ExecutorApi, ExecutorApiError, RawOutput, StatusResponse, SubmitResponse};

/// Executor-assigned handle for an asynchronously running job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    pub task_id: String,
    pub submitted_at: Timestamp,
}

/// Outcome of a successful submission call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// The executor queued the job; poll the handle for its outcome.
    Task(TaskHandle),
    /// The executor ran the job inline and returned its final output.
    Finished(RawOutput),
}

/// Lifecycle state reported by one status poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Started,
    Completed(RawOutput),
    /// Executor-reported failure with its error message.
    Failed(String),
    /// A status string this client does not know; treated as running.
    Other(String),
}

impl From<StatusResponse> for TaskStatus {
    fn from(response: StatusResponse) -> Self {
        match response.status.as_str() {
            "started" | "running" => Self::Started,
            "completed" => match response.result {
                Some(output) => Self::Completed(output),
                None => Self::Failed(
                    response
                        .error
                        .unwrap_or_else(|| "executor reported completion without a result".into()),
                ),
            },
            "failed" => Self::Failed(
                response
                    .error
                    .unwrap_or_else(|| "executor reported failure".into()),
            ),
            other => Self::Other(other.to_string()),
        }
    }
}

/// Operations the engine needs from a remote script executor.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Submit a job. An `Err` means no task exists.
    async fn submit(&self, spec: &JobSpec) -> Result<Submission, ExecutorApiError>;

    /// Fetch the current status of a task.
    async fn poll_status(&self, task_id: &str) -> Result<TaskStatus, ExecutorApiError>;

    /// Best-effort request to stop a task. The remote process may keep
    /// running after this returns `Ok`.
    async fn cancel(&self, task_id: &str) -> Result<(), ExecutorApiError>;
}

#[async_trait]
impl RemoteExecutor for ExecutorApi {
    async fn submit(&self, spec: &JobSpec) -> Result<Submission, ExecutorApiError> {
        Ok(match self.execute(spec).await? {
            SubmitResponse::Task { task_id } => {
                tracing::debug!(job_id = %spec.id, task_id = %task_id, "Executor accepted job");
                Submission::Task(TaskHandle {
                    task_id,
                    submitted_at: Utc::now(),
                })
            }
            SubmitResponse::Finished(output) => {
                tracing::debug!(job_id = %spec.id, "Executor ran job inline");
                Submission::Finished(output)
            }
        })
    }

    async fn poll_status(&self, task_id: &str) -> Result<TaskStatus, ExecutorApiError> {
        Ok(self.status(task_id).await?.into())
    }

    async fn cancel(&self, task_id: &str) -> Result<(), ExecutorApiError> {
        ExecutorApi::cancel(self, task_id).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
