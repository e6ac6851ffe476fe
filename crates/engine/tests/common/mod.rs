//! Scripted remote executor shared by the engine integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use testbench_core::job::JobSpec;
use testbench_engine::config::{PollProfile, TrackerConfig};
use testbench_executor::api::{ExecutorApiError, RawOutput};
use testbench_executor::client::{RemoteExecutor, Submission, TaskHandle, TaskStatus};

/// What the fake executor does with one job id.
#[derive(Debug, Clone)]
pub enum Script {
    /// Submission is rejected with an HTTP error; no task is created.
    SubmitError,
    /// The executor runs the script inline and answers the submit call.
    Inline(RawOutput),
    /// An async task that reports `started` for `polls` polls, then the
    /// final status.
    Task { polls: usize, outcome: Outcome },
    /// An async task that never reaches a terminal status.
    Hang,
    /// A task id is handed out but every status poll fails.
    Vanish,
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Completed(RawOutput),
    Failed(String),
}

struct Task {
    job_id: String,
    remaining: Option<usize>,
    outcome: Option<Outcome>,
}

#[derive(Default)]
pub struct MockExecutor {
    scripts: Mutex<HashMap<String, Script>>,
    tasks: Mutex<HashMap<String, Task>>,
    submitted: Mutex<Vec<String>>,
    cancelled: Mutex<Vec<String>>,
    polls: AtomicUsize,
    next_task: AtomicUsize,
}

impl MockExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Script the behaviour for `job_id`. Unscripted jobs succeed after
    /// one poll.
    pub fn script(&self, job_id: &str, script: Script) {
        self.scripts.lock().unwrap().insert(job_id.to_string(), script);
    }

    /// Job ids in the order they were submitted.
    pub fn submitted(&self) -> Vec<String> {
        self.submitted.lock().unwrap().clone()
    }

    /// Job ids whose tasks received a remote cancel.
    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }

    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteExecutor for MockExecutor {
    async fn submit(&self, spec: &JobSpec) -> Result<Submission, ExecutorApiError> {
        self.submitted.lock().unwrap().push(spec.id.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&spec.id)
            .cloned()
            .unwrap_or(Script::Task {
                polls: 0,
                outcome: Outcome::Completed(success_output()),
            });

        let (remaining, outcome) = match script {
            Script::SubmitError => {
                return Err(ExecutorApiError::ApiError {
                    status: 503,
                    body: format!("host unreachable for {}", spec.id),
                })
            }
            Script::Inline(output) => return Ok(Submission::Finished(output)),
            Script::Task { polls, outcome } => (Some(polls), Some(outcome)),
            Script::Hang => (None, None),
            Script::Vanish => {
                return Ok(Submission::Task(TaskHandle {
                    task_id: format!("lost-{}", spec.id),
                    submitted_at: Utc::now(),
                }))
            }
        };

        let task_id = format!("task-{}", self.next_task.fetch_add(1, Ordering::SeqCst));
        self.tasks.lock().unwrap().insert(
            task_id.clone(),
            Task {
                job_id: spec.id.clone(),
                remaining,
                outcome,
            },
        );
        Ok(Submission::Task(TaskHandle {
            task_id,
            submitted_at: Utc::now(),
        }))
    }

    async fn poll_status(&self, task_id: &str) -> Result<TaskStatus, ExecutorApiError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.get_mut(task_id).ok_or(ExecutorApiError::ApiError {
            status: 404,
            body: "unknown task".into(),
        })?;

        match (&mut task.remaining, &task.outcome) {
            (Some(0), Some(Outcome::Completed(output))) => {
                Ok(TaskStatus::Completed(output.clone()))
            }
            (Some(0), Some(Outcome::Failed(message))) => Ok(TaskStatus::Failed(message.clone())),
            (Some(n), _) => {
                *n -= 1;
                Ok(TaskStatus::Started)
            }
            (None, _) => Ok(TaskStatus::Started),
        }
    }

    async fn cancel(&self, task_id: &str) -> Result<(), ExecutorApiError> {
        let tasks = self.tasks.lock().unwrap();
        if let Some(task) = tasks.get(task_id) {
            self.cancelled.lock().unwrap().push(task.job_id.clone());
        }
        Ok(())
    }
}

pub fn job(id: &str) -> JobSpec {
    JobSpec::new(id, format!("{id}.py"), "pi-1", "device1")
}

pub fn success_output() -> RawOutput {
    RawOutput {
        success: true,
        stdout: "SCRIPT_SUCCESS:true".into(),
        exit_code: 0,
        ..Default::default()
    }
}

pub fn failure_output(exit_code: i32) -> RawOutput {
    RawOutput {
        success: false,
        stdout: "SCRIPT_SUCCESS:false".into(),
        stderr: "assertion failed".into(),
        exit_code,
        ..Default::default()
    }
}

/// Tracker timings in whole seconds: poll every second, give up after
/// `max_wait_secs`.
pub fn tracker_config(max_wait_secs: u64) -> TrackerConfig {
    let profile = PollProfile {
        poll_interval: Duration::from_secs(1),
        max_wait: Duration::from_secs(max_wait_secs),
    };
    TrackerConfig {
        long_running: profile,
        short: profile,
    }
}
