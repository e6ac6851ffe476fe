//! Runs a batch of independent jobs concurrently.
//!
//! Each job gets its own task and its own [`JobTracker`] run. A failure
//! in one job never affects the others, and the batch resolves only
//! once every job is terminal.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use testbench_core::error::CoreError;
use testbench_core::job::{validate_batch, FailureKind, JobResult, JobSpec};
use testbench_core::types::JobId;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::tracker::JobTracker;

/// Called once per job as it resolves, in completion order.
pub type EachCallback = Arc<dyn Fn(&JobId, &JobResult) + Send + Sync>;

type InFlight = Arc<Mutex<HashSet<JobId>>>;

pub struct ExecutionPool {
    tracker: Arc<JobTracker>,
    in_flight: InFlight,
    busy: AtomicBool,
}

impl ExecutionPool {
    pub fn new(tracker: Arc<JobTracker>) -> Self {
        Self {
            tracker,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            busy: AtomicBool::new(false),
        }
    }

    /// Ids of jobs in the current batch that have not resolved yet.
    pub fn in_flight(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = lock(&self.in_flight).iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Launch every job at once and wait for all of them.
    ///
    /// The returned map has exactly one entry per spec. Rejects the batch
    /// with [`CoreError::Validation`] on invalid specs or duplicate ids
    /// and with [`CoreError::Conflict`] while another batch is running on
    /// this pool. Cancelling `cancel` cancels every job still in flight.
    pub async fn run_all(
        &self,
        specs: Vec<JobSpec>,
        on_each: Option<EachCallback>,
        cancel: &CancellationToken,
    ) -> Result<HashMap<JobId, JobResult>, CoreError> {
        self.run_all_accepted(specs, |_| {}, on_each, cancel).await
    }

    /// [`run_all`](Self::run_all), calling `on_accept` once the batch owns
    /// the pool and before any job is launched.
    pub async fn run_all_accepted(
        &self,
        specs: Vec<JobSpec>,
        on_accept: impl FnOnce(&[JobSpec]),
        on_each: Option<EachCallback>,
        cancel: &CancellationToken,
    ) -> Result<HashMap<JobId, JobResult>, CoreError> {
        validate_batch(&specs)?;
        let _guard = BatchGuard::acquire(&self.busy, &self.in_flight)?;
        on_accept(&specs);

        let ids: Vec<JobId> = specs.iter().map(|s| s.id.clone()).collect();
        lock(&self.in_flight).extend(ids.iter().cloned());
        tracing::info!(jobs = ids.len(), "Batch started");

        let mut tasks = JoinSet::new();
        for spec in specs {
            let tracker = Arc::clone(&self.tracker);
            let in_flight = Arc::clone(&self.in_flight);
            let on_each = on_each.clone();
            let token = cancel.child_token();

            tasks.spawn(async move {
                let job_id = spec.id.clone();
                let callback_id = job_id.clone();
                let result = tracker
                    .start(
                        &spec,
                        &token,
                        Some(Box::new(move |result: &JobResult| {
                            resolve(&in_flight, on_each.as_ref(), &callback_id, result);
                        })),
                    )
                    .await;
                (job_id, result)
            });
        }

        let mut results = HashMap::with_capacity(ids.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((job_id, result)) => {
                    results.insert(job_id, result);
                }
                Err(e) => tracing::error!(error = %e, "Job task ended without a result"),
            }
        }

        for job_id in &ids {
            if !results.contains_key(job_id) {
                let result = JobResult::failed(FailureKind::Internal, "job task aborted", 0);
                resolve(&self.in_flight, on_each.as_ref(), job_id, &result);
                results.insert(job_id.clone(), result);
            }
        }

        let failed = results.values().filter(|r| !r.success).count();
        tracing::info!(jobs = results.len(), failed, "Batch finished");
        Ok(results)
    }
}

/// Completion handler: leave the in-flight set, then notify. A job that
/// already left the set is not reported again.
fn resolve(
    in_flight: &InFlight,
    on_each: Option<&EachCallback>,
    job_id: &JobId,
    result: &JobResult,
) {
    let removed = lock(in_flight).remove(job_id);
    if let (true, Some(callback)) = (removed, on_each) {
        callback(job_id, result);
    }
}

fn lock(set: &Mutex<HashSet<JobId>>) -> MutexGuard<'_, HashSet<JobId>> {
    set.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Holds the pool's busy flag for one batch. Dropping it (including when
/// the batch future is dropped mid-flight) frees the pool.
struct BatchGuard<'a> {
    busy: &'a AtomicBool,
    in_flight: &'a Mutex<HashSet<JobId>>,
}

impl<'a> BatchGuard<'a> {
    fn acquire(
        busy: &'a AtomicBool,
        in_flight: &'a Mutex<HashSet<JobId>>,
    ) -> Result<Self, CoreError> {
        busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| CoreError::Conflict("A batch is already running on this pool".into()))?;
        Ok(Self { busy, in_flight })
    }
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        lock(self.in_flight).clear();
        self.busy.store(false, Ordering::Release);
    }
}
