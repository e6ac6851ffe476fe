//! Caller-facing engine facade.
//!
//! [`Orchestrator`] owns the shared tracker, the ad-hoc batch pool, every
//! running campaign, the event bus and the history recorder. It is
//! created once and shared as `Arc<Orchestrator>`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use testbench_core::campaign::{validate_campaign_spec, CampaignExecution, CampaignSpec};
use testbench_core::error::CoreError;
use testbench_core::history::{HistoryFilter, HistoryRecord};
use testbench_core::job::{validate_batch, validate_job_spec, JobResult, JobSpec};
use testbench_core::types::{CampaignId, JobId};
use testbench_events::{EngineEvent, EventBus};
use testbench_executor::client::RemoteExecutor;
use tokio::sync::{broadcast, watch, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::TrackerConfig;
use crate::history::{HistoryRecorder, HistoryStore};
use crate::pool::{EachCallback, ExecutionPool};
use crate::sequencer::CampaignSequencer;
use crate::tracker::JobTracker;

/// How long [`Orchestrator::shutdown`] waits for each campaign task.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Finished campaigns kept for progress queries. Older ones remain
/// available through history.
pub const DEFAULT_CAMPAIGN_RETENTION: usize = 100;

pub struct Orchestrator {
    tracker: Arc<JobTracker>,
    /// Pool for ad-hoc batches. Campaigns get their own.
    batch_pool: ExecutionPool,
    sequencer: Arc<CampaignSequencer>,
    recorder: Arc<HistoryRecorder>,
    events: Arc<EventBus>,
    /// Running campaigns plus the most recently finished ones.
    campaigns: RwLock<HashMap<CampaignId, ManagedCampaign>>,
    campaign_retention: usize,
    launched: AtomicU64,
    /// Master cancellation token -- cancelled during shutdown.
    cancel: CancellationToken,
}

/// Internal bookkeeping for a single campaign.
struct ManagedCampaign {
    progress: watch::Receiver<CampaignExecution>,
    /// Per-campaign cancellation token (child of the master token).
    cancel: CancellationToken,
    task_handle: tokio::task::JoinHandle<()>,
    /// Launch order, used to evict the oldest finished campaigns first.
    seq: u64,
}

impl Orchestrator {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        store: Arc<dyn HistoryStore>,
        tracker_config: TrackerConfig,
        events: Arc<EventBus>,
    ) -> Self {
        let tracker = Arc::new(JobTracker::new(executor, tracker_config));
        let recorder = Arc::new(HistoryRecorder::new(store));
        let sequencer = Arc::new(CampaignSequencer::new(
            Arc::clone(&tracker),
            Arc::clone(&recorder),
            Arc::clone(&events),
        ));

        Self {
            batch_pool: ExecutionPool::new(Arc::clone(&tracker)),
            tracker,
            sequencer,
            recorder,
            events,
            campaigns: RwLock::new(HashMap::new()),
            campaign_retention: DEFAULT_CAMPAIGN_RETENTION,
            launched: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        }
    }

    /// Keep at most `retention` finished campaigns queryable by id.
    pub fn with_campaign_retention(mut self, retention: usize) -> Self {
        self.campaign_retention = retention;
        self
    }

    /// Subscribe to engine lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Run one job and record it in history.
    pub async fn submit_single(&self, spec: JobSpec) -> Result<JobResult, CoreError> {
        validate_job_spec(&spec)?;

        let started_at = Utc::now();
        self.publish_job_started(&spec);
        let result = self.tracker.start(&spec, &self.cancel.child_token(), None).await;
        self.events.publish(job_finished(&spec.id, &result));

        if let Err(e) = self.recorder.record_job(&spec, &result, started_at).await {
            tracing::error!(job_id = %spec.id, error = %e, "Failed to record job history");
        }
        Ok(result)
    }

    /// Run a batch of independent jobs concurrently.
    ///
    /// `on_each` fires as each job resolves. Only one ad-hoc batch may run
    /// at a time; a second call while one is in flight is rejected with
    /// [`CoreError::Conflict`] and publishes nothing.
    pub async fn submit_batch(
        &self,
        specs: Vec<JobSpec>,
        on_each: Option<EachCallback>,
    ) -> Result<HashMap<JobId, JobResult>, CoreError> {
        validate_batch(&specs)?;
        let started_at = Utc::now();

        let events = Arc::clone(&self.events);
        let notify: EachCallback = Arc::new(move |job_id: &JobId, result: &JobResult| {
            events.publish(job_finished(job_id, result));
            if let Some(callback) = &on_each {
                callback(job_id, result);
            }
        });

        let on_accept = |accepted: &[JobSpec]| {
            for spec in accepted {
                self.publish_job_started(spec);
            }
        };
        let results = self
            .batch_pool
            .run_all_accepted(
                specs.clone(),
                on_accept,
                Some(notify),
                &self.cancel.child_token(),
            )
            .await?;

        for spec in &specs {
            if let Some(result) = results.get(&spec.id) {
                if let Err(e) = self.recorder.record_job(spec, result, started_at).await {
                    tracing::error!(job_id = %spec.id, error = %e, "Failed to record job history");
                }
            }
        }
        Ok(results)
    }

    /// Ids of ad-hoc batch jobs that have not resolved yet.
    pub fn in_flight(&self) -> Vec<JobId> {
        self.batch_pool.in_flight()
    }

    /// Validate and launch a campaign in the background.
    pub async fn start_campaign(&self, spec: CampaignSpec) -> Result<CampaignId, CoreError> {
        validate_campaign_spec(&spec)?;

        let id = Uuid::new_v4();
        let (progress_tx, progress_rx) = CampaignSequencer::progress_channel(id, &spec);
        let cancel = self.cancel.child_token();

        let sequencer = Arc::clone(&self.sequencer);
        let task_cancel = cancel.clone();
        let task_handle = tokio::spawn(async move {
            sequencer.run(&spec, progress_tx, &task_cancel).await;
        });

        let mut campaigns = self.campaigns.write().await;
        evict_finished(&mut campaigns, self.campaign_retention);
        campaigns.insert(
            id,
            ManagedCampaign {
                progress: progress_rx,
                cancel,
                task_handle,
                seq: self.launched.fetch_add(1, Ordering::Relaxed),
            },
        );
        Ok(id)
    }

    /// Current snapshot of a campaign. Never blocks on the running
    /// campaign and is stable once the campaign is terminal.
    pub async fn campaign_progress(&self, id: CampaignId) -> Result<CampaignExecution, CoreError> {
        let campaigns = self.campaigns.read().await;
        let managed = campaigns.get(&id).ok_or_else(|| campaign_not_found(id))?;
        let snapshot = managed.progress.borrow().clone();
        Ok(snapshot)
    }

    /// Request cancellation of a campaign. Jobs already running remotely
    /// are asked to stop but may keep running. A no-op for a campaign
    /// that already finished.
    pub async fn cancel_campaign(&self, id: CampaignId) -> Result<(), CoreError> {
        let campaigns = self.campaigns.read().await;
        let managed = campaigns.get(&id).ok_or_else(|| campaign_not_found(id))?;

        if managed.progress.borrow().is_terminal() {
            tracing::debug!(campaign_id = %id, "Cancel ignored, campaign already finished");
            return Ok(());
        }
        tracing::info!(campaign_id = %id, "Cancelling campaign");
        managed.cancel.cancel();
        Ok(())
    }

    /// Wait until a campaign is terminal and return its final snapshot.
    pub async fn wait_campaign(&self, id: CampaignId) -> Result<CampaignExecution, CoreError> {
        let mut progress = {
            let campaigns = self.campaigns.read().await;
            let managed = campaigns.get(&id).ok_or_else(|| campaign_not_found(id))?;
            managed.progress.clone()
        };

        let snapshot = progress
            .wait_for(CampaignExecution::is_terminal)
            .await
            .map_err(|_| {
                CoreError::Internal(format!("Campaign {id} stopped without finishing"))
            })?
            .clone();
        Ok(snapshot)
    }

    /// History records matching `filter`, newest first.
    pub async fn history(&self, filter: &HistoryFilter) -> Result<Vec<HistoryRecord>, CoreError> {
        self.recorder.list(filter).await
    }

    pub async fn history_record(&self, id: Uuid) -> Result<HistoryRecord, CoreError> {
        self.recorder.get(id).await
    }

    /// Cancel every running campaign and wait briefly for each to record
    /// its final state.
    ///
    /// Cancels the master token, then waits up to 5 seconds per campaign
    /// task.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down orchestrator");
        self.cancel.cancel();

        let mut campaigns = self.campaigns.write().await;
        for (id, managed) in campaigns.drain() {
            if managed.task_handle.is_finished() {
                continue;
            }
            tracing::info!(campaign_id = %id, "Stopping campaign task");
            managed.cancel.cancel();
            if tokio::time::timeout(SHUTDOWN_GRACE, managed.task_handle).await.is_err() {
                tracing::warn!(campaign_id = %id, "Campaign task did not stop in time");
            }
        }

        tracing::info!("Orchestrator shut down complete");
    }

    // ---- private helpers ----

    fn publish_job_started(&self, spec: &JobSpec) {
        self.events.publish(EngineEvent::JobStarted {
            campaign_id: None,
            job_id: spec.id.clone(),
            script_name: spec.script_name.clone(),
        });
    }
}

fn job_finished(job_id: &JobId, result: &JobResult) -> EngineEvent {
    EngineEvent::JobFinished {
        campaign_id: None,
        job_id: job_id.clone(),
        success: result.success,
        failure: result.failure,
        execution_time_ms: result.execution_time_ms,
    }
}

/// Drop the oldest finished campaigns beyond `retention`. A campaign
/// counts as finished once its task has exited, i.e. after its history
/// record was written.
fn evict_finished(campaigns: &mut HashMap<CampaignId, ManagedCampaign>, retention: usize) {
    let mut finished: Vec<(u64, CampaignId)> = campaigns
        .iter()
        .filter(|(_, managed)| managed.task_handle.is_finished())
        .map(|(id, managed)| (managed.seq, *id))
        .collect();
    if finished.len() <= retention {
        return;
    }

    finished.sort();
    let excess = finished.len() - retention;
    for (_, id) in finished.into_iter().take(excess) {
        campaigns.remove(&id);
        tracing::debug!(campaign_id = %id, "Evicted finished campaign");
    }
}

fn campaign_not_found(id: CampaignId) -> CoreError {
    CoreError::NotFound {
        entity: "Campaign",
        id: id.to_string(),
    }
}
