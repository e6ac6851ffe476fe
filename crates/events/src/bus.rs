//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is the publish/subscribe hub for [`EngineEvent`]s. It is
//! shared via `Arc<EventBus>` between the orchestrator, the sequencers it
//! spawns, and any number of observers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use testbench_core::campaign::{CampaignExecution, CampaignStatus, HaltReason};
use testbench_core::job::FailureKind;
use testbench_core::job_events::{
    EVENT_CAMPAIGN_FINISHED, EVENT_CAMPAIGN_PROGRESS, EVENT_CAMPAIGN_STARTED, EVENT_JOB_FINISHED,
    EVENT_JOB_STARTED,
};
use testbench_core::types::{CampaignId, JobId};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// EngineEvent
// ---------------------------------------------------------------------------

/// A lifecycle event emitted by the engine.
///
/// `campaign_id` is `None` for jobs submitted outside a campaign.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    JobStarted {
        campaign_id: Option<CampaignId>,
        job_id: JobId,
        script_name: String,
    },

    JobFinished {
        campaign_id: Option<CampaignId>,
        job_id: JobId,
        success: bool,
        failure: Option<FailureKind>,
        execution_time_ms: u64,
    },

    CampaignStarted {
        campaign_id: CampaignId,
        name: String,
        total_jobs: usize,
    },

    CampaignProgress {
        campaign_id: CampaignId,
        current_index: Option<usize>,
        completed_count: usize,
        success_count: usize,
        failed_count: usize,
        total_jobs: usize,
        /// Completion percentage (0-100).
        percent: u8,
    },

    CampaignFinished {
        campaign_id: CampaignId,
        status: CampaignStatus,
        halt_reason: Option<HaltReason>,
        completed_at: Option<DateTime<Utc>>,
    },
}

impl EngineEvent {
    /// Progress event built from an execution snapshot.
    pub fn progress(execution: &CampaignExecution) -> Self {
        Self::CampaignProgress {
            campaign_id: execution.id,
            current_index: execution.current_index,
            completed_count: execution.completed_count,
            success_count: execution.success_count,
            failed_count: execution.failed_count,
            total_jobs: execution.total_jobs,
            percent: execution.progress_percent(),
        }
    }

    /// Terminal event built from a finished execution.
    pub fn finished(execution: &CampaignExecution) -> Self {
        Self::CampaignFinished {
            campaign_id: execution.id,
            status: execution.status,
            halt_reason: execution.halt_reason,
            completed_at: execution.completed_at,
        }
    }

    /// Dot-separated event name, e.g. `"campaign.progress"`.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::JobStarted { .. } => EVENT_JOB_STARTED,
            Self::JobFinished { .. } => EVENT_JOB_FINISHED,
            Self::CampaignStarted { .. } => EVENT_CAMPAIGN_STARTED,
            Self::CampaignProgress { .. } => EVENT_CAMPAIGN_PROGRESS,
            Self::CampaignFinished { .. } => EVENT_CAMPAIGN_FINISHED,
        }
    }

    /// Campaign this event belongs to, if any.
    pub fn campaign_id(&self) -> Option<CampaignId> {
        match self {
            Self::JobStarted { campaign_id, .. } | Self::JobFinished { campaign_id, .. } => {
                *campaign_id
            }
            Self::CampaignStarted { campaign_id, .. }
            | Self::CampaignProgress { campaign_id, .. }
            | Self::CampaignFinished { campaign_id, .. } => Some(*campaign_id),
        }
    }

    /// Serialize for forwarding to external observers.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 256;

/// In-process fan-out event bus.
///
/// Wraps a [`broadcast::Sender`] so that any number of subscribers can
/// independently receive every published [`EngineEvent`].
///
/// # Usage
///
/// ```rust
/// use testbench_events::bus::{EngineEvent, EventBus};
///
/// let bus = EventBus::default();
/// let mut rx = bus.subscribe();
///
/// bus.publish(EngineEvent::CampaignStarted {
///     campaign_id: testbench_core::types::CampaignId::nil(),
///     name: "nightly".into(),
///     total_jobs: 3,
/// });
/// ```
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Bus buffering at most `capacity` events per receiver. A receiver
    /// that falls further behind skips the oldest events and sees
    /// `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Fan `event` out to every current subscriber. Without subscribers
    /// the event is dropped.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to all events published on this bus.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
