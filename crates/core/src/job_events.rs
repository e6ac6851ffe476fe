//! Event type names for job and campaign lifecycle notifications.
//!
//! Shared by the event bus and anything that forwards events to external
//! observers, so both sides agree on the strings.

/// A job was handed to the remote executor.
pub const EVENT_JOB_STARTED: &str = "job.started";

/// A job reached a terminal state.
pub const EVENT_JOB_FINISHED: &str = "job.finished";

/// A campaign began running.
pub const EVENT_CAMPAIGN_STARTED: &str = "campaign.started";

/// Campaign counters changed.
pub const EVENT_CAMPAIGN_PROGRESS: &str = "campaign.progress";

/// A campaign reached a terminal status.
pub const EVENT_CAMPAIGN_FINISHED: &str = "campaign.finished";
