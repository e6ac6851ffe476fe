/// Caller-assigned correlation id of a job, unique within a batch.
pub type JobId = String;

/// Campaign executions are keyed by a random UUID.
pub type CampaignId = uuid::Uuid;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
