//! Execution orchestration for remote test scripts.
//!
//! The [`tracker::JobTracker`] follows one job to a terminal result, the
//! [`pool::ExecutionPool`] runs many at once, and the
//! [`sequencer::CampaignSequencer`] drives a whole campaign. The
//! [`orchestrator::Orchestrator`] ties them together for callers.

pub mod config;
pub mod history;
pub mod orchestrator;
pub mod pool;
pub mod sequencer;
pub mod tracker;

pub use orchestrator::Orchestrator;
