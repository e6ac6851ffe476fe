//! Lifecycle events for the testbench engine.
//!
//! [`EngineEvent`] describes job and campaign transitions; [`EventBus`]
//! fans them out to any number of subscribers over a
//! `tokio::sync::broadcast` channel.

pub mod bus;

pub use bus::{EngineEvent, EventBus};
