//! Domain types for the testbench orchestration core.
//!
//! Everything in this crate is pure data plus the rules that govern it:
//! job specifications and results, campaign execution counters, and
//! history records. No I/O and no async runtime live here, so the
//! engine and any future front-end share one definition of each type.

pub mod campaign;
pub mod error;
pub mod history;
pub mod job;
pub mod job_events;
pub mod types;
