//! Remote script executor client library.
//!
//! Provides the [`RemoteExecutor`](client::RemoteExecutor) trait the
//! engine drives, the typed submission and status views it returns, and
//! [`ExecutorApi`](api::ExecutorApi), the HTTP implementation talking to
//! a host's script-execution endpoints.

pub mod api;
pub mod client;
