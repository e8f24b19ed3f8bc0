//! Single-pass dispatcher of per-sample pipeline runs.
//!
//! A pass reads the samples queued for one workflow from a record store,
//! claims the eligible ones, builds a pipeline invocation per sample, runs
//! them as external processes with bounded and staggered concurrency, and
//! records every outcome back to the store and a local processed ledger.

pub mod config;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod worker;

pub use error::{DispatchError, Result};
pub use orchestrator::{Orchestrator, PassSummary};
