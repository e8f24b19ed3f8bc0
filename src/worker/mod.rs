//! Turning claimed candidates into running pipeline processes.
//!
//! - [`builder`]: candidate + pipeline settings to one immutable [`JobDescription`](crate::scheduler::JobDescription) per pipeline
//! - [`dispatcher`]: bounded, staggered fan-out with completion-order fan-in
//! - [`executor`]: the OS process [`JobRunner`] used in production
//!
//! Jobs run as independent external processes. Their stdout/stderr are kept
//! only as a short tail for diagnostics and are never parsed.

pub mod builder;
pub mod dispatcher;
pub mod executor;

pub use builder::{JobBuilder, NextflowBuilder};
pub use dispatcher::{Dispatcher, JobRunner, OutcomeFuture};
pub use executor::JobExecutor;
