pub mod job;
pub mod ledger;
pub mod recorder;
pub mod selector;

pub use job::{CompositeKey, JobDescription, JobOutcome, SampleCandidate, TrackedState};
pub use ledger::ProcessedLedger;
pub use recorder::{RecordStatus, StateRecorder};
pub use selector::{EligibilitySelector, Selection, SkipReason};
