use std::sync::Arc;

use crate::error::{StoreError, StoreResult};
use crate::scheduler::job::{CompositeKey, JobOutcome, OutcomeStatus, TrackedState};
use crate::scheduler::ledger::ProcessedLedger;
use crate::store::{RecordFields, RecordStore, TrackedRecord};

/// What happened when an outcome was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    /// Store and ledger both updated.
    Recorded(TrackedState),
    /// The store write failed. The ledger was left alone so the key is
    /// reconsidered on a later pass.
    StoreWriteFailed,
    /// The store holds the terminal state but the ledger append failed.
    LedgerWriteFailed(TrackedState),
    /// The job never started. Its claim went back to `pending` and the
    /// ledger was left alone.
    Released,
}

impl RecordStatus {
    pub fn is_recorded(&self) -> bool {
        !matches!(self, RecordStatus::StoreWriteFailed)
    }
}

/// Writes terminal outcomes back to the record store, then to the ledger.
pub struct StateRecorder {
    store: Arc<dyn RecordStore>,
}

impl StateRecorder {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Record one outcome. The store write always happens before the ledger append.
    pub fn record(&self, outcome: &JobOutcome, ledger: &mut ProcessedLedger) -> RecordStatus {
        if outcome.status == OutcomeStatus::NotStarted {
            return self.release(outcome);
        }

        let state = outcome.tracked_state();
        let note = match &outcome.error {
            Some(error) => format!("{}: {}", outcome.status, error),
            None => outcome.status.to_string(),
        };

        if let Err(e) = self.write_state(&outcome.key, state, note) {
            tracing::error!(
                job_id = %outcome.job_id,
                key = %outcome.key,
                state = %state,
                error = %e,
                "Outcome unrecorded, leaving key out of the ledger"
            );
            return RecordStatus::StoreWriteFailed;
        }

        if let Err(e) = ledger.append(&outcome.key) {
            tracing::warn!(
                key = %outcome.key,
                path = %ledger.path().display(),
                error = %e,
                "Failed to append to processed ledger"
            );
            return RecordStatus::LedgerWriteFailed(state);
        }

        tracing::info!(job_id = %outcome.job_id, key = %outcome.key, state = %state, "Recorded outcome");
        RecordStatus::Recorded(state)
    }

    /// Hand the claim of a job that never started back to `pending`, only if
    /// it is still `running`. Nothing is written to the ledger.
    fn release(&self, outcome: &JobOutcome) -> RecordStatus {
        let released = self
            .store
            .tracked(&outcome.key)
            .and_then(|record| record.ok_or_else(|| StoreError::NotFound(outcome.key.clone())))
            .and_then(|record| {
                let fields = RecordFields::state(TrackedState::Pending)
                    .with_note(outcome.error.clone().unwrap_or_else(|| outcome.status.to_string()));
                self.store.update_if(&record, TrackedState::Running, fields)
            });

        match released {
            Ok(Some(_)) => {
                tracing::info!(key = %outcome.key, "Job not started, claim released to pending");
                RecordStatus::Released
            }
            Ok(None) => {
                tracing::warn!(key = %outcome.key, "Job not started and claim no longer running, left as is");
                RecordStatus::Released
            }
            Err(e) => {
                tracing::error!(
                    key = %outcome.key,
                    error = %e,
                    "Could not release claim of unstarted job, it stays running"
                );
                RecordStatus::StoreWriteFailed
            }
        }
    }

    /// Mark a claimed candidate failed without touching the ledger. Used when
    /// no job could be built for it.
    pub fn mark_failed(&self, key: &CompositeKey, reason: &str) -> StoreResult<TrackedRecord> {
        self.write_state(key, TrackedState::Failed, reason.to_string())
    }

    fn write_state(
        &self,
        key: &CompositeKey,
        state: TrackedState,
        note: String,
    ) -> StoreResult<TrackedRecord> {
        let record = self
            .store
            .tracked(key)?
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        self.store
            .update(&record, RecordFields::state(state).with_note(note))
    }
}
