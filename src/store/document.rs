use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::scheduler::job::{CompositeKey, TrackedState};
use crate::store::{RecordFields, SampleRecord, TrackedRecord};

/// Complete contents of a record store: upstream samples and their tracked state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreDocument {
    #[serde(default)]
    pub samples: Vec<SampleRecord>,
    #[serde(default)]
    pub tracked: Vec<TrackedRecord>,
}

impl StoreDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sample(&mut self, sample: SampleRecord) {
        self.samples.push(sample);
    }

    /// Get all samples tagged for a queue
    pub fn query(&self, queue_tag: &str) -> Vec<SampleRecord> {
        self.samples
            .iter()
            .filter(|s| s.queue_tag == queue_tag)
            .cloned()
            .collect()
    }

    pub fn tracked(&self, key: &CompositeKey) -> Option<&TrackedRecord> {
        self.tracked.iter().find(|r| &r.key == key)
    }

    pub fn create(
        &mut self,
        key: &CompositeKey,
        queue_tag: &str,
        fields: RecordFields,
    ) -> StoreResult<TrackedRecord> {
        if self.tracked(key).is_some() {
            return Err(StoreError::Conflict(key.clone()));
        }

        let record = TrackedRecord {
            id: Uuid::new_v4(),
            key: key.clone(),
            queue_tag: queue_tag.to_string(),
            state: fields.state.unwrap_or(TrackedState::Pending),
            note: fields.note,
            updated_at: Utc::now(),
        };
        self.tracked.push(record.clone());
        Ok(record)
    }

    pub fn update(
        &mut self,
        record: &TrackedRecord,
        fields: RecordFields,
    ) -> StoreResult<TrackedRecord> {
        let stored = self
            .tracked
            .iter_mut()
            .find(|r| r.id == record.id)
            .ok_or_else(|| StoreError::NotFound(record.key.clone()))?;
        apply(stored, fields)
    }

    pub fn update_if(
        &mut self,
        record: &TrackedRecord,
        expected: TrackedState,
        fields: RecordFields,
    ) -> StoreResult<Option<TrackedRecord>> {
        let stored = self
            .tracked
            .iter_mut()
            .find(|r| r.id == record.id)
            .ok_or_else(|| StoreError::NotFound(record.key.clone()))?;
        if stored.state != expected {
            return Ok(None);
        }
        apply(stored, fields).map(Some)
    }

    /// Number of tracked records in a given state
    pub fn count_in_state(&self, state: TrackedState) -> usize {
        self.tracked.iter().filter(|r| r.state == state).count()
    }
}

fn apply(stored: &mut TrackedRecord, fields: RecordFields) -> StoreResult<TrackedRecord> {
    if let Some(next) = fields.state {
        if !stored.state.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                key: stored.key.clone(),
                from: stored.state,
                to: next,
            });
        }
        stored.state = next;
    }
    if fields.note.is_some() {
        stored.note = fields.note;
    }
    stored.updated_at = Utc::now();
    Ok(stored.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> CompositeKey {
        CompositeKey::new("S1", "240101_FC1")
    }

    #[test]
    fn create_rejects_existing_key() {
        let mut doc = StoreDocument::new();
        doc.create(&key(), "q", RecordFields::state(TrackedState::Running))
            .unwrap();

        let err = doc
            .create(&key(), "q", RecordFields::state(TrackedState::Running))
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn create_defaults_to_pending() {
        let mut doc = StoreDocument::new();
        let record = doc.create(&key(), "q", RecordFields::default()).unwrap();
        assert_eq!(record.state, TrackedState::Pending);
        assert_eq!(doc.count_in_state(TrackedState::Pending), 1);
    }

    #[test]
    fn update_if_only_applies_on_expected_state() {
        let mut doc = StoreDocument::new();
        let record = doc
            .create(&key(), "q", RecordFields::state(TrackedState::Pending))
            .unwrap();

        let claimed = doc
            .update_if(
                &record,
                TrackedState::Pending,
                RecordFields::state(TrackedState::Running),
            )
            .unwrap();
        assert_eq!(claimed.map(|r| r.state), Some(TrackedState::Running));

        // A second claimer still holding the stale record loses.
        let second = doc
            .update_if(
                &record,
                TrackedState::Pending,
                RecordFields::state(TrackedState::Running),
            )
            .unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn update_refuses_to_leave_terminal_state() {
        let mut doc = StoreDocument::new();
        let record = doc
            .create(&key(), "q", RecordFields::state(TrackedState::Running))
            .unwrap();
        doc.update(&record, RecordFields::state(TrackedState::Completed))
            .unwrap();

        let err = doc
            .update(&record, RecordFields::state(TrackedState::Running))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        // Same terminal state again is accepted.
        let again = doc
            .update(&record, RecordFields::state(TrackedState::Completed))
            .unwrap();
        assert_eq!(again.state, TrackedState::Completed);
    }

    #[test]
    fn update_unknown_record_is_not_found() {
        let mut doc = StoreDocument::new();
        let mut other = StoreDocument::new();
        let record = other.create(&key(), "q", RecordFields::default()).unwrap();

        let err = doc.update(&record, RecordFields::default()).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn query_filters_by_queue_tag() {
        let mut doc = StoreDocument::new();
        for (id, tag) in [("A", "rna"), ("B", "dna"), ("C", "rna")] {
            doc.add_sample(SampleRecord {
                sample_id: id.to_string(),
                queue_tag: tag.to_string(),
                fastq_groups: Vec::new(),
            });
        }
        let ids: Vec<_> = doc.query("rna").into_iter().map(|s| s.sample_id).collect();
        assert_eq!(ids, vec!["A", "C"]);
    }
}
