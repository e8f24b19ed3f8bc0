use std::sync::{Mutex, MutexGuard};

use crate::error::{StoreError, StoreResult};
use crate::scheduler::job::{CompositeKey, TrackedState};
use crate::store::{RecordFields, RecordStore, SampleRecord, StoreDocument, TrackedRecord};

/// In-process record store. The mutex serializes conflicting writes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    document: Mutex<StoreDocument>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sample(&self, sample: SampleRecord) -> StoreResult<()> {
        self.lock()?.add_sample(sample);
        Ok(())
    }

    /// Copy of the current document.
    pub fn snapshot(&self) -> StoreResult<StoreDocument> {
        Ok(self.lock()?.clone())
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, StoreDocument>> {
        self.document
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

impl RecordStore for MemoryStore {
    fn query(&self, queue_tag: &str) -> StoreResult<Vec<SampleRecord>> {
        Ok(self.lock()?.query(queue_tag))
    }

    fn tracked(&self, key: &CompositeKey) -> StoreResult<Option<TrackedRecord>> {
        Ok(self.lock()?.tracked(key).cloned())
    }

    fn create(
        &self,
        key: &CompositeKey,
        queue_tag: &str,
        fields: RecordFields,
    ) -> StoreResult<TrackedRecord> {
        self.lock()?.create(key, queue_tag, fields)
    }

    fn update(&self, record: &TrackedRecord, fields: RecordFields) -> StoreResult<TrackedRecord> {
        self.lock()?.update(record, fields)
    }

    fn update_if(
        &self,
        record: &TrackedRecord,
        expected: TrackedState,
        fields: RecordFields,
    ) -> StoreResult<Option<TrackedRecord>> {
        self.lock()?.update_if(record, expected, fields)
    }
}
