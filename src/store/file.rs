use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{StoreError, StoreResult};
use crate::scheduler::job::{CompositeKey, TrackedState};
use crate::store::{RecordFields, RecordStore, SampleRecord, StoreDocument, TrackedRecord};

/// Record store persisted as a single JSON document.
///
/// Every operation reloads the file so records written by upstream systems
/// between calls are visible. Mutations are written to a sibling temp file and
/// renamed into place. Conflicting writes are serialized within this process
/// only; concurrent passes on different hosts need a store with its own
/// conditional-update support.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Write `document` as the initial store contents.
    pub fn create_with(path: impl Into<PathBuf>, document: &StoreDocument) -> StoreResult<Self> {
        let store = Self::new(path);
        store.save(document)?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> StoreResult<StoreDocument> {
        let text = fs::read_to_string(&self.path).map_err(|e| {
            StoreError::Unavailable(format!("{}: {}", self.path.display(), e))
        })?;
        serde_json::from_str(&text)
            .map_err(|e| StoreError::Corrupt(format!("{}: {}", self.path.display(), e)))
    }

    fn save(&self, document: &StoreDocument) -> StoreResult<()> {
        let json = serde_json::to_string_pretty(document)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .and_then(|_| fs::rename(&tmp, &self.path))
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", self.path.display(), e)))
    }

    fn read<T>(&self, f: impl FnOnce(&StoreDocument) -> T) -> StoreResult<T> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| StoreError::Unavailable("file store lock poisoned".to_string()))?;
        let document = self.load()?;
        Ok(f(&document))
    }

    fn write<T>(
        &self,
        f: impl FnOnce(&mut StoreDocument) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| StoreError::Unavailable("file store lock poisoned".to_string()))?;
        let mut document = self.load()?;
        let value = f(&mut document)?;
        self.save(&document)?;
        Ok(value)
    }
}

impl RecordStore for JsonFileStore {
    fn query(&self, queue_tag: &str) -> StoreResult<Vec<SampleRecord>> {
        self.read(|doc| doc.query(queue_tag))
    }

    fn tracked(&self, key: &CompositeKey) -> StoreResult<Option<TrackedRecord>> {
        self.read(|doc| doc.tracked(key).cloned())
    }

    fn create(
        &self,
        key: &CompositeKey,
        queue_tag: &str,
        fields: RecordFields,
    ) -> StoreResult<TrackedRecord> {
        self.write(|doc| doc.create(key, queue_tag, fields))
    }

    fn update(&self, record: &TrackedRecord, fields: RecordFields) -> StoreResult<TrackedRecord> {
        self.write(|doc| doc.update(record, fields))
    }

    fn update_if(
        &self,
        record: &TrackedRecord,
        expected: TrackedState,
        fields: RecordFields,
    ) -> StoreResult<Option<TrackedRecord>> {
        self.write(|doc| doc.update_if(record, expected, fields))
    }
}
