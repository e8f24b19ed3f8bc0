//! Record store access.
//!
//! The record store is the external tracking system holding per-sample
//! processing state. The orchestrator only talks to it through
//! [`RecordStore`]:
//!
//! - [`RecordStore::query`] lists the sample records tagged for a queue
//! - [`RecordStore::tracked`] looks up the tracked state of a composite key
//! - [`RecordStore::create`] / [`RecordStore::update`] write tracked state
//! - [`RecordStore::update_if`] is the conditional write used to claim work
//!   and to release the claim of a job that never started
//!
//! Two backends are provided: [`MemoryStore`] and [`JsonFileStore`].

pub mod document;
pub mod file;
pub mod memory;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreResult;
use crate::scheduler::job::{CompositeKey, TrackedState};

pub use document::StoreDocument;
pub use file::JsonFileStore;
pub use memory::MemoryStore;

/// A group of fastq files from one sequencing run, as listed upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastqGroup {
    pub run_tag: String,
    pub paths: Vec<PathBuf>,
    #[serde(default)]
    pub total_reads: Option<u64>,
    #[serde(default)]
    pub do_not_include: bool,
}

/// Upstream sample record tagged for a workflow queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub sample_id: String,
    pub queue_tag: String,
    #[serde(default)]
    pub fastq_groups: Vec<FastqGroup>,
}

/// Tracked processing state for one composite key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedRecord {
    pub id: Uuid,
    pub key: CompositeKey,
    pub queue_tag: String,
    pub state: TrackedState,
    #[serde(default)]
    pub note: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Fields written by `create`/`update`. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct RecordFields {
    pub state: Option<TrackedState>,
    pub note: Option<String>,
}

impl RecordFields {
    pub fn state(state: TrackedState) -> Self {
        Self {
            state: Some(state),
            note: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Query/update interface to the external tracking system.
///
/// Implementations must serialize conflicting writes to the same record:
/// `create` fails with [`StoreError::Conflict`](crate::error::StoreError::Conflict)
/// when the key is already tracked and `update_if` only applies when the
/// current state still equals `expected`.
pub trait RecordStore: Send + Sync {
    fn query(&self, queue_tag: &str) -> StoreResult<Vec<SampleRecord>>;

    fn tracked(&self, key: &CompositeKey) -> StoreResult<Option<TrackedRecord>>;

    fn create(
        &self,
        key: &CompositeKey,
        queue_tag: &str,
        fields: RecordFields,
    ) -> StoreResult<TrackedRecord>;

    fn update(&self, record: &TrackedRecord, fields: RecordFields) -> StoreResult<TrackedRecord>;

    /// Conditional update. Returns `Ok(None)` when the stored state is no
    /// longer `expected`.
    fn update_if(
        &self,
        record: &TrackedRecord,
        expected: TrackedState,
        fields: RecordFields,
    ) -> StoreResult<Option<TrackedRecord>>;
}
