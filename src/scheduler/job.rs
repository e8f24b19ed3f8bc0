use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// (sample identifier, run tag) pair naming one unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompositeKey {
    pub sample_id: String,
    pub run_tag: String,
}

impl CompositeKey {
    pub fn new(sample_id: impl Into<String>, run_tag: impl Into<String>) -> Self {
        Self {
            sample_id: sample_id.into(),
            run_tag: run_tag.into(),
        }
    }

    /// Single ledger line representation (tab separated).
    pub fn to_ledger_line(&self) -> String {
        format!("{}\t{}", self.sample_id, self.run_tag)
    }

    pub fn from_ledger_line(line: &str) -> Option<Self> {
        let (sample_id, run_tag) = line.split_once('\t')?;
        let (sample_id, run_tag) = (sample_id.trim(), run_tag.trim());
        if sample_id.is_empty() || run_tag.is_empty() || run_tag.contains('\t') {
            return None;
        }
        Some(Self::new(sample_id, run_tag))
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.sample_id, self.run_tag)
    }
}

/// Externally persisted processing state of a composite key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackedState {
    Unseen,
    Pending,
    Running,
    Completed,
    Failed,
}

impl TrackedState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TrackedState::Completed | TrackedState::Failed)
    }

    /// States a dispatch pass may move to `Running`.
    pub fn is_claimable(self) -> bool {
        matches!(self, TrackedState::Unseen | TrackedState::Pending)
    }

    /// Rewriting the current state is always allowed so recording stays idempotent.
    /// `Running -> Pending` releases a claim whose job never started.
    pub fn can_transition_to(self, next: TrackedState) -> bool {
        use TrackedState::*;
        if self == next {
            return true;
        }
        match self {
            Unseen => matches!(next, Pending | Running),
            Pending => next == Running,
            Running => next == Pending || next.is_terminal(),
            Completed | Failed => false,
        }
    }
}

impl fmt::Display for TrackedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackedState::Unseen => write!(f, "unseen"),
            TrackedState::Pending => write!(f, "pending"),
            TrackedState::Running => write!(f, "running"),
            TrackedState::Completed => write!(f, "completed"),
            TrackedState::Failed => write!(f, "failed"),
        }
    }
}

/// One group of raw input files produced by a single sequencing run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputGroup {
    pub run_tag: String,
    pub paths: Vec<PathBuf>,
    pub total_reads: Option<u64>,
}

/// A claimed, validated unit of work.
#[derive(Debug, Clone)]
pub struct SampleCandidate {
    pub key: CompositeKey,
    pub queue_tag: String,
    pub record_id: Uuid,
    pub input_groups: Vec<InputGroup>,
}

/// Fully resolved external invocation. Immutable once built.
#[derive(Debug, Clone)]
pub struct JobDescription {
    pub id: Uuid,
    pub key: CompositeKey,
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
    pub output_dir: PathBuf,
    /// Scratch area that may be removed once the job has completed.
    pub work_dir: Option<PathBuf>,
}

impl JobDescription {
    pub fn new(key: CompositeKey, label: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
            output_dir: PathBuf::new(),
            work_dir: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(work_dir.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NonZeroExit,
    Timeout,
    Spawn,
    Cancelled,
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::NonZeroExit => write!(f, "nonzero-exit"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::Spawn => write!(f, "spawn"),
            FailureKind::Cancelled => write!(f, "cancelled"),
            FailureKind::Internal => write!(f, "internal"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeStatus {
    Completed,
    Failed(FailureKind),
    /// Shutdown was requested before the job was launched.
    NotStarted,
}

impl OutcomeStatus {
    /// Order used when several runs of one key are folded together.
    fn severity(self) -> u8 {
        match self {
            OutcomeStatus::Completed => 0,
            OutcomeStatus::NotStarted => 1,
            OutcomeStatus::Failed(_) => 2,
        }
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeStatus::Completed => write!(f, "completed"),
            OutcomeStatus::Failed(kind) => write!(f, "failed({})", kind),
            OutcomeStatus::NotStarted => write!(f, "not-started"),
        }
    }
}

/// Result of one dispatched job. Produced exactly once per job description.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: Uuid,
    pub key: CompositeKey,
    pub label: String,
    pub status: OutcomeStatus,
    pub exit_code: Option<i32>,
    /// Tail of stdout, kept for diagnostics only.
    pub output: Option<String>,
    /// Tail of stderr or the reason the job did not run to completion.
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobOutcome {
    pub fn completed(job: &JobDescription, exit_code: Option<i32>) -> Self {
        let now = Utc::now();
        Self {
            job_id: job.id,
            key: job.key.clone(),
            label: job.label.clone(),
            status: OutcomeStatus::Completed,
            exit_code,
            output: None,
            error: None,
            started_at: now,
            finished_at: now,
        }
    }

    pub fn failed(job: &JobDescription, kind: FailureKind, error: Option<String>) -> Self {
        Self::failure(job.id, job.key.clone(), job.label.clone(), kind, error)
    }

    pub fn failure(
        job_id: Uuid,
        key: CompositeKey,
        label: String,
        kind: FailureKind,
        error: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            key,
            label,
            status: OutcomeStatus::Failed(kind),
            exit_code: None,
            output: None,
            error,
            started_at: now,
            finished_at: now,
        }
    }

    pub fn not_started(job: &JobDescription) -> Self {
        Self {
            status: OutcomeStatus::NotStarted,
            error: Some("shutdown requested before launch".to_string()),
            ..Self::completed(job, None)
        }
    }

    pub fn started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }

    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }

    pub fn with_output(mut self, output: Option<String>) -> Self {
        self.output = output;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Completed
    }

    /// State this outcome is recorded as. A job that never started hands
    /// its key back as `Pending`.
    pub fn tracked_state(&self) -> TrackedState {
        match self.status {
            OutcomeStatus::Completed => TrackedState::Completed,
            OutcomeStatus::Failed(_) => TrackedState::Failed,
            OutcomeStatus::NotStarted => TrackedState::Pending,
        }
    }

    /// Fold the outcomes of every job run for one key into the single
    /// outcome recorded for that key.
    ///
    /// Any failure fails the key. Otherwise any job that never started
    /// releases it, and only a key whose jobs all completed is completed.
    /// The reasons of every unsuccessful job are kept, prefixed by label.
    pub fn combine(mut outcomes: Vec<JobOutcome>) -> Option<JobOutcome> {
        if outcomes.len() <= 1 {
            return outcomes.pop();
        }

        let started_at = outcomes.iter().map(|o| o.started_at).min()?;
        let finished_at = outcomes.iter().map(|o| o.finished_at).max()?;
        let label = outcomes
            .iter()
            .map(|o| o.label.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let reasons: Vec<String> = outcomes
            .iter()
            .filter(|o| !o.is_success())
            .map(|o| match &o.error {
                Some(error) => format!("{}: {}", o.label, error),
                None => format!("{}: {}", o.label, o.status),
            })
            .collect();

        let worst = outcomes
            .into_iter()
            .max_by_key(|o| o.status.severity())?;
        Some(JobOutcome {
            label,
            error: (!reasons.is_empty()).then(|| reasons.join("; ")),
            started_at,
            finished_at,
            ..worst
        })
    }
}
