use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::error::Result;
use crate::scheduler::job::{CompositeKey, JobOutcome, OutcomeStatus, SampleCandidate};
use crate::scheduler::{EligibilitySelector, ProcessedLedger, RecordStatus, StateRecorder};
use crate::store::RecordStore;
use crate::worker::{Dispatcher, JobBuilder, JobRunner};

/// Counts reported at the end of a pass. Dispatch counts are per sample,
/// whatever number of pipeline jobs each one ran.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    /// Candidates claimed for this pass.
    pub eligible: usize,
    pub skipped: usize,
    pub rejected: usize,
    pub build_failed: usize,
    pub completed: usize,
    pub failed: usize,
    /// Samples handed back to `pending` because shutdown came before launch.
    pub not_started: usize,
    /// Outcomes whose store write failed.
    pub unrecorded: usize,
}

impl PassSummary {
    pub fn dispatched(&self) -> usize {
        self.completed + self.failed + self.not_started
    }
}

impl fmt::Display for PassSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rows = [
            ("eligible", self.eligible),
            ("skipped", self.skipped),
            ("rejected", self.rejected),
            ("build failed", self.build_failed),
            ("completed", self.completed),
            ("failed", self.failed),
            ("not started", self.not_started),
            ("unrecorded", self.unrecorded),
        ];
        writeln!(f, "{:<14}{:>6}", "OUTCOME", "COUNT")?;
        for (label, count) in rows {
            writeln!(f, "{:<14}{:>6}", label, count)?;
        }
        Ok(())
    }
}

/// One dispatch pass: select, build, dispatch, record.
///
/// All collaborators are constructed by the caller and handed in; nothing
/// here is global.
pub struct Orchestrator<B: JobBuilder, R: JobRunner> {
    selector: EligibilitySelector,
    builder: B,
    dispatcher: Dispatcher<R>,
    recorder: StateRecorder,
    ledger: ProcessedLedger,
    cleanup: bool,
}

impl<B: JobBuilder, R: JobRunner> Orchestrator<B, R> {
    pub fn new(
        store: Arc<dyn RecordStore>,
        queue_tag: impl Into<String>,
        ledger: ProcessedLedger,
        builder: B,
        dispatcher: Dispatcher<R>,
    ) -> Self {
        Self {
            selector: EligibilitySelector::new(Arc::clone(&store), queue_tag),
            recorder: StateRecorder::new(store),
            builder,
            dispatcher,
            ledger,
            cleanup: false,
        }
    }

    /// Remove the scratch directories of every sample recorded as completed.
    pub fn with_cleanup(mut self, cleanup: bool) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub fn ledger(&self) -> &ProcessedLedger {
        &self.ledger
    }

    /// Run a single pass. Only pass-level failures (invalid pipeline
    /// settings, store unreachable during selection) return an error;
    /// per-candidate and per-job failures are counted in the summary.
    pub async fn run_pass(&mut self) -> Result<PassSummary> {
        self.builder.validate()?;

        let selection = self.selector.select(&self.ledger)?;
        let mut summary = PassSummary {
            eligible: selection.candidates.len(),
            skipped: selection.skipped.len(),
            rejected: selection.rejected.len(),
            ..PassSummary::default()
        };

        if selection.candidates.is_empty() {
            tracing::info!("No eligible samples, nothing to dispatch");
            return Ok(summary);
        }

        let mut jobs = Vec::with_capacity(selection.candidates.len());
        let mut scratch: HashMap<CompositeKey, Vec<PathBuf>> = HashMap::new();
        for candidate in &selection.candidates {
            match self.builder.build(candidate) {
                Ok(built) if !built.is_empty() => {
                    scratch
                        .entry(candidate.key.clone())
                        .or_default()
                        .extend(built.iter().filter_map(|job| job.work_dir.clone()));
                    jobs.extend(built);
                }
                Ok(_) => self.build_failed(&mut summary, candidate, "no pipeline jobs"),
                Err(e) => self.build_failed(&mut summary, candidate, &e.to_string()),
            }
        }

        if jobs.is_empty() {
            tracing::warn!("Every eligible sample failed to build");
            return Ok(summary);
        }

        let outcomes = self.dispatcher.run(jobs).await;

        for outcome in combine_by_key(outcomes) {
            let status = self.recorder.record(&outcome, &mut self.ledger);
            if status == RecordStatus::StoreWriteFailed {
                summary.unrecorded += 1;
            }
            match outcome.status {
                OutcomeStatus::Completed => {
                    summary.completed += 1;
                    if self.cleanup && status.is_recorded() {
                        for work_dir in scratch.get(&outcome.key).into_iter().flatten() {
                            remove_scratch(&outcome, work_dir);
                        }
                    }
                }
                OutcomeStatus::Failed(_) => summary.failed += 1,
                OutcomeStatus::NotStarted => summary.not_started += 1,
            }
        }

        tracing::info!(
            completed = summary.completed,
            failed = summary.failed,
            not_started = summary.not_started,
            unrecorded = summary.unrecorded,
            "Pass finished"
        );
        Ok(summary)
    }

    fn build_failed(&self, summary: &mut PassSummary, candidate: &SampleCandidate, reason: &str) {
        summary.build_failed += 1;
        tracing::error!(key = %candidate.key, error = %reason, "Failed to build job, skipping sample");
        if let Err(store_err) = self
            .recorder
            .mark_failed(&candidate.key, &format!("build failed: {reason}"))
        {
            tracing::error!(
                key = %candidate.key,
                error = %store_err,
                "Could not mark sample failed, it stays running"
            );
        }
    }
}

/// One outcome per key, in the order keys first reported back.
fn combine_by_key(outcomes: Vec<JobOutcome>) -> Vec<JobOutcome> {
    let mut order = Vec::new();
    let mut groups: HashMap<CompositeKey, Vec<JobOutcome>> = HashMap::new();
    for outcome in outcomes {
        let group = groups.entry(outcome.key.clone()).or_default();
        if group.is_empty() {
            order.push(outcome.key.clone());
        }
        group.push(outcome);
    }
    order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .filter_map(JobOutcome::combine)
        .collect()
}

fn remove_scratch(outcome: &JobOutcome, work_dir: &Path) {
    if !work_dir.exists() {
        return;
    }
    match fs::remove_dir_all(work_dir) {
        Ok(()) => tracing::info!(key = %outcome.key, path = %work_dir.display(), "Removed work directory"),
        Err(e) => tracing::warn!(
            key = %outcome.key,
            path = %work_dir.display(),
            error = %e,
            "Failed to remove work directory"
        ),
    }
}
