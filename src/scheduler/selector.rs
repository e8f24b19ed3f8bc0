use std::sync::Arc;

use chrono::NaiveDate;

use crate::error::{CandidateError, Result, StoreError};
use crate::scheduler::job::{CompositeKey, InputGroup, SampleCandidate, TrackedState};
use crate::scheduler::ledger::ProcessedLedger;
use crate::store::{FastqGroup, RecordFields, RecordStore, SampleRecord, TrackedRecord};

/// Why an otherwise valid record was not selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Key already present in the processed ledger.
    InLedger,
    /// Another pass claimed the key between our lookup and our write.
    AlreadyClaimed,
    /// Tracked state is running or terminal.
    State(TrackedState),
}

#[derive(Debug, Clone)]
pub struct Skipped {
    pub key: CompositeKey,
    pub reason: SkipReason,
}

#[derive(Debug)]
pub struct Rejected {
    pub sample_id: String,
    pub error: CandidateError,
}

/// Result of one selection: claimed candidates plus everything left out.
#[derive(Debug, Default)]
pub struct Selection {
    pub candidates: Vec<SampleCandidate>,
    pub skipped: Vec<Skipped>,
    pub rejected: Vec<Rejected>,
}

enum Resolved {
    InLedger(CompositeKey),
    Ready(CompositeKey, Vec<InputGroup>),
}

enum Claim {
    Claimed(TrackedRecord),
    Skipped(SkipReason),
}

/// Pulls the records tagged for one queue and claims the eligible ones.
pub struct EligibilitySelector {
    store: Arc<dyn RecordStore>,
    queue_tag: String,
}

impl EligibilitySelector {
    pub fn new(store: Arc<dyn RecordStore>, queue_tag: impl Into<String>) -> Self {
        Self {
            store,
            queue_tag: queue_tag.into(),
        }
    }

    /// Select and claim the candidates eligible for this pass.
    ///
    /// Each claimed candidate has been moved to `running` in the store.
    /// Candidate-level problems are collected in [`Selection::rejected`];
    /// only store failures abort the selection.
    pub fn select(&self, ledger: &ProcessedLedger) -> Result<Selection> {
        let records = self.store.query(&self.queue_tag)?;
        tracing::info!(queue = %self.queue_tag, records = records.len(), "Queried record store");

        let mut selection = Selection::default();
        for record in records {
            let (key, input_groups) = match Self::resolve(&record, ledger) {
                Ok(Resolved::Ready(key, input_groups)) => (key, input_groups),
                Ok(Resolved::InLedger(key)) => {
                    tracing::debug!(key = %key, "Already in processed ledger");
                    selection.skipped.push(Skipped {
                        key,
                        reason: SkipReason::InLedger,
                    });
                    continue;
                }
                Err(error) => {
                    tracing::error!(
                        sample = %record.sample_id,
                        error = %error,
                        "Excluding candidate"
                    );
                    selection.rejected.push(Rejected {
                        sample_id: record.sample_id,
                        error,
                    });
                    continue;
                }
            };

            match self.claim(&key)? {
                Claim::Claimed(tracked) => {
                    tracing::info!(sample = %key.sample_id, run_tag = %key.run_tag, "Claimed sample");
                    selection.candidates.push(SampleCandidate {
                        key,
                        queue_tag: self.queue_tag.clone(),
                        record_id: tracked.id,
                        input_groups,
                    });
                }
                Claim::Skipped(reason) => {
                    tracing::debug!(sample = %key.sample_id, run_tag = %key.run_tag, ?reason, "Skipping sample");
                    selection.skipped.push(Skipped { key, reason });
                }
            }
        }

        tracing::info!(
            queue = %self.queue_tag,
            eligible = selection.candidates.len(),
            skipped = selection.skipped.len(),
            rejected = selection.rejected.len(),
            "Selection finished"
        );
        Ok(selection)
    }

    /// Resolve the composite key and validated inputs of a record.
    fn resolve(
        record: &SampleRecord,
        ledger: &ProcessedLedger,
    ) -> std::result::Result<Resolved, CandidateError> {
        let groups: Vec<&FastqGroup> = record
            .fastq_groups
            .iter()
            .filter(|g| !g.do_not_include)
            .collect();
        if groups.is_empty() {
            return Err(CandidateError::NoInputGroups);
        }

        let run_tag = resolve_run_tag(groups.iter().map(|g| g.run_tag.as_str()))?;
        let key = CompositeKey::new(&record.sample_id, run_tag);
        if ledger.contains(&key) {
            return Ok(Resolved::InLedger(key));
        }

        let input_groups = validate_inputs(&groups)?;
        Ok(Resolved::Ready(key, input_groups))
    }

    fn claim(&self, key: &CompositeKey) -> Result<Claim> {
        let running = || RecordFields::state(TrackedState::Running);

        match self.store.tracked(key)? {
            None => match self.store.create(key, &self.queue_tag, running()) {
                Ok(record) => Ok(Claim::Claimed(record)),
                Err(StoreError::Conflict(_)) => Ok(Claim::Skipped(SkipReason::AlreadyClaimed)),
                Err(e) => Err(e.into()),
            },
            Some(record) if record.state.is_claimable() => {
                match self.store.update_if(&record, record.state, running())? {
                    Some(record) => Ok(Claim::Claimed(record)),
                    None => Ok(Claim::Skipped(SkipReason::AlreadyClaimed)),
                }
            }
            Some(record) => Ok(Claim::Skipped(SkipReason::State(record.state))),
        }
    }
}

/// Pick the most recent run tag. Tags start with a `YYMMDD` date; two
/// distinct tags sharing the newest date are ambiguous.
pub fn resolve_run_tag<'a>(
    tags: impl IntoIterator<Item = &'a str>,
) -> std::result::Result<String, CandidateError> {
    let mut newest: Option<(NaiveDate, &str)> = None;
    let mut tie: Option<&str> = None;

    for tag in tags {
        let date = run_tag_date(tag)?;
        match newest {
            None => newest = Some((date, tag)),
            Some((best, _)) if date > best => {
                newest = Some((date, tag));
                tie = None;
            }
            Some((best, best_tag)) if date == best && tag != best_tag => tie = Some(tag),
            Some(_) => {}
        }
    }

    match (newest, tie) {
        (None, _) => Err(CandidateError::NoRunTag),
        (Some((_, tag)), Some(other)) => Err(CandidateError::AmbiguousRunTag(
            tag.to_string(),
            other.to_string(),
        )),
        (Some((_, tag)), None) => Ok(tag.to_string()),
    }
}

fn run_tag_date(tag: &str) -> std::result::Result<NaiveDate, CandidateError> {
    let prefix = tag.split('_').next().unwrap_or_default();
    if prefix.len() != 6 {
        return Err(CandidateError::InvalidRunTag(tag.to_string()));
    }
    NaiveDate::parse_from_str(prefix, "%y%m%d")
        .map_err(|_| CandidateError::InvalidRunTag(tag.to_string()))
}

fn validate_inputs(groups: &[&FastqGroup]) -> std::result::Result<Vec<InputGroup>, CandidateError> {
    groups
        .iter()
        .map(|group| {
            if group.paths.is_empty() {
                return Err(CandidateError::EmptyInputGroup(group.run_tag.clone()));
            }
            if let Some(missing) = group.paths.iter().find(|p| !p.exists()) {
                return Err(CandidateError::MissingInput(missing.clone()));
            }
            Ok(InputGroup {
                run_tag: group.run_tag.clone(),
                paths: group.paths.clone(),
                total_reads: group.total_reads,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newest_run_tag_wins() {
        let tag = resolve_run_tag(["231130_FCA", "240215_FCC", "240101_FCB"]).unwrap();
        assert_eq!(tag, "240215_FCC");
    }

    #[test]
    fn repeated_identical_tag_is_not_a_tie() {
        let tag = resolve_run_tag(["240101_FCA", "240101_FCA"]).unwrap();
        assert_eq!(tag, "240101_FCA");
    }

    #[test]
    fn distinct_tags_on_newest_date_are_ambiguous() {
        let err = resolve_run_tag(["240101_FCA", "240101_FCB"]).unwrap_err();
        assert!(matches!(err, CandidateError::AmbiguousRunTag(_, _)));
    }

    #[test]
    fn tie_on_an_older_date_is_fine() {
        let tag = resolve_run_tag(["240101_FCA", "240101_FCB", "240301_FCC"]).unwrap();
        assert_eq!(tag, "240301_FCC");
    }

    #[test]
    fn malformed_run_tag_is_rejected() {
        for bad in ["FCA_240101", "2401_FCA", "241399_FCA", ""] {
            let err = resolve_run_tag([bad]).unwrap_err();
            assert!(matches!(err, CandidateError::InvalidRunTag(_)), "{bad}");
        }
    }

    #[test]
    fn no_tags_is_an_error() {
        let err = resolve_run_tag(std::iter::empty()).unwrap_err();
        assert!(matches!(err, CandidateError::NoRunTag));
    }
}
