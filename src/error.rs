use std::path::PathBuf;

use thiserror::Error;

use crate::scheduler::job::{CompositeKey, TrackedState};

/// Pass-level failure. Anything of this type aborts the whole pass.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Record store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid concurrency limit {0}, must be greater than 0")]
    InvalidConcurrency(usize),

    #[error("Processed ledger {path} could not be read: {source}")]
    Ledger {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("Invalid pipeline configuration: {0}")]
    Pipeline(#[source] BuildError),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record store unavailable: {0}")]
    Unavailable(String),

    #[error("Record store document is corrupt: {0}")]
    Corrupt(String),

    #[error("Tracked record not found: {0}")]
    NotFound(CompositeKey),

    #[error("Tracked record already exists: {0}")]
    Conflict(CompositeKey),

    #[error("Tracked record {key} cannot move from {from} to {to}")]
    InvalidTransition {
        key: CompositeKey,
        from: TrackedState,
        to: TrackedState,
    },
}

/// Reasons a single candidate is excluded from a pass.
#[derive(Error, Debug)]
pub enum CandidateError {
    #[error("No run tag found among input groups")]
    NoRunTag,

    #[error("Run tag {0:?} does not start with a YYMMDD date")]
    InvalidRunTag(String),

    #[error("Run tags {0:?} and {1:?} share the same date")]
    AmbiguousRunTag(String, String),

    #[error("No valid input groups")]
    NoInputGroups,

    #[error("Input group for run {0} lists no files")]
    EmptyInputGroup(String),

    #[error("Input file does not exist: {0}")]
    MissingInput(PathBuf),
}

/// Job description build failures. Fatal for one candidate, never for the pass.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Missing required pipeline key: {0}")]
    MissingKey(&'static str),

    #[error("Unsupported value {value:?} for {key}")]
    UnsupportedOption { key: &'static str, value: String },

    #[error("Input group for run {run_tag} has {files} files, expected 1 or 2")]
    UnsupportedLayout { run_tag: String, files: usize },

    #[error("Output location {path} is not writable: {source}")]
    OutputNotWritable {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, DispatchError>;
pub type StoreResult<T> = std::result::Result<T, StoreError>;
