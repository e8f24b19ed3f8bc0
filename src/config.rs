use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConfigError, DispatchError};

const DEFAULT_CONCURRENCY_LIMIT: usize = 2;
const DEFAULT_MAX_LOG_FILES: usize = 10;
const DEFAULT_PIPELINES: [&str; 2] = ["rnaseq", "rnafusion"];

/// Dispatch pass settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Tag identifying this workflow's queue in the record store.
    pub queue_tag: String,
    /// JSON record store document.
    pub store_path: PathBuf,
    /// Processed ledger file, one composite key per line.
    pub ledger_path: PathBuf,
    /// Maximum number of pipeline runs alive at once.
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    /// Minimum gap between two consecutive launches.
    #[serde(default)]
    pub stagger_interval_secs: u64,
    /// Wall-clock limit for a single run. Absent means no limit.
    #[serde(default)]
    pub job_timeout_secs: Option<u64>,
}

impl DispatchConfig {
    pub fn new(
        queue_tag: impl Into<String>,
        store_path: impl Into<PathBuf>,
        ledger_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            queue_tag: queue_tag.into(),
            store_path: store_path.into(),
            ledger_path: ledger_path.into(),
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            stagger_interval_secs: 0,
            job_timeout_secs: None,
        }
    }

    pub fn stagger_interval(&self) -> Duration {
        Duration::from_secs(self.stagger_interval_secs)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

fn default_concurrency_limit() -> usize {
    DEFAULT_CONCURRENCY_LIMIT
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Directory for per-run log files. Absent means stdout only.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default = "default_max_log_files")]
    pub max_log_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            max_log_files: DEFAULT_MAX_LOG_FILES,
        }
    }
}

fn default_max_log_files() -> usize {
    DEFAULT_MAX_LOG_FILES
}

/// Pipeline keys handed to the job description builder.
///
/// Values stay optional here; the builder decides which ones it needs and
/// checks them once per pass, before anything is claimed.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Pipelines run for every sample. Defaults to rnaseq and rnafusion.
    #[serde(default = "default_pipelines")]
    pub pipelines: Vec<String>,
    /// Pipeline engine binary.
    pub nextflow: Option<String>,
    pub main: Option<String>,
    pub profile: Option<String>,
    pub custom_config: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub strandedness: Option<String>,
    pub genome: Option<String>,
    pub aligner: Option<String>,
    /// Pre-downloaded references, passed as `--<key> <value>`.
    #[serde(default)]
    pub references: BTreeMap<String, String>,
    #[serde(default)]
    pub fusion: BTreeMap<String, String>,
    /// Extra `--<key> <value>` parameters appended last, to every pipeline.
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pipelines: default_pipelines(),
            nextflow: None,
            main: None,
            profile: None,
            custom_config: None,
            output_dir: None,
            strandedness: None,
            genome: None,
            aligner: None,
            references: BTreeMap::new(),
            fusion: BTreeMap::new(),
            overrides: BTreeMap::new(),
        }
    }
}

fn default_pipelines() -> Vec<String> {
    DEFAULT_PIPELINES.iter().map(|p| p.to_string()).collect()
}

/// Complete settings file, resolved once at process start.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl Settings {
    /// Read, parse and validate a TOML settings file.
    pub fn load(path: &Path) -> Result<Self, DispatchError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Settings = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Pass-level checks. Pipeline keys are checked by the builder's own
    /// `validate`, which knows which of them it needs.
    pub fn validate(&self) -> Result<(), DispatchError> {
        let dispatch = &self.dispatch;
        if dispatch.queue_tag.trim().is_empty() {
            return Err(invalid("dispatch.queue_tag", "must not be empty").into());
        }
        if dispatch.store_path.as_os_str().is_empty() {
            return Err(invalid("dispatch.store_path", "must not be empty").into());
        }
        if dispatch.ledger_path.as_os_str().is_empty() {
            return Err(invalid("dispatch.ledger_path", "must not be empty").into());
        }
        if dispatch.concurrency_limit == 0 {
            return Err(DispatchError::InvalidConcurrency(dispatch.concurrency_limit));
        }
        if self.logging.max_log_files == 0 {
            return Err(invalid("logging.max_log_files", "must be greater than 0").into());
        }
        Ok(())
    }
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.to_string(),
    }
}
