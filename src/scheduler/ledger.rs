use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::{DispatchError, Result};
use crate::scheduler::job::CompositeKey;

/// Local append-only list of composite keys that completed a full pass.
///
/// One key per line (`sample<TAB>run_tag`). Read in full when loaded,
/// appended to as outcomes are recorded, never rewritten.
#[derive(Debug)]
pub struct ProcessedLedger {
    path: PathBuf,
    keys: HashSet<CompositeKey>,
}

impl ProcessedLedger {
    /// Load the ledger at `path`. A missing file is an empty ledger.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let keys = match fs::read_to_string(&path) {
            Ok(text) => parse_lines(&path, &text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No processed ledger yet, starting empty");
                HashSet::new()
            }
            Err(source) => return Err(DispatchError::Ledger { path, source }),
        };

        tracing::debug!(path = %path.display(), entries = keys.len(), "Loaded processed ledger");
        Ok(Self { path, keys })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, key: &CompositeKey) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Append `key` to the file, then to the in-memory set.
    pub fn append(&mut self, key: &CompositeKey) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", key.to_ledger_line())?;
        file.flush()?;

        self.keys.insert(key.clone());
        Ok(())
    }
}

fn parse_lines(path: &Path, text: &str) -> HashSet<CompositeKey> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(idx, line)| {
            let key = CompositeKey::from_ledger_line(line);
            if key.is_none() {
                tracing::warn!(
                    path = %path.display(),
                    line = idx + 1,
                    "Skipping malformed ledger line"
                );
            }
            key
        })
        .collect()
}
