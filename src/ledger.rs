//! Per-document, per-model run history.
//!
//! A small JSON file that records the outcome of the latest repair of each
//! (document, model) pair, so repeated runs over a corpus can be compared
//! without re-reading every report.

use crate::error::MdRepairError;
use crate::output::RepairOutput;
use crate::repair::write_atomic;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Outcome of one repair run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub document: String,
    pub model: String,
    pub total_chunks: usize,
    pub model_chunks: usize,
    pub fallback_chunks: usize,
    pub total_attempts: usize,
    pub unique_uris_total: usize,
    pub unique_uris_present: usize,
    pub issues: Vec<String>,
    pub duration_ms: u64,
    /// Seconds since the Unix epoch.
    pub recorded_at: u64,
}

impl RunSummary {
    pub fn from_output(document: &str, model: &str, output: &RepairOutput) -> Self {
        let recorded_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            document: document.to_string(),
            model: model.to_string(),
            total_chunks: output.stats.total_chunks,
            model_chunks: output.stats.model_chunks,
            fallback_chunks: output.stats.fallback_chunks,
            total_attempts: output.stats.total_attempts as usize,
            unique_uris_total: output.report.unique_uris_total,
            unique_uris_present: output.report.unique_uris_present,
            issues: output.report.issues.clone(),
            duration_ms: output.stats.total_duration_ms,
            recorded_at,
        }
    }

    pub fn coverage(&self) -> f64 {
        if self.unique_uris_total == 0 {
            1.0
        } else {
            self.unique_uris_present as f64 / self.unique_uris_total as f64
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    runs: Vec<RunSummary>,
}

/// JSON-backed store of [`RunSummary`] keyed by (document, model).
#[derive(Debug)]
pub struct RunLedger {
    path: PathBuf,
    runs: Vec<RunSummary>,
}

impl RunLedger {
    /// Open a ledger; a missing file is an empty ledger.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MdRepairError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Ok(Self { path, runs: Vec::new() });
        }
        let bytes = std::fs::read(&path).map_err(|e| MdRepairError::ReadFailed {
            path: path.clone(),
            source: e,
        })?;
        let file: LedgerFile = serde_json::from_slice(&bytes).map_err(|e| {
            MdRepairError::InvalidConfig(format!("ledger {} is not valid JSON: {e}", path.display()))
        })?;
        debug!("Loaded {} run(s) from {}", file.runs.len(), path.display());
        Ok(Self { path, runs: file.runs })
    }

    /// Insert or replace the run for `(summary.document, summary.model)`.
    pub fn record(&mut self, summary: RunSummary) {
        match self
            .runs
            .iter_mut()
            .find(|r| r.document == summary.document && r.model == summary.model)
        {
            Some(slot) => *slot = summary,
            None => self.runs.push(summary),
        }
    }

    pub fn get(&self, document: &str, model: &str) -> Option<&RunSummary> {
        self.runs
            .iter()
            .find(|r| r.document == document && r.model == model)
    }

    pub fn runs(&self) -> &[RunSummary] {
        &self.runs
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the ledger back atomically.
    pub fn save(&self) -> Result<(), MdRepairError> {
        let file = LedgerFile {
            runs: self.runs.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&file)
            .map_err(|e| MdRepairError::Internal(format!("ledger serialisation: {e}")))?;
        write_atomic(&self.path, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(doc: &str, model: &str, fallback: usize) -> RunSummary {
        RunSummary {
            document: doc.into(),
            model: model.into(),
            total_chunks: 4,
            model_chunks: 4 - fallback,
            fallback_chunks: fallback,
            total_attempts: 5,
            unique_uris_total: 4,
            unique_uris_present: 3,
            issues: vec![],
            duration_ms: 10,
            recorded_at: 0,
        }
    }

    #[test]
    fn record_replaces_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = RunLedger::load(dir.path().join("ledger.json")).unwrap();
        ledger.record(summary("a.md", "gpt-4.1-mini", 1));
        ledger.record(summary("a.md", "gpt-5-mini", 0));
        ledger.record(summary("a.md", "gpt-4.1-mini", 2));
        assert_eq!(ledger.runs().len(), 2);
        assert_eq!(ledger.get("a.md", "gpt-4.1-mini").unwrap().fallback_chunks, 2);
        assert!(ledger.get("b.md", "gpt-4.1-mini").is_none());
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.json");
        let mut ledger = RunLedger::load(&path).unwrap();
        ledger.record(summary("a.md", "m", 0));
        ledger.save().unwrap();

        let reloaded = RunLedger::load(&path).unwrap();
        assert_eq!(reloaded.runs(), ledger.runs());
        assert!((reloaded.runs()[0].coverage() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn corrupt_ledger_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(RunLedger::load(&path).is_err());
    }
}
