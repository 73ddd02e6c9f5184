//! Output types returned by the repair pipeline.

use crate::error::MdRepairError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where the kept text of a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultSource {
    /// The completion service's answer passed every gate.
    Model,
    /// The deterministically cleaned chunk text.
    Fallback,
}

impl fmt::Display for ResultSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResultSource::Model => "model",
            ResultSource::Fallback => "fallback",
        })
    }
}

/// Why a chunk fell back to its deterministic text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// The run was a dry run; no dispatch was made.
    DryRun,
    /// Every attempt failed, or a permanent error stopped retrying.
    ServiceFailed,
    /// The answer was shorter than the quality gate allows.
    Truncated,
    /// The answer lost a URL that the chunk contained.
    LinksDropped,
    /// The answer was empty after cleanup.
    EmptyResponse,
    /// The worker task panicked.
    TaskPanicked,
}

/// The outcome for one chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairResult {
    pub chunk_index: usize,

    /// Kept text. Not serialised: the assembled document carries it.
    #[serde(skip_serializing, default)]
    pub text: String,

    pub source: ResultSource,

    /// Dispatch attempts made (0 in a dry run).
    pub attempt_count: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<FallbackReason>,

    /// Last service error, when there was one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Token-proxy length of the chunk sent.
    pub input_tokens: usize,

    /// Token-proxy length of the cleaned answer (0 without one).
    pub output_tokens: usize,

    pub duration_ms: u64,
}

impl RepairResult {
    pub fn is_fallback(&self) -> bool {
        self.source == ResultSource::Fallback
    }
}

/// Acceptance findings for a final document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageReport {
    /// Distinct URIs in the annotation set.
    pub unique_uris_total: usize,
    /// Distinct annotation URIs found literally in the document.
    pub unique_uris_present: usize,
    /// Failed checks, by name.
    pub issues: Vec<String>,
}

impl CoverageReport {
    /// Share of annotation URIs present; 1.0 when there are none.
    pub fn coverage(&self) -> f64 {
        if self.unique_uris_total == 0 {
            1.0
        } else {
            self.unique_uris_present as f64 / self.unique_uris_total as f64
        }
    }

    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Aggregate statistics for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepairStats {
    pub total_chunks: usize,
    pub model_chunks: usize,
    pub fallback_chunks: usize,
    /// Sum of dispatch attempts over all chunks.
    pub total_attempts: u64,
    pub annotations_loaded: usize,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_duration_ms: u64,
    /// Wall-clock time spent in the worker pool.
    pub repair_duration_ms: u64,
}

/// Everything a repair run produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairOutput {
    /// Final Markdown document.
    pub markdown: String,
    /// Per-chunk outcomes in chunk order.
    pub results: Vec<RepairResult>,
    pub report: CoverageReport,
    pub stats: RepairStats,
}

impl RepairOutput {
    /// Fail with [`MdRepairError::ResidualIssues`] if the validator found
    /// anything.
    pub fn into_result(self) -> Result<Self, MdRepairError> {
        match self.report.issues.first() {
            Some(first) => Err(MdRepairError::ResidualIssues {
                count: self.report.issues.len(),
                first: first.clone(),
            }),
            None => Ok(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(issues: Vec<String>) -> RepairOutput {
        RepairOutput {
            markdown: "# A\n".into(),
            results: vec![RepairResult {
                chunk_index: 0,
                text: "# A".into(),
                source: ResultSource::Fallback,
                attempt_count: 0,
                fallback_reason: Some(FallbackReason::DryRun),
                last_error: None,
                input_tokens: 2,
                output_tokens: 0,
                duration_ms: 1,
            }],
            report: CoverageReport {
                unique_uris_total: 4,
                unique_uris_present: 3,
                issues,
            },
            stats: RepairStats::default(),
        }
    }

    #[test]
    fn result_json_shape() {
        let json = serde_json::to_value(&output(vec![]).results[0]).unwrap();
        assert_eq!(json["source"], "fallback");
        assert_eq!(json["fallback_reason"], "dry_run");
        assert!(json.get("text").is_none());
        assert!(json.get("last_error").is_none());
    }

    #[test]
    fn coverage_ratio() {
        let out = output(vec![]);
        assert!((out.report.coverage() - 0.75).abs() < 1e-9);
        assert_eq!(CoverageReport::default().coverage(), 1.0);
    }

    #[test]
    fn into_result_reports_issues() {
        assert!(output(vec![]).into_result().is_ok());
        match output(vec!["furniture:on this page".into()]).into_result() {
            Err(MdRepairError::ResidualIssues { count, first }) => {
                assert_eq!(count, 1);
                assert_eq!(first, "furniture:on this page");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
