//! Error types for the edgequake-mdrepair library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`MdRepairError`] — **Fatal**: the run cannot proceed at all (input
//!   missing, provider not configured, output not writable). Returned as
//!   `Err(MdRepairError)` from the top-level `repair*` functions.
//!
//! * [`ServiceError`] — **Per dispatch**: one completion call failed. The
//!   orchestrator classifies it as transient (retry with backoff) or
//!   permanent (stop retrying) and, either way, degrades that single chunk to
//!   its deterministic fallback. It never aborts the run.
//!
//! Residual acceptance findings are not errors at all; they live in
//! [`crate::output::CoverageReport`] unless the caller asks for
//! [`MdRepairError::ResidualIssues`] via `fail_on_issues`.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// All fatal errors returned by the edgequake-mdrepair library.
#[derive(Debug, Error)]
pub enum MdRepairError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Markdown input file was not found at the given path.
    #[error("Markdown file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// The input exists but could not be read as UTF-8 text.
    #[error("Failed to read '{path}': {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Completion service errors ─────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Acceptance ────────────────────────────────────────────────────────
    /// The document was produced but the validator still found defects.
    ///
    /// Only returned when the caller opted in with `fail_on_issues`; the
    /// output has already been written by then.
    #[error("{count} residual acceptance issue(s) remain; first: {first}")]
    ResidualIssues { count: usize, first: String },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A failed dispatch to the completion service.
///
/// Transient variants feed the retry/backoff loop; the rest stop it.
#[derive(Debug, Clone, Error, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ServiceError {
    /// The attempt exceeded its per-request timeout.
    #[error("completion timed out after {secs}s")]
    Timeout { secs: u64 },

    /// HTTP 429 or a provider-specific throttling signal.
    #[error("rate limited: {detail}")]
    RateLimited { detail: String },

    /// 5xx / overloaded backend.
    #[error("server error: {detail}")]
    Server { detail: String },

    /// Connection reset, DNS failure and similar.
    #[error("network error: {detail}")]
    Network { detail: String },

    /// The request itself was rejected (400, unsupported parameter, ...).
    #[error("invalid request: {detail}")]
    InvalidRequest { detail: String },

    /// 401 / 403 — retrying will not help.
    #[error("authentication failed: {detail}")]
    Auth { detail: String },

    /// Anything the classifier does not recognise.
    #[error("{detail}")]
    Other { detail: String },
}

impl ServiceError {
    /// Whether the retry loop should try again after this failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ServiceError::Timeout { .. }
                | ServiceError::RateLimited { .. }
                | ServiceError::Server { .. }
                | ServiceError::Network { .. }
        )
    }

    /// Build the timeout variant from the elapsed per-attempt budget.
    pub fn timeout(limit: Duration) -> Self {
        ServiceError::Timeout {
            secs: limit.as_secs(),
        }
    }

    /// Classify a provider error message.
    ///
    /// Provider crates surface most failures as display strings, so the
    /// classification keys on status codes and well-known phrases. Unknown
    /// messages are permanent: retrying an unrecognised failure five times
    /// only delays the fallback.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        let detail = message.to_string();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        if has(&["timed out", "timeout", "deadline exceeded"]) {
            ServiceError::Timeout { secs: 0 }
        } else if has(&["429", "rate limit", "rate-limit", "ratelimit", "too many requests", "quota"]) {
            ServiceError::RateLimited { detail }
        } else if has(&["401", "403", "unauthorized", "forbidden", "invalid api key", "authentication"]) {
            ServiceError::Auth { detail }
        } else if has(&["500", "502", "503", "504", "529", "overloaded", "internal server error", "bad gateway", "service unavailable"]) {
            ServiceError::Server { detail }
        } else if has(&["connection", "connect error", "dns", "broken pipe", "reset by peer", "network"]) {
            ServiceError::Network { detail }
        } else if has(&["400", "bad request", "invalid request", "unsupported", "context length"]) {
            ServiceError::InvalidRequest { detail }
        } else {
            ServiceError::Other { detail }
        }
    }
}
