//! # edgequake-mdrepair
//!
//! Repair Markdown extracted from PDFs, using the PDF's own link annotations
//! as ground truth.
//!
//! ## Why this crate?
//!
//! PDF-to-Markdown extractors lose what the page only showed visually:
//! clickable link targets vanish behind their anchor text, tables arrive
//! split or duplicated, page furniture ("On this page", tables of contents)
//! leaks into the body, and link syntax comes out mangled
//! (`https://[https://x.org]]`). This crate fixes what rules can fix, asks a
//! language model to fix the rest chunk by chunk, and never returns a
//! document that is worse than the deterministic baseline: every chunk the
//! model cannot repair safely falls back to the rule-based text.
//!
//! ## Pipeline Overview
//!
//! ```text
//! Markdown + link annotations (CSV / JSON)
//!  │
//!  ├─ 1. Normalise  ordered, idempotent rule passes (links, tables, furniture…)
//!  ├─ 2. Chunk      heading-aware, token-budgeted; tables and code stay whole
//!  ├─ 3. Repair     concurrent completion calls, retry with backoff,
//!  │                quality gate, deterministic fallback per chunk
//!  ├─ 4. Assemble   chunk order restored, second normalisation pass,
//!  │                optional External Links section for missing URIs
//!  └─ 5. Validate   residual issues + annotation URI coverage
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_mdrepair::{repair_files, RepairConfig};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from EDGEQUAKE_* / OPENAI_API_KEY / …
//!     let config = RepairConfig::default();
//!     let output = repair_files("doc.md", Some(Path::new("doc.links.csv")), &config).await?;
//!     println!("{}", output.markdown);
//!     eprintln!(
//!         "{} chunk(s), {} fallback, coverage {:.0}%",
//!         output.stats.total_chunks,
//!         output.stats.fallback_chunks,
//!         output.report.coverage() * 100.0
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `mdrepair` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! ```toml
//! edgequake-mdrepair = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod compare;
pub mod config;
pub mod error;
pub mod ledger;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod repair;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use compare::{compare_files, compare_texts, Comparison, DocumentProfile};
pub use config::{PageRange, PageRanges, ProviderProfile, RepairConfig, RepairConfigBuilder, TokenParam};
pub use error::{MdRepairError, ServiceError};
pub use ledger::{RunLedger, RunSummary};
pub use output::{CoverageReport, FallbackReason, RepairOutput, RepairResult, RepairStats, ResultSource};
pub use pipeline::annotations::{append_missing_links, load_annotations, LinkAnnotation};
pub use pipeline::completion::{CompletionRequest, CompletionResponse, CompletionService, ProviderService};
pub use pipeline::normalize::{normalize, NormalizeOptions};
pub use pipeline::validate::validate;
pub use progress::{NoopProgressCallback, ProgressCallback, RepairProgressCallback};
pub use repair::{finish, reassemble, repair, repair_files, repair_sync, repair_to_file, write_output};
pub use stream::{repair_stream, RepairStream};
