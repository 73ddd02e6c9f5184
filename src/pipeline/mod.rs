//! Pipeline stages for Markdown repair.
//!
//! Each submodule implements exactly one step, so every stage can be tested
//! on its own.
//!
//! ## Data Flow
//!
//! ```text
//! annotations ─────────────────────────────┐
//!                                          ▼
//! markdown ──▶ normalize ──▶ chunk ──▶ llm (completion) ──▶ reassemble
//!                                                         │
//!              validate ◀── normalize (second pass) ◀─────┘
//! ```
//!
//! 1. [`annotations`] — load the PDF link-annotation table
//! 2. [`normalize`]   — ordered, idempotent deterministic passes
//! 3. [`chunk`]       — split into budgeted chunks without breaking tables
//!    or fenced code
//! 4. [`llm`]         — per-chunk dispatch with retry, gating and fallback;
//!    the only stage with network I/O, through [`completion`]
//! 5. [`postprocess`] — cleanup of model answers before they are gated
//! 6. [`validate`]    — acceptance checks and URI coverage
//!
//! [`markdown`] holds the structural scanner the other stages share.

pub mod annotations;
pub mod chunk;
pub mod completion;
pub mod llm;
pub mod markdown;
pub mod normalize;
pub mod postprocess;
pub mod validate;
