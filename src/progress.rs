//! Progress-callback trait for per-chunk repair events.
//!
//! Inject an [`Arc<dyn RepairProgressCallback>`] via
//! [`crate::config::RepairConfigBuilder::progress_callback`] to receive
//! events as the orchestrator works through the chunks. Callers can forward
//! them to a terminal progress bar, a channel or a log without the library
//! knowing how the host application communicates.
//!
//! # Example
//!
//! ```rust
//! use edgequake_mdrepair::{RepairConfig, RepairProgressCallback, ResultSource};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct FallbackCounter(AtomicUsize);
//!
//! impl RepairProgressCallback for FallbackCounter {
//!     fn on_chunk_complete(&self, _index: usize, _total: usize, source: ResultSource) {
//!         if source == ResultSource::Fallback {
//!             self.0.fetch_add(1, Ordering::SeqCst);
//!         }
//!     }
//! }
//!
//! let config = RepairConfig::builder()
//!     .progress_callback(Arc::new(FallbackCounter(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

use crate::output::ResultSource;
use std::sync::Arc;

/// Called by the orchestrator as it processes each chunk.
///
/// Chunks run concurrently, so `on_chunk_start` and `on_chunk_complete` may
/// be called from different threads at the same time. All methods default to
/// no-ops.
pub trait RepairProgressCallback: Send + Sync {
    /// Called once after chunking, before any dispatch.
    fn on_repair_start(&self, total_chunks: usize) {
        let _ = total_chunks;
    }

    /// Called just before a chunk is dispatched (0-indexed).
    fn on_chunk_start(&self, index: usize, total_chunks: usize) {
        let _ = (index, total_chunks);
    }

    /// Called when a chunk has a final result.
    fn on_chunk_complete(&self, index: usize, total_chunks: usize, source: ResultSource) {
        let _ = (index, total_chunks, source);
    }

    /// Called once after every chunk has resolved.
    fn on_repair_complete(&self, total_chunks: usize, model_count: usize, fallback_count: usize) {
        let _ = (total_chunks, model_count, fallback_count);
    }
}

/// A no-op implementation, the default when no callback is configured.
pub struct NoopProgressCallback;

impl RepairProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::RepairConfig`].
pub type ProgressCallback = Arc<dyn RepairProgressCallback>;
