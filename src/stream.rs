//! Streaming repair API: emit chunk results as they complete.
//!
//! Unlike the eager [`crate::repair::repair`], which returns only after the
//! whole document is reassembled and validated, [`repair_stream`] yields each
//! [`RepairResult`] as soon as its chunk resolves. Results arrive in
//! completion order; pass the collected results to [`crate::repair::finish`]
//! for the same finished document the eager path returns.

use crate::config::RepairConfig;
use crate::error::MdRepairError;
use crate::output::RepairResult;
use crate::pipeline::annotations::LinkAnnotation;
use crate::repair::{dispatch_chunk, prepare, resolve_service};
use futures::stream::{self, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;
use tracing::info;

/// A boxed stream of chunk results.
pub type RepairStream = Pin<Box<dyn Stream<Item = RepairResult> + Send>>;

/// Repair a document, streaming chunk results as they are ready.
///
/// Normalisation and chunking happen before this returns; the completion
/// calls run as the stream is polled, at most `config.concurrency` at once.
///
/// # Errors
/// Only fatal errors (no completion provider could be configured).
///
/// # Example
/// ```rust,no_run
/// use edgequake_mdrepair::{repair_stream, RepairConfig};
/// use futures::StreamExt;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = RepairConfig::default();
/// let mut stream = repair_stream("# Title\n\ntext\n", Vec::new(), &config)?;
/// while let Some(r) = stream.next().await {
///     println!("chunk {} ({}): {} chars", r.chunk_index, r.source, r.text.len());
/// }
/// # Ok(())
/// # }
/// ```
pub fn repair_stream(
    markdown: &str,
    annotations: Vec<LinkAnnotation>,
    config: &RepairConfig,
) -> Result<RepairStream, MdRepairError> {
    let service = resolve_service(config)?;
    let chunks = prepare(markdown, &annotations, config);
    let total = chunks.len();
    info!("Streaming repair of {} chunk(s)", total);
    if let Some(ref cb) = config.progress_callback {
        cb.on_repair_start(total);
    }

    let annotations = Arc::new(annotations);
    let config = Arc::new(config.clone());
    let concurrency = config.concurrency;
    let s = stream::iter(chunks.into_iter().map(move |chunk| {
        dispatch_chunk(
            service.clone(),
            chunk,
            Arc::clone(&annotations),
            Arc::clone(&config),
            total,
        )
    }))
    .buffer_unordered(concurrency);

    Ok(Box::pin(s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::ResultSource;

    #[tokio::test]
    async fn dry_run_stream_yields_every_chunk() {
        let config = RepairConfig::builder().dry_run(true).build().unwrap();
        let md = "# A\n\none\n\n# B\n\ntwo\n\n# C\n\nthree\n";
        let mut results: Vec<RepairResult> = repair_stream(md, Vec::new(), &config)
            .unwrap()
            .collect()
            .await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.source == ResultSource::Fallback));
        results.sort_by_key(|r| r.chunk_index);
        assert!(results[1].text.starts_with("# B"));
    }
}
