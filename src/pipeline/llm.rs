//! Per-chunk repair: build the request, dispatch with retry, gate the answer.
//!
//! Each chunk moves through `PENDING → DISPATCHED → (SUCCESS | RETRY |
//! FALLBACK)`. Whatever happens, [`repair_chunk`] returns a
//! [`RepairResult`]; a failed or rejected chunk degrades to its
//! deterministically cleaned text and never aborts the run.
//!
//! ## Retry Strategy
//!
//! Timeouts, rate limits, 5xx and network errors are transient and retried
//! with exponential backoff (`retry_backoff_ms * 2^(n-1)` plus up to 50 %
//! jitter): with the 1 s default and 5 attempts the waits are roughly
//! 1 s → 2 s → 4 s → 8 s. Permanent errors (bad request, auth) stop the loop
//! at once.
//!
//! ## Gates
//!
//! A cleaned answer is kept only if it is non-empty, at least
//! `max(min_output_tokens, quality_ratio × input)` proxy tokens long, and
//! still contains every URL of the chunk.

use crate::config::RepairConfig;
use crate::error::ServiceError;
use crate::output::{FallbackReason, RepairResult, ResultSource};
use crate::pipeline::annotations::{filter_by_pages, page_span, to_csv_payload, LinkAnnotation};
use crate::pipeline::chunk::Chunk;
use crate::pipeline::completion::{CompletionRequest, CompletionService};
use crate::pipeline::markdown::token_count;
use crate::pipeline::normalize::fix_malformed_links;
use crate::pipeline::postprocess::clean_model_output;
use crate::prompts::{system_prompt, user_payload};
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use std::time::Instant;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, warn};

/// Repair one chunk. `service` is `None` in a dry run.
pub async fn repair_chunk(
    service: Option<&dyn CompletionService>,
    chunk: &Chunk,
    annotations: &[LinkAnnotation],
    config: &RepairConfig,
) -> RepairResult {
    let start = Instant::now();
    let input_tokens = token_count(&chunk.content);
    let baseline = fallback_text(&chunk.content, config);

    let fallback = |reason: FallbackReason, attempts: u32, last_error: Option<String>| RepairResult {
        chunk_index: chunk.index,
        text: baseline.clone(),
        source: ResultSource::Fallback,
        attempt_count: attempts,
        fallback_reason: Some(reason),
        last_error,
        input_tokens,
        output_tokens: 0,
        duration_ms: start.elapsed().as_millis() as u64,
    };

    let service = match service {
        Some(s) if !config.dry_run => s,
        _ => return fallback(FallbackReason::DryRun, 0, None),
    };

    let request = build_request(chunk, annotations, config);
    let per_attempt = Duration::from_secs(config.api_timeout_secs);
    let mut last_err: Option<ServiceError> = None;
    let mut attempts = 0;

    for attempt in 1..=config.max_attempts {
        if attempt > 1 {
            let delay = backoff_delay(config.retry_backoff_ms, attempt - 1);
            warn!(
                "Chunk {}: retry {}/{} after {}ms",
                chunk.index,
                attempt - 1,
                config.max_attempts - 1,
                delay.as_millis()
            );
            sleep(delay).await;
        }
        attempts = attempt;

        let outcome = match timeout(per_attempt, service.complete(&request)).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::timeout(per_attempt)),
        };

        match outcome {
            Ok(response) => {
                let cleaned = clean_model_output(&response.text, &chunk.content);
                let output_tokens = token_count(&cleaned);
                debug!(
                    "Chunk {}: {} → {} proxy tokens in {:?}",
                    chunk.index,
                    input_tokens,
                    output_tokens,
                    start.elapsed()
                );

                let rejection = if cleaned.trim().is_empty() {
                    Some(FallbackReason::EmptyResponse)
                } else if !passes_quality_gate(input_tokens, output_tokens, config) {
                    Some(FallbackReason::Truncated)
                } else if !dropped_urls(&baseline, &cleaned).is_empty() {
                    Some(FallbackReason::LinksDropped)
                } else {
                    None
                };

                if let Some(reason) = rejection {
                    warn!(
                        "Chunk {}: model output rejected ({:?}, {} of {} tokens); using fallback",
                        chunk.index, reason, output_tokens, input_tokens
                    );
                    let mut result = fallback(reason, attempt, None);
                    result.output_tokens = output_tokens;
                    return result;
                }

                return RepairResult {
                    chunk_index: chunk.index,
                    text: cleaned,
                    source: ResultSource::Model,
                    attempt_count: attempt,
                    fallback_reason: None,
                    last_error: None,
                    input_tokens,
                    output_tokens,
                    duration_ms: start.elapsed().as_millis() as u64,
                };
            }
            Err(e) => {
                warn!("Chunk {}: attempt {} failed — {}", chunk.index, attempt, e);
                let transient = e.is_transient();
                last_err = Some(e);
                if !transient {
                    break;
                }
            }
        }
    }

    let detail = last_err.map(|e| e.to_string());
    warn!(
        "Chunk {}: giving up after {} attempt(s); using fallback",
        chunk.index, attempts
    );
    fallback(FallbackReason::ServiceFailed, attempts, detail)
}

/// The deterministic text kept when the model answer is not: the chunk with
/// the malformed-link fixups applied.
pub fn fallback_text(content: &str, config: &RepairConfig) -> String {
    fix_malformed_links(content, &config.normalize)
}

/// Build the request for a chunk, shrinking the annotation subset until the
/// payload fits `token_budget`.
pub fn build_request(
    chunk: &Chunk,
    annotations: &[LinkAnnotation],
    config: &RepairConfig,
) -> CompletionRequest {
    let mut subset = select_annotations(chunk, annotations, config);
    let mut user = user_payload(&chunk.content, &to_csv_payload(&subset));
    while token_count(&user) > config.token_budget && !subset.is_empty() {
        subset.truncate(subset.len() / 2);
        user = user_payload(&chunk.content, &to_csv_payload(&subset));
    }
    debug!(
        "Chunk {}: payload ~{} tokens, {} annotation rows",
        chunk.index,
        token_count(&user),
        subset.len()
    );

    let profile = config.resolved_profile();
    CompletionRequest {
        system: system_prompt(config.system_prompt.as_deref(), profile.compact_prompt).to_string(),
        user,
    }
}

/// Annotations for a chunk: its own page markers first, then the caller's
/// ranges, then the full annotation span.
fn select_annotations<'a>(
    chunk: &Chunk,
    annotations: &'a [LinkAnnotation],
    config: &RepairConfig,
) -> Vec<&'a LinkAnnotation> {
    if !config.include_annotations {
        return Vec::new();
    }
    let range = chunk
        .page_range
        .or_else(|| config.page_ranges.for_chunk(chunk.index))
        .or_else(|| page_span(annotations));
    match range {
        Some(r) => filter_by_pages(annotations, r),
        None => Vec::new(),
    }
}

/// Whether an answer is long enough to be trusted.
pub fn passes_quality_gate(input_tokens: usize, output_tokens: usize, config: &RepairConfig) -> bool {
    let floor = (config.quality_ratio * input_tokens as f64).max(config.min_output_tokens as f64);
    output_tokens as f64 >= floor
}

static RE_URL: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(?:https?://|mailto:)[^\s()<>\[\]|"'`]+"#).unwrap());

/// URLs of `original` that no longer appear in `repaired`.
pub fn dropped_urls(original: &str, repaired: &str) -> Vec<String> {
    let mut missing: Vec<String> = RE_URL
        .find_iter(original)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?', '*']))
        .filter(|url| url.len() > "https://".len() && !repaired.contains(url))
        .map(str::to_string)
        .collect();
    missing.dedup();
    missing
}

/// Delay before retry number `retry` (1-based), with up to 50 % jitter.
fn backoff_delay(base_ms: u64, retry: u32) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << retry.saturating_sub(1).min(16));
    let jitter = if exp >= 2 {
        rand::thread_rng().gen_range(0..=exp / 2)
    } else {
        0
    };
    Duration::from_millis(exp + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PageRanges;
    use crate::pipeline::annotations::{BoundingBox, PageRange};
    use crate::pipeline::completion::CompletionResponse;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn chunk(index: usize, content: &str) -> Chunk {
        Chunk {
            index,
            content: content.to_string(),
            is_atomic: false,
            page_range: None,
        }
    }

    fn annotation(page: u32, uri: &str) -> LinkAnnotation {
        LinkAnnotation {
            page,
            bbox: BoundingBox::default(),
            uri: uri.to_string(),
            text: "link".to_string(),
        }
    }

    fn fast_config() -> RepairConfig {
        RepairConfig::builder()
            .retry_backoff_ms(0)
            .api_timeout_secs(5)
            .build()
            .unwrap()
    }

    /// Fails transiently `failures` times, then echoes the slice.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        error: ServiceError,
    }

    #[async_trait]
    impl CompletionService for Flaky {
        async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ServiceError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(self.error.clone());
            }
            let slice = request
                .user
                .split("=== MARKDOWN SLICE BEGIN ===\n")
                .nth(1)
                .and_then(|s| s.split("\n=== MARKDOWN SLICE END ===").next())
                .unwrap_or_default();
            Ok(CompletionResponse::text(slice))
        }
    }

    fn flaky(failures: u32, error: ServiceError) -> Flaky {
        Flaky {
            failures,
            calls: AtomicU32::new(0),
            error,
        }
    }

    #[test]
    fn quality_gate_threshold() {
        let c = fast_config();
        assert!(!passes_quality_gate(1000, 100, &c));
        assert!(!passes_quality_gate(1000, 599, &c));
        assert!(passes_quality_gate(1000, 600, &c));
        let floored = RepairConfig::builder().min_output_tokens(200).build().unwrap();
        assert!(!passes_quality_gate(10, 150, &floored));
    }

    #[test]
    fn dropped_urls_are_detected() {
        let original = "See https://a.org/x. and [b](https://b.org)";
        assert!(dropped_urls(original, "[x](https://a.org/x) [b](https://b.org)").is_empty());
        assert_eq!(dropped_urls(original, "https://a.org/x"), vec!["https://b.org"]);
    }

    #[test]
    fn backoff_doubles_with_bounded_jitter() {
        for retry in 1..=4 {
            let base = 100 * (1u64 << (retry - 1));
            let d = backoff_delay(100, retry).as_millis() as u64;
            assert!(d >= base && d <= base + base / 2, "retry {retry}: {d}");
        }
        assert_eq!(backoff_delay(0, 3), Duration::ZERO);
    }

    #[test]
    fn annotation_selection_order() {
        let anns = vec![annotation(1, "https://one"), annotation(5, "https://five")];
        let mut c = chunk(3, "x");
        let cfg = RepairConfig::builder()
            .page_ranges(PageRanges(vec![PageRange::new(1, 2), PageRange::new(5, 5)]))
            .build()
            .unwrap();
        assert_eq!(select_annotations(&c, &anns, &cfg)[0].uri, "https://five");
        c.page_range = Some(PageRange::new(1, 1));
        assert_eq!(select_annotations(&c, &anns, &cfg)[0].uri, "https://one");
        assert_eq!(select_annotations(&chunk(0, "x"), &anns, &fast_config()).len(), 2);
        let off = RepairConfig::builder().include_annotations(false).build().unwrap();
        assert!(select_annotations(&c, &anns, &off).is_empty());
    }

    #[test]
    fn payload_shrinks_to_budget() {
        let anns: Vec<_> = (0..400)
            .map(|i| annotation(1, &format!("https://host/{i} with some words")))
            .collect();
        let cfg = RepairConfig::builder()
            .max_chunk_tokens(50)
            .token_budget(300)
            .build()
            .unwrap();
        let req = build_request(&chunk(0, "short text"), &anns, &cfg);
        assert!(token_count(&req.user) <= 300);
        assert!(req.user.contains("short text"));
    }

    #[tokio::test]
    async fn dry_run_is_fallback_without_attempts() {
        let cfg = RepairConfig::builder().dry_run(true).build().unwrap();
        let svc = flaky(0, ServiceError::Other { detail: String::new() });
        let r = repair_chunk(Some(&svc as &dyn CompletionService), &chunk(0, "https://[https://a.org]]"), &[], &cfg).await;
        assert_eq!(r.source, ResultSource::Fallback);
        assert_eq!(r.attempt_count, 0);
        assert_eq!(r.fallback_reason, Some(FallbackReason::DryRun));
        assert_eq!(r.text, "https://a.org");
        assert_eq!(svc.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let svc = flaky(2, ServiceError::RateLimited { detail: "429".into() });
        let r = repair_chunk(Some(&svc as &dyn CompletionService), &chunk(0, "some words here"), &[], &fast_config()).await;
        assert_eq!(r.source, ResultSource::Model);
        assert_eq!(r.attempt_count, 3);
        assert_eq!(r.text, "some words here");
    }

    #[tokio::test]
    async fn permanent_error_stops_immediately() {
        let svc = flaky(10, ServiceError::Auth { detail: "401".into() });
        let r = repair_chunk(Some(&svc as &dyn CompletionService), &chunk(0, "text"), &[], &fast_config()).await;
        assert_eq!(r.source, ResultSource::Fallback);
        assert_eq!(r.fallback_reason, Some(FallbackReason::ServiceFailed));
        assert_eq!(r.attempt_count, 1);
        assert!(r.last_error.unwrap_or_default().contains("401"));
    }

    #[tokio::test]
    async fn exhausted_retries_fall_back() {
        let svc = flaky(10, ServiceError::Server { detail: "503".into() });
        let r = repair_chunk(Some(&svc as &dyn CompletionService), &chunk(0, "text"), &[], &fast_config()).await;
        assert_eq!(r.attempt_count, 5);
        assert_eq!(svc.calls.load(Ordering::SeqCst), 5);
        assert!(r.is_fallback());
    }
}
