//! Eager (full-document) repair entry points.
//!
//! These wait for every chunk, then reassemble, re-normalise and validate
//! the document before returning. Use [`crate::stream::repair_stream`] to
//! see chunk results as they complete instead.

use crate::config::RepairConfig;
use crate::error::MdRepairError;
use crate::output::{CoverageReport, FallbackReason, RepairOutput, RepairResult, RepairStats, ResultSource};
use crate::pipeline::annotations::{append_missing_links, load_annotations, unique_uris, LinkAnnotation};
use crate::pipeline::chunk::{chunk_markdown, Chunk};
use crate::pipeline::completion::{CompletionService, ProviderService};
use crate::pipeline::llm::{fallback_text, repair_chunk};
use crate::pipeline::markdown::token_count;
use crate::pipeline::normalize::{normalize, NormalizeOptions};
use crate::pipeline::validate::validate;
use edgequake_llm::{LLMProvider, ProviderFactory};
use futures::stream::{self, StreamExt};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Repair a Markdown document.
///
/// This is the primary entry point for the library.
///
/// # Returns
/// `Ok(RepairOutput)` whenever a document could be produced, even if every
/// chunk fell back or the validator found residual issues (check
/// `output.report.issues`).
///
/// # Errors
/// Only fatal problems: no completion provider could be configured, or the
/// caller asked for `fail_on_issues` and issues remain.
pub async fn repair(
    markdown: &str,
    annotations: &[LinkAnnotation],
    config: &RepairConfig,
) -> Result<RepairOutput, MdRepairError> {
    let output = repair_document(markdown, annotations, config).await?;
    if config.fail_on_issues {
        output.into_result()
    } else {
        Ok(output)
    }
}

/// Read a Markdown file and an optional annotation file, then [`repair`].
pub async fn repair_files(
    markdown_path: impl AsRef<Path>,
    annotations_path: Option<&Path>,
    config: &RepairConfig,
) -> Result<RepairOutput, MdRepairError> {
    let (markdown, annotations) = read_inputs(markdown_path.as_ref(), annotations_path).await?;
    repair(&markdown, &annotations, config).await
}

/// Repair a file pair and write the result.
///
/// The Markdown is written atomically (temp file in the target directory,
/// then rename) and a JSON report lands next to it as
/// `<output>.report.json`. With `fail_on_issues`, the error is returned only
/// after both files are written.
pub async fn repair_to_file(
    markdown_path: impl AsRef<Path>,
    annotations_path: Option<&Path>,
    output_path: impl AsRef<Path>,
    config: &RepairConfig,
) -> Result<RepairOutput, MdRepairError> {
    let (markdown, annotations) = read_inputs(markdown_path.as_ref(), annotations_path).await?;
    let output = repair_document(&markdown, &annotations, config).await?;
    write_output(output_path.as_ref(), &output)?;

    if config.fail_on_issues {
        output.into_result()
    } else {
        Ok(output)
    }
}

/// Synchronous wrapper around [`repair`].
///
/// Creates a temporary tokio runtime internally.
pub fn repair_sync(
    markdown: &str,
    annotations: &[LinkAnnotation],
    config: &RepairConfig,
) -> Result<RepairOutput, MdRepairError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| MdRepairError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(repair(markdown, annotations, config))
}

/// Write the document atomically and its JSON report (`report`, `stats`,
/// `results`) next to it as `<path>.report.json`.
pub fn write_output(path: &Path, output: &RepairOutput) -> Result<(), MdRepairError> {
    write_atomic(path, output.markdown.as_bytes())?;
    let report = serde_json::json!({
        "report": &output.report,
        "stats": &output.stats,
        "results": &output.results,
    });
    let report_bytes = serde_json::to_vec_pretty(&report)
        .map_err(|e| MdRepairError::Internal(format!("report serialisation: {e}")))?;
    write_atomic(&report_path(path), &report_bytes)?;
    info!("Wrote {} ({} bytes)", path.display(), output.markdown.len());
    Ok(())
}

/// Path of the JSON report written next to `output`.
pub fn report_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".report.json");
    PathBuf::from(name)
}

// ── Shared stages ────────────────────────────────────────────────────────

/// Normalisation options for one run: the configured options plus every
/// annotation URI as a reference-inlining candidate.
pub(crate) fn run_options(annotations: &[LinkAnnotation], config: &RepairConfig) -> NormalizeOptions {
    let mut options = config.normalize.clone();
    for uri in unique_uris(annotations) {
        if !options.known_uris.iter().any(|k| k == uri) {
            options.known_uris.push(uri.to_string());
        }
    }
    options
}

/// First normalisation pass and chunking.
pub(crate) fn prepare(markdown: &str, annotations: &[LinkAnnotation], config: &RepairConfig) -> Vec<Chunk> {
    let normalized = normalize(markdown, &run_options(annotations, config));
    let chunks = chunk_markdown(&normalized, config.max_chunk_tokens);
    info!(
        "Normalised {} → {} proxy tokens; {} chunk(s)",
        token_count(markdown),
        token_count(&normalized),
        chunks.len()
    );
    chunks
}

/// Run one chunk on its own task so a panic degrades to a fallback result.
pub(crate) async fn dispatch_chunk(
    service: Option<Arc<dyn CompletionService>>,
    chunk: Chunk,
    annotations: Arc<Vec<LinkAnnotation>>,
    config: Arc<RepairConfig>,
    total: usize,
) -> RepairResult {
    let index = chunk.index;
    let content = chunk.content.clone();
    if let Some(ref cb) = config.progress_callback {
        cb.on_chunk_start(index, total);
    }

    let task_config = Arc::clone(&config);
    let handle = tokio::spawn(async move {
        repair_chunk(service.as_deref(), &chunk, &annotations, &task_config).await
    });
    let result = match handle.await {
        Ok(result) => result,
        Err(e) => {
            warn!("Chunk {}: worker task failed ({}); using fallback", index, e);
            RepairResult {
                chunk_index: index,
                text: fallback_text(&content, &config),
                source: ResultSource::Fallback,
                attempt_count: 0,
                fallback_reason: Some(FallbackReason::TaskPanicked),
                last_error: Some(e.to_string()),
                input_tokens: token_count(&content),
                output_tokens: 0,
                duration_ms: 0,
            }
        }
    };

    if let Some(ref cb) = config.progress_callback {
        cb.on_chunk_complete(index, total, result.source);
    }
    result
}

/// Turn chunk results (in any order) into the finished document.
///
/// Reassembles in index order, runs the stabilising normalisation pass,
/// appends missing annotation links when configured, then validates.
/// Durations in the returned stats are left at zero for the caller.
pub fn finish(
    mut results: Vec<RepairResult>,
    annotations: &[LinkAnnotation],
    config: &RepairConfig,
) -> RepairOutput {
    let options = run_options(annotations, config);
    let assembled = reassemble(&mut results);
    let mut markdown = normalize(&assembled, &options);
    if config.append_missing_links {
        markdown = append_missing_links(&markdown, annotations);
    }
    let report: CoverageReport = validate(&markdown, annotations, &options);

    let total = results.len();
    let model_chunks = results.iter().filter(|r| r.source == ResultSource::Model).count();
    let stats = RepairStats {
        total_chunks: total,
        model_chunks,
        fallback_chunks: total - model_chunks,
        total_attempts: results.iter().map(|r| r.attempt_count as u64).sum(),
        annotations_loaded: annotations.len(),
        total_input_tokens: results.iter().map(|r| r.input_tokens as u64).sum(),
        total_output_tokens: results.iter().map(|r| r.output_tokens as u64).sum(),
        total_duration_ms: 0,
        repair_duration_ms: 0,
    };
    RepairOutput {
        markdown,
        results,
        report,
        stats,
    }
}

/// Order results by chunk index and join them with a blank line.
pub fn reassemble(results: &mut [RepairResult]) -> String {
    results.sort_by_key(|r| r.chunk_index);
    results
        .iter()
        .map(|r| r.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

async fn repair_document(
    markdown: &str,
    annotations: &[LinkAnnotation],
    config: &RepairConfig,
) -> Result<RepairOutput, MdRepairError> {
    let total_start = Instant::now();
    info!(
        "Starting repair: {} bytes, {} annotation(s)",
        markdown.len(),
        annotations.len()
    );

    // ── Step 1: Resolve the completion service ───────────────────────────
    let service = resolve_service(config)?;

    // ── Step 2: Normalise and chunk ──────────────────────────────────────
    let chunks = prepare(markdown, annotations, config);
    let total = chunks.len();
    if let Some(ref cb) = config.progress_callback {
        cb.on_repair_start(total);
    }

    // ── Step 3: Repair chunks under the worker pool ──────────────────────
    let repair_start = Instant::now();
    let shared_annotations = Arc::new(annotations.to_vec());
    let shared_config = Arc::new(config.clone());
    let results: Vec<RepairResult> = stream::iter(chunks.into_iter().map(|chunk| {
        dispatch_chunk(
            service.clone(),
            chunk,
            Arc::clone(&shared_annotations),
            Arc::clone(&shared_config),
            total,
        )
    }))
    .buffer_unordered(config.concurrency)
    .collect()
    .await;
    let repair_duration_ms = repair_start.elapsed().as_millis() as u64;

    // ── Step 4: Reassemble, re-normalise, validate ───────────────────────
    let mut output = finish(results, annotations, config);
    output.stats.repair_duration_ms = repair_duration_ms;
    output.stats.total_duration_ms = total_start.elapsed().as_millis() as u64;

    let (stats, report) = (&output.stats, &output.report);
    if let Some(ref cb) = config.progress_callback {
        cb.on_repair_complete(total, stats.model_chunks, stats.fallback_chunks);
    }
    info!(
        "Repair complete: {}/{} chunks from the model, {} issue(s), {}/{} URIs present, {}ms",
        stats.model_chunks,
        total,
        report.issues.len(),
        report.unique_uris_present,
        report.unique_uris_total,
        stats.total_duration_ms
    );
    Ok(output)
}

// ── Internal helpers ─────────────────────────────────────────────────────

async fn read_inputs(
    markdown_path: &Path,
    annotations_path: Option<&Path>,
) -> Result<(String, Vec<LinkAnnotation>), MdRepairError> {
    if !markdown_path.exists() {
        return Err(MdRepairError::FileNotFound {
            path: markdown_path.to_path_buf(),
        });
    }
    let markdown = tokio::fs::read_to_string(markdown_path)
        .await
        .map_err(|e| MdRepairError::ReadFailed {
            path: markdown_path.to_path_buf(),
            source: e,
        })?;
    let annotations = match annotations_path {
        Some(p) => load_annotations(p),
        None => Vec::new(),
    };
    debug!(
        "Read {} ({} bytes), {} annotation(s)",
        markdown_path.display(),
        markdown.len(),
        annotations.len()
    );
    Ok((markdown, annotations))
}

/// Write through a temp file in the target directory, then rename, so a
/// reader never sees a partial file.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), MdRepairError> {
    let write_err = |e: std::io::Error| MdRepairError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    };
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(write_err)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(write_err)?;
    tmp.write_all(contents).map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}

/// Instantiate a named provider with the given model.
fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, MdRepairError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        MdRepairError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the completion service, from most-specific to least-specific.
///
/// 1. **Dry run** — no service at all.
/// 2. **Pre-built service** (`config.service`) — used as-is; tests plug in
///    scripted services here.
/// 3. **Pre-built provider** (`config.provider`) — wrapped in a
///    [`ProviderService`].
/// 4. **Named provider + model** (`config.provider_name`).
/// 5. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`).
/// 6. **OpenAI key** (`OPENAI_API_KEY`) — preferred when several keys exist.
/// 7. **Full auto-detection** (`ProviderFactory::from_env`).
pub(crate) fn resolve_service(
    config: &RepairConfig,
) -> Result<Option<Arc<dyn CompletionService>>, MdRepairError> {
    if config.dry_run {
        return Ok(None);
    }
    if let Some(ref service) = config.service {
        return Ok(Some(Arc::clone(service)));
    }

    let mut model = config.model.clone();
    let provider = resolve_provider(config, &mut model)?;
    let profile = config
        .profile
        .unwrap_or_else(|| crate::config::ProviderProfile::for_model(model.as_deref().unwrap_or("")));
    debug!(
        "Completion profile '{}' for model {:?}",
        profile.profile_id, model
    );
    Ok(Some(Arc::new(ProviderService::new(
        provider,
        profile,
        config.max_tokens,
        config.temperature,
    ))))
}

/// `model` is updated when the environment picks it.
fn resolve_provider(
    config: &RepairConfig,
    model: &mut Option<String>,
) -> Result<Arc<dyn LLMProvider>, MdRepairError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let m = model.get_or_insert_with(|| "gpt-4.1-mini".to_string());
        return create_provider(name, m);
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            let m = model.get_or_insert(env_model);
            return create_provider(&prov, m);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let m = model.get_or_insert_with(|| "gpt-4.1-mini".to_string());
            return create_provider("openai", m);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| MdRepairError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Use --dry-run to apply only the deterministic passes.\n\
                Error: {}",
                e
            ),
        })?;
    Ok(llm_provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(index: usize, text: &str) -> RepairResult {
        RepairResult {
            chunk_index: index,
            text: text.into(),
            source: ResultSource::Model,
            attempt_count: 1,
            fallback_reason: None,
            last_error: None,
            input_tokens: 1,
            output_tokens: 1,
            duration_ms: 0,
        }
    }

    #[test]
    fn reassembly_restores_chunk_order() {
        let mut results = vec![result(2, "c\n"), result(0, "\na"), result(1, "  "), result(3, "d")];
        assert_eq!(reassemble(&mut results), "a\n\nc\n\nd");
        assert_eq!(results[0].chunk_index, 0);
    }

    #[test]
    fn report_path_appends_suffix() {
        assert_eq!(report_path(Path::new("out/doc.md")), PathBuf::from("out/doc.md.report.json"));
    }

    #[test]
    fn dry_run_needs_no_provider() {
        let config = RepairConfig::builder().dry_run(true).build().unwrap();
        assert!(resolve_service(&config).unwrap().is_none());
    }

    #[test]
    fn atomic_write_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("a.md");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
        assert_eq!(std::fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn prepare_registers_annotation_uris() {
        let anns = vec![LinkAnnotation {
            page: 1,
            bbox: Default::default(),
            uri: "https://a.org".into(),
            text: String::new(),
        }];
        let config = RepairConfig::default();
        assert_eq!(run_options(&anns, &config).known_uris, vec!["https://a.org".to_string()]);
        assert_eq!(prepare("# T\n\ntext\n", &anns, &config).len(), 1);
    }

    #[test]
    fn finish_orders_and_appends_missing_links() {
        let anns = vec![LinkAnnotation {
            page: 2,
            bbox: Default::default(),
            uri: "https://b.org".into(),
            text: "Bee".into(),
        }];
        let results = vec![result(1, "Second https://a.org"), result(0, "# First")];
        let plain = finish(results.clone(), &anns, &RepairConfig::default());
        let first = plain.markdown.find("First").unwrap();
        assert!(first < plain.markdown.find("Second").unwrap());
        assert_eq!(plain.results[0].chunk_index, 0);
        assert_eq!(plain.stats.total_chunks, 2);
        assert_eq!(plain.stats.model_chunks, 2);
        assert_eq!((plain.report.unique_uris_present, plain.report.unique_uris_total), (0, 1));

        let config = RepairConfig::builder().append_missing_links(true).build().unwrap();
        let full = finish(results, &anns, &config);
        assert!(full.markdown.contains("## External Links"));
        assert!(full.markdown.contains("- [Bee](https://b.org)"));
        assert_eq!(full.report.unique_uris_present, full.report.unique_uris_total);
    }

    #[test]
    fn write_output_writes_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.md");
        let output = finish(vec![result(0, "# A")], &[], &RepairConfig::default());
        write_output(&path, &output).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), output.markdown);
        let report: serde_json::Value =
            serde_json::from_slice(&std::fs::read(report_path(&path)).unwrap()).unwrap();
        assert_eq!(report["stats"]["total_chunks"], 1);
    }

    #[tokio::test]
    async fn missing_input_is_fatal() {
        let config = RepairConfig::builder().dry_run(true).build().unwrap();
        let err = repair_files("/definitely/not/here.md", None, &config).await.unwrap_err();
        assert!(matches!(err, MdRepairError::FileNotFound { .. }));
    }
}
