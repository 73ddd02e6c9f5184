//! CLI binary for edgequake-mdrepair.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `RepairConfig` and prints results.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use edgequake_mdrepair::{
    compare_files, finish, load_annotations, repair, repair_stream, repair_to_file, validate,
    write_output, CoverageReport, NormalizeOptions, PageRange, PageRanges, ProgressCallback, ProviderProfile,
    RepairConfig, RepairOutput, RepairProgressCallback, RepairResult, ResultSource, RunLedger,
    RunSummary,
};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: [&str; 11] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Live progress bar plus one log line per chunk. Chunks complete out of
/// order, so lines are printed as they arrive.
struct CliProgressCallback {
    bar: ProgressBar,
    fallbacks: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&TICKS),
        );
        bar.set_prefix("Preparing");
        bar.set_message("Normalising…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            fallbacks: AtomicUsize::new(0),
        })
    }
}

impl RepairProgressCallback for CliProgressCallback {
    fn on_repair_start(&self, total_chunks: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} chunks  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&TICKS);
        self.bar.set_length(total_chunks as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Repairing");
        self.bar.reset_eta();
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Repairing {total_chunks} chunk(s)…"))
        ));
    }

    fn on_chunk_start(&self, chunk_index: usize, _total: usize) {
        self.bar.set_message(format!("chunk {}", chunk_index + 1));
    }

    fn on_chunk_complete(&self, chunk_index: usize, total: usize, source: ResultSource) {
        let mark = match source {
            ResultSource::Model => green("✓"),
            ResultSource::Fallback => {
                self.fallbacks.fetch_add(1, Ordering::SeqCst);
                yellow("↺")
            }
        };
        self.bar.println(format!(
            "  {} Chunk {:>3}/{:<3}  {}",
            mark,
            chunk_index + 1,
            total,
            dim(&source.to_string())
        ));
        self.bar.inc(1);
    }

    fn on_repair_complete(&self, total_chunks: usize, model_count: usize, fallback_count: usize) {
        self.bar.finish_and_clear();
        let mark = if fallback_count == 0 {
            green("✔")
        } else if model_count == 0 {
            red("✘")
        } else {
            cyan("⚠")
        };
        eprintln!(
            "{} {}/{} chunks repaired by the model  ({} fallback)",
            mark,
            bold(&model_count.to_string()),
            total_chunks,
            fallback_count
        );
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Repair to stdout, deterministic rules only (no API key needed)
  mdrepair repair doc.md doc.links.csv --dry-run

  # Repair to file (writes doc.fixed.md and doc.fixed.md.report.json)
  mdrepair repair doc.md doc.links.csv -o doc.fixed.md

  # Pick a model; restrict annotation pages for the first two chunks
  mdrepair repair doc.md doc.links.csv --model gpt-5-mini --pages 1-4 --pages 5-9 -o out.md

  # Record the run in a ledger and fail (exit 2) on residual issues
  mdrepair repair doc.md doc.links.csv -o out.md --ledger runs.json --fail-on-issues

  # Compare two extractions
  mdrepair compare --old doc.md --new out.md --out cmp.json

  # Only run the acceptance checks
  mdrepair check out.md --annotations doc.links.csv

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  EDGEQUAKE_LLM_PROVIDER  Provider used when --provider is not set
  EDGEQUAKE_MODEL         Model used with EDGEQUAKE_LLM_PROVIDER
  MDREPAIR_*              Every repair flag, e.g. MDREPAIR_CONCURRENCY=8
  RUST_LOG                Log filter (overrides --verbose)

EXIT CODES:
  0  success
  1  fatal error
  2  residual acceptance issues (repair --fail-on-issues, check)
"#;

/// Repair PDF-extracted Markdown using the PDF's link annotations.
#[derive(Parser, Debug)]
#[command(
    name = "mdrepair",
    version,
    about = "Repair PDF-extracted Markdown using the PDF's link annotations",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "MDREPAIR_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "MDREPAIR_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full pipeline on a Markdown file and its link annotations.
    Repair(RepairArgs),
    /// Compare table, link and heading counts of two Markdown files.
    Compare {
        #[arg(long)]
        old: PathBuf,
        #[arg(long)]
        new: PathBuf,
        /// Also write the comparison as JSON.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Run only the acceptance validator.
    Check {
        markdown: PathBuf,
        #[arg(long)]
        annotations: Option<PathBuf>,
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct RepairArgs {
    /// Markdown extracted from the PDF.
    markdown: PathBuf,

    /// Link annotations (CSV or JSON) extracted from the same PDF.
    annotations: Option<PathBuf>,

    /// Write Markdown here (and a `.report.json` next to it) instead of stdout.
    #[arg(short, long, env = "MDREPAIR_OUTPUT")]
    output: Option<PathBuf>,

    /// Model ID (e.g. gpt-4.1-mini, gpt-5-mini, llama3.1).
    #[arg(long, env = "MDREPAIR_MODEL")]
    model: Option<String>,

    /// Provider name: openai, anthropic, gemini, ollama, azure, …
    #[arg(long, env = "MDREPAIR_PROVIDER")]
    provider: Option<String>,

    /// Request profile: chat, reasoning, reasoning-mini, local. Default: from the model ID.
    #[arg(long, env = "MDREPAIR_PROFILE")]
    profile: Option<String>,

    /// Concurrent completion calls.
    #[arg(short, long, env = "MDREPAIR_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Token budget per chunk.
    #[arg(long, env = "MDREPAIR_MAX_CHUNK_TOKENS", default_value_t = 3000)]
    max_chunk_tokens: usize,

    /// Token budget for a whole request payload (chunk + annotations).
    #[arg(long, env = "MDREPAIR_TOKEN_BUDGET", default_value_t = 12000)]
    token_budget: usize,

    /// Attempts per chunk before falling back.
    #[arg(long, env = "MDREPAIR_MAX_ATTEMPTS", default_value_t = 5)]
    max_attempts: u32,

    /// Base retry delay in milliseconds (doubles per attempt).
    #[arg(long, env = "MDREPAIR_RETRY_BACKOFF_MS", default_value_t = 1000)]
    retry_backoff_ms: u64,

    /// Per-attempt completion timeout in seconds.
    #[arg(long, env = "MDREPAIR_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,

    /// Minimum output/input token ratio for a model answer to be accepted.
    #[arg(long, env = "MDREPAIR_QUALITY_RATIO", default_value_t = 0.6)]
    quality_ratio: f64,

    /// Absolute floor on output tokens for the quality gate.
    #[arg(long, env = "MDREPAIR_MIN_OUTPUT_TOKENS", default_value_t = 0)]
    min_output_tokens: usize,

    /// Max completion tokens per chunk.
    #[arg(long, env = "MDREPAIR_MAX_TOKENS", default_value_t = 2000)]
    max_tokens: usize,

    /// Sampling temperature (ignored by reasoning profiles).
    #[arg(long, env = "MDREPAIR_TEMPERATURE", default_value_t = 0.0)]
    temperature: f32,

    /// Annotation page range per chunk, e.g. `3-7`; repeat for later chunks.
    #[arg(long = "pages", env = "MDREPAIR_PAGES", value_delimiter = ',')]
    pages: Vec<String>,

    /// Skip the model; apply the deterministic rules only.
    #[arg(long, env = "MDREPAIR_DRY_RUN")]
    dry_run: bool,

    /// Do not send annotations to the model.
    #[arg(long, env = "MDREPAIR_NO_ANNOTATIONS")]
    no_annotations: bool,

    /// Exit with code 2 if acceptance issues remain (output is still written).
    #[arg(long, env = "MDREPAIR_FAIL_ON_ISSUES")]
    fail_on_issues: bool,

    /// Append an "External Links" section for annotation URIs missing from the output.
    #[arg(long, env = "MDREPAIR_APPEND_MISSING_LINKS")]
    append_missing_links: bool,

    /// Path to a text file containing a custom system prompt.
    #[arg(long, env = "MDREPAIR_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Print each chunk as soon as it is repaired (completion order).
    #[arg(long)]
    stream: bool,

    /// Print `RepairOutput` as JSON instead of Markdown.
    #[arg(long, env = "MDREPAIR_JSON")]
    json: bool,

    /// Record this run in a JSON ledger.
    #[arg(long, env = "MDREPAIR_LEDGER")]
    ledger: Option<PathBuf>,

    /// Disable progress bar.
    #[arg(long, env = "MDREPAIR_NO_PROGRESS")]
    no_progress: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar provides the feedback that matters; keep library
    // logs to errors while it is active.
    let show_progress = match &cli.command {
        Command::Repair(args) => !cli.quiet && !args.no_progress && !args.json && !args.stream,
        _ => false,
    };
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Repair(ref args) => run_repair(args, cli.quiet, show_progress).await,
        Command::Compare {
            ref old,
            ref new,
            ref out,
        } => run_compare(old, new, out.as_deref(), cli.quiet),
        Command::Check {
            ref markdown,
            ref annotations,
            json,
        } => run_check(markdown, annotations.as_deref(), json),
    }
}

// ── repair ───────────────────────────────────────────────────────────────────

async fn run_repair(args: &RepairArgs, quiet: bool, show_progress: bool) -> Result<ExitCode> {
    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn RepairProgressCallback>)
    } else {
        None
    };
    let config = build_config(args, progress_cb).await?;

    if args.stream {
        return run_stream(args, &config, quiet).await;
    }

    let output = if let Some(ref out) = args.output {
        let output = repair_to_file(&args.markdown, args.annotations.as_deref(), out, &config)
            .await
            .context("Repair failed")?;
        if !quiet {
            eprintln!(
                "{}  {} chunks  {}ms  →  {}",
                if output.stats.fallback_chunks == 0 {
                    green("✔")
                } else {
                    cyan("⚠")
                },
                output.stats.total_chunks,
                output.stats.total_duration_ms,
                bold(&out.display().to_string()),
            );
        }
        output
    } else {
        let markdown = tokio::fs::read_to_string(&args.markdown)
            .await
            .with_context(|| format!("Failed to read {}", args.markdown.display()))?;
        let annotations = args
            .annotations
            .as_deref()
            .map(load_annotations)
            .unwrap_or_default();
        let output = repair(&markdown, &annotations, &config)
            .await
            .context("Repair failed")?;
        if args.json {
            let json =
                serde_json::to_string_pretty(&output).context("Failed to serialise output")?;
            println!("{json}");
        } else {
            write_stdout(&output.markdown)?;
        }
        output
    };

    if !quiet {
        print_summary(&output);
    }
    if let Some(ref path) = args.ledger {
        record_run(path, args, &config, &output)?;
    }
    Ok(exit_for(&output.report, args.fail_on_issues))
}

async fn run_stream(args: &RepairArgs, config: &RepairConfig, quiet: bool) -> Result<ExitCode> {
    let started = std::time::Instant::now();
    let markdown = tokio::fs::read_to_string(&args.markdown)
        .await
        .with_context(|| format!("Failed to read {}", args.markdown.display()))?;
    let annotations = args
        .annotations
        .as_deref()
        .map(load_annotations)
        .unwrap_or_default();

    let mut stream =
        repair_stream(&markdown, annotations.clone(), config).context("Repair failed")?;
    let mut results: Vec<RepairResult> = Vec::new();
    while let Some(result) = stream.next().await {
        println!(
            "<!-- chunk {} · {} · {} attempt(s) -->\n{}\n",
            result.chunk_index + 1,
            result.source,
            result.attempt_count,
            result.text.trim_end()
        );
        results.push(result);
    }

    let mut output = finish(results, &annotations, config);
    output.stats.total_duration_ms = started.elapsed().as_millis() as u64;
    if let Some(ref out) = args.output {
        write_output(out, &output).with_context(|| format!("Failed to write {}", out.display()))?;
        eprintln!("{} {}", green("✔"), bold(&out.display().to_string()));
    }
    if !quiet {
        print_summary(&output);
    }
    if let Some(ref path) = args.ledger {
        record_run(path, args, config, &output)?;
    }
    Ok(exit_for(&output.report, args.fail_on_issues))
}

/// Map CLI args to `RepairConfig`.
async fn build_config(args: &RepairArgs, progress: Option<ProgressCallback>) -> Result<RepairConfig> {
    let mut builder = RepairConfig::builder()
        .concurrency(args.concurrency)
        .max_chunk_tokens(args.max_chunk_tokens)
        .token_budget(args.token_budget)
        .max_attempts(args.max_attempts)
        .retry_backoff_ms(args.retry_backoff_ms)
        .api_timeout_secs(args.api_timeout)
        .quality_ratio(args.quality_ratio)
        .min_output_tokens(args.min_output_tokens)
        .max_tokens(args.max_tokens)
        .temperature(args.temperature)
        .page_ranges(parse_pages(&args.pages)?)
        .dry_run(args.dry_run)
        .include_annotations(!args.no_annotations)
        .append_missing_links(args.append_missing_links)
        .normalize(NormalizeOptions::default());

    if let Some(ref model) = args.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = args.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(ref id) = args.profile {
        let profile = ProviderProfile::by_id(id).with_context(|| {
            let known: Vec<&str> = ProviderProfile::ALL.iter().map(|p| p.profile_id).collect();
            format!("Unknown profile '{id}' (known: {})", known.join(", "))
        })?;
        builder = builder.profile(profile);
    }
    if let Some(ref path) = args.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {:?}", path))?;
        builder = builder.system_prompt(prompt);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    // --fail-on-issues is applied by the caller once output and ledger exist.
    builder.build().context("Invalid configuration")
}

/// Parse repeated `--pages` values into per-chunk ranges.
fn parse_pages(values: &[String]) -> Result<PageRanges> {
    let ranges = values
        .iter()
        .map(|v| {
            v.parse::<PageRange>()
                .with_context(|| format!("Invalid --pages value '{v}'"))
        })
        .collect::<Result<Vec<_>>>()?;
    if ranges.iter().any(|r| r.start < 1) {
        anyhow::bail!("Pages are 1-indexed, minimum is 1");
    }
    Ok(PageRanges(ranges))
}

fn record_run(path: &Path, args: &RepairArgs, config: &RepairConfig, output: &RepairOutput) -> Result<()> {
    let model = if config.dry_run {
        "dry-run".to_string()
    } else {
        config.model.clone().unwrap_or_else(|| "default".to_string())
    };
    let mut ledger = RunLedger::load(path).context("Failed to load ledger")?;
    ledger.record(RunSummary::from_output(
        &args.markdown.display().to_string(),
        &model,
        output,
    ));
    ledger.save().context("Failed to save ledger")?;
    Ok(())
}

fn print_summary(output: &RepairOutput) {
    let s = &output.stats;
    eprintln!(
        "   {} tokens in  /  {} tokens out  —  {} attempt(s), {}ms",
        dim(&s.total_input_tokens.to_string()),
        dim(&s.total_output_tokens.to_string()),
        s.total_attempts,
        s.total_duration_ms,
    );
    print_report(&output.report);
}

// ── compare / check ──────────────────────────────────────────────────────────

fn run_compare(old: &Path, new: &Path, out: Option<&Path>, quiet: bool) -> Result<ExitCode> {
    let cmp = compare_files(old, new, out).context("Comparison failed")?;
    let json = serde_json::to_string_pretty(&cmp).context("Failed to serialise comparison")?;
    println!("{json}");
    if !quiet {
        if let Some(out) = out {
            eprintln!("{} {}", green("✔"), bold(&out.display().to_string()));
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn run_check(markdown: &Path, annotations: Option<&Path>, json: bool) -> Result<ExitCode> {
    let text = std::fs::read_to_string(markdown)
        .with_context(|| format!("Failed to read {}", markdown.display()))?;
    let annotations = annotations.map(load_annotations).unwrap_or_default();
    let report = validate(&text, &annotations, &NormalizeOptions::default());
    if json {
        let out = serde_json::to_string_pretty(&report).context("Failed to serialise report")?;
        println!("{out}");
    } else {
        print_report(&report);
    }
    Ok(exit_for(&report, true))
}

fn print_report(report: &CoverageReport) {
    eprintln!(
        "   URI coverage {}/{} ({:.1}%)",
        report.unique_uris_present,
        report.unique_uris_total,
        report.coverage() * 100.0
    );
    if report.is_clean() {
        eprintln!("   {} no residual issues", green("✓"));
    } else {
        for issue in &report.issues {
            eprintln!("   {} {}", red("✗"), issue);
        }
    }
}

fn exit_for(report: &CoverageReport, fail_on_issues: bool) -> ExitCode {
    if fail_on_issues && !report.is_clean() {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    }
}

fn write_stdout(markdown: &str) -> Result<()> {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    handle
        .write_all(markdown.as_bytes())
        .context("Failed to write to stdout")?;
    if !markdown.ends_with('\n') {
        handle.write_all(b"\n").ok();
    }
    Ok(())
}
