//! Configuration types for Markdown repair.
//!
//! All repair behaviour is controlled through [`RepairConfig`], built via its
//! [`RepairConfigBuilder`]. One struct holds every knob so a config can be
//! shared across the worker pool, logged, and compared between runs.

use crate::error::MdRepairError;
use crate::pipeline::completion::CompletionService;
use crate::pipeline::normalize::NormalizeOptions;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub use crate::pipeline::annotations::PageRange;

/// Configuration for a repair run.
///
/// Built via [`RepairConfig::builder()`] or using [`RepairConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_mdrepair::RepairConfig;
///
/// let config = RepairConfig::builder()
///     .concurrency(8)
///     .max_chunk_tokens(2000)
///     .model("gpt-4.1-mini")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct RepairConfig {
    /// Number of chunks in flight at once. Default: 4.
    ///
    /// Completion calls are network-bound. Lower this when the service
    /// answers with rate-limit errors.
    pub concurrency: usize,

    /// Token-proxy budget per chunk. Default: 3000.
    pub max_chunk_tokens: usize,

    /// Token-proxy budget for the whole user payload (slice + link CSV).
    /// Default: 12000. The CSV subset is halved until the payload fits.
    pub token_budget: usize,

    /// Dispatch attempts per chunk, first try included. Default: 5.
    pub max_attempts: u32,

    /// Base retry delay in milliseconds. Default: 1000.
    ///
    /// Doubles after each failed attempt (1 s → 2 s → 4 s → 8 s) and gets up
    /// to 50 % random jitter so concurrent workers do not retry in lockstep.
    pub retry_backoff_ms: u64,

    /// Per-attempt timeout in seconds. Default: 60.
    pub api_timeout_secs: u64,

    /// Minimum output/input token-proxy ratio a model answer must reach.
    /// Default: 0.6.
    pub quality_ratio: f64,

    /// Absolute floor for the quality gate. Default: 0.
    pub min_output_tokens: usize,

    /// Maximum tokens the service may generate per chunk. Default: 2000.
    pub max_tokens: usize,

    /// Sampling temperature. Default: 0.0. Ignored for profiles that do not
    /// accept a temperature.
    pub temperature: f32,

    /// Model identifier, e.g. "gpt-4.1-mini". If None, uses provider default.
    pub model: Option<String>,

    /// Provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Pre-constructed completion service. Takes precedence over everything.
    pub service: Option<Arc<dyn CompletionService>>,

    /// Explicit request profile. If None, looked up from `model`.
    pub profile: Option<ProviderProfile>,

    /// Page ranges used to select annotations for chunks without page
    /// markers. Default: empty (full annotation span).
    pub page_ranges: PageRanges,

    /// Skip the completion service entirely. Default: false.
    pub dry_run: bool,

    /// Send the annotation CSV with each chunk. Default: true.
    pub include_annotations: bool,

    /// Turn residual acceptance issues into an error. Default: false.
    pub fail_on_issues: bool,

    /// Append an "External Links" section listing annotation URIs the
    /// repaired text does not contain, grouped by page. Default: false.
    pub append_missing_links: bool,

    /// Custom system prompt. If None, uses the built-in prompt.
    pub system_prompt: Option<String>,

    /// Options shared by the normalisation passes.
    pub normalize: NormalizeOptions,

    /// Optional per-chunk progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_chunk_tokens: 3000,
            token_budget: 12000,
            max_attempts: 5,
            retry_backoff_ms: 1000,
            api_timeout_secs: 60,
            quality_ratio: 0.6,
            min_output_tokens: 0,
            max_tokens: 2000,
            temperature: 0.0,
            model: None,
            provider_name: None,
            provider: None,
            service: None,
            profile: None,
            page_ranges: PageRanges::default(),
            dry_run: false,
            include_annotations: true,
            fail_on_issues: false,
            append_missing_links: false,
            system_prompt: None,
            normalize: NormalizeOptions::default(),
            progress_callback: None,
        }
    }
}

impl fmt::Debug for RepairConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepairConfig")
            .field("concurrency", &self.concurrency)
            .field("max_chunk_tokens", &self.max_chunk_tokens)
            .field("token_budget", &self.token_budget)
            .field("max_attempts", &self.max_attempts)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("quality_ratio", &self.quality_ratio)
            .field("min_output_tokens", &self.min_output_tokens)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("service", &self.service.as_ref().map(|_| "<dyn CompletionService>"))
            .field("profile", &self.profile)
            .field("page_ranges", &self.page_ranges)
            .field("dry_run", &self.dry_run)
            .field("include_annotations", &self.include_annotations)
            .field("fail_on_issues", &self.fail_on_issues)
            .field("append_missing_links", &self.append_missing_links)
            .finish()
    }
}

impl RepairConfig {
    /// Create a new builder for `RepairConfig`.
    pub fn builder() -> RepairConfigBuilder {
        RepairConfigBuilder {
            config: Self::default(),
        }
    }

    /// The request profile in effect: explicit, else looked up from the model.
    pub fn resolved_profile(&self) -> ProviderProfile {
        self.profile
            .unwrap_or_else(|| ProviderProfile::for_model(self.model.as_deref().unwrap_or("")))
    }
}

/// Builder for [`RepairConfig`].
pub struct RepairConfigBuilder {
    config: RepairConfig,
}

impl fmt::Debug for RepairConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepairConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl RepairConfigBuilder {
    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n;
        self
    }

    pub fn max_chunk_tokens(mut self, n: usize) -> Self {
        self.config.max_chunk_tokens = n;
        self
    }

    pub fn token_budget(mut self, n: usize) -> Self {
        self.config.token_budget = n;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn quality_ratio(mut self, ratio: f64) -> Self {
        self.config.quality_ratio = ratio;
        self
    }

    pub fn min_output_tokens(mut self, n: usize) -> Self {
        self.config.min_output_tokens = n;
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn service(mut self, service: Arc<dyn CompletionService>) -> Self {
        self.config.service = Some(service);
        self
    }

    pub fn profile(mut self, profile: ProviderProfile) -> Self {
        self.config.profile = Some(profile);
        self
    }

    pub fn page_ranges(mut self, ranges: PageRanges) -> Self {
        self.config.page_ranges = ranges;
        self
    }

    pub fn dry_run(mut self, v: bool) -> Self {
        self.config.dry_run = v;
        self
    }

    pub fn include_annotations(mut self, v: bool) -> Self {
        self.config.include_annotations = v;
        self
    }

    pub fn fail_on_issues(mut self, v: bool) -> Self {
        self.config.fail_on_issues = v;
        self
    }

    pub fn append_missing_links(mut self, v: bool) -> Self {
        self.config.append_missing_links = v;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn normalize(mut self, options: NormalizeOptions) -> Self {
        self.config.normalize = options;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<RepairConfig, MdRepairError> {
        let c = &self.config;
        let invalid = |msg: String| Err(MdRepairError::InvalidConfig(msg));
        if c.concurrency == 0 {
            return invalid("concurrency must be ≥ 1".into());
        }
        if c.max_chunk_tokens == 0 {
            return invalid("max_chunk_tokens must be ≥ 1".into());
        }
        if c.token_budget < c.max_chunk_tokens {
            return invalid(format!(
                "token_budget ({}) must be ≥ max_chunk_tokens ({})",
                c.token_budget, c.max_chunk_tokens
            ));
        }
        if c.max_attempts == 0 {
            return invalid("max_attempts must be ≥ 1".into());
        }
        if c.api_timeout_secs == 0 {
            return invalid("api_timeout_secs must be ≥ 1".into());
        }
        if !(0.0..=1.0).contains(&c.quality_ratio) {
            return invalid(format!("quality_ratio must be 0.0–1.0, got {}", c.quality_ratio));
        }
        if let Err(e) = Regex::new(&c.normalize.furniture_heading_pattern) {
            return invalid(format!("furniture_heading_pattern: {e}"));
        }
        for rule in &c.normalize.reference_rules {
            if let Err(e) = Regex::new(&rule.pattern) {
                return invalid(format!("reference rule '{}': {e}", rule.name));
            }
        }
        Ok(self.config)
    }
}

// ── Provider profiles ────────────────────────────────────────────────────

/// How the completion cap is expressed for a model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenParam {
    /// Classic chat models: `max_tokens`.
    MaxTokens,
    /// Reasoning models: `max_completion_tokens`. The provider crate maps
    /// `CompletionOptions::max_tokens` onto this name.
    MaxCompletionTokens,
    /// Send no cap at all.
    Omit,
}

/// Request capabilities of a model family, declared up front instead of
/// discovered by trial and error against the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProviderProfile {
    pub profile_id: &'static str,
    pub token_param: TokenParam,
    pub supports_temperature: bool,
    /// Use the compact system prompt.
    pub compact_prompt: bool,
}

impl ProviderProfile {
    pub const CHAT: Self = Self {
        profile_id: "chat",
        token_param: TokenParam::MaxTokens,
        supports_temperature: true,
        compact_prompt: false,
    };

    pub const REASONING: Self = Self {
        profile_id: "reasoning",
        token_param: TokenParam::MaxCompletionTokens,
        supports_temperature: false,
        compact_prompt: false,
    };

    pub const REASONING_MINI: Self = Self {
        profile_id: "reasoning-mini",
        token_param: TokenParam::MaxCompletionTokens,
        supports_temperature: false,
        compact_prompt: true,
    };

    pub const LOCAL: Self = Self {
        profile_id: "local",
        token_param: TokenParam::Omit,
        supports_temperature: true,
        compact_prompt: true,
    };

    /// Every known profile.
    pub const ALL: [Self; 4] = [Self::CHAT, Self::REASONING, Self::REASONING_MINI, Self::LOCAL];

    /// Select the profile for a model id. Unknown models get [`Self::CHAT`].
    pub fn for_model(model: &str) -> Self {
        let m = model.to_ascii_lowercase();
        let m = m.rsplit('/').next().unwrap_or(&m);
        let reasoning = m.starts_with("gpt-5")
            || m.starts_with("o1")
            || m.starts_with("o3")
            || m.starts_with("o4");
        if reasoning && (m.contains("mini") || m.contains("nano")) {
            Self::REASONING_MINI
        } else if reasoning {
            Self::REASONING
        } else if ["llama", "mistral", "qwen", "phi", "gemma"]
            .iter()
            .any(|p| m.starts_with(p))
        {
            Self::LOCAL
        } else {
            Self::CHAT
        }
    }

    /// Look a profile up by its id.
    pub fn by_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.profile_id == id)
    }
}

// ── Page ranges ──────────────────────────────────────────────────────────

/// Caller-supplied page ranges; chunk *i* uses range *min(i, n − 1)*.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRanges(pub Vec<PageRange>);

impl PageRanges {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Range for the chunk at `index`, if any ranges were given.
    pub fn for_chunk(&self, index: usize) -> Option<PageRange> {
        let last = self.0.len().checked_sub(1)?;
        self.0.get(index.min(last)).copied()
    }
}

impl FromStr for PageRange {
    type Err = MdRepairError;

    /// Parse `"3-7"` or `"4"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || MdRepairError::InvalidConfig(format!("invalid page range '{s}', expected N or N-M"));
        let (a, b) = match s.trim().split_once('-') {
            Some((a, b)) => (a.trim(), b.trim()),
            None => (s.trim(), s.trim()),
        };
        let start: u32 = a.parse().map_err(|_| bad())?;
        let end: u32 = b.parse().map_err(|_| bad())?;
        Ok(PageRange::new(start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = RepairConfig::default();
        assert_eq!(c.concurrency, 4);
        assert_eq!(c.max_chunk_tokens, 3000);
        assert_eq!(c.token_budget, 12000);
        assert_eq!(c.max_attempts, 5);
        assert_eq!(c.retry_backoff_ms, 1000);
        assert_eq!(c.api_timeout_secs, 60);
        assert!((c.quality_ratio - 0.6).abs() < f64::EPSILON);
        assert_eq!(c.max_tokens, 2000);
        assert!(c.include_annotations);
        assert!(!c.dry_run);
        assert!(!c.append_missing_links);
    }

    #[test]
    fn builder_rejects_bad_values() {
        assert!(RepairConfig::builder().concurrency(0).build().is_err());
        assert!(RepairConfig::builder().max_attempts(0).build().is_err());
        assert!(RepairConfig::builder().quality_ratio(1.5).build().is_err());
        assert!(RepairConfig::builder()
            .max_chunk_tokens(5000)
            .token_budget(100)
            .build()
            .is_err());
        let bad_pattern = NormalizeOptions {
            furniture_heading_pattern: "(".into(),
            ..NormalizeOptions::default()
        };
        assert!(RepairConfig::builder().normalize(bad_pattern).build().is_err());
    }

    #[test]
    fn builder_keeps_values() {
        let c = RepairConfig::builder()
            .concurrency(2)
            .model("gpt-5-mini")
            .temperature(9.0)
            .build()
            .unwrap();
        assert_eq!(c.concurrency, 2);
        assert_eq!(c.temperature, 2.0);
        assert_eq!(c.resolved_profile(), ProviderProfile::REASONING_MINI);
    }

    #[test]
    fn profile_lookup() {
        assert_eq!(ProviderProfile::for_model("gpt-4.1-nano"), ProviderProfile::CHAT);
        assert_eq!(ProviderProfile::for_model("o3"), ProviderProfile::REASONING);
        assert_eq!(ProviderProfile::for_model("openai/gpt-5"), ProviderProfile::REASONING);
        assert_eq!(ProviderProfile::for_model("llama3.2"), ProviderProfile::LOCAL);
        assert_eq!(ProviderProfile::for_model(""), ProviderProfile::CHAT);
        assert_eq!(ProviderProfile::by_id("local"), Some(ProviderProfile::LOCAL));
    }

    #[test]
    fn page_ranges_per_chunk() {
        let ranges = PageRanges(vec!["1-3".parse().unwrap(), "9".parse().unwrap()]);
        assert_eq!(ranges.for_chunk(0), Some(PageRange::new(1, 3)));
        assert_eq!(ranges.for_chunk(1), Some(PageRange::new(9, 9)));
        assert_eq!(ranges.for_chunk(7), Some(PageRange::new(9, 9)));
        assert_eq!(PageRanges::default().for_chunk(0), None);
        assert!("x-2".parse::<PageRange>().is_err());
        assert_eq!("7-2".parse::<PageRange>().unwrap(), PageRange::new(2, 7));
    }
}
