//! Deterministic normaliser: an ordered list of idempotent text passes.
//!
//! Each pass is a pure `&str → String` function. Order matters: tables are
//! canonicalised before they are de-duplicated, and both happen before the
//! reflow pass, which relies on table rows already being well-formed.
//!
//! Passes never fail. A pass that panics on pathological input is logged and
//! treated as a no-op, so [`normalize`] is total.

mod furniture;
mod headings;
mod links;
mod references;
mod tables;
mod text;

pub use furniture::{remove_furniture, FurnitureMatcher};
pub use headings::{deduplicate_headings, renumber_headings};
pub use links::{
    autolink, autolink_line, fix_malformed_links, malformed_signatures, repair_line, LinkRule,
    LINK_RULES,
};
pub use references::{inline_references, ReferenceRule, UrlLabel};
pub use tables::{deduplicate_tables, normalize_tables, table_blocks};
pub use text::{canonicalize, clean_symbols, layout, reflow_paragraphs};

use crate::pipeline::markdown::{code_mask, is_table_row, map_unprotected, rejoin, split_raw};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::warn;

// ── Options ──────────────────────────────────────────────────────────────────

/// Frequency threshold for running headers and footers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatPolicy {
    /// A short line seen at least this many times is boilerplate.
    pub min_repeats: usize,
    /// Only lines with at most this many words are candidates.
    pub max_words: usize,
}

impl Default for RepeatPolicy {
    fn default() -> Self {
        Self {
            min_repeats: 10,
            max_words: 7,
        }
    }
}

/// Tunables shared by the normalisation passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeOptions {
    /// Plain lines (or heading titles) that open a furniture section.
    pub furniture_markers: Vec<String>,
    /// Heading titles matching this regex open a furniture section.
    pub furniture_heading_pattern: String,
    pub repeated_lines: RepeatPolicy,
    pub reference_rules: Vec<ReferenceRule>,
    pub url_labels: Vec<UrlLabel>,
    /// Annotation URIs available to reference inlining.
    pub known_uris: Vec<String>,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            furniture_markers: vec!["On this page".into(), "Handbook Index".into()],
            furniture_heading_pattern: r"(?i)^(?:\d+(?:\.\d+)*\.?\s+)?(?:contents|table of contents|handbook index|index|on this page)\s*:?$".into(),
            repeated_lines: RepeatPolicy::default(),
            reference_rules: vec![ReferenceRule::academic_manual()],
            url_labels: UrlLabel::defaults(),
            known_uris: Vec::new(),
        }
    }
}

// ── Passes ───────────────────────────────────────────────────────────────────

/// A named text rewrite.
#[derive(Clone, Copy)]
pub struct NormalizationPass {
    pub name: &'static str,
    pub apply: fn(&str, &NormalizeOptions) -> String,
}

impl std::fmt::Debug for NormalizationPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NormalizationPass")
            .field("name", &self.name)
            .finish()
    }
}

impl NormalizationPass {
    /// Run the pass; on panic, log and return the input unchanged.
    pub fn run(&self, text: &str, options: &NormalizeOptions) -> String {
        match catch_unwind(AssertUnwindSafe(|| (self.apply)(text, options))) {
            Ok(out) => out,
            Err(_) => {
                warn!("Normalisation pass '{}' failed; leaving text unchanged", self.name);
                text.to_string()
            }
        }
    }
}

/// Every pass, in execution order.
pub static PASSES: [NormalizationPass; 12] = [
    NormalizationPass {
        name: "canonicalize",
        apply: canonicalize,
    },
    NormalizationPass {
        name: "remove_furniture",
        apply: remove_furniture,
    },
    NormalizationPass {
        name: "fix_malformed_links",
        apply: fix_malformed_links,
    },
    NormalizationPass {
        name: "autolink",
        apply: autolink,
    },
    NormalizationPass {
        name: "renumber_headings",
        apply: renumber_headings,
    },
    NormalizationPass {
        name: "inline_references",
        apply: inline_references,
    },
    NormalizationPass {
        name: "normalize_tables",
        apply: normalize_tables,
    },
    NormalizationPass {
        name: "deduplicate_tables",
        apply: deduplicate_tables,
    },
    NormalizationPass {
        name: "clean_symbols",
        apply: clean_symbols,
    },
    NormalizationPass {
        name: "reflow_paragraphs",
        apply: reflow_paragraphs,
    },
    NormalizationPass {
        name: "deduplicate_headings",
        apply: deduplicate_headings,
    },
    NormalizationPass {
        name: "layout",
        apply: layout,
    },
];

/// Look a pass up by name.
pub fn pass(name: &str) -> Option<&'static NormalizationPass> {
    PASSES.iter().find(|p| p.name == name)
}

/// Run every pass in order.
pub fn normalize(text: &str, options: &NormalizeOptions) -> String {
    PASSES
        .iter()
        .fold(text.to_string(), |acc, p| p.run(&acc, options))
}

// ── Helpers shared by the passes ────────────────────────────────────────────

/// Rewrite every line outside fenced code.
pub(crate) fn map_code_free_lines(text: &str, mut f: impl FnMut(&str) -> String) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let mask = code_mask(&lines);
    let out: Vec<String> = lines
        .iter()
        .zip(mask)
        .map(|(&line, in_code)| if in_code { line.to_string() } else { f(line) })
        .collect();
    rejoin(text, &out)
}

/// Rewrite the unprotected text of a line. Table rows are rewritten cell by
/// cell so pipes are never created or consumed.
pub(crate) fn map_text_segments(line: &str, mut f: impl FnMut(&str) -> String) -> String {
    if !is_table_row(line) {
        return map_unprotected(line, f);
    }
    split_raw(line)
        .into_iter()
        .map(|segment| map_unprotected(segment, &mut f))
        .collect::<Vec<_>>()
        .join("|")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Handbook Index\nA ..... 1\n# 1 Welcome\r\n\nThe   handbook\nexplains &amp; lists\nrules. See https://[https://example.org]]\n\n## 1.1 Contacts\n| Name | Email |\n| Ann | ann@x.ac.uk |\n\n| Name | Email |\n| Ann | ann@x.ac.uk |\n\nPage 2 of 9\n\u{2022} item one\n## Notes\n## Notes\n```\nhttps://[https://raw]]\n```\n";

    #[test]
    fn full_normalisation() {
        let out = normalize(SAMPLE, &NormalizeOptions::default());
        assert!(!out.contains("Handbook Index"));
        assert!(out.contains("## 1 Welcome"));
        assert!(out.contains("### 1.1 Contacts"));
        assert!(out.contains("The   handbook explains & lists rules."));
        assert!(out.contains("[https://example.org](https://example.org)"));
        assert_eq!(out.matches("| Name | Email |").count(), 1);
        assert!(out.contains("| Ann | [ann@x.ac.uk](mailto:ann@x.ac.uk) |"));
        assert!(!out.contains("Page 2 of 9"));
        assert!(out.contains("- item one"));
        assert!(out.contains("#### Notes (2)"));
        assert!(out.contains("```\nhttps://[https://raw]]\n```"));
        assert!(out.ends_with("```\n"));
    }

    #[test]
    fn every_pass_is_idempotent() {
        let opts = NormalizeOptions::default();
        let mut text = SAMPLE.to_string();
        for p in PASSES.iter() {
            let once = p.run(&text, &opts);
            assert_eq!(p.run(&once, &opts), once, "pass {} is not idempotent", p.name);
            text = once;
        }
    }

    #[test]
    fn whole_normaliser_is_stable() {
        let opts = NormalizeOptions::default();
        let once = normalize(SAMPLE, &opts);
        assert_eq!(normalize(&once, &opts), once);
    }

    #[test]
    fn autolinked_parens_are_stable() {
        let opts = NormalizeOptions::default();
        for input in ["text https://a.org/x) more", "(see https://a.org/x)) and mail b@c.org)"] {
            let once = normalize(input, &opts);
            assert_eq!(normalize(&once, &opts), once, "{input}");
        }
        let out = normalize("text https://a.org/x) more", &opts);
        assert!(out.contains("(https://a.org/x) more"), "{out}");
    }

    #[test]
    fn panicking_pass_is_a_no_op() {
        fn boom(_: &str, _: &NormalizeOptions) -> String {
            panic!("boom")
        }
        let p = NormalizationPass {
            name: "boom",
            apply: boom,
        };
        assert_eq!(p.run("keep me", &NormalizeOptions::default()), "keep me");
    }

    #[test]
    fn passes_are_addressable_by_name() {
        assert_eq!(pass("autolink").map(|p| p.name), Some("autolink"));
        assert!(pass("nope").is_none());
    }

    #[test]
    fn empty_input_stays_empty() {
        assert_eq!(normalize("", &NormalizeOptions::default()), "");
        assert_eq!(normalize(" \n\n", &NormalizeOptions::default()), "");
    }
}
