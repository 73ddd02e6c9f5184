//! Keyword and reference inlining.
//!
//! Textual references such as "Academic Manual Chapter 4, Section 3" become
//! links. An annotation URI from the source PDF is preferred; otherwise a
//! canonical URL is synthesised from the rule's template.

use super::{map_code_free_lines, map_text_segments, NormalizeOptions};
use crate::pipeline::markdown::heading_level;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A phrase pattern that names a chapter (and optionally a section) of a
/// known document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceRule {
    pub name: String,
    /// Regex with a `chapter` group and an optional `section` group.
    pub pattern: String,
    /// Fragment searched for inside annotation URIs, e.g.
    /// `academic-manual/chapters/chapter-{chapter}`.
    pub match_template: String,
    /// Canonical URL used when no annotation matches.
    pub url_template: String,
    /// Canonical URL for references that also name a section.
    #[serde(default)]
    pub section_template: Option<String>,
}

impl ReferenceRule {
    pub fn academic_manual() -> Self {
        Self {
            name: "academic-manual".into(),
            pattern: r"(?i)\b(?:UCL\s+)?Academic\s+Manual,?\s+Chapter\s+(?P<chapter>\d{1,2})(?:,?\s+Section\s+(?P<section>\d{1,3}(?:\.\d{1,3})*))?".into(),
            match_template: "academic-manual/chapters/chapter-{chapter}".into(),
            url_template: "https://www.ucl.ac.uk/academic-manual/chapters/chapter-{chapter}".into(),
            section_template: Some(
                "https://www.ucl.ac.uk/academic-manual/chapters/chapter-{chapter}#section-{section}"
                    .into(),
            ),
        }
    }
}

/// A display label for a bare, self-labelled link to a well-known URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlLabel {
    pub url: String,
    pub label: String,
}

impl UrlLabel {
    pub fn new(url: &str, label: &str) -> Self {
        Self {
            url: url.into(),
            label: label.into(),
        }
    }

    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new("https://www.ucl.ac.uk/academic-manual", "UCL Academic Manual"),
            Self::new("https://www.ucl.ac.uk/module-catalogue", "UCL Module Catalogue"),
            Self::new("https://moodle.ucl.ac.uk", "Moodle"),
            Self::new("https://portico.ucl.ac.uk", "Portico"),
        ]
    }
}

fn render(template: &str, chapter: &str, section: &str) -> String {
    template
        .replace("{chapter}", chapter)
        .replace("{section}", section)
}

/// First annotation URI containing `fragment` where the fragment is not
/// followed by another digit (chapter-1 must not match chapter-12).
fn authentic_uri<'a>(known: &'a [String], fragment: &str) -> Option<&'a str> {
    known.iter().map(String::as_str).find(|uri| {
        uri.match_indices(fragment).any(|(at, _)| {
            !uri[at + fragment.len()..]
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_digit())
        })
    })
}

struct CompiledRule<'a> {
    rule: &'a ReferenceRule,
    re: Regex,
}

impl CompiledRule<'_> {
    fn target(&self, caps: &Captures<'_>, known: &[String]) -> String {
        let chapter = caps.name("chapter").map_or("", |m| m.as_str());
        let section = caps.name("section").map(|m| m.as_str());
        let fragment = render(&self.rule.match_template, chapter, "");
        if let Some(uri) = authentic_uri(known, &fragment) {
            return uri.to_string();
        }
        match (section, &self.rule.section_template) {
            (Some(section), Some(template)) => render(template, chapter, section),
            _ => render(&self.rule.url_template, chapter, ""),
        }
    }
}

fn compile(rules: &[ReferenceRule]) -> Vec<CompiledRule<'_>> {
    rules
        .iter()
        .filter_map(|rule| match Regex::new(&rule.pattern) {
            Ok(re) => Some(CompiledRule { rule, re }),
            Err(e) => {
                warn!("Skipping reference rule '{}': {}", rule.name, e);
                None
            }
        })
        .collect()
}

static RE_SELF_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(https?://[^\]\s]+)\]\((https?://[^)\s]+)\)").unwrap());

fn relabel(line: &str, labels: &[UrlLabel]) -> String {
    RE_SELF_LINK
        .replace_all(line, |caps: &Captures<'_>| {
            let (shown, dest) = (&caps[1], &caps[2]);
            let key = dest.trim_end_matches('/');
            if shown != dest {
                return caps[0].to_string();
            }
            labels
                .iter()
                .find(|l| l.url.trim_end_matches('/') == key)
                .map_or_else(|| caps[0].to_string(), |l| format!("[{}]({})", l.label, dest))
        })
        .into_owned()
}

/// Link textual references and relabel self-labelled links to known URLs.
pub fn inline_references(text: &str, options: &NormalizeOptions) -> String {
    let rules = compile(&options.reference_rules);
    if rules.is_empty() && options.url_labels.is_empty() {
        return text.to_string();
    }
    let known = &options.known_uris;

    map_code_free_lines(text, |line| {
        let line = if heading_level(line).is_some() {
            line.to_string()
        } else {
            map_text_segments(line, |segment| {
                rules.iter().fold(segment.to_string(), |acc, compiled| {
                    compiled
                        .re
                        .replace_all(&acc, |caps: &Captures<'_>| {
                            format!("[{}]({})", &caps[0], compiled.target(caps, known))
                        })
                        .into_owned()
                })
            })
        };
        relabel(&line, &options.url_labels)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesises_canonical_url() {
        let opts = NormalizeOptions::default();
        let out = inline_references("See Academic Manual Chapter 4, Section 3.2 for rules.", &opts);
        assert_eq!(
            out,
            "See [Academic Manual Chapter 4, Section 3.2](https://www.ucl.ac.uk/academic-manual/chapters/chapter-4#section-3.2) for rules."
        );
        assert_eq!(inline_references(&out, &opts), out);
    }

    #[test]
    fn prefers_annotation_uri() {
        let opts = NormalizeOptions {
            known_uris: vec![
                "https://www.ucl.ac.uk/academic-manual/chapters/chapter-12-x".into(),
                "https://www.ucl.ac.uk/academic-manual/chapters/chapter-1-framework".into(),
            ],
            ..NormalizeOptions::default()
        };
        let out = inline_references("UCL Academic Manual Chapter 1 applies", &opts);
        assert_eq!(
            out,
            "[UCL Academic Manual Chapter 1](https://www.ucl.ac.uk/academic-manual/chapters/chapter-1-framework) applies"
        );
    }

    #[test]
    fn relabels_known_self_links() {
        let opts = NormalizeOptions::default();
        let out = inline_references("Go to [https://moodle.ucl.ac.uk/](https://moodle.ucl.ac.uk/) now", &opts);
        assert_eq!(out, "Go to [Moodle](https://moodle.ucl.ac.uk/) now");
        let other = "[https://a.org](https://a.org)";
        assert_eq!(inline_references(other, &opts), other);
    }

    #[test]
    fn headings_and_code_untouched() {
        let opts = NormalizeOptions::default();
        let input = "## Academic Manual Chapter 4\n```\nAcademic Manual Chapter 4\n```\n";
        assert_eq!(inline_references(input, &opts), input);
    }
}
