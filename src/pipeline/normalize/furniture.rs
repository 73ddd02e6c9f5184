//! Navigation furniture: tables of contents, indices, page numbers and
//! running headers/footers.

use super::{NormalizeOptions, RepeatPolicy};
use crate::pipeline::markdown::{code_mask, heading_level, heading_text, is_table_row, rejoin};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use tracing::warn;

static RE_PAGE_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^page\s*\d+(?:\s*of\s*\d+)?$").unwrap());

static RE_DIGITS_ONLY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{1,4}$").unwrap());

fn is_private_use(c: char) -> bool {
    matches!(c, '\u{E000}'..='\u{F8FF}')
}

/// Icon-font residue: a line made only of private-use glyphs.
fn is_glyph_line(t: &str) -> bool {
    let mut glyphs = t.chars().filter(|c| !c.is_whitespace()).peekable();
    glyphs.peek().is_some() && glyphs.all(is_private_use)
}

fn is_page_furniture(t: &str) -> bool {
    RE_PAGE_LINE.is_match(t) || RE_DIGITS_ONLY.is_match(t) || is_glyph_line(t)
}

/// Recognises the lines that open a furniture section.
pub struct FurnitureMatcher {
    heading: Option<Regex>,
    markers: Vec<String>,
}

impl FurnitureMatcher {
    pub fn new(options: &NormalizeOptions) -> Self {
        let heading = match Regex::new(&options.furniture_heading_pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!("Ignoring invalid furniture heading pattern: {}", e);
                None
            }
        };
        Self {
            heading,
            markers: options
                .furniture_markers
                .iter()
                .map(|m| m.trim().to_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }

    fn marker_for(&self, t: &str) -> Option<&str> {
        let key = t.trim().trim_end_matches(':').trim_end().to_lowercase();
        self.markers
            .iter()
            .find(|m| **m == key)
            .map(String::as_str)
    }

    /// The furniture label of a line, if it opens a furniture section.
    pub fn label(&self, line: &str) -> Option<String> {
        if let Some(title) = heading_text(line) {
            let title = title.trim();
            if let Some(m) = self.marker_for(title) {
                return Some(m.to_string());
            }
            return self
                .heading
                .as_ref()
                .filter(|re| re.is_match(title))
                .map(|_| title.to_lowercase());
        }
        self.marker_for(line).map(str::to_string)
    }
}

/// Lines eligible for the repeated-line filter.
fn repeat_candidate(line: &str, policy: &RepeatPolicy) -> Option<String> {
    let t = line.trim();
    if t.is_empty() || heading_level(line).is_some() || is_table_row(line) {
        return None;
    }
    (t.split_whitespace().count() <= policy.max_words).then(|| t.to_string())
}

pub fn remove_furniture(text: &str, options: &NormalizeOptions) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let mask = code_mask(&lines);
    let matcher = FurnitureMatcher::new(options);
    let mut keep = vec![true; lines.len()];

    // Furniture sections run from the opening line to the next heading.
    let mut dropping = false;
    for (i, line) in lines.iter().enumerate() {
        if !mask[i] {
            if heading_level(line).is_some() {
                dropping = matcher.label(line).is_some();
            } else if !dropping && matcher.label(line).is_some() {
                dropping = true;
            }
        }
        if dropping {
            keep[i] = false;
        }
    }

    for (i, line) in lines.iter().enumerate() {
        if keep[i] && !mask[i] && !is_table_row(line) && is_page_furniture(line.trim()) {
            keep[i] = false;
        }
    }

    // Running headers and footers: count first, then filter with the
    // frozen frequency map.
    let policy = &options.repeated_lines;
    let mut counts: HashMap<String, usize> = HashMap::new();
    for (i, line) in lines.iter().enumerate() {
        if keep[i] && !mask[i] {
            if let Some(key) = repeat_candidate(line, policy) {
                *counts.entry(key).or_default() += 1;
            }
        }
    }
    let boilerplate: HashSet<String> = counts
        .into_iter()
        .filter(|(_, n)| *n >= policy.min_repeats)
        .map(|(k, _)| k)
        .collect();

    let out: Vec<String> = lines
        .iter()
        .enumerate()
        .filter(|(i, line)| {
            keep[*i] && (mask[*i] || !boilerplate.contains(line.trim()))
        })
        .map(|(_, line)| line.to_string())
        .collect();
    rejoin(text, &out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> NormalizeOptions {
        NormalizeOptions::default()
    }

    #[test]
    fn drops_contents_and_index_sections() {
        let input = "# Handbook\nintro\n## Contents\n1 Intro ..... 3\n2 Rules ..... 9\n## 1 Intro\nbody\n## Index\nA, 3\n";
        let out = remove_furniture(input, &opts());
        assert_eq!(out, "# Handbook\nintro\n## 1 Intro\nbody\n");
    }

    #[test]
    fn marker_line_drops_until_next_heading() {
        let input = "## Section\ntext\nOn this page\n- link a\n- link b\n## Next\nkept\n";
        let out = remove_furniture(input, &opts());
        assert_eq!(out, "## Section\ntext\n## Next\nkept\n");
    }

    #[test]
    fn page_numbers_and_glyph_lines() {
        let input = "text\nPage 3 of 10\n42\n\u{F0B7}\u{F0A7}\n2024 was busy\n";
        assert_eq!(remove_furniture(input, &opts()), "text\n2024 was busy\n");
    }

    #[test]
    fn repeated_short_lines_are_boilerplate() {
        let mut input = String::new();
        for i in 0..12 {
            input.push_str(&format!("Department of Computer Science\npara {i} has enough distinct words to stay\n"));
        }
        input.push_str("| Department of Computer Science |\n");
        let out = remove_furniture(&input, &opts());
        assert!(!out.lines().any(|l| l == "Department of Computer Science"));
        assert!(out.contains("| Department of Computer Science |"));
        assert_eq!(remove_furniture(&out, &opts()), out);
    }

    #[test]
    fn nine_repeats_are_kept() {
        let input = "Footer\n".repeat(9);
        assert_eq!(remove_furniture(&input, &opts()), input);
    }

    #[test]
    fn fenced_code_is_never_furniture() {
        let input = "```\n## Contents\n12\n```\n";
        assert_eq!(remove_furniture(input, &opts()), input);
    }

    #[test]
    fn matcher_labels() {
        let m = FurnitureMatcher::new(&opts());
        assert_eq!(m.label("## Table of Contents").as_deref(), Some("table of contents"));
        assert_eq!(m.label("Handbook Index").as_deref(), Some("handbook index"));
        assert_eq!(m.label("## Indexing strategy"), None);
        assert_eq!(m.label("See the index for details"), None);
    }
}
