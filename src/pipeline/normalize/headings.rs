//! Heading depth calibration and title de-duplication.

use super::NormalizeOptions;
use crate::pipeline::markdown::{code_mask, heading_level, heading_text, rejoin};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

/// Section numbers use 1–3 digit components, so years never count.
static RE_SECTION_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,3}(?:\.\d{1,3})*)\.?(?:\s|$)").unwrap());

/// Depth of a numbered heading title: `"2"` → 0, `"2.1.3"` → 2.
fn section_depth(title: &str) -> Option<usize> {
    RE_SECTION_NUMBER
        .captures(title.trim())
        .map(|c| c[1].matches('.').count())
}

fn render_heading(level: usize, title: &str) -> String {
    if title.is_empty() {
        "#".repeat(level)
    } else {
        format!("{} {}", "#".repeat(level), title)
    }
}

/// Map numbered headings onto a calibrated base level and demote the
/// unnumbered headings that follow them.
///
/// The shallowest numbering depth lands on H2. An unnumbered heading after a
/// numbered one at level L becomes at least level L+1.
pub fn renumber_headings(text: &str, _options: &NormalizeOptions) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let mask = code_mask(&lines);

    let min_depth = lines
        .iter()
        .zip(&mask)
        .filter(|(_, in_code)| !**in_code)
        .filter_map(|(line, _)| heading_text(line).and_then(section_depth))
        .min();
    let Some(min_depth) = min_depth else {
        return text.to_string();
    };
    let base = 2usize.saturating_sub(min_depth).max(1);

    let mut last_numbered: Option<usize> = None;
    let out: Vec<String> = lines
        .iter()
        .zip(&mask)
        .map(|(line, in_code)| {
            let (Some(level), Some(title), false) = (heading_level(line), heading_text(line), *in_code)
            else {
                return line.to_string();
            };
            let title = title.trim();
            let target = match section_depth(title) {
                Some(depth) => {
                    let lvl = (base + depth).min(6);
                    last_numbered = Some(lvl);
                    lvl
                }
                None => match last_numbered {
                    Some(parent) => level.max((parent + 1).min(6)),
                    None => level,
                },
            };
            render_heading(target, title)
        })
        .collect();
    rejoin(text, &out)
}

/// Suffix repeated heading titles with ` (n)` so anchors stay unique.
///
/// Comparison is case-insensitive, and a suffix is never chosen if it
/// would collide with a title that already exists elsewhere.
pub fn deduplicate_headings(text: &str, _options: &NormalizeOptions) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let mask = code_mask(&lines);

    let existing: HashSet<String> = lines
        .iter()
        .zip(&mask)
        .filter(|(_, in_code)| !**in_code)
        .filter_map(|(line, _)| heading_text(line))
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();

    let mut used: HashSet<String> = HashSet::new();
    let mut changed = false;
    let out: Vec<String> = lines
        .iter()
        .zip(&mask)
        .map(|(line, in_code)| {
            let (Some(level), Some(title), false) = (heading_level(line), heading_text(line), *in_code)
            else {
                return line.to_string();
            };
            let title = title.trim();
            let key = title.to_lowercase();
            if key.is_empty() || used.insert(key.clone()) {
                return line.to_string();
            }
            let mut n = 2;
            let (candidate, candidate_key) = loop {
                let candidate = format!("{title} ({n})");
                let candidate_key = candidate.to_lowercase();
                if !existing.contains(&candidate_key) && !used.contains(&candidate_key) {
                    break (candidate, candidate_key);
                }
                n += 1;
            };
            used.insert(candidate_key);
            changed = true;
            render_heading(level, &candidate)
        })
        .collect();

    if !changed {
        return text.to_string();
    }
    rejoin(text, &out)
}
