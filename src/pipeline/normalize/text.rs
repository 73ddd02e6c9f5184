//! Character-level and layout passes: canonicalisation, symbol cleanup,
//! paragraph reflow and final blank-line layout.

use super::{map_code_free_lines, NormalizeOptions};
use crate::pipeline::markdown::{code_mask, heading_level, is_table_row, rejoin, FenceMarker};
use once_cell::sync::Lazy;
use regex::Regex;
use std::borrow::Cow;

// ── Pass 0: canonicalisation ────────────────────────────────────────────────

const INVISIBLE: [char; 6] = [
    '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
];

/// Decode HTML entities until the text stops changing (`&amp;amp;` → `&`).
fn decode_entities(line: &str) -> Cow<'_, str> {
    if !line.contains('&') {
        return Cow::Borrowed(line);
    }
    let mut current = line.to_string();
    loop {
        let next = html_escape::decode_html_entities(&current).into_owned();
        if next == current {
            break;
        }
        current = next;
    }
    Cow::Owned(current)
}

/// Line endings, invisible characters, trailing whitespace and HTML
/// entities. Fenced code keeps its entities verbatim.
pub fn canonicalize(text: &str, _options: &NormalizeOptions) -> String {
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let lines: Vec<&str> = text.lines().collect();
    let mask = code_mask(&lines);
    let out: Vec<String> = lines
        .iter()
        .zip(mask)
        .map(|(line, in_code)| {
            let decoded = if in_code {
                Cow::Borrowed(*line)
            } else {
                decode_entities(line)
            };
            decoded
                .replace(INVISIBLE, "")
                .replace(['\n', '\r'], " ")
                .trim_end()
                .to_string()
        })
        .collect();
    rejoin(&text, &out)
}

// ── Pass 7a: symbol cleanup ─────────────────────────────────────────────────

const SYMBOLS: &[(&str, &str)] = &[
    ("\u{2018}", "'"),
    ("\u{2019}", "'"),
    ("\u{201A}", "'"),
    ("\u{201C}", "\""),
    ("\u{201D}", "\""),
    ("\u{201E}", "\""),
    ("\u{00A0}", " "),
    ("\u{202F}", " "),
    ("\u{2009}", " "),
    ("\u{FB00}", "ff"),
    ("\u{FB01}", "fi"),
    ("\u{FB02}", "fl"),
    ("\u{FB03}", "ffi"),
    ("\u{FB04}", "ffl"),
    ("\u{2026}", "..."),
];

static RE_BULLET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\s*)[\u{2022}\u{25AA}\u{25E6}\u{25CF}\u{F0B7}\u{F0A7}]\s*").unwrap());

fn clean_line(line: &str) -> String {
    let mut s = line.to_string();
    for (from, to) in SYMBOLS {
        if s.contains(from) {
            s = s.replace(from, to);
        }
    }
    RE_BULLET.replace(&s, "${1}- ").into_owned()
}

/// Punctuation glyphs, ligatures, odd spaces and glyph bullets.
pub fn clean_symbols(text: &str, _options: &NormalizeOptions) -> String {
    map_code_free_lines(text, clean_line)
}

// ── Pass 7b: paragraph reflow ───────────────────────────────────────────────

static RE_LIST_ITEM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:[-*+]|\d{1,9}[.)])(?:\s|$)").unwrap());

static RE_RULE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s{0,3}(?:(?:-\s*){3,}|(?:\*\s*){3,}|(?:_\s*){3,}|=+)$").unwrap());

/// A line that may be merged with its plain neighbours.
fn is_plain(line: &str) -> bool {
    let t = line.trim();
    !t.is_empty()
        && !line.starts_with("    ")
        && !line.starts_with('\t')
        && heading_level(line).is_none()
        && !is_table_row(line)
        && !RE_LIST_ITEM.is_match(line)
        && !RE_RULE.is_match(line)
        && !t.starts_with('>')
        && !t.starts_with('<')
        && FenceMarker::parse(line).is_none()
}

/// Join soft-wrapped paragraph lines into single lines.
pub fn reflow_paragraphs(text: &str, _options: &NormalizeOptions) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let mask = code_mask(&lines);
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut prev_plain = false;

    for (line, in_code) in lines.iter().zip(mask) {
        let plain = !in_code && is_plain(line);
        match out.len().checked_sub(1) {
            Some(last) if plain && prev_plain => {
                out[last].push(' ');
                out[last].push_str(line.trim());
            }
            _ => out.push(line.to_string()),
        }
        prev_plain = plain;
    }
    rejoin(text, &out)
}

// ── Pass 9: layout ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Blank,
    Heading,
    Table,
    Code(usize),
    Text,
}

fn regions(lines: &[&str]) -> Vec<Region> {
    let mut out = Vec::with_capacity(lines.len());
    let mut open: Option<FenceMarker> = None;
    let mut fence_id = 0usize;
    for line in lines {
        if let Some(marker) = open {
            out.push(Region::Code(fence_id));
            if marker.closes(line) {
                open = None;
            }
            continue;
        }
        if let Some(marker) = FenceMarker::parse(line) {
            fence_id += 1;
            open = Some(marker);
            out.push(Region::Code(fence_id));
        } else if line.trim().is_empty() {
            out.push(Region::Blank);
        } else if heading_level(line).is_some() {
            out.push(Region::Heading);
        } else if is_table_row(line) {
            out.push(Region::Table);
        } else {
            out.push(Region::Text);
        }
    }
    out
}

/// Two adjacent non-blank lines need a blank line between them.
fn needs_gap(a: Region, b: Region) -> bool {
    match (a, b) {
        (Region::Heading, _) | (_, Region::Heading) => true,
        (Region::Code(x), Region::Code(y)) => x != y,
        (Region::Code(_), _) | (_, Region::Code(_)) => true,
        (Region::Table, Region::Table) => false,
        (Region::Table, _) | (_, Region::Table) => true,
        _ => false,
    }
}

/// Blank-line runs collapsed, blank lines around headings, tables and
/// fences, no leading blank lines, exactly one final newline.
pub fn layout(text: &str, _options: &NormalizeOptions) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let kinds = regions(&lines);
    let mut out: Vec<&str> = Vec::with_capacity(lines.len() + 16);
    let mut last: Option<Region> = None;

    for (line, kind) in lines.iter().copied().zip(kinds.iter().copied()) {
        match kind {
            Region::Blank => {
                if matches!(last, Some(r) if r != Region::Blank) {
                    out.push("");
                    last = Some(Region::Blank);
                }
            }
            _ => {
                if let Some(prev) = last {
                    if prev != Region::Blank && needs_gap(prev, kind) {
                        out.push("");
                    }
                }
                out.push(line);
                last = Some(kind);
            }
        }
    }
    while out.last().is_some_and(|l| l.is_empty()) {
        out.pop();
    }
    if out.is_empty() {
        return String::new();
    }
    let mut s = out.join("\n");
    s.push('\n');
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> NormalizeOptions {
        NormalizeOptions::default()
    }

    #[test]
    fn canonicalize_decodes_entities_outside_code() {
        let input = "A &amp;amp; B\r\n```\n&amp;\n```\nzero\u{200B}width   \n";
        let out = canonicalize(input, &opts());
        assert_eq!(out, "A & B\n```\n&amp;\n```\nzerowidth\n");
        assert_eq!(canonicalize(&out, &opts()), out);
    }

    #[test]
    fn symbols_and_bullets() {
        let out = clean_symbols("\u{201C}of\u{FB01}ce\u{201D}\n\u{2022}item\n  \u{F0B7} nested", &opts());
        assert_eq!(out, "\"office\"\n- item\n  - nested");
        assert_eq!(clean_symbols(&out, &opts()), out);
    }

    #[test]
    fn reflow_merges_plain_lines_only() {
        let input = "one\ntwo\nthree\n\n- list\ncontinued\n\n| a |\n| b |\n\n```\nx\ny\n```\n# H\nnext";
        let out = reflow_paragraphs(input, &opts());
        assert!(out.starts_with("one two three\n\n- list\ncontinued\n"));
        assert!(out.contains("| a |\n| b |"));
        assert!(out.contains("```\nx\ny\n```"));
        assert_eq!(reflow_paragraphs(&out, &opts()), out);
    }

    #[test]
    fn layout_spacing() {
        let input = "\n\n# Title\ntext\n\n\n\nmore\n| a |\n|---|\nafter\n```\ncode\n\n\n```\n\n\n";
        let out = layout(input, &opts());
        assert_eq!(
            out,
            "# Title\n\ntext\n\nmore\n\n| a |\n|---|\n\nafter\n\n```\ncode\n\n\n```\n"
        );
        assert_eq!(layout(&out, &opts()), out);
    }

    #[test]
    fn layout_of_blank_document_is_empty() {
        assert_eq!(layout("\n\n  \n", &opts()), "");
    }
}
