//! Structural scanning shared by the normaliser, the chunker and the validator.
//!
//! Everything downstream depends on agreeing about three facts of a line:
//! is it inside fenced code, is it a table row, and is it a heading. Keeping
//! the answers in one module means a fence that protects a line from the
//! autolinker also protects it from being split by the chunker and from
//! being flagged by the validator.

use once_cell::sync::Lazy;
use regex::Regex;
use std::ops::Range;

// ── Line classification ──────────────────────────────────────────────────────

/// Opening marker of a fenced code block (``` or ~~~, three or more).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceMarker {
    ch: char,
    len: usize,
}

impl FenceMarker {
    /// Parse a line as a fence delimiter.
    pub fn parse(line: &str) -> Option<Self> {
        let t = line.trim_start();
        if line.len() - t.len() > 3 {
            return None;
        }
        let ch = t.chars().next()?;
        if ch != '`' && ch != '~' {
            return None;
        }
        let len = t.chars().take_while(|&c| c == ch).count();
        if len < 3 {
            return None;
        }
        Some(Self { ch, len })
    }

    /// Whether `line` closes a fence opened by `self`.
    pub fn closes(&self, line: &str) -> bool {
        let t = line.trim();
        let run = t.chars().take_while(|&c| c == self.ch).count();
        run >= self.len && t[run * self.ch.len_utf8()..].trim().is_empty()
    }
}

/// Per-line flag: `true` when the line is a fence delimiter or inside fenced code.
///
/// An unclosed fence protects everything to the end of the document.
pub fn code_mask(lines: &[&str]) -> Vec<bool> {
    let mut mask = Vec::with_capacity(lines.len());
    let mut open: Option<FenceMarker> = None;
    for line in lines {
        match open {
            Some(marker) => {
                mask.push(true);
                if marker.closes(line) {
                    open = None;
                }
            }
            None => {
                if let Some(marker) = FenceMarker::parse(line) {
                    open = Some(marker);
                    mask.push(true);
                } else {
                    mask.push(false);
                }
            }
        }
    }
    mask
}

/// A line belongs to a GFM table when it starts with a pipe.
pub fn is_table_row(line: &str) -> bool {
    line.trim_start().starts_with('|')
}

/// A delimiter row contains only pipes, dashes, colons and spaces, and at
/// least one dash.
pub fn is_separator_row(line: &str) -> bool {
    let trimmed = line.trim();
    if !trimmed.starts_with('|') || !trimmed.contains('-') {
        return false;
    }
    trimmed
        .chars()
        .all(|c| c == '|' || c == '-' || c == ':' || c == ' ')
}

static RE_HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^ {0,3}(#{1,6})(?:[ \t]+(.*?))?[ \t]*$").unwrap());

/// ATX heading level (1–6) of a line, if it is one.
pub fn heading_level(line: &str) -> Option<usize> {
    RE_HEADING.captures(line).map(|c| c[1].len())
}

/// Heading text without the leading hashes.
pub fn heading_text(line: &str) -> Option<&str> {
    RE_HEADING
        .captures(line)
        .map(|c| c.get(2).map_or("", |m| m.as_str()))
}

/// Word-count proxy for tokens.
///
/// Cheap, tokenizer-free and monotonic in content length; the budgets built
/// on it are best-effort rather than exact.
pub fn token_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Rejoin processed lines, keeping the input's trailing-newline convention.
pub fn rejoin(input: &str, lines: &[String]) -> String {
    let mut out = lines.join("\n");
    if input.ends_with('\n') && !lines.is_empty() {
        out.push('\n');
    }
    out
}

// ── Table cells ──────────────────────────────────────────────────────────────

/// Byte offsets of the unescaped pipes in a row.
fn pipe_positions(row: &str) -> Vec<usize> {
    let bytes = row.as_bytes();
    let mut out = Vec::new();
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'|' && (i == 0 || bytes[i - 1] != b'\\') {
            out.push(i);
        }
    }
    out
}

/// Split a table row into trimmed cell texts, dropping the border pipes.
pub fn split_cells(row: &str) -> Vec<String> {
    let t = row.trim();
    let mut segments = split_raw(t);
    if t.starts_with('|') && !segments.is_empty() {
        segments.remove(0);
    }
    if t.ends_with('|') && !t.ends_with("\\|") && !segments.is_empty() {
        segments.pop();
    }
    segments.into_iter().map(|s| s.trim().to_string()).collect()
}

/// Split on unescaped pipes, keeping every byte (including border segments).
pub fn split_raw(row: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut last = 0;
    for p in pipe_positions(row) {
        out.push(&row[last..p]);
        last = p + 1;
    }
    out.push(&row[last..]);
    out
}

// ── Inline protection ────────────────────────────────────────────────────────

static RE_PROTECTED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"`[^`]*`",
        r#"|!?\[[^\[\]]*\]\([^()\s]*(?:\s+"[^"]*")?\)"#,
        r"|<(?:https?://|mailto:)[^>\s]+>",
    ))
    .unwrap()
});

static RE_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[[^\[\]]*\]\([^()\s]+\)|<(?:https?://|mailto:)[^>\s]+>").unwrap());

/// Spans that text rewrites must leave alone: inline code, existing links
/// and images, and angle-bracket autolinks.
pub fn protected_spans(line: &str) -> Vec<Range<usize>> {
    RE_PROTECTED.find_iter(line).map(|m| m.range()).collect()
}

/// Apply `f` to every unprotected stretch of `line`.
pub fn map_unprotected(line: &str, mut f: impl FnMut(&str) -> String) -> String {
    let mut out = String::with_capacity(line.len() + 16);
    let mut last = 0;
    for span in protected_spans(line) {
        out.push_str(&f(&line[last..span.start]));
        out.push_str(&line[span.clone()]);
        last = span.end;
    }
    out.push_str(&f(&line[last..]));
    out
}

/// Number of clickable links (inline or angle autolinks) in a fragment.
pub fn link_count(fragment: &str) -> usize {
    RE_LINK.find_iter(fragment).count()
}

// ── Block scan ───────────────────────────────────────────────────────────────

/// Structural category of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Fenced code, delimiters included. Atomic.
    Fence,
    /// Consecutive table rows. Atomic.
    Table,
    /// A paragraph-ish run of other lines plus trailing blank lines.
    Text,
}

/// A contiguous byte span of the scanned text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub kind: BlockKind,
    pub span: Range<usize>,
}

impl Block {
    pub fn is_atomic(&self) -> bool {
        matches!(self.kind, BlockKind::Fence | BlockKind::Table)
    }
}

/// Lines with their byte spans, newline included.
fn line_spans(text: &str) -> Vec<Range<usize>> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, b) in text.bytes().enumerate() {
        if b == b'\n' {
            out.push(start..i + 1);
            start = i + 1;
        }
    }
    if start < text.len() {
        out.push(start..text.len());
    }
    out
}

fn line_at<'a>(text: &'a str, spans: &[Range<usize>], i: usize) -> &'a str {
    text[spans[i].clone()].trim_end_matches(['\n', '\r'])
}

/// Partition `text` into fence, table and text blocks.
///
/// The blocks are contiguous and cover every byte, so concatenating their
/// spans reproduces the input exactly.
pub fn scan_blocks(text: &str) -> Vec<Block> {
    let spans = line_spans(text);
    let line = |i: usize| line_at(text, &spans, i);
    let mut blocks = Vec::new();
    let mut i = 0;

    while i < spans.len() {
        let start = spans[i].start;
        if let Some(marker) = FenceMarker::parse(line(i)) {
            let mut j = i + 1;
            while j < spans.len() && !marker.closes(line(j)) {
                j += 1;
            }
            let end_line = j.min(spans.len() - 1);
            blocks.push(Block {
                kind: BlockKind::Fence,
                span: start..spans[end_line].end,
            });
            i = end_line + 1;
        } else if is_table_row(line(i)) {
            let mut j = i;
            while j + 1 < spans.len() && is_table_row(line(j + 1)) {
                j += 1;
            }
            blocks.push(Block {
                kind: BlockKind::Table,
                span: start..spans[j].end,
            });
            i = j + 1;
        } else {
            let mut j = i;
            loop {
                let next = j + 1;
                if next >= spans.len() {
                    break;
                }
                let next_line = line(next);
                if FenceMarker::parse(next_line).is_some() || is_table_row(next_line) {
                    break;
                }
                if line(j).trim().is_empty() && !next_line.trim().is_empty() {
                    break;
                }
                j = next;
            }
            blocks.push(Block {
                kind: BlockKind::Text,
                span: start..spans[j].end,
            });
            i = j + 1;
        }
    }
    blocks
}
