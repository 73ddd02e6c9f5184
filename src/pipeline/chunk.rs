//! Block-aware chunking.
//!
//! Splits normalised Markdown into ordered chunks that can be repaired
//! independently. The split is hierarchical:
//!
//! 1. always cut before every H1/H2 heading;
//! 2. a piece over the token budget is cut before its H3 headings, then H4,
//!    and so on down to H6;
//! 3. a piece with no deeper heading is packed block by block. Tables and
//!    fenced code are never divided; only an over-budget plain-text block is
//!    sliced, at line boundaries first and at character boundaries last.
//!
//! Chunk contents always concatenate back to the input byte for byte.

use crate::pipeline::annotations::PageRange;
use crate::pipeline::markdown::{heading_level, scan_blocks, token_count, Block, BlockKind};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::debug;

/// An ordered, independently repairable slice of the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub content: String,
    /// The chunk is a single table or fenced-code block and must not be
    /// subdivided further.
    pub is_atomic: bool,
    /// Pages covered, inferred from `<!-- page N -->` markers.
    pub page_range: Option<PageRange>,
}

impl Chunk {
    pub fn tokens(&self) -> usize {
        token_count(&self.content)
    }
}

static RE_PAGE_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<!--\s*page[\s:#]*(\d{1,5})\s*-->").unwrap());

struct HeadingAt {
    start: usize,
    level: usize,
}

struct Chunker<'a> {
    text: &'a str,
    blocks: Vec<Block>,
    headings: Vec<HeadingAt>,
    budget: usize,
    slice_bytes: usize,
    out: Vec<(Range<usize>, bool)>,
}

impl<'a> Chunker<'a> {
    fn new(text: &'a str, budget: usize) -> Self {
        let blocks = scan_blocks(text);
        let mut headings = Vec::new();
        for block in blocks.iter().filter(|b| b.kind == BlockKind::Text) {
            let mut offset = block.span.start;
            for line in text[block.span.clone()].split_inclusive('\n') {
                if let Some(level) = heading_level(line.trim_end_matches(['\n', '\r'])) {
                    headings.push(HeadingAt {
                        start: offset,
                        level,
                    });
                }
                offset += line.len();
            }
        }
        let budget = budget.max(1);
        Self {
            text,
            blocks,
            headings,
            budget,
            slice_bytes: (budget * 4).max(1000),
            out: Vec::new(),
        }
    }

    fn tokens(&self, range: &Range<usize>) -> usize {
        token_count(&self.text[range.clone()])
    }

    fn emit(&mut self, range: Range<usize>, atomic: bool) {
        if !range.is_empty() {
            self.out.push((range, atomic));
        }
    }

    /// Cut `range` before every heading of level `<= max_level`.
    fn cut(&self, range: &Range<usize>, max_level: usize) -> Option<Vec<Range<usize>>> {
        let cuts: Vec<usize> = self
            .headings
            .iter()
            .filter(|h| h.level <= max_level && h.start > range.start && h.start < range.end)
            .map(|h| h.start)
            .collect();
        if cuts.is_empty() {
            return None;
        }
        let mut pieces = Vec::with_capacity(cuts.len() + 1);
        let mut start = range.start;
        for c in cuts {
            pieces.push(start..c);
            start = c;
        }
        pieces.push(start..range.end);
        Some(pieces)
    }

    fn run(&mut self) {
        let all = 0..self.text.len();
        let top = self.cut(&all, 2).unwrap_or_else(|| vec![all]);
        for piece in top {
            self.split(piece, 3);
        }
    }

    fn split(&mut self, range: Range<usize>, from_level: usize) {
        if self.tokens(&range) <= self.budget {
            self.emit(range, false);
            return;
        }
        for level in from_level..=6 {
            if let Some(pieces) = self.cut(&range, level) {
                for piece in pieces {
                    self.split(piece, level + 1);
                }
                return;
            }
        }
        self.pack(range);
    }

    /// Greedy block packing for a piece with no usable heading.
    fn pack(&mut self, range: Range<usize>) {
        let spans: Vec<(Range<usize>, bool)> = self
            .blocks
            .iter()
            .map(|b| (b.span.start.max(range.start)..b.span.end.min(range.end), b.is_atomic()))
            .filter(|(span, _)| !span.is_empty())
            .collect();

        let mut current: Option<Range<usize>> = None;
        for (span, atomic) in spans {
            if self.tokens(&span) > self.budget {
                if let Some(cur) = current.take() {
                    self.emit(cur, false);
                }
                if atomic {
                    debug!(
                        "Atomic block of {} tokens exceeds the {}-token budget",
                        self.tokens(&span),
                        self.budget
                    );
                    self.emit(span, true);
                } else {
                    self.slice_text(span);
                }
                continue;
            }
            current = match current {
                Some(cur) if self.tokens(&(cur.start..span.end)) <= self.budget => {
                    Some(cur.start..span.end)
                }
                Some(cur) => {
                    self.emit(cur, false);
                    Some(span)
                }
                None => Some(span),
            };
        }
        if let Some(cur) = current {
            self.emit(cur, false);
        }
    }

    /// Slice an over-budget text block at line boundaries; a single
    /// over-budget line is cut at character boundaries.
    fn slice_text(&mut self, range: Range<usize>) {
        let mut current: Option<Range<usize>> = None;
        let mut offset = range.start;
        let lines: Vec<Range<usize>> = self.text[range.clone()]
            .split_inclusive('\n')
            .map(|l| {
                let r = offset..offset + l.len();
                offset = r.end;
                r
            })
            .collect();

        for line in lines {
            if self.tokens(&line) > self.budget {
                if let Some(cur) = current.take() {
                    self.emit(cur, false);
                }
                self.slice_chars(line);
                continue;
            }
            current = match current {
                Some(cur) if self.tokens(&(cur.start..line.end)) <= self.budget => {
                    Some(cur.start..line.end)
                }
                Some(cur) => {
                    self.emit(cur, false);
                    Some(line)
                }
                None => Some(line),
            };
        }
        if let Some(cur) = current {
            self.emit(cur, false);
        }
    }

    fn slice_chars(&mut self, range: Range<usize>) {
        let mut start = range.start;
        while start < range.end {
            let mut end = (start + self.slice_bytes).min(range.end);
            while !self.text.is_char_boundary(end) {
                end -= 1;
            }
            if end < range.end {
                // Prefer to cut after a space inside the window.
                if let Some(space) = self.text[start..end].rfind(' ') {
                    if space > 0 {
                        end = start + space + 1;
                    }
                }
            }
            if end <= start {
                end = range.end;
            }
            self.emit(start..end, false);
            start = end;
        }
    }
}

/// Merge whitespace-only pieces into a neighbour so no chunk is empty of
/// content while the concatenation stays exact. Whitespace never changes
/// whether the neighbour is atomic.
fn absorb_blank_pieces(text: &str, pieces: Vec<(Range<usize>, bool)>) -> Vec<(Range<usize>, bool)> {
    let mut out: Vec<(Range<usize>, bool)> = Vec::with_capacity(pieces.len());
    let mut pending: Option<usize> = None;
    for (range, atomic) in pieces {
        if text[range.clone()].trim().is_empty() {
            match out.last_mut() {
                Some((last, _)) => last.end = range.end,
                None => pending = Some(pending.unwrap_or(range.start)),
            }
            continue;
        }
        match pending.take() {
            Some(start) => out.push((start..range.end, atomic)),
            None => out.push((range, atomic)),
        }
    }
    out
}

fn page_markers(text: &str) -> Vec<(usize, u32)> {
    RE_PAGE_MARKER
        .captures_iter(text)
        .filter_map(|c| {
            let at = c.get(0)?.start();
            let page = c[1].parse().ok()?;
            Some((at, page))
        })
        .collect()
}

fn infer_pages(markers: &[(usize, u32)], range: &Range<usize>) -> Option<PageRange> {
    let before = markers
        .iter()
        .take_while(|(at, _)| *at < range.start)
        .last()
        .map(|(_, p)| *p);
    let inside: Vec<u32> = markers
        .iter()
        .filter(|(at, _)| range.contains(at))
        .map(|(_, p)| *p)
        .collect();
    let first = before.or_else(|| inside.first().copied())?;
    let last = inside.last().copied().unwrap_or(first);
    Some(PageRange::new(first, last))
}

/// Split `text` into chunks of at most `max_tokens` proxy tokens where the
/// structure allows it.
pub fn chunk_markdown(text: &str, max_tokens: usize) -> Vec<Chunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let mut chunker = Chunker::new(text, max_tokens);
    chunker.run();
    let pieces = absorb_blank_pieces(text, std::mem::take(&mut chunker.out));
    let markers = page_markers(text);

    let chunks: Vec<Chunk> = pieces
        .into_iter()
        .enumerate()
        .map(|(index, (range, is_atomic))| Chunk {
            index,
            page_range: infer_pages(&markers, &range),
            content: text[range].to_string(),
            is_atomic,
        })
        .collect();
    debug!(
        "Chunked {} tokens into {} chunks (budget {})",
        token_count(text),
        chunks.len(),
        max_tokens
    );
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::markdown::code_mask;

    fn rebuild(chunks: &[Chunk]) -> String {
        chunks.iter().map(|c| c.content.as_str()).collect()
    }

    fn words(n: usize, tag: &str) -> String {
        (0..n).map(|i| format!("{tag}{i}")).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn empty_document_has_no_chunks() {
        assert!(chunk_markdown("", 100).is_empty());
        assert!(chunk_markdown("\n  \n", 100).is_empty());
    }

    #[test]
    fn splits_on_top_level_headings() {
        let doc = "intro\n\n# A\ntext a\n\n## B\ntext b\n### B.1\ndeeper\n";
        let chunks = chunk_markdown(doc, 1000);
        assert_eq!(chunks.len(), 3);
        assert!(chunks[1].content.starts_with("# A"));
        assert!(chunks[2].content.starts_with("## B"));
        assert!(chunks[2].content.contains("### B.1"));
        assert_eq!(rebuild(&chunks), doc);
        assert!(chunks.iter().enumerate().all(|(i, c)| c.index == i));
    }

    #[test]
    fn over_budget_sections_use_deeper_headings() {
        let doc = format!(
            "## Big\n{}\n### One\n{}\n#### One.a\n{}\n### Two\n{}\n",
            words(5, "p"),
            words(20, "a"),
            words(20, "b"),
            words(20, "c")
        );
        let chunks = chunk_markdown(&doc, 30);
        assert_eq!(rebuild(&chunks), doc);
        assert!(chunks.iter().all(|c| c.tokens() <= 30), "{chunks:#?}");
        assert!(chunks.iter().any(|c| c.content.starts_with("#### One.a")));
    }

    #[test]
    fn oversized_table_is_one_atomic_chunk() {
        let mut table = String::from("| a | b |\n| --- | --- |\n");
        for i in 0..50 {
            table.push_str(&format!("| x{i} | y{i} |\n"));
        }
        let chunks = chunk_markdown(&table, 10);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_atomic);
    }

    #[test]
    fn trailing_blank_lines_keep_atomic_flag() {
        let mut table = String::from("| a | b |\n| --- | --- |\n");
        for i in 0..50 {
            table.push_str(&format!("| x{i} | y{i} |\n"));
        }
        for doc in [format!("{table}\n\n"), format!("\n\n{table}")] {
            let chunks = chunk_markdown(&doc, 10);
            assert_eq!(chunks.len(), 1);
            assert!(chunks[0].is_atomic, "{doc:?}");
            assert_eq!(rebuild(&chunks), doc);
        }
    }

    #[test]
    fn fallback_packing_never_splits_atomic_blocks() {
        let mut doc = String::new();
        for i in 0..6 {
            doc.push_str(&format!("{}\n\n", words(8, &format!("p{i}w"))));
            doc.push_str(&format!("| h{i} | v |\n| --- | --- |\n| 1 | 2 |\n\n"));
            doc.push_str(&format!("```\ncode {i}\n\nmore {i}\n```\n\n"));
        }
        let chunks = chunk_markdown(&doc, 25);
        assert!(chunks.len() > 1);
        assert_eq!(rebuild(&chunks), doc);
        for c in &chunks {
            let lines: Vec<&str> = c.content.lines().collect();
            let mask = code_mask(&lines);
            assert!(!mask.last().copied().unwrap_or(false) || c.content.trim_end().ends_with("```"));
            assert!(!c.content.starts_with("| 1 |") && !c.content.starts_with("| --- |"));
        }
    }

    #[test]
    fn over_budget_text_is_sliced() {
        let doc = format!("{}\n{}\n", words(40, "a"), words(40, "b"));
        let chunks = chunk_markdown(&doc, 50);
        assert_eq!(chunks.len(), 2);
        assert_eq!(rebuild(&chunks), doc);

        let long_line = "word ".repeat(3000);
        let chunks = chunk_markdown(&long_line, 100);
        assert!(chunks.len() > 1);
        assert_eq!(rebuild(&chunks), long_line);
    }

    #[test]
    fn headings_inside_fences_are_not_split_points() {
        let doc = "## Real\n```\n## Fake\n```\n";
        assert_eq!(chunk_markdown(doc, 1000).len(), 1);
    }

    #[test]
    fn page_ranges_follow_markers() {
        let doc = "<!-- page 3 -->\n# A\ntext\n<!-- page 4 -->\nmore\n# B\nrest\n<!-- page 6 -->\n";
        let chunks = chunk_markdown(doc, 1000);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].page_range, Some(PageRange::new(3, 3)));
        assert_eq!(chunks[1].page_range, Some(PageRange::new(3, 4)));
        assert_eq!(chunks[2].page_range, Some(PageRange::new(4, 6)));
        assert_eq!(chunk_markdown("# x\n", 10)[0].page_range, None);
    }
}
