//! GFM table canonicalisation and de-duplication.

use super::NormalizeOptions;
use crate::pipeline::markdown::{code_mask, is_separator_row, is_table_row, rejoin, split_cells};
use std::collections::HashSet;
use std::ops::Range;
use tracing::debug;

/// Rows compared when deciding whether two tables are the same.
const SIGNATURE_ROWS: usize = 3;

/// Line ranges of table blocks (two or more consecutive rows outside code).
pub fn table_blocks(lines: &[&str]) -> Vec<Range<usize>> {
    let mask = code_mask(lines);
    let mut blocks = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        if mask[i] || !is_table_row(lines[i]) {
            i += 1;
            continue;
        }
        let start = i;
        while i < lines.len() && !mask[i] && is_table_row(lines[i]) {
            i += 1;
        }
        if i - start >= 2 {
            blocks.push(start..i);
        }
    }
    blocks
}

fn alignment(cell: &str) -> &'static str {
    let c = cell.trim();
    match (c.starts_with(':'), c.ends_with(':') && c.len() > 1) {
        (true, true) => ":---:",
        (false, true) => "---:",
        (true, false) => ":---",
        (false, false) => "---",
    }
}

fn render_row(cells: &[String], width: usize) -> String {
    let mut row = String::from("|");
    for i in 0..width {
        row.push(' ');
        row.push_str(cells.get(i).map_or("", String::as_str));
        row.push_str(" |");
    }
    row
}

/// Rewrite one table block: header, a single delimiter row in position two,
/// data rows, every row padded to the widest row.
fn canonical_table(rows: &[&str]) -> Option<Vec<String>> {
    let content: Vec<Vec<String>> = rows
        .iter()
        .filter(|r| !is_separator_row(r))
        .map(|r| split_cells(r))
        .collect();
    if content.is_empty() {
        return None;
    }
    let width = content.iter().map(Vec::len).max().unwrap_or(1).max(1);

    let aligns: Vec<&str> = match rows.get(1) {
        Some(r) if is_separator_row(r) => split_cells(r).iter().map(|c| alignment(c)).collect(),
        _ => Vec::new(),
    };
    let delimiter = {
        let cells: Vec<String> = (0..width)
            .map(|i| aligns.get(i).copied().unwrap_or("---").to_string())
            .collect();
        render_row(&cells, width)
    };

    let mut out = Vec::with_capacity(content.len() + 1);
    out.push(render_row(&content[0], width));
    out.push(delimiter);
    out.extend(content[1..].iter().map(|cells| render_row(cells, width)));
    Some(out)
}

pub fn normalize_tables(text: &str, _options: &NormalizeOptions) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let blocks = table_blocks(&lines);
    if blocks.is_empty() {
        return text.to_string();
    }

    let mut out: Vec<String> = Vec::with_capacity(lines.len() + blocks.len());
    let mut cursor = 0;
    for block in blocks {
        out.extend(lines[cursor..block.start].iter().map(|l| l.to_string()));
        match canonical_table(&lines[block.clone()]) {
            Some(rows) => out.extend(rows),
            None => out.extend(lines[block.clone()].iter().map(|l| l.to_string())),
        }
        cursor = block.end;
    }
    out.extend(lines[cursor..].iter().map(|l| l.to_string()));
    rejoin(text, &out)
}

/// Column count plus the first data-bearing rows, whitespace-insensitive.
fn signature(rows: &[&str]) -> (usize, Vec<Vec<String>>) {
    let content: Vec<Vec<String>> = rows
        .iter()
        .filter(|r| !is_separator_row(r))
        .map(|r| split_cells(r))
        .collect();
    let width = content.iter().map(Vec::len).max().unwrap_or(0);
    let head = content
        .into_iter()
        .take(SIGNATURE_ROWS)
        .map(|mut cells| {
            cells.resize(width, String::new());
            cells
        })
        .collect();
    (width, head)
}

/// Remove later copies of a table with the same signature.
pub fn deduplicate_tables(text: &str, _options: &NormalizeOptions) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let mut seen = HashSet::new();
    let mut duplicate = vec![false; lines.len()];
    let mut removed = 0usize;

    for block in table_blocks(&lines) {
        if !seen.insert(signature(&lines[block.clone()])) {
            for i in block {
                duplicate[i] = true;
            }
            removed += 1;
        }
    }
    if removed == 0 {
        return text.to_string();
    }
    debug!("Removed {} duplicate tables", removed);

    let out: Vec<String> = lines
        .iter()
        .zip(duplicate)
        .filter(|(_, dup)| !dup)
        .map(|(l, _)| l.to_string())
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
    fn pads_rows_and_inserts_delimiter() {
        let input = "| A | B |\n| 1 |\n|2|3|4|\n";
        let out = normalize_tables(input, &opts());
        assert_eq!(out, "| A | B |  |\n| --- | --- | --- |\n| 1 |  |  |\n| 2 | 3 | 4 |\n");
        assert_eq!(normalize_tables(&out, &opts()), out);
    }

    #[test]
    fn keeps_alignment_and_drops_mid_table_separators() {
        let input = "|Name|Qty|\n|:--|--:|\n|a|1|\n|---|---|\n|b|2|";
        let out = normalize_tables(input, &opts());
        assert_eq!(out, "| Name | Qty |\n| :--- | ---: |\n| a | 1 |\n| b | 2 |");
    }

    #[test]
    fn single_rows_and_code_are_not_tables() {
        let input = "| lone row |\n\n```\n| a |\n| b |\n```\n";
        assert_eq!(normalize_tables(input, &opts()), input);
    }

    #[test]
    fn duplicate_tables_keep_first() {
        let table = "| H | I |\n| --- | --- |\n| 1 | 2 |\n| 3 | 4 |\n";
        let input = format!("{table}\ntext\n\n{table}\n|x|y|\n|---|---|\n");
        let out = deduplicate_tables(&input, &opts());
        assert_eq!(out.matches("| H | I |").count(), 1);
        assert!(out.contains("|x|y|"));
        assert_eq!(deduplicate_tables(&out, &opts()), out);
    }

    #[test]
    fn tables_differing_after_three_rows_are_duplicates() {
        let a = "| H |\n| --- |\n| 1 |\n| 2 |\n| 3 |\n";
        let b = "| H |\n| --- |\n| 1 |\n| 2 |\n| 9 |\n";
        let out = deduplicate_tables(&format!("{a}\n{b}"), &opts());
        assert_eq!(out.matches("| H |").count(), 1);
    }
}
