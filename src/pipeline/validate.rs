//! Acceptance checks on a finished document.
//!
//! The validator never mutates the document and never fails; every finding
//! becomes a named issue in the [`CoverageReport`]:
//!
//! - `malformed-link:<rule>` — a link-corruption signature survived
//! - `furniture:<marker>` — a navigation marker or furniture heading survived
//! - `table-link:<table#>:<column>` — a cell of a link-type column does not
//!   hold exactly one clickable link
//!
//! Fenced code is excluded from every scan.

use crate::output::CoverageReport;
use crate::pipeline::annotations::{unique_uris, LinkAnnotation};
use crate::pipeline::markdown::{code_mask, is_separator_row, link_count, split_cells};
use crate::pipeline::normalize::{malformed_signatures, table_blocks, FurnitureMatcher, NormalizeOptions};
use tracing::debug;

/// Header words that mark a column whose cells must be links.
pub const LINK_COLUMN_KEYWORDS: [&str; 10] = [
    "email", "e-mail", "contact", "meeting", "zoom", "teams", "booking", "website", "link", "url",
];

/// Cell values that mean "nothing here" and are not checked.
const EMPTY_CELLS: [&str; 4] = ["", "-", "n/a", "—"];

/// Run every check and compute URI coverage.
pub fn validate(markdown: &str, annotations: &[LinkAnnotation], options: &NormalizeOptions) -> CoverageReport {
    let lines: Vec<&str> = markdown.lines().collect();
    let mask = code_mask(&lines);

    let mut issues = Vec::new();
    let mut push = |issue: String| {
        if !issues.contains(&issue) {
            issues.push(issue);
        }
    };

    let matcher = FurnitureMatcher::new(options);
    for (line, _) in lines.iter().zip(&mask).filter(|(_, in_code)| !**in_code) {
        for rule in malformed_signatures(line) {
            push(format!("malformed-link:{rule}"));
        }
        if let Some(label) = matcher.label(line) {
            push(format!("furniture:{label}"));
        }
    }
    for issue in table_link_issues(&lines) {
        push(issue);
    }

    let (unique_uris_total, unique_uris_present) = uri_coverage(markdown, annotations);
    debug!(
        "Validation: {} issue(s), {}/{} annotation URIs present",
        issues.len(),
        unique_uris_present,
        unique_uris_total
    );
    CoverageReport {
        unique_uris_total,
        unique_uris_present,
        issues,
    }
}

/// (distinct annotation URIs, how many appear literally in `markdown`).
pub fn uri_coverage(markdown: &str, annotations: &[LinkAnnotation]) -> (usize, usize) {
    let uris = unique_uris(annotations);
    let present = uris.iter().filter(|u| markdown.contains(*u)).count();
    (uris.len(), present)
}

fn is_link_column(header: &str) -> bool {
    let h = header.to_lowercase();
    LINK_COLUMN_KEYWORDS.iter().any(|k| h.contains(k))
}

/// One issue per (table, column) with at least one bad cell.
fn table_link_issues(lines: &[&str]) -> Vec<String> {
    let mut issues = Vec::new();
    for (n, block) in table_blocks(lines).into_iter().enumerate() {
        let rows = &lines[block];
        let header = split_cells(rows[0]);
        let columns: Vec<(usize, &String)> = header
            .iter()
            .enumerate()
            .filter(|(_, h)| is_link_column(h))
            .collect();
        if columns.is_empty() {
            continue;
        }
        let data: Vec<Vec<String>> = rows[1..]
            .iter()
            .filter(|r| !is_separator_row(r))
            .map(|r| split_cells(r))
            .collect();
        for (col, name) in columns {
            let bad = data.iter().any(|cells| {
                let cell = cells.get(col).map_or("", |c| c.trim());
                !EMPTY_CELLS.contains(&cell.to_lowercase().as_str()) && link_count(cell) != 1
            });
            if bad {
                issues.push(format!("table-link:{}:{}", n + 1, name.trim().to_lowercase()));
            }
        }
    }
    issues
}
