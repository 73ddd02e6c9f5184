//! Side-by-side structural comparison of two Markdown files.
//!
//! Used to check that a repair (or a new extraction) did not lose tables,
//! links or numbered sections relative to a baseline.

use crate::error::MdRepairError;
use crate::pipeline::markdown::{code_mask, heading_level, heading_text, is_separator_row};
use crate::pipeline::normalize::table_blocks;
use crate::repair::write_atomic;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

static RE_SKIPPING_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[SKIPPING TABLE SECTION[^\]]*\]").unwrap());
static RE_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://[\w\-._~:/?#\[\]@!$&'()*+,;=%]+").unwrap());
static RE_MD_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[[^\]]+\]\(https?://[^)]+\)").unwrap());
static RE_EMAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@(?:[A-Za-z0-9-]+\.)+[A-Za-z]{2,}\b").unwrap()
});
static RE_NUMBERED: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+(?:\.\d+)*\b").unwrap());

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkCounts {
    pub urls_total: usize,
    pub md_links: usize,
    pub emails: usize,
}

/// Structural counts for one document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentProfile {
    pub path: PathBuf,
    /// Table blocks with a header and a delimiter row.
    pub tables_found: usize,
    /// `[SKIPPING TABLE SECTION…]` markers left by the extractor.
    pub skipping_markers: usize,
    pub links: LinkCounts,
    /// Numbered headings per heading level.
    pub heading_depth: BTreeMap<usize, usize>,
}

/// `new − old` for each count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileDelta {
    pub tables_found: i64,
    pub skipping_markers: i64,
    pub links_total: i64,
    pub md_links: i64,
    pub emails: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comparison {
    pub old: DocumentProfile,
    pub new: DocumentProfile,
    pub delta: ProfileDelta,
}

/// Count the structures of one document.
pub fn profile(text: &str) -> DocumentProfile {
    let lines: Vec<&str> = text.lines().collect();
    let mask = code_mask(&lines);

    let tables_found = table_blocks(&lines)
        .into_iter()
        .filter(|b| is_separator_row(lines[b.start + 1]))
        .count();

    let mut heading_depth = BTreeMap::new();
    for (line, _) in lines.iter().zip(&mask).filter(|(_, in_code)| !**in_code) {
        if let (Some(level), Some(title)) = (heading_level(line), heading_text(line)) {
            if RE_NUMBERED.is_match(title.trim()) {
                *heading_depth.entry(level).or_insert(0) += 1;
            }
        }
    }

    DocumentProfile {
        path: PathBuf::new(),
        tables_found,
        skipping_markers: RE_SKIPPING_MARKER.find_iter(text).count(),
        links: LinkCounts {
            urls_total: RE_URL.find_iter(text).count(),
            md_links: RE_MD_LINK.find_iter(text).count(),
            emails: RE_EMAIL.find_iter(text).count(),
        },
        heading_depth,
    }
}

fn diff(new: usize, old: usize) -> i64 {
    new as i64 - old as i64
}

/// Compare two documents held in memory.
pub fn compare_texts(old: &str, new: &str) -> Comparison {
    let (old, new) = (profile(old), profile(new));
    let delta = ProfileDelta {
        tables_found: diff(new.tables_found, old.tables_found),
        skipping_markers: diff(new.skipping_markers, old.skipping_markers),
        links_total: diff(new.links.urls_total, old.links.urls_total),
        md_links: diff(new.links.md_links, old.links.md_links),
        emails: diff(new.links.emails, old.links.emails),
    };
    Comparison { old, new, delta }
}

fn read(path: &Path) -> Result<String, MdRepairError> {
    if !path.exists() {
        return Err(MdRepairError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    std::fs::read_to_string(path).map_err(|e| MdRepairError::ReadFailed {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Compare two files; optionally write the comparison as pretty JSON.
pub fn compare_files(
    old_path: &Path,
    new_path: &Path,
    out_json: Option<&Path>,
) -> Result<Comparison, MdRepairError> {
    let mut cmp = compare_texts(&read(old_path)?, &read(new_path)?);
    cmp.old.path = old_path.to_path_buf();
    cmp.new.path = new_path.to_path_buf();
    if let Some(out) = out_json {
        let json = serde_json::to_vec_pretty(&cmp)
            .map_err(|e| MdRepairError::Internal(format!("comparison serialisation: {e}")))?;
        write_atomic(out, &json)?;
    }
    Ok(cmp)
}

#[cfg(test)]
mod tests {
    use super::*;

    const OLD: &str = "# 1 Intro\n\n[SKIPPING TABLE SECTION 3]\n\nMail ann@x.ac.uk or see https://a.org\n";
    const NEW: &str = "## 1 Intro\n\n### 1.1 Staff\n\n| Name | Email |\n| --- | --- |\n| Ann | [ann@x.ac.uk](mailto:ann@x.ac.uk) |\n\nSee [A](https://a.org) and https://b.org\n\n```\n# 2 not a heading\n```\n";

    #[test]
    fn profiles_count_structures() {
        let p = profile(NEW);
        assert_eq!(p.tables_found, 1);
        assert_eq!(p.skipping_markers, 0);
        assert_eq!(p.links.urls_total, 2);
        assert_eq!(p.links.md_links, 1);
        assert_eq!(p.links.emails, 2);
        assert_eq!(p.heading_depth, BTreeMap::from([(2, 1), (3, 1)]));
    }

    #[test]
    fn deltas_are_new_minus_old() {
        let c = compare_texts(OLD, NEW);
        assert_eq!(c.delta.tables_found, 1);
        assert_eq!(c.delta.skipping_markers, -1);
        assert_eq!(c.delta.links_total, 1);
        assert_eq!(c.delta.md_links, 1);
        assert_eq!(c.delta.emails, 1);
    }

    #[test]
    fn rows_without_delimiter_are_not_tables() {
        assert_eq!(profile("| a |\n| b |\n").tables_found, 0);
    }

    #[test]
    fn compare_files_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let (old, new, out) = (
            dir.path().join("old.md"),
            dir.path().join("new.md"),
            dir.path().join("cmp.json"),
        );
        std::fs::write(&old, OLD).unwrap();
        std::fs::write(&new, NEW).unwrap();
        let cmp = compare_files(&old, &new, Some(out.as_path())).unwrap();
        let saved: Comparison = serde_json::from_slice(&std::fs::read(&out).unwrap()).unwrap();
        assert_eq!(saved, cmp);
        assert!(compare_files(&dir.path().join("nope.md"), &new, None).is_err());
    }
}
