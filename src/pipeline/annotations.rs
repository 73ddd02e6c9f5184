//! Link annotations: the side-channel of hyperlinks lifted from the PDF.
//!
//! The extractor writes one record per link annotation with the columns
//! `page, x0, y0, x1, y1, uri, text`. Loading is deliberately forgiving: a
//! bad row is skipped, never fatal, and an unreadable source simply yields no
//! annotations. The repair run then proceeds without link hints rather than
//! not at all.

use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

/// Column order of the extractor output and of the payload sent to the model.
pub const ANNOTATION_COLUMNS: [&str; 7] = ["page", "x0", "y0", "x1", "y1", "uri", "text"];

/// Annotation rectangle in PDF user-space units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

/// One hyperlink annotation from the source PDF.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkAnnotation {
    /// 1-indexed page number.
    pub page: u32,
    pub bbox: BoundingBox,
    /// Link target. Never empty.
    pub uri: String,
    /// Words found under the annotation rectangle (may be empty).
    pub text: String,
}

/// Inclusive page interval used to pick the annotations relevant to a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    pub start: u32,
    pub end: u32,
}

impl PageRange {
    /// Build a range; swapped bounds are reordered.
    pub fn new(start: u32, end: u32) -> Self {
        Self {
            start: start.min(end),
            end: start.max(end),
        }
    }

    pub fn contains(&self, page: u32) -> bool {
        self.start <= page && page <= self.end
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

// ── Loading ──────────────────────────────────────────────────────────────────

/// Load annotations from a CSV file, or from a JSON array when the path ends
/// in `.json`.
///
/// Never fails: an unreadable source is logged and yields an empty list.
pub fn load_annotations(path: &Path) -> Vec<LinkAnnotation> {
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));

    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) => {
            warn!("Cannot open annotations '{}': {}", path.display(), e);
            return Vec::new();
        }
    };

    let rows = if is_json {
        read_json_rows(file)
    } else {
        read_csv_rows(file)
    };
    let annotations = annotations_from_rows(rows);
    debug!(
        "Loaded {} link annotations from {}",
        annotations.len(),
        path.display()
    );
    annotations
}

/// Parse CSV text (header row required) into annotations.
pub fn parse_csv(text: &str) -> Vec<LinkAnnotation> {
    annotations_from_rows(read_csv_rows(text.as_bytes()))
}

/// Parse a JSON array of records into annotations.
pub fn parse_json(text: &str) -> Vec<LinkAnnotation> {
    annotations_from_rows(read_json_rows(text.as_bytes()))
}

type RawRow = BTreeMap<String, String>;

fn read_csv_rows<R: Read>(reader: R) -> Vec<RawRow> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let headers: Vec<String> = match reader.headers() {
        Ok(h) => h
            .iter()
            .map(|s| s.trim_matches('\u{feff}').trim().to_lowercase())
            .collect(),
        Err(e) => {
            warn!("Annotation CSV has no readable header: {}", e);
            return Vec::new();
        }
    };

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                debug!("Skipping annotation row {}: {}", line + 2, e);
                continue;
            }
        };
        let row = headers
            .iter()
            .zip(record.iter())
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect();
        rows.push(row);
    }
    rows
}

fn read_json_rows<R: Read>(reader: R) -> Vec<RawRow> {
    let values: Vec<serde_json::Map<String, serde_json::Value>> =
        match serde_json::from_reader(reader) {
            Ok(v) => v,
            Err(e) => {
                warn!("Annotation JSON is not an array of records: {}", e);
                return Vec::new();
            }
        };

    values
        .into_iter()
        .map(|obj| {
            obj.into_iter()
                .map(|(k, v)| {
                    let v = match v {
                        serde_json::Value::String(s) => s,
                        serde_json::Value::Null => String::new(),
                        other => other.to_string(),
                    };
                    (k.to_lowercase(), v)
                })
                .collect()
        })
        .collect()
}

fn annotations_from_rows(rows: Vec<RawRow>) -> Vec<LinkAnnotation> {
    let total = rows.len();
    let out: Vec<LinkAnnotation> = rows.iter().filter_map(parse_row).collect();
    if out.len() < total {
        debug!("Dropped {} malformed annotation rows", total - out.len());
    }
    out
}

/// Parse a numeric field: empty → 0, otherwise integer or float text.
fn number(row: &RawRow, key: &str) -> Option<f64> {
    let raw = row.get(key).map(|s| s.trim()).unwrap_or("");
    if raw.is_empty() {
        return Some(0.0);
    }
    raw.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn parse_row(row: &RawRow) -> Option<LinkAnnotation> {
    let uri = row.get("uri").map(|s| s.trim()).unwrap_or("");
    if uri.is_empty() {
        return None;
    }
    let page = number(row, "page")?;
    if page < 0.0 {
        return None;
    }
    Some(LinkAnnotation {
        page: page as u32,
        bbox: BoundingBox {
            x0: number(row, "x0")?,
            y0: number(row, "y0")?,
            x1: number(row, "x1")?,
            y1: number(row, "y1")?,
        },
        uri: uri.to_string(),
        text: row.get("text").map(|s| s.trim()).unwrap_or("").to_string(),
    })
}

// ── Queries ──────────────────────────────────────────────────────────────────

/// Unique URIs in first-seen order.
pub fn unique_uris(annotations: &[LinkAnnotation]) -> Vec<&str> {
    let mut seen = HashSet::new();
    annotations
        .iter()
        .map(|a| a.uri.as_str())
        .filter(|u| seen.insert(*u))
        .collect()
}

/// Smallest range covering every annotated page.
pub fn page_span(annotations: &[LinkAnnotation]) -> Option<PageRange> {
    let min = annotations.iter().map(|a| a.page).min()?;
    let max = annotations.iter().map(|a| a.page).max()?;
    Some(PageRange::new(min, max))
}

/// Annotations whose page lies in `range`.
pub fn filter_by_pages(annotations: &[LinkAnnotation], range: PageRange) -> Vec<&LinkAnnotation> {
    annotations.iter().filter(|a| range.contains(a.page)).collect()
}

/// Shortest annotation text used as a link label; shorter text falls back
/// to the URI.
const MIN_LABEL_CHARS: usize = 3;

/// Append an `## External Links` section with one `### Page N` list per
/// page, holding every annotation URI that `markdown` does not contain.
/// Returns `markdown` unchanged when nothing is missing.
pub fn append_missing_links(markdown: &str, annotations: &[LinkAnnotation]) -> String {
    let mut pages: BTreeMap<u32, Vec<&LinkAnnotation>> = BTreeMap::new();
    for a in annotations.iter().filter(|a| !markdown.contains(a.uri.as_str())) {
        let entries = pages.entry(a.page).or_default();
        if !entries.iter().any(|e| e.uri == a.uri) {
            entries.push(a);
        }
    }
    if pages.is_empty() {
        return markdown.to_string();
    }

    let mut out = markdown.trim_end().to_string();
    if !out.is_empty() {
        out.push_str("\n\n");
    }
    out.push_str("## External Links\n");
    for (page, entries) in &pages {
        out.push_str(&format!("\n### Page {page}\n\n"));
        for a in entries {
            let text = a.text.split_whitespace().collect::<Vec<_>>().join(" ");
            let label = if text.chars().count() >= MIN_LABEL_CHARS && !text.contains(['[', ']']) {
                text
            } else {
                a.uri.clone()
            };
            out.push_str(&format!("- [{label}]({})\n", a.uri));
        }
    }
    debug!(
        "Appended {} missing link(s) across {} page(s)",
        pages.values().map(Vec::len).sum::<usize>(),
        pages.len()
    );
    out
}

/// Render annotations as CSV text for the model payload.
///
/// Newlines inside fields are flattened so every record stays on one line.
pub fn to_csv_payload(annotations: &[&LinkAnnotation]) -> String {
    if annotations.is_empty() {
        return String::new();
    }
    let mut writer = WriterBuilder::new().from_writer(Vec::new());
    let flatten = |s: &str| s.replace(['\n', '\r'], " ");

    let mut ok = writer.write_record(ANNOTATION_COLUMNS).is_ok();
    for a in annotations {
        if !ok {
            break;
        }
        ok = writer
            .write_record([
                a.page.to_string(),
                a.bbox.x0.to_string(),
                a.bbox.y0.to_string(),
                a.bbox.x1.to_string(),
                a.bbox.y1.to_string(),
                flatten(&a.uri),
                flatten(&a.text),
            ])
            .is_ok();
    }
    match writer.into_inner() {
        Ok(bytes) if ok => String::from_utf8_lossy(&bytes).trim_end().to_string(),
        _ => {
            warn!("Failed to render annotation payload");
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSV: &str = "\u{feff}page,x0,y0,x1,y1,uri,text\n\
        3,10,20,30,40,https://a.org,Alpha\n\
        x,1,2,3,4,https://bad.org,Bad page\n\
        4,1,2,3,4,,Empty uri\n\
        5.0,,2,3,4,mailto:b@c.org,  Beta  \n\
        6,1,oops,3,4,https://bad.org/bbox,Bad bbox\n\
        3,1,2,3,4,https://a.org,Alpha again\n";

    fn link(page: u32, uri: &str, text: &str) -> LinkAnnotation {
        LinkAnnotation {
            page,
            bbox: BoundingBox::default(),
            uri: uri.into(),
            text: text.into(),
        }
    }

    #[test]
    fn missing_links_are_appended_per_page() {
        let anns = vec![
            link(4, "https://b.org", "Bee  site"),
            link(2, "https://a.org", "Alpha"),
            link(2, "https://c.org", "C"),
            link(2, "https://c.org", "again"),
            link(4, "https://c.org", ""),
            link(5, "https://present.org", "Here"),
        ];
        let out = append_missing_links("# Doc\n\nSee https://present.org\n", &anns);
        assert_eq!(
            out,
            "# Doc\n\nSee https://present.org\n\n## External Links\n\n### Page 2\n\n\
             - [Alpha](https://a.org)\n- [https://c.org](https://c.org)\n\n### Page 4\n\n\
             - [Bee site](https://b.org)\n- [https://c.org](https://c.org)\n"
        );
        assert!(anns.iter().all(|a| out.contains(&a.uri)));
        assert_eq!(append_missing_links("x https://a.org", &anns[1..2]), "x https://a.org");
    }

    #[test]
    fn malformed_rows_are_dropped() {
        let anns = parse_csv(CSV);
        assert_eq!(anns.len(), 3);
        assert_eq!(anns[0].page, 3);
        assert_eq!(anns[0].bbox.x1, 30.0);
        assert_eq!(anns[1].page, 5);
        assert_eq!(anns[1].bbox.x0, 0.0);
        assert_eq!(anns[1].text, "Beta");
    }

    #[test]
    fn json_accepts_numbers_and_strings() {
        let json = r#"[
            {"page": 2, "x0": 1.5, "y0": "2", "x1": 3, "y1": 4, "uri": "https://x.org", "text": "X"},
            {"page": "n/a", "x0": 0, "y0": 0, "x1": 0, "y1": 0, "uri": "https://y.org", "text": ""},
            {"page": 7, "uri": "https://z.org"}
        ]"#;
        let anns = parse_json(json);
        assert_eq!(anns.len(), 2);
        assert_eq!(anns[0].bbox.x0, 1.5);
        assert_eq!(anns[1].page, 7);
    }

    #[test]
    fn unreadable_source_yields_empty() {
        assert!(load_annotations(Path::new("/definitely/not/here.csv")).is_empty());
        assert!(parse_json("not json").is_empty());
    }

    #[test]
    fn unique_uris_keep_first_seen_order() {
        let anns = parse_csv(CSV);
        assert_eq!(unique_uris(&anns), vec!["https://a.org", "mailto:b@c.org"]);
    }

    #[test]
    fn page_filtering() {
        let anns = parse_csv(CSV);
        assert_eq!(page_span(&anns), Some(PageRange::new(3, 5)));
        assert_eq!(filter_by_pages(&anns, PageRange::new(4, 9)).len(), 1);
        assert_eq!(page_span(&[]), None);
    }

    #[test]
    fn payload_round_trips_through_the_loader() {
        let anns = parse_csv(CSV);
        let refs: Vec<&LinkAnnotation> = anns.iter().collect();
        let payload = to_csv_payload(&refs);
        assert!(payload.starts_with("page,x0,y0,x1,y1,uri,text"));
        assert_eq!(parse_csv(&payload), anns);
    }
}
