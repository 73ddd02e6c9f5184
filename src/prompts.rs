//! Instructions sent to the completion service.
//!
//! The system prompt says what a repaired slice looks like; the user payload
//! carries the slice itself plus the link annotations for its pages. Callers
//! can override the system prompt via
//! [`crate::config::RepairConfig::system_prompt`]; the constants here are used
//! only when no override is provided.

use crate::pipeline::annotations::ANNOTATION_COLUMNS;

/// Default system prompt for repairing one Markdown slice.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You repair Markdown that was extracted from a PDF so it can be indexed for retrieval. You receive one slice of the document and a CSV dump of the hyperlink annotations found on the matching PDF pages.

Follow these rules precisely:

1. LINKS
   - Repair broken link markup: nested schemes such as "https://[https://", doubled "]]", stray "))]"
   - Turn bare URLs into [label](url) with a short human label taken from nearby words
   - Turn bare e-mail addresses into [name@host](mailto:name@host)
   - Never drop a URL that is already present in the slice

2. TABLES
   - Keep every table as valid GFM: one header row, one delimiter row, equal column counts
   - When a column header mentions Email, Contact, Meeting, Zoom, Teams, Booking, Website, Link or URL,
     each non-empty cell in that column must hold exactly one clickable link
   - Restore missing cell links from the CSV: match the cell words against the CSV `text` column on the same page

3. NOISE
   - Remove navigation furniture ("On this page", "Handbook Index", repeated footers, icon glyph lines)

4. STRUCTURE
   - Keep the existing heading levels; do not invent new sections
   - Keep paragraphs, lists, block quotes and fenced code as they are

5. OUTPUT FORMAT
   - Output ONLY the repaired Markdown for the slice
   - Do NOT wrap the answer in ```markdown fences
   - Do NOT add commentary, summaries or explanations
   - Do NOT shorten or summarise the text"#;

/// Shorter prompt for small, fast models that follow long rule lists poorly.
pub const COMPACT_SYSTEM_PROMPT: &str = r#"You repair PDF-extracted Markdown for retrieval.
- fix broken link markup; turn bare URLs and e-mail addresses into [label](url) links
- keep tables valid GFM; give link-type columns (Email, Meeting, Zoom, Link, Website) one link per cell, using the CSV
- remove navigation furniture and repeated footers
- keep every sentence and every existing URL
Return only the repaired Markdown."#;

/// Opening and closing markers around the slice in the user payload.
pub const SLICE_BEGIN: &str = "=== MARKDOWN SLICE BEGIN ===";
pub const SLICE_END: &str = "=== MARKDOWN SLICE END ===";
/// Opening and closing markers around the annotation CSV.
pub const LINKS_BEGIN: &str = "=== PDF LINK DUMP (CSV) BEGIN ===";
pub const LINKS_END: &str = "=== PDF LINK DUMP (CSV) END ===";

/// Pick the system prompt: caller override, then the profile's preference.
pub fn system_prompt(custom: Option<&str>, compact: bool) -> &str {
    match custom {
        Some(p) => p,
        None if compact => COMPACT_SYSTEM_PROMPT,
        None => DEFAULT_SYSTEM_PROMPT,
    }
}

/// Build the user payload for one slice.
///
/// `annotations_csv` is the output of
/// [`crate::pipeline::annotations::to_csv_payload`]; pass an empty string to
/// send the slice without link context.
pub fn user_payload(markdown: &str, annotations_csv: &str) -> String {
    let mut payload = format!(
        "Repair the following Markdown slice.\n\n{SLICE_BEGIN}\n{}\n{SLICE_END}\n",
        markdown.trim()
    );
    if !annotations_csv.trim().is_empty() {
        payload.push_str(&format!(
            "\nCSV columns: {}\n\n{LINKS_BEGIN}\n{}\n{LINKS_END}\n",
            ANNOTATION_COLUMNS.join(","),
            annotations_csv.trim_end()
        ));
    }
    payload.push_str("\nReturn ONLY the repaired Markdown for the slice.");
    payload
}
