//! Post-processing: deterministic cleanup of model-repaired slices.
//!
//! Even a well-prompted model occasionally returns something that is right
//! in substance but wrong in shape:
//!
//! - the whole answer wrapped in ` ```markdown ... ``` ` fences
//! - the slice/CSV delimiters of the request echoed back
//! - placeholder images (`![chart](chart.png)`) that point nowhere
//! - Windows line endings and invisible Unicode
//! - link markup it broke while editing
//!
//! These rules run on every model answer before it is gated, so the gate
//! measures the text that would actually be kept.

use crate::pipeline::normalize::{map_code_free_lines, repair_line};
use crate::prompts::{LINKS_BEGIN, LINKS_END, SLICE_BEGIN, SLICE_END};
use once_cell::sync::Lazy;
use regex::Regex;

/// Apply all cleanup rules to a raw model answer for the slice `source`.
///
/// Rules (applied in order):
/// 1. Normalise line endings (CRLF → LF)
/// 2. Strip an outer fence the model added around the whole answer
/// 3. Drop echoed request delimiters and anything after a link dump
/// 4. Remove placeholder image links, keeping their alt text
/// 5. Strip invisible Unicode
/// 6. Re-apply the malformed-link fixups outside fenced code
pub fn clean_model_output(input: &str, source: &str) -> String {
    let s = normalise_line_endings(input);
    let s = strip_markdown_fences(&s, source);
    let s = drop_echoed_delimiters(&s);
    let s = remove_hallucinated_images(&s);
    let s = remove_invisible_chars(&s);
    fix_links(&s)
}

// ── Rule 1: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 2: Strip outer markdown fences ──────────────────────────────────────
//
// Only a wrapper the model added is removed: when the slice itself opens
// with the same fence line, the fences are content and stay.

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^(```(?:markdown|md)?)\n(.*)\n```\s*$").unwrap());

fn strip_markdown_fences(input: &str, source: &str) -> String {
    let caps = match RE_OUTER_FENCES.captures(input.trim()) {
        Some(caps) => caps,
        None => return input.to_string(),
    };
    let opening = &caps[1];
    let source_opening = source.trim_start().lines().next().unwrap_or("").trim_end();
    let from_source = if opening == "```" {
        source_opening.starts_with("```")
    } else {
        source_opening == opening
    };
    if from_source {
        input.to_string()
    } else {
        caps[2].to_string()
    }
}

// ── Rule 3: Drop echoed request delimiters ──────────────────────────────────
//
// Models sometimes answer with the payload layout intact. The slice markers
// are removed; an echoed CSV dump and everything after it is cut.

fn drop_echoed_delimiters(input: &str) -> String {
    let body = match input.find(LINKS_BEGIN) {
        Some(at) => &input[..at],
        None => input,
    };
    body.lines()
        .filter(|l| {
            let t = l.trim();
            t != SLICE_BEGIN && t != SLICE_END && t != LINKS_END
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 4: Remove hallucinated images ──────────────────────────────────────
//
// A repaired slice never gains real images: the source is text. An image
// with a local or placeholder URL is replaced by its alt text in italics.

static RE_IMAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\(([^)]*)\)").unwrap());

fn is_placeholder_url(url: &str) -> bool {
    let u = url.trim();
    if u.is_empty() || !(u.starts_with("http://") || u.starts_with("https://")) {
        return true;
    }
    let fake_domains = [
        "example.com",
        "placeholder.com",
        "via.placeholder.com",
        "dummyimage.com",
        "placehold.it",
    ];
    fake_domains.iter().any(|d| u.contains(d))
}

fn remove_hallucinated_images(input: &str) -> String {
    RE_IMAGE
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let alt = caps[1].trim();
            if !is_placeholder_url(&caps[2]) {
                caps[0].to_string()
            } else if alt.is_empty() {
                String::new()
            } else {
                format!("*{}*", alt)
            }
        })
        .into_owned()
}

// ── Rule 5: Strip invisible Unicode ─────────────────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input
        .chars()
        .filter(|c| !matches!(c, '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{FEFF}' | '\u{00AD}' | '\u{2060}'))
        .collect()
}

// ── Rule 6: Malformed-link fixups ───────────────────────────────────────────

fn fix_links(input: &str) -> String {
    map_code_free_lines(input, repair_line)
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_fences() {
        let src = "# Hello\nWorld";
        assert_eq!(strip_markdown_fences("```markdown\n# Hello\nWorld\n```", src), "# Hello\nWorld");
        assert_eq!(strip_markdown_fences("```\n# Hello\nWorld\n```", src), "# Hello\nWorld");
        assert_eq!(strip_markdown_fences("# Hello\nWorld", src), "# Hello\nWorld");
    }

    #[test]
    fn test_inner_code_fence_is_kept() {
        let input = "text\n```\ncode\n```\nmore";
        assert_eq!(strip_markdown_fences(input, input), input);
    }

    #[test]
    fn test_fenced_slice_echo_is_kept() {
        let slice = "```\nlet a = 1;\nlet b = 2;\n```\n\nSome prose here.\n\n```\nfn main() {}\n```";
        let out = clean_model_output(slice, slice);
        assert_eq!(out, slice);
        assert_eq!(out.matches("```").count(), 4);

        let tagged = "```markdown\n# Notes\n```";
        assert_eq!(clean_model_output(tagged, tagged), tagged);
        assert_eq!(clean_model_output(&format!("```markdown\n{slice}\n```"), slice), slice);
    }

    #[test]
    fn test_link_fixups_skip_code() {
        let input = "See https://[https://a.org]]\n```\nhttps://[https://raw]]\n```";
        assert_eq!(
            clean_model_output(input, input),
            "See https://a.org\n```\nhttps://[https://raw]]\n```"
        );
    }

    #[test]
    fn test_normalise_line_endings() {
        assert_eq!(normalise_line_endings("a\r\nb\rc"), "a\nb\nc");
    }

    #[test]
    fn test_drop_echoed_delimiters() {
        let input = format!("{SLICE_BEGIN}\n# A\ntext\n{SLICE_END}\n\n{LINKS_BEGIN}\npage,uri\n{LINKS_END}");
        assert_eq!(drop_echoed_delimiters(&input), "# A\ntext\n");
    }

    #[test]
    fn test_placeholder_images() {
        let out = remove_hallucinated_images("![Chart](chart.png) and ![](https://example.com/x.png)");
        assert_eq!(out, "*Chart* and ");
        let real = "![Figure](https://www.ucl.ac.uk/fig1.png)";
        assert_eq!(remove_hallucinated_images(real), real);
    }

    #[test]
    fn test_remove_invisible() {
        assert_eq!(remove_invisible_chars("a\u{200B}b\u{FEFF}c\u{00AD}d"), "abcd");
    }

    #[test]
    fn test_clean_model_output_full() {
        let input = "```markdown\r\n# Title\r\nSee https://[https://example.org]]\r\n```";
        assert_eq!(clean_model_output(input, "# Title"), "# Title\nSee https://example.org");
    }
}
