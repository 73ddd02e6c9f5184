//! Link repair and autolinking.
//!
//! The malformed-link rules are shared with the acceptance validator: a rule
//! "matches" a line exactly when applying it would change the line, so the
//! validator reports precisely the signatures this pass would have fixed.

use super::{map_code_free_lines, map_text_segments, NormalizeOptions};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// Upper bound on repair rounds per line.
const MAX_ROUNDS: usize = 3;

/// A named corruption signature and its fix.
pub struct LinkRule {
    pub name: &'static str,
    fix: fn(&str) -> String,
}

impl LinkRule {
    pub fn apply(&self, line: &str) -> String {
        (self.fix)(line)
    }

    /// Whether the signature is present on `line`.
    pub fn matches(&self, line: &str) -> bool {
        self.apply(line) != line
    }
}

/// Repair rules in application order.
pub static LINK_RULES: [LinkRule; 8] = [
    LinkRule {
        name: "nested-scheme",
        fix: fix_nested_scheme,
    },
    LinkRule {
        name: "broken-scheme",
        fix: fix_broken_scheme,
    },
    LinkRule {
        name: "nested-brackets",
        fix: fix_nested_brackets,
    },
    LinkRule {
        name: "doubled-bracket-paren",
        fix: fix_doubled_bracket_paren,
    },
    LinkRule {
        name: "stray-paren-bracket",
        fix: fix_stray_paren_bracket,
    },
    LinkRule {
        name: "doubled-link-paren",
        fix: fix_doubled_link_paren,
    },
    LinkRule {
        name: "bracketed-url",
        fix: fix_bracketed_url,
    },
    LinkRule {
        name: "trailing-bracket",
        fix: fix_trailing_bracket,
    },
];

// ── Rule 1: https://[https://… ─────────────────────────────────────────────

static RE_NESTED_SCHEME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:https?://\[+)+(https?://)").unwrap());

fn fix_nested_scheme(line: &str) -> String {
    RE_NESTED_SCHEME.replace_all(line, "$1").into_owned()
}

// ── Rule 2: https://://, http:////, https// ─────────────────────────────────

static RE_BROKEN_SCHEME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(https?)(?::/{3,}|://:/*|//)").unwrap());

fn fix_broken_scheme(line: &str) -> String {
    RE_BROKEN_SCHEME.replace_all(line, "$1://").into_owned()
}

// ── Rule 3: [[label]] ───────────────────────────────────────────────────────

static RE_NESTED_BRACKETS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[{2,}([^\[\]]*)\]{2,}").unwrap());

fn fix_nested_brackets(line: &str) -> String {
    RE_NESTED_BRACKETS.replace_all(line, "[$1]").into_owned()
}

// ── Rule 4: ]]( ─────────────────────────────────────────────────────────────

static RE_DOUBLED_BRACKET_PAREN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\]{2,}\(").unwrap());

fn fix_doubled_bracket_paren(line: &str) -> String {
    RE_DOUBLED_BRACKET_PAREN.replace_all(line, "](").into_owned()
}

// ── Rule 5: ))] ─────────────────────────────────────────────────────────────

static RE_STRAY_PAREN_BRACKET: Lazy<Regex> = Lazy::new(|| Regex::new(r"\){2,}\]").unwrap());

fn fix_stray_paren_bracket(line: &str) -> String {
    RE_STRAY_PAREN_BRACKET.replace_all(line, ")").into_owned()
}

// ── Rule 6: [x](url)) ───────────────────────────────────────────────────────
//
// Extra closing parens are only stray when nothing earlier on the line is
// waiting for them: "(see [x](url))" is left alone.

static RE_DOUBLED_LINK_PAREN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\]\(([^\s()]+)\)(\)+)").unwrap());

fn unmatched(prefix: &str, open: char, close: char) -> usize {
    prefix.chars().fold(0usize, |depth, c| {
        if c == open {
            depth + 1
        } else if c == close {
            depth.saturating_sub(1)
        } else {
            depth
        }
    })
}

fn fix_doubled_link_paren(line: &str) -> String {
    RE_DOUBLED_LINK_PAREN
        .replace_all(line, |caps: &Captures<'_>| {
            let start = caps.get(0).map_or(0, |m| m.start());
            let open = unmatched(&line[..start], '(', ')');
            let keep = caps[2].len().min(open);
            format!("]({}){}", &caps[1], ")".repeat(keep))
        })
        .into_owned()
}

// ── Rule 7: [https://…] without a destination ──────────────────────────────

static RE_BRACKETED_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(https?://[^\s\[\]]+)\](\()?").unwrap());

fn fix_bracketed_url(line: &str) -> String {
    RE_BRACKETED_URL
        .replace_all(line, |caps: &Captures<'_>| {
            if caps.get(2).is_some() {
                caps[0].to_string()
            } else {
                caps[1].to_string()
            }
        })
        .into_owned()
}

// ── Rule 8: https://…]] ─────────────────────────────────────────────────────

static RE_TRAILING_BRACKET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(https?://[^\s\[\]()<>]+)(\]+)(\()?").unwrap());

fn fix_trailing_bracket(line: &str) -> String {
    RE_TRAILING_BRACKET
        .replace_all(line, |caps: &Captures<'_>| {
            let start = caps.get(0).map_or(0, |m| m.start());
            if caps.get(3).is_some() || unmatched(&line[..start], '[', ']') > 0 {
                caps[0].to_string()
            } else {
                caps[1].to_string()
            }
        })
        .into_owned()
}

// ── Pass: malformed-link repair ─────────────────────────────────────────────

/// Apply every rule until the line is stable or `MAX_ROUNDS` is reached.
pub fn repair_line(line: &str) -> String {
    let mut current = line.to_string();
    for _ in 0..MAX_ROUNDS {
        let next = LINK_RULES
            .iter()
            .fold(current.clone(), |acc, rule| rule.apply(&acc));
        if next == current {
            break;
        }
        current = next;
    }
    current
}

/// Names of the rules whose signature is present on `line`.
pub fn malformed_signatures(line: &str) -> Vec<&'static str> {
    LINK_RULES
        .iter()
        .filter(|rule| rule.matches(line))
        .map(|rule| rule.name)
        .collect()
}

pub fn fix_malformed_links(text: &str, _options: &NormalizeOptions) -> String {
    map_code_free_lines(text, repair_line)
}

// ── Pass: autolinking ───────────────────────────────────────────────────────

static RE_AUTOLINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?:(?P<mailto>mailto:[A-Za-z0-9._%+-]+@(?:[A-Za-z0-9-]+\.)+[A-Za-z]{2,})",
        r"|(?P<url>https?://[A-Za-z0-9\-._~:/?#@!$&'*+,;=%]+)",
        r"|(?P<email>\b[A-Za-z0-9._%+-]+@(?:[A-Za-z0-9-]+\.)+[A-Za-z]{2,}\b))",
        r"(?P<close>\)*)",
    ))
    .unwrap()
});

static RE_LINK_DEFINITION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s{0,3}\[[^\]]+\]:\s").unwrap());

const TRAILING_PUNCT: &[char] = &['.', ',', ';', ':', '!', '?', '\'', '*'];

/// Link bare URLs and e-mail addresses in an unprotected stretch of text.
///
/// Closing parens right after a new link survive only when an earlier `(`
/// opens them, so the output never carries the `[x](url))` signature.
fn linkify(fragment: &str) -> String {
    RE_AUTOLINK
        .replace_all(fragment, |caps: &Captures<'_>| {
            let start = caps.get(0).map_or(0, |m| m.start());
            let closes = caps.name("close").map_or(0, |m| m.as_str().len());
            let opened = || closes.min(unmatched(&fragment[..start], '(', ')'));
            let (link, tail) = if let Some(m) = caps.name("mailto") {
                let addr = &m.as_str()["mailto:".len()..];
                (format!("[{addr}](mailto:{addr})"), "")
            } else if let Some(m) = caps.name("email") {
                let addr = m.as_str();
                (format!("[{addr}](mailto:{addr})"), "")
            } else {
                let raw = caps.name("url").map_or("", |m| m.as_str());
                let url = raw.trim_end_matches(TRAILING_PUNCT);
                if url.ends_with("://") {
                    return caps[0].to_string();
                }
                (format!("[{url}]({url})"), &raw[url.len()..])
            };
            let keep = if tail.is_empty() { opened() } else { closes };
            format!("{link}{tail}{}", ")".repeat(keep))
        })
        .into_owned()
}

fn is_html_line(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with('<') && !t.starts_with("<http") && !t.starts_with("<mailto:")
}

/// Link a single line. Table rows are linked cell by cell so cell
/// boundaries and non-link content stay untouched.
pub fn autolink_line(line: &str) -> String {
    if is_html_line(line) || RE_LINK_DEFINITION.is_match(line) {
        return line.to_string();
    }
    map_text_segments(line, linkify)
}

pub fn autolink(text: &str, _options: &NormalizeOptions) -> String {
    map_code_free_lines(text, autolink_line)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> NormalizeOptions {
        NormalizeOptions::default()
    }

    #[test]
    fn nested_scheme_collapses() {
        let out = fix_malformed_links("https://[https://example.org]]", &opts());
        assert_eq!(out, "https://example.org");
    }

    #[test]
    fn broken_schemes() {
        assert_eq!(repair_line("https://://a.org"), "https://a.org");
        assert_eq!(repair_line("http:////a.org"), "http://a.org");
        assert_eq!(repair_line("see https//a.org"), "see https://a.org");
        assert_eq!(repair_line("https://a.org"), "https://a.org");
    }

    #[test]
    fn bracket_and_paren_signatures() {
        assert_eq!(repair_line("[[Moodle]](https://m.org)"), "[Moodle](https://m.org)");
        assert_eq!(repair_line("[a]](https://a.org)"), "[a](https://a.org)");
        assert_eq!(repair_line("[a](https://a.org))]"), "[a](https://a.org)");
        assert_eq!(repair_line("[a](https://a.org)) tail"), "[a](https://a.org) tail");
        assert_eq!(repair_line("[https://a.org] tail"), "https://a.org tail");
    }

    #[test]
    fn balanced_constructs_survive() {
        for ok in [
            "(see [a](https://a.org))",
            "[https://a.org](https://a.org)",
            "[see https://a.org]",
            "plain text with ] and )",
        ] {
            assert_eq!(repair_line(ok), ok);
            assert!(malformed_signatures(ok).is_empty(), "{ok}");
        }
    }

    #[test]
    fn signatures_name_rules() {
        assert_eq!(malformed_signatures("x https://[https://a.org y"), vec!["nested-scheme"]);
    }

    #[test]
    fn code_fences_are_left_alone() {
        let input = "```\nhttps://[https://a.org]]\n```\n";
        assert_eq!(fix_malformed_links(input, &opts()), input);
        assert_eq!(autolink(input, &opts()), input);
    }

    #[test]
    fn autolinks_prose() {
        let out = autolink("Visit https://a.org/x. Mail a@b.ac.uk or mailto:c@d.org", &opts());
        assert_eq!(
            out,
            "Visit [https://a.org/x](https://a.org/x). Mail [a@b.ac.uk](mailto:a@b.ac.uk) or [c@d.org](mailto:c@d.org)"
        );
    }

    #[test]
    fn autolink_table_cells() {
        let input = "| Contact | Email |\n|---|---|\n| A | a@x.ac.uk |";
        let out = autolink(input, &opts());
        assert!(out.contains("| A | [a@x.ac.uk](mailto:a@x.ac.uk) |"), "{out}");
        assert!(out.starts_with("| Contact | Email |\n|---|---|\n"));
    }

    #[test]
    fn autolink_skips_existing_links_and_code() {
        let input = "[home](https://a.org) `https://b.org` <https://c.org>";
        assert_eq!(autolink(input, &opts()), input);
    }

    #[test]
    fn autolink_skips_definitions_and_html() {
        let input = "[1]: https://a.org\n<a href=\"https://b.org\">b</a>";
        assert_eq!(autolink(input, &opts()), input);
    }

    #[test]
    fn autolink_parens() {
        assert_eq!(
            autolink("text https://a.org/x) more", &opts()),
            "text [https://a.org/x](https://a.org/x) more"
        );
        assert_eq!(
            autolink("(see https://a.org/x) and (b@c.org))", &opts()),
            "(see [https://a.org/x](https://a.org/x)) and ([b@c.org](mailto:b@c.org))"
        );
        assert_eq!(
            autolink("end https://a.org.) x", &opts()),
            "end [https://a.org](https://a.org).) x"
        );
        for line in ["text https://a.org/x) more", "(see https://a.org/x))"] {
            let out = autolink(line, &opts());
            assert!(malformed_signatures(&out).is_empty(), "{out}");
        }
    }

    #[test]
    fn passes_are_idempotent() {
        let input = "x https://[https://a.org]] and [[b]](https://b.org)) y@z.org\n| c | https://c.org |";
        let once = autolink(&fix_malformed_links(input, &opts()), &opts());
        let twice = autolink(&fix_malformed_links(&once, &opts()), &opts());
        assert_eq!(once, twice);
    }
}
