use std::sync::LazyLock;

use regex::Regex;

static COMMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());
static SELF_CLOSING_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<ref\b[^>]*/>").unwrap());
static REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<ref\b[^>]*>.*?</ref\s*>").unwrap());
static PIPED_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\[[^\[\]|]*\|([^\[\]]*)\]\]").unwrap());
static PLAIN_LINK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[\[([^\[\]]*)\]\]").unwrap());
static LABELED_EXTERNAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(?:https?:)?//[^\s\]]+\s+([^\]]*)\]").unwrap());
static BARE_EXTERNAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(?:https?:)?//[^\s\]]+\]").unwrap());
static EMPHASIS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"'{2,}").unwrap());
static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*=+[ \t]*(.*?)[ \t]*=+[ \t]*$").unwrap());
static LIST_MARKER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^[ \t]*[*#:;]+[ \t]*").unwrap());
static HTML_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"</?[A-Za-z][^>]*>").unwrap());
static MAGIC_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"__[A-Z]+__").unwrap());
static CITATION_MARKER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[\d+\]").unwrap());

const NAMESPACED_LINK_PREFIXES: &[&str] = &["file:", "image:", "category:"];

const ENTITIES: &[(&str, &str)] = &[
    ("&nbsp;", " "),
    ("&ndash;", "\u{2013}"),
    ("&mdash;", "\u{2014}"),
    ("&quot;", "\""),
    ("&#39;", "'"),
    ("&apos;", "'"),
    ("&lt;", "<"),
    ("&gt;", ">"),
    ("&amp;", "&"),
];

/// Reduce wiki markup to the plain prose a reader would see.
pub fn normalize_markup(raw: &str) -> String {
    let text = COMMENT.replace_all(raw, "");
    let text = SELF_CLOSING_REF.replace_all(&text, "");
    let text = REF.replace_all(&text, "");
    let text = strip_balanced(&text, "{{", "}}");
    let text = strip_balanced(&text, "{|", "|}");
    let text = strip_namespaced_links(&text);
    let text = PIPED_LINK.replace_all(&text, "$1");
    let text = PLAIN_LINK.replace_all(&text, "$1");
    let text = LABELED_EXTERNAL.replace_all(&text, "$1");
    let text = BARE_EXTERNAL.replace_all(&text, "");
    let text = EMPHASIS.replace_all(&text, "");
    let text = HEADING.replace_all(&text, "$1");
    let text = LIST_MARKER.replace_all(&text, "");
    let text = HTML_TAG.replace_all(&text, "");
    let text = MAGIC_WORD.replace_all(&text, "");

    let mut text = text.into_owned();
    for (entity, replacement) in ENTITIES {
        if text.contains(entity) {
            text = text.replace(entity, replacement);
        }
    }

    let text = CITATION_MARKER.replace_all(&text, "");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Remove every `open ... close` span, honoring nesting. An unclosed span runs to the end.
fn strip_balanced(text: &str, open: &str, close: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut depth = 0usize;
    let mut rest = text;

    while !rest.is_empty() {
        if rest.starts_with(open) {
            depth += 1;
            rest = &rest[open.len()..];
        } else if depth > 0 && rest.starts_with(close) {
            depth -= 1;
            rest = &rest[close.len()..];
        } else {
            let mut chars = rest.chars();
            if let Some(c) = chars.next() {
                if depth == 0 {
                    out.push(c);
                }
            }
            rest = chars.as_str();
        }
    }
    out
}

/// Drop `[[File:...]]`, `[[Image:...]]` and `[[Category:...]]`, including captions that
/// contain nested links.
fn strip_namespaced_links(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("[[") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        if !has_namespaced_prefix(after.trim_start()) {
            out.push_str("[[");
            rest = after;
            continue;
        }

        let mut depth = 1usize;
        let mut cursor = after;
        while depth > 0 && !cursor.is_empty() {
            if cursor.starts_with("[[") {
                depth += 1;
                cursor = &cursor[2..];
            } else if cursor.starts_with("]]") {
                depth -= 1;
                cursor = &cursor[2..];
            } else {
                let mut chars = cursor.chars();
                chars.next();
                cursor = chars.as_str();
            }
        }
        rest = cursor;
    }
    out.push_str(rest);
    out
}

fn has_namespaced_prefix(target: &str) -> bool {
    NAMESPACED_LINK_PREFIXES.iter().any(|prefix| {
        target
            .get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
    })
}

/// Raw content of a redirect page, e.g. `#REDIRECT [[Natural satellite]]`.
pub(crate) fn is_redirect(raw: &str) -> bool {
    raw.trim_start()
        .get(..9)
        .is_some_and(|head| head.eq_ignore_ascii_case("#redirect"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_templates_refs_and_links() {
        let raw = "{{Infobox planet|name={{lang|en|Moon}}}}\n\
                   The '''Moon''' is [[Earth]]'s only [[natural satellite|moon]].<ref name=\"a\">Cite</ref>\n\
                   <!-- hidden note -->It orbits [[Earth|our planet]].<ref name=\"a\" />";
        assert_eq!(
            normalize_markup(raw),
            "The Moon is Earth's only moon. It orbits our planet."
        );
    }

    #[test]
    fn drops_files_categories_and_tables() {
        let raw = "[[File:Moon.jpg|thumb|The [[Moon]] at night]]\n\
                   {| class=\"wikitable\"\n|-\n| cell\n|}\n\
                   Tides follow the Moon.\n[[Category:Moons]]";
        assert_eq!(normalize_markup(raw), "Tides follow the Moon.");
    }

    #[test]
    fn strips_headings_lists_and_html() {
        let raw = "== Orbit ==\n* Period: 27&nbsp;days\n# Distance &amp; speed<br/>\n\
                   See [https://nasa.gov NASA] and [https://example.org].[3]";
        assert_eq!(
            normalize_markup(raw),
            "Orbit Period: 27 days Distance & speed See NASA and ."
        );
    }

    #[test]
    fn unclosed_template_swallows_the_rest() {
        assert_eq!(normalize_markup("Before {{cite web|url=x"), "Before");
    }

    #[test]
    fn empty_markup_normalizes_to_empty() {
        assert_eq!(normalize_markup(""), "");
        assert_eq!(normalize_markup("{{stub}}\n\n"), "");
    }

    #[test]
    fn namespace_prefixes_match_in_any_case() {
        let raw = "[[CATEGORY:Moons]] [[ image:Moon.png|thumb]] [[Filer]] [[Île de la Cité]]";
        assert_eq!(normalize_markup(raw), "Filer Île de la Cité");
    }

    #[test]
    fn long_pages_with_many_links_keep_every_label() {
        let raw = "[[Earth|planet]] ".repeat(5_000) + "[[Category:Moons]]";
        let normalized = normalize_markup(&raw);
        assert_eq!(normalized.matches("planet").count(), 5_000);
        assert!(!normalized.contains("Moons"));
    }

    #[test]
    fn redirect_content_is_recognized() {
        assert!(is_redirect("#REDIRECT [[Natural satellite]]"));
        assert!(is_redirect("  #redirect[[Moon]]"));
        assert!(!is_redirect("The Moon #REDIRECT"));
        assert!(!is_redirect("#RED"));
    }
}
