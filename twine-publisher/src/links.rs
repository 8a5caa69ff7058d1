//! Extracts link targets from passage text.
//!
//! Recognised forms: `[[target]]`, `[[text->target]]`, `[[target<-text]]`
//! and `[[text|target]]`. A setter component (`[[text->target][$x to 1]]`)
//! is ignored.

use std::sync::OnceLock;

use regex::Regex;

fn link_tags() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[\[(.*?)\]\]").expect("link pattern is valid"))
}

fn external_link() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^\w+:///?\w").expect("url pattern is valid"))
}

/// Splits `link` by `separator` and returns the field at `index`, counted from
/// the end when negative. `None` if the separator doesn't occur.
fn field<'a>(link: &'a str, separator: &str, index: isize) -> Option<&'a str> {
    let fields: Vec<&str> = link.split(separator).collect();
    if fields.len() == 1 {
        return None;
    }
    if index < 0 {
        fields.get(fields.len() - index.unsigned_abs()).copied()
    } else {
        fields.get(index as usize).copied()
    }
}

fn link_target(content: &str) -> &str {
    let content = field(content, "][", 0).unwrap_or(content);
    field(content, "->", -1)
        .filter(|t| !t.is_empty())
        .or_else(|| field(content, "<-", 0).filter(|t| !t.is_empty()))
        .or_else(|| field(content, "|", -1).filter(|t| !t.is_empty()))
        .unwrap_or(content)
}

/// Returns true if `link` points outside the story, e.g. `https://example.org`.
pub fn is_external(link: &str) -> bool {
    external_link().is_match(link)
}

/// Returns every link target in `text`, in order of appearance and with duplicates.
/// With `internal_only`, links to external URLs are left out.
pub fn parse_links(text: &str, internal_only: bool) -> Vec<String> {
    link_tags()
        .captures_iter(text)
        .filter_map(|c| {
            let content = c.get(1)?.as_str();
            // The innermost bracket pair wins over an unclosed outer one.
            let content = match content.rfind("[[") {
                Some(i) => &content[i + 2..],
                None => content,
            };
            let target = link_target(content);
            if target.is_empty() || (internal_only && is_external(target)) {
                None
            } else {
                Some(target.to_string())
            }
        })
        .collect()
}

/// Like [parse_links], but each target is reported once, at its first appearance.
pub fn unique_links(text: &str, internal_only: bool) -> Vec<String> {
    let mut result: Vec<String> = vec![];
    for link in parse_links(text, internal_only) {
        if !result.contains(&link) {
            result.push(link);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn all_link_forms_name_the_target() {
        for text in ["[[A]]", "[[B->A]]", "[[A<-B]]", "[[B|A]]"] {
            assert_eq!(parse_links(text, false), vec!["A"], "{}", text);
        }
    }

    #[test]
    fn keeps_order_and_duplicates() {
        let text = "[[One]] then [[Two]], back to [[go->One]].";
        assert_eq!(parse_links(text, false), vec!["One", "Two", "One"]);
        assert_eq!(unique_links(text, false), vec!["One", "Two"]);
    }

    #[test]
    fn arrows_split_at_the_outermost_separator() {
        assert_eq!(parse_links("[[a->b->c]]", false), vec!["c"]);
        assert_eq!(parse_links("[[c<-b<-a]]", false), vec!["c"]);
        assert_eq!(parse_links("[[a|b|c]]", false), vec!["c"]);
    }

    #[test]
    fn setters_are_ignored() {
        assert_eq!(parse_links("[[Go->Room][$visited to true]]", false), vec!["Room"]);
    }

    #[test]
    fn empty_and_malformed_links_yield_nothing() {
        assert!(parse_links("", false).is_empty());
        assert!(parse_links("[[]]", false).is_empty());
        assert!(parse_links("[[unclosed", false).is_empty());
        assert!(parse_links("[[split\nover lines]]", false).is_empty());
        assert!(parse_links("[single]", false).is_empty());
    }

    #[test]
    fn nested_brackets_use_the_innermost_link() {
        assert_eq!(parse_links("[[outer [[Inner]] tail]]", false), vec!["Inner"]);
    }

    #[test]
    fn empty_arrow_target_falls_back() {
        assert_eq!(parse_links("[[text->]]", false), vec!["text->"]);
    }

    #[test]
    fn internal_only_drops_urls() {
        let text = "[[Docs->https://example.org]] [[Home]]";
        assert_eq!(parse_links(text, false), vec!["https://example.org", "Home"]);
        assert_eq!(parse_links(text, true), vec!["Home"]);
    }
}
