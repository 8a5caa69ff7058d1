//! HTML escaping for published story data.
//!
//! Everything the publisher writes into attributes or element text goes
//! through [escape_html]. The story script and stylesheet live in raw-text
//! elements where entities are not decoded, so they only get their closing
//! tag neutralised by [escape_raw_text].

/// Escapes `&`, `<`, `>`, `"` and `'` so the string is safe in HTML text and
/// in quoted attributes.
pub fn escape_html(text: &str) -> String {
    let mut result = String::with_capacity(text.len() + text.len() / 8);
    for c in text.chars() {
        match c {
            '&' => result.push_str("&amp;"),
            '<' => result.push_str("&lt;"),
            '>' => result.push_str("&gt;"),
            '"' => result.push_str("&quot;"),
            '\'' => result.push_str("&#39;"),
            _ => result.push(c),
        }
    }
    result
}

/// Rewrites every `<`, backslashes, `/tag` sequence (ASCII case-insensitive),
/// adding one backslash or taking one away.
fn rewrite_closing_tags(text: &str, tag: &str, add: bool) -> String {
    let needle = format!("/{}", tag.to_ascii_lowercase());
    let lower = text.to_ascii_lowercase();
    let mut result = String::with_capacity(text.len());
    let mut last = 0;
    for (lt, _) in lower.match_indices('<') {
        let backslashes = lower[lt + 1..].bytes().take_while(|&b| b == b'\\').count();
        if !lower[lt + 1 + backslashes..].starts_with(&needle) {
            continue;
        }
        if add {
            result.push_str(&text[last..=lt]);
            result.push('\\');
            last = lt + 1;
        } else if backslashes > 0 {
            result.push_str(&text[last..=lt]);
            last = lt + 2;
        }
    }
    result.push_str(&text[last..]);
    result
}

/// Neutralises `</tag` inside the body of a raw-text element named `tag`, so
/// the body cannot close its element early. Every `<` followed by backslashes
/// and `/tag` gets one more backslash, which [unescape_raw_text] removes again.
pub fn escape_raw_text(text: &str, tag: &str) -> String {
    rewrite_closing_tags(text, tag, true)
}

/// Reverses [escape_raw_text].
pub fn unescape_raw_text(text: &str, tag: &str) -> String {
    rewrite_closing_tags(text, tag, false)
}

/// Decodes named and numeric character references.
/// Unknown references are kept as written.
pub fn decode_entities(text: &str) -> String {
    html_escape::decode_html_entities(text).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn escapes_markup_characters() {
        assert_eq!(
            escape_html(r#"<b class="x">Tom & 'Jerry'</b>"#),
            "&lt;b class=&quot;x&quot;&gt;Tom &amp; &#39;Jerry&#39;&lt;/b&gt;"
        );
    }

    #[test]
    fn decode_reverses_escape() {
        let text = "if (a < b && c > d) { say(\"'hi'\") } </tw-passagedata>";
        assert_eq!(decode_entities(&escape_html(text)), text);
    }

    #[test]
    fn decodes_numeric_references() {
        assert_eq!(decode_entities("&#65;&#x42;"), "AB");
    }

    #[test]
    fn decodes_named_references() {
        assert_eq!(decode_entities("Caf&eacute; &hellip; It&rsquo;s"), "Caf\u{e9} \u{2026} It\u{2019}s");
    }

    #[test]
    fn keeps_unknown_references() {
        assert_eq!(decode_entities("Q&A &bogus;"), "Q&A &bogus;");
    }

    #[test]
    fn raw_text_cannot_close_its_element() {
        let script = "document.write('</SCRIPT>'); x = '</script >';";
        let escaped = escape_raw_text(script, "script");
        assert!(!escaped.to_ascii_lowercase().contains("</script"));
        assert_eq!(unescape_raw_text(&escaped, "script"), script);
    }

    #[test]
    fn raw_text_keeps_existing_backslashes() {
        let script = r"document.write('<\/script>'); s = '<\\/SCRIPT'; t = '</script>';";
        let escaped = escape_raw_text(script, "script");
        assert_eq!(escaped, r"document.write('<\\/script>'); s = '<\\\/SCRIPT'; t = '<\/script>';");
        assert_eq!(unescape_raw_text(&escaped, "script"), script);
    }

    #[test]
    fn raw_text_leaves_other_tags() {
        assert_eq!(escape_raw_text("a </style> b", "script"), "a </style> b");
        assert_eq!(unescape_raw_text(r"a <\/style> b", "script"), r"a <\/style> b");
    }
}
