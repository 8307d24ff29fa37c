//! Card identity: an ordered cascade of id sources, with a content hash as the last resort.

use fipibank_core::{IdMethod, Identity};
use regex::Regex;
use std::sync::LazyLock;

const ATTR_NAMES: &[&str] = &["data-id", "data-task", "id", "name"];
const HREF_KEYS: &[&str] = &["id", "qid", "tid"];
const HIDDEN_NAMES: &[&str] = &["q", "qid"];

static TEXT_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:номер(?:\s+задания)?|task\s+number|number|id)\s*[:№#]\s*([0-9a-z]{4,})")
        .expect("valid regex")
});
static ATTR_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?i:(?:question|task|q)[-_])?([0-9A-Za-z]{4,})$").expect("valid regex")
});
static ONCLICK_ARG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\(\s*(?:'([^']+)'|"([^"]+)"|(\d+))"#).expect("valid regex")
});
static STYLE_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\sstyle\s*=\s*(?:"[^"]*"|'[^']*'|[^\s>]+)"#).expect("valid regex")
});

fn clean_token(raw: &str) -> Option<String> {
    let t = raw.trim();
    if t.is_empty() || !t.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return None;
    }
    Some(t.to_ascii_uppercase())
}

fn from_text(visible_text: &str) -> Option<String> {
    let caps = TEXT_LABEL.captures(visible_text)?;
    Some(caps.get(1)?.as_str().to_ascii_uppercase())
}

fn from_attr(doc: &html_scraper::Html) -> Option<String> {
    let all = html_scraper::Selector::parse("*").ok()?;
    for el in doc.select(&all) {
        for name in ATTR_NAMES {
            let Some(v) = el.value().attr(name) else {
                continue;
            };
            let Some(caps) = ATTR_VALUE.captures(v.trim()) else {
                continue;
            };
            let tok = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            if tok.chars().any(|c| c.is_ascii_digit()) {
                return Some(tok.to_ascii_uppercase());
            }
        }
    }
    None
}

fn from_href(doc: &html_scraper::Html) -> Option<String> {
    let sel = html_scraper::Selector::parse("a[href]").ok()?;
    let base = url::Url::parse("http://card.invalid/").ok()?;
    for a in doc.select(&sel) {
        let Some(href) = a.value().attr("href") else {
            continue;
        };
        let Ok(u) = base.join(href.trim()) else {
            continue;
        };
        for (k, v) in u.query_pairs() {
            if HREF_KEYS.iter().any(|key| k.eq_ignore_ascii_case(key)) {
                if let Some(tok) = clean_token(&v) {
                    return Some(tok);
                }
            }
        }
    }
    None
}

fn from_onclick(doc: &html_scraper::Html) -> Option<String> {
    let all = html_scraper::Selector::parse("*").ok()?;
    for el in doc.select(&all) {
        for (name, value) in el.value().attrs() {
            if !name.to_ascii_lowercase().starts_with("on") {
                continue;
            }
            let Some(caps) = ONCLICK_ARG.captures(value) else {
                continue;
            };
            let arg = caps
                .get(1)
                .or_else(|| caps.get(2))
                .or_else(|| caps.get(3))
                .map(|m| m.as_str())
                .unwrap_or_default();
            if let Some(tok) = clean_token(arg) {
                return Some(tok);
            }
        }
    }
    None
}

fn from_hidden(doc: &html_scraper::Html) -> Option<String> {
    let sel = html_scraper::Selector::parse("input").ok()?;
    doc.select(&sel)
        .filter(|i| {
            i.value()
                .attr("type")
                .is_some_and(|t| t.eq_ignore_ascii_case("hidden"))
        })
        .filter(|i| {
            i.value()
                .attr("name")
                .is_some_and(|n| HIDDEN_NAMES.iter().any(|h| n.eq_ignore_ascii_case(h)))
        })
        .find_map(|i| i.value().attr("value").and_then(clean_token))
}

/// Synthetic id: `SYN-` plus the first 12 hex chars of sha256 over the markup with `style`
/// attributes stripped and whitespace collapsed.
pub fn synthetic_id(fragment_html: &str) -> String {
    let stripped = STYLE_ATTR.replace_all(fragment_html, "");
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    let hex = crate::sha256_hex(collapsed.as_bytes());
    format!("SYN-{}", hex[..12].to_ascii_uppercase())
}

/// Derive the identity of one card. Strategies are tried in a fixed order; the first hit wins.
pub fn resolve_id(fragment_html: &str, visible_text: &str) -> Identity {
    if let Some(id) = from_text(visible_text) {
        return Identity::Stable {
            id,
            method: IdMethod::Text,
        };
    }

    let doc = html_scraper::Html::parse_fragment(fragment_html);
    let cascade: [(IdMethod, fn(&html_scraper::Html) -> Option<String>); 4] = [
        (IdMethod::Attr, from_attr),
        (IdMethod::Href, from_href),
        (IdMethod::Onclick, from_onclick),
        (IdMethod::Hidden, from_hidden),
    ];
    for (method, strategy) in cascade {
        if let Some(id) = strategy(&doc) {
            return Identity::Stable { id, method };
        }
    }

    Identity::Synthetic {
        id: synthetic_id(fragment_html),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method_of(html: &str, text: &str) -> (IdMethod, String) {
        let id = resolve_id(html, text);
        (id.method(), id.id().to_string())
    }

    #[test]
    fn visible_label_wins_over_everything() {
        let html = r#"<div data-id="q_9999"><a href="?qid=777">x</a></div>"#;
        assert_eq!(
            method_of(html, "Номер задания: 4d5e6f Найдите значение"),
            (IdMethod::Text, "4D5E6F".to_string())
        );
        assert_eq!(
            method_of(html, "Task number: AB12"),
            (IdMethod::Text, "AB12".to_string())
        );
    }

    #[test]
    fn short_label_token_is_ignored() {
        let (m, id) = method_of(r#"<div data-id="q-12345">x</div>"#, "ID: ab1");
        assert_eq!(m, IdMethod::Attr);
        assert_eq!(id, "12345");
    }

    #[test]
    fn label_must_be_a_whole_word() {
        let html = r#"<div data-id="q-12345">x</div>"#;
        assert_eq!(method_of(html, "valid: 2024x").0, IdMethod::Attr);
        assert_eq!(method_of(html, "numbers: abcd").0, IdMethod::Attr);
        assert_eq!(method_of(html, "(ID: 77ab)").0, IdMethod::Text);
    }

    #[test]
    fn attr_requires_a_digit() {
        let (m, _) = method_of(
            r#"<div id="questions"><a href="show.php?qid=55aa">x</a></div>"#,
            "",
        );
        assert_eq!(m, IdMethod::Href);
    }

    #[test]
    fn attr_strips_known_prefixes() {
        assert_eq!(
            method_of(r#"<div id="task-0A1B2C">x</div>"#, ""),
            (IdMethod::Attr, "0A1B2C".to_string())
        );
        assert_eq!(
            method_of(r#"<div data-task="question_x123">x</div>"#, ""),
            (IdMethod::Attr, "X123".to_string())
        );
    }

    #[test]
    fn onclick_literal_argument() {
        assert_eq!(
            method_of(r#"<div><span onclick="showTask('e3f1')">open</span></div>"#, ""),
            (IdMethod::Onclick, "E3F1".to_string())
        );
        // `this` is not a literal.
        let (m, _) = method_of(r#"<div><span onclick="toggle(this)">x</span></div>"#, "");
        assert_eq!(m, IdMethod::Hash);
    }

    #[test]
    fn hidden_input() {
        assert_eq!(
            method_of(
                r#"<form><input type="hidden" name="qid" value="7f7f"></form>"#,
                ""
            ),
            (IdMethod::Hidden, "7F7F".to_string())
        );
    }

    #[test]
    fn fallback_hash_ignores_style_and_whitespace() {
        let a = resolve_id(r#"<div style="color:red">  Найдите   x </div>"#, "Найдите x");
        let b = resolve_id("<div>\n Найдите x\n</div>", "Найдите x");
        assert!(a.is_synthetic());
        assert_eq!(a, b);
        assert!(a.id().starts_with("SYN-"));
        assert_eq!(a.id().len(), 16);
        assert_eq!(a.id()[4..], a.id()[4..].to_ascii_uppercase());
    }

    #[test]
    fn resolve_is_deterministic() {
        let html = r#"<div class="qblock"><p>2 + 2</p></div>"#;
        assert_eq!(resolve_id(html, "2 + 2"), resolve_id(html, "2 + 2"));
    }
}
