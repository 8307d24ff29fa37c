use crate::identity;
use crate::sanitize;
use fipibank_core::{ExamId, Identity, Level, RawRecord, RecordBody, Sanitizer};

/// Card containers, most specific first. The first selector with any match wins.
pub const CARD_SELECTORS: &[&str] = &[
    ".qblock",
    ".question",
    ".task",
    ".b-task",
    ".bank-card",
    "article",
    ".item",
    ".q-item",
];

/// Where the statement lives inside a card; absent -> the whole card.
pub const STATEMENT_SELECTORS: &[&str] = &[
    ".task-text",
    ".question-text",
    ".qtext",
    ".b-task__text",
    ".statement",
];

pub const ANSWER_SELECTORS: &[&str] = &[".answer", ".task-answer", ".q-answer", ".b-task__answer"];

const TEXT_WIDTH: usize = 4096;

/// Statement markup rendered as one line of plain text: block breaks kept as spaces, no
/// decoration, whitespace collapsed. Falls back to the raw text nodes if rendering fails.
pub fn html_to_text(html: &str) -> String {
    match html2text::config::plain_no_decorate().string_from_read(html.as_bytes(), TEXT_WIDTH) {
        Ok(t) => norm_ws(&t),
        Err(_) => fragment_text(html),
    }
}

fn norm_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn element_text(el: &html_scraper::ElementRef) -> String {
    norm_ws(&el.text().collect::<Vec<_>>().join(" "))
}

/// Visible text of an HTML fragment, whitespace collapsed.
pub fn fragment_text(html: &str) -> String {
    let frag = html_scraper::Html::parse_fragment(html);
    element_text(&frag.root_element())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Card {
    pub identity: Identity,
    pub statement_html: String,
    pub statement_text: String,
    /// Absolute where the page URL allowed resolution, otherwise as written.
    pub asset_urls: Vec<String>,
    pub answer: Option<String>,
    /// Unsanitized outer markup, kept for debug captures.
    pub outer_html: String,
}

impl Card {
    pub fn checksum(&self) -> String {
        crate::store::checksum(&self.statement_html, &self.asset_urls)
    }

    /// Build the raw record for this card. `assets` are the localized paths that downloaded.
    pub fn to_raw(
        &self,
        exam: ExamId,
        level: Level,
        task_no: u32,
        assets: Vec<String>,
        source_url: &str,
        accessed_at: &str,
    ) -> RawRecord {
        let mut body = RecordBody {
            statement_html: self.statement_html.clone(),
            statement_text: Some(self.statement_text.clone()),
            asset_urls: self.asset_urls.clone(),
            assets,
            answer: self.answer.clone(),
            source_url: source_url.to_string(),
            accessed_at: accessed_at.to_string(),
            checksum: self.checksum(),
            ..RecordBody::default()
        };
        body.set_identity(&self.identity);
        RawRecord {
            exam: Some(exam),
            level: Some(level),
            task_no: Some(task_no),
            body,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CardSet {
    pub cards: Vec<Card>,
    /// No card selector matched; the single card is the whole document body.
    pub fallback: bool,
    pub selector: Option<&'static str>,
}

fn select_outermost<'a>(
    doc: &'a html_scraper::Html,
    selector: &str,
) -> Vec<html_scraper::ElementRef<'a>> {
    let Ok(sel) = html_scraper::Selector::parse(selector) else {
        return Vec::new();
    };
    let matched: Vec<_> = doc.select(&sel).collect();
    let ids: Vec<_> = matched.iter().map(|e| e.id()).collect();
    matched
        .into_iter()
        .filter(|e| !e.ancestors().any(|a| ids.contains(&a.id())))
        .collect()
}

fn first_within<'a>(
    card: &html_scraper::ElementRef<'a>,
    selectors: &[&str],
) -> Option<html_scraper::ElementRef<'a>> {
    selectors.iter().find_map(|s| {
        let sel = html_scraper::Selector::parse(s).ok()?;
        card.select(&sel).next()
    })
}

fn collect_images(card: &html_scraper::ElementRef, base: Option<&url::Url>) -> Vec<String> {
    let Ok(sel) = html_scraper::Selector::parse("img") else {
        return Vec::new();
    };
    let mut out: Vec<String> = Vec::new();
    for img in card.select(&sel) {
        let src = img.value().attr("src").map(str::trim).unwrap_or_default();
        if src.is_empty() {
            continue;
        }
        let resolved = base
            .and_then(|b| b.join(src).ok())
            .map(|u| u.to_string())
            .unwrap_or_else(|| src.to_string());
        if !out.contains(&resolved) {
            out.push(resolved);
        }
    }
    out
}

fn card_from_element(
    el: &html_scraper::ElementRef,
    base: Option<&url::Url>,
    sanitizer: &dyn Sanitizer,
) -> Card {
    let outer_html = el.html();
    let statement_el = first_within(el, STATEMENT_SELECTORS).unwrap_or(*el);
    let statement_html = sanitize::sanitize_or_fallback(sanitizer, &statement_el.inner_html());
    let statement_text = fragment_text(&statement_html);
    let answer = first_within(el, ANSWER_SELECTORS)
        .map(|a| element_text(&a))
        .filter(|s| !s.is_empty());
    let identity = identity::resolve_id(&outer_html, &element_text(el));
    Card {
        identity,
        statement_html,
        statement_text,
        asset_urls: collect_images(el, base),
        answer,
        outer_html,
    }
}

/// Split a rendered listing page into cards.
pub fn extract_cards(html: &str, page_url: &str, sanitizer: &dyn Sanitizer) -> CardSet {
    let doc = html_scraper::Html::parse_document(html);
    let base = url::Url::parse(page_url).ok();

    for selector in CARD_SELECTORS {
        let found = select_outermost(&doc, selector);
        if found.is_empty() {
            continue;
        }
        return CardSet {
            cards: found
                .iter()
                .map(|el| card_from_element(el, base.as_ref(), sanitizer))
                .collect(),
            fallback: false,
            selector: Some(*selector),
        };
    }

    let body = html_scraper::Selector::parse("body")
        .ok()
        .and_then(|sel| doc.select(&sel).next());
    let root = body.unwrap_or_else(|| doc.root_element());
    CardSet {
        cards: vec![card_from_element(&root, base.as_ref(), sanitizer)],
        fallback: true,
        selector: None,
    }
}
