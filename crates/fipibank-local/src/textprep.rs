//! Deterministic text normalization, Russian stemming and cue detectors.
//!
//! Everything here is a total function: empty input, huge input, or text in another script
//! yields empty/zero results, never an error.

use regex::Regex;
use std::sync::{LazyLock, OnceLock};

fn is_punct_class(ch: char) -> bool {
    matches!(ch, '\u{2000}'..='\u{206F}' | '\u{2E00}'..='\u{2E7F}')
        || matches!(
            ch,
            '\'' | '"'
                | '`'
                | '~'
                | '!'
                | '@'
                | '#'
                | '$'
                | '%'
                | '^'
                | '&'
                | '*'
                | '('
                | ')'
                | '_'
                | '+'
                | '='
                | '['
                | ']'
                | '{'
                | '}'
                | '|'
                | '\\'
                | ':'
                | ';'
                | '<'
                | '>'
                | ','
                | '.'
                | '?'
                | '/'
        )
}

/// Lowercase, fold `ё` into `е`, and turn punctuation into spaces.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars().flat_map(char::to_lowercase) {
        if ch == 'ё' {
            out.push('е');
        } else if is_punct_class(ch) {
            out.push(' ');
        } else {
            out.push(ch);
        }
    }
    out
}

fn is_cyrillic_word(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| matches!(c, 'а'..='я' | 'ё'))
}

fn stemmer() -> &'static rust_stemmers::Stemmer {
    static STEMMER: OnceLock<rust_stemmers::Stemmer> = OnceLock::new();
    STEMMER.get_or_init(|| rust_stemmers::Stemmer::create(rust_stemmers::Algorithm::Russian))
}

/// Stem a single lower-cased word; falls back to the word itself.
pub fn stem_word(word: &str) -> String {
    if !is_cyrillic_word(word) {
        return word.to_string();
    }
    let stemmed = stemmer().stem(word);
    if stemmed.trim().is_empty() {
        word.to_string()
    } else {
        stemmed.into_owned()
    }
}

/// Split normalized text into tokens; Cyrillic tokens are stemmed.
pub fn stem_tokens(text: &str) -> Vec<String> {
    normalize(text)
        .split(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, 'а'..='я' | 'ё')))
        .filter(|p| !p.is_empty())
        .map(stem_word)
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct UnitCounts {
    pub length: usize,
    pub mass: usize,
    pub time: usize,
    pub area: usize,
    pub volume: usize,
}

impl UnitCounts {
    pub fn total(&self) -> usize {
        self.length + self.mass + self.time + self.area + self.volume
    }
}

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("valid regex")
}

// Superscripts are not word characters, so `м²` is captured by LENGTH and filtered out in
// `has_units`; `м2` never matches LENGTH because of the trailing `\b`.
static LENGTH: LazyLock<Regex> = LazyLock::new(|| re(r"\b(?:мм|см|дм|м|км)(?:[²³]|\b)"));
static MASS: LazyLock<Regex> = LazyLock::new(|| re(r"\b(?:мг|г|кг|т|ц)\b"));
static TIME: LazyLock<Regex> =
    LazyLock::new(|| re(r"\b(?:сек|мин|ч|час(?:а|ов)?|сут(?:ок|ки)?|дн(?:я|ей))\b"));
static AREA: LazyLock<Regex> = LazyLock::new(|| re(r"(?:\b(?:мм|см|дм|м|км)(?:2|²)|\bга\b)"));
static VOLUME: LazyLock<Regex> = LazyLock::new(|| re(r"(?:\b(?:мл|л)\b|\b(?:см|дм|м)(?:3|³))"));
static GRAPH: LazyLock<Regex> = LazyLock::new(|| re(r"(?:график|диаграмм|рисунк|\bос[ьи]\b)"));
static FORMULA: LazyLock<Regex> = LazyLock::new(|| {
    re(r"(?:формул|подстав|выразит|упрост|значени[ея] переменн|раскройте скобки)")
});
static PROBABILITY: LazyLock<Regex> =
    LazyLock::new(|| re(r"(?:вероят|событи|монет|кубик|\bурн|\bшар|лотер|карточк|исход)"));
static OPTIMIZATION: LazyLock<Regex> =
    LazyLock::new(|| re(r"(?:тариф|выгодн|оптимальн|абонентск|пакет|стоимост|вариант)"));
static VAR_TOKEN: LazyLock<Regex> = LazyLock::new(|| re(r"\b[a-z]\d?\b"));

pub fn has_units(text: &str) -> UnitCounts {
    let t = text.to_lowercase();
    UnitCounts {
        length: LENGTH
            .find_iter(&t)
            .filter(|m| !m.as_str().ends_with(['²', '³']))
            .count(),
        mass: MASS.find_iter(&t).count(),
        time: TIME.find_iter(&t).count(),
        area: AREA.find_iter(&t).count(),
        volume: VOLUME.find_iter(&t).count(),
    }
}

pub fn has_graph_cues(text: &str) -> bool {
    GRAPH.is_match(&text.to_lowercase())
}

pub fn has_formula_cues(text: &str) -> bool {
    FORMULA.is_match(&text.to_lowercase())
}

pub fn has_probability_cues(text: &str) -> bool {
    PROBABILITY.is_match(&text.to_lowercase())
}

pub fn has_optimization_cues(text: &str) -> bool {
    OPTIMIZATION.is_match(&text.to_lowercase())
}

/// Rough count of algebra-variable-like tokens: one letter, optionally one digit (`x`, `a1`).
pub fn count_vars(text: &str) -> usize {
    VAR_TOKEN.find_iter(&text.to_lowercase()).count()
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct Detections {
    pub units: UnitCounts,
    pub graph: bool,
    pub formula: bool,
    pub probability: bool,
    pub optimization: bool,
    pub vars_count: usize,
    pub tokens: Vec<String>,
}

pub fn detect_all(text: &str) -> Detections {
    Detections {
        units: has_units(text),
        graph: has_graph_cues(text),
        formula: has_formula_cues(text),
        probability: has_probability_cues(text),
        optimization: has_optimization_cues(text),
        vars_count: count_vars(text),
        tokens: stem_tokens(text),
    }
}
