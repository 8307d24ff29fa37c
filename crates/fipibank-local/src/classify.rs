//! Blended keyword + heuristic classifier over the taxonomy grid.
//!
//! For each cell:
//! - `keyword_score`: number of the cell's rules (regex over normalized text) and keywords
//!   (stem match) that hit, each counted once;
//! - `heuristic_score`: from a fixed per-task table over the text detectors;
//! - `confidence = min(1, (kw_weight * keyword_score + heuristic_weight * heuristic_score) / normalizer)`.
//!
//! The best cell wins on confidence, then on hit count, then on taxonomy order.

use crate::taxonomy::{Cell, Taxonomy};
use crate::textprep::{self, Detections};
use fipibank_core::{Error, Result, UNKNOWN_SUBTOPIC};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub kw_weight: f64,
    pub heuristic_weight: f64,
    pub normalizer: f64,
    /// Minimum confidence for a label to be accepted.
    pub threshold: f64,
    /// Minimum per-task heuristic score for a task-only guess when nothing is confident.
    pub fallback_bar: f64,
    pub fallback_confidence: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            kw_weight: 0.7,
            heuristic_weight: 0.3,
            normalizer: 2.0,
            threshold: 0.55,
            fallback_bar: 2.0,
            fallback_confidence: 0.5,
        }
    }
}

impl ClassifierConfig {
    pub fn validate(&self) -> Result<()> {
        let finite = [
            self.kw_weight,
            self.heuristic_weight,
            self.normalizer,
            self.threshold,
            self.fallback_bar,
            self.fallback_confidence,
        ]
        .iter()
        .all(|v| v.is_finite());
        if !finite {
            return Err(Error::NotConfigured("classifier settings must be finite".to_string()));
        }
        if self.normalizer <= 0.0 {
            return Err(Error::NotConfigured("normalizer must be > 0".to_string()));
        }
        if self.kw_weight < 0.0 || self.heuristic_weight < 0.0 {
            return Err(Error::NotConfigured("weights must be >= 0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.threshold) || !(0.0..=1.0).contains(&self.fallback_confidence)
        {
            return Err(Error::NotConfigured(
                "threshold and fallback confidence must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Label {
    pub task_no: u32,
    pub subtopic: String,
    pub confidence: f64,
    pub hits: Vec<String>,
}

impl Label {
    /// A task-only guess: the task number is plausible but no subtopic is.
    pub fn is_task_guess(&self) -> bool {
        self.subtopic == UNKNOWN_SUBTOPIC
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CellScore {
    pub task_no: u32,
    pub subtopic: String,
    pub keyword_score: f64,
    pub heuristic_score: f64,
    pub confidence: f64,
    pub hits: Vec<String>,
}

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("valid regex")
}

static DECIMAL: LazyLock<Regex> = LazyLock::new(|| re(r"\d+[.,]\d+"));
static ROUNDING: LazyLock<Regex> = LazyLock::new(|| re(r"округл"));
static CONVERT: LazyLock<Regex> = LazyLock::new(|| re(r"(?:переведите|выразите)"));
static EXTREMES: LazyLock<Regex> = LazyLock::new(|| re(r"(?:наибольш|наименьш)"));
static MONEY: LazyLock<Regex> = LazyLock::new(|| re(r"(?:\bруб|рубл)"));
static DERIVATIVE: LazyLock<Regex> = LazyLock::new(|| re(r"(?:производн|касательн)"));
static STATEMENTS: LazyLock<Regex> = LazyLock::new(|| re(r"утверждени"));
static GRID: LazyLock<Regex> = LazyLock::new(|| re(r"(?:клетк|\bплан)"));
static HEIGHT: LazyLock<Regex> = LazyLock::new(|| re(r"(?:высот|расстояни)"));
static VOLUME_WORD: LazyLock<Regex> = LazyLock::new(|| re(r"объ[её]м"));

fn flag(b: bool, w: f64) -> f64 {
    if b {
        w
    } else {
        0.0
    }
}

/// Fixed per-task heuristics over detector output and the lower-cased raw text.
pub fn heuristic_score(task_no: u32, d: &Detections, t: &str) -> f64 {
    match task_no {
        1 => flag(ROUNDING.is_match(t), 2.0) + flag(DECIMAL.is_match(t), 1.0),
        2 => {
            flag(d.units.total() >= 1, 1.0)
                + flag(d.units.total() >= 2, 1.0)
                + flag(CONVERT.is_match(t), 1.0)
        }
        3 => flag(d.graph, 2.0) + flag(EXTREMES.is_match(t), 1.0),
        4 => flag(d.formula, 2.0) + flag(d.vars_count >= 2, 1.0),
        5 => flag(d.probability, 3.0),
        6 => flag(d.optimization, 2.0) + flag(MONEY.is_match(t), 1.0),
        7 => flag(DERIVATIVE.is_match(t), 2.0) + flag(d.graph, 1.0),
        8 => flag(STATEMENTS.is_match(t), 2.0),
        9 => flag(d.units.area > 0, 2.0) + flag(GRID.is_match(t), 1.0),
        10 => flag(d.units.length > 0, 1.0) + flag(HEIGHT.is_match(t), 1.0),
        11 => flag(d.units.volume > 0, 2.0) + flag(VOLUME_WORD.is_match(t), 1.0),
        _ => 0.0,
    }
}

pub struct Classifier<'a> {
    taxonomy: &'a Taxonomy,
    config: ClassifierConfig,
}

struct Prepared {
    normalized: String,
    stems: HashSet<String>,
    heuristics: BTreeMap<u32, f64>,
}

impl<'a> Classifier<'a> {
    pub fn new(taxonomy: &'a Taxonomy, config: ClassifierConfig) -> Self {
        Self { taxonomy, config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    fn prepare(&self, text: &str) -> Prepared {
        let lower = text.to_lowercase();
        let detections = textprep::detect_all(text);
        let heuristics = self
            .taxonomy
            .task_numbers()
            .into_iter()
            .map(|n| (n, heuristic_score(n, &detections, &lower)))
            .collect();
        Prepared {
            normalized: textprep::normalize(text),
            stems: detections.tokens.into_iter().collect(),
            heuristics,
        }
    }

    fn score_cell(&self, cell: &Cell, p: &Prepared) -> CellScore {
        let mut hits: Vec<String> = Vec::new();
        for rule in &cell.rules {
            if rule.regex.is_match(&p.normalized) && !hits.contains(&rule.pattern) {
                hits.push(rule.pattern.clone());
            }
        }
        for kw in &cell.keywords {
            if p.stems.contains(&kw.stem) && !hits.contains(&kw.word) {
                hits.push(kw.word.clone());
            }
        }
        let keyword_score = hits.len() as f64;
        let heuristic_score = p.heuristics.get(&cell.task_no).copied().unwrap_or(0.0);
        let score =
            self.config.kw_weight * keyword_score + self.config.heuristic_weight * heuristic_score;
        let normalizer = if self.config.normalizer > 0.0 {
            self.config.normalizer
        } else {
            1.0
        };
        CellScore {
            task_no: cell.task_no,
            subtopic: cell.subtopic.clone(),
            keyword_score,
            heuristic_score,
            confidence: (score / normalizer).clamp(0.0, 1.0),
            hits,
        }
    }

    /// Every cell with a positive score, best first (same order `classify` uses).
    pub fn explain(&self, text: &str) -> Vec<CellScore> {
        let p = self.prepare(text);
        let mut scored: Vec<CellScore> = self
            .taxonomy
            .cells()
            .iter()
            .map(|c| self.score_cell(c, &p))
            .filter(|s| s.confidence > 0.0)
            .collect();
        // Stable sort keeps taxonomy order for full ties.
        scored.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| b.hits.len().cmp(&a.hits.len()))
        });
        scored
    }

    pub fn classify(&self, text: &str) -> Option<Label> {
        let p = self.prepare(text);

        let mut best: Option<CellScore> = None;
        for cell in self.taxonomy.cells() {
            let s = self.score_cell(cell, &p);
            if s.confidence <= 0.0 {
                continue;
            }
            let better = match &best {
                None => true,
                Some(b) => {
                    s.confidence > b.confidence
                        || (s.confidence == b.confidence && s.hits.len() > b.hits.len())
                }
            };
            if better {
                best = Some(s);
            }
        }

        if let Some(b) = best.filter(|b| b.confidence >= self.config.threshold) {
            return Some(Label {
                task_no: b.task_no,
                subtopic: b.subtopic,
                confidence: b.confidence,
                hits: b.hits,
            });
        }

        // Task-only guess: highest heuristic, lowest task number on ties.
        let (task_no, h) = p
            .heuristics
            .iter()
            .fold(None::<(u32, f64)>, |acc, (&n, &h)| match acc {
                Some((_, bh)) if bh >= h => acc,
                _ => Some((n, h)),
            })?;
        (h >= self.config.fallback_bar && h > 0.0).then(|| Label {
            task_no,
            subtopic: UNKNOWN_SUBTOPIC.to_string(),
            confidence: self.config.fallback_confidence,
            hits: Vec::new(),
        })
    }
}
