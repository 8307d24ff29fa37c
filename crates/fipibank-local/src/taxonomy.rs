//! The fixed (task number, subtopic) grid records are classified into.
//!
//! A `Taxonomy` is built once at startup and handed by reference to the classifier, curation,
//! coverage and relabel code. Cells iterate in task-number order, then subtopic-slug order;
//! classifier tie-breaking relies on this order.

use crate::textprep;
use fipibank_core::{Error, ExamId, Level, Result, UNKNOWN_SUBTOPIC};
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

/// Slugs become path segments and CSV fields.
static SLUG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+(?:-[a-z0-9]+)*$").expect("valid regex"));

const EGE_BASIC_JSON: &str = include_str!("../taxonomy/ege-basic.json");

#[derive(Debug, Deserialize)]
struct TaskFile {
    title: String,
    subtopics: BTreeMap<String, SubtopicFile>,
}

#[derive(Debug, Deserialize)]
struct SubtopicFile {
    title: String,
    #[serde(default)]
    rules: Vec<String>,
    #[serde(default)]
    keywords: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub pattern: String,
    pub regex: Regex,
}

#[derive(Debug, Clone)]
pub struct Keyword {
    pub word: String,
    pub stem: String,
}

#[derive(Debug, Clone)]
pub struct Cell {
    pub task_no: u32,
    pub subtopic: String,
    pub task_title: String,
    pub subtopic_title: String,
    pub rules: Vec<Rule>,
    pub keywords: Vec<Keyword>,
}

impl Cell {
    /// Human title stored on labeled records, e.g. `Задание 1. Округление до заданного разряда`.
    pub fn record_title(&self) -> String {
        format!("Задание {}. {}", self.task_no, self.subtopic_title)
    }
}

#[derive(Debug, Clone)]
pub struct Taxonomy {
    pub exam: ExamId,
    pub level: Level,
    cells: Vec<Cell>,
}

/// Case-insensitive regex; a pattern that does not compile is matched as a literal.
fn compile_rule(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .or_else(|_| {
            tracing::debug!(pattern, "rule is not a valid regex; matching it literally");
            RegexBuilder::new(&regex::escape(pattern))
                .case_insensitive(true)
                .build()
        })
        .map_err(|e| Error::Taxonomy(format!("rule {pattern:?}: {e}")))
}

impl Taxonomy {
    pub fn from_json(exam: ExamId, level: Level, json: &str) -> Result<Self> {
        let tasks: BTreeMap<u32, TaskFile> =
            serde_json::from_str(json).map_err(|e| Error::Taxonomy(e.to_string()))?;
        if tasks.is_empty() {
            return Err(Error::Taxonomy("taxonomy has no tasks".to_string()));
        }
        let mut cells = Vec::new();
        for (task_no, task) in tasks {
            if task_no == 0 {
                return Err(Error::Taxonomy("task number 0 is reserved".to_string()));
            }
            for (slug, sub) in task.subtopics {
                if !SLUG.is_match(&slug) || slug == UNKNOWN_SUBTOPIC {
                    return Err(Error::Taxonomy(format!(
                        "task {task_no}: invalid subtopic slug {slug:?}"
                    )));
                }
                if sub.rules.is_empty() && sub.keywords.is_empty() {
                    return Err(Error::Taxonomy(format!(
                        "task {task_no}/{slug}: needs at least one rule or keyword"
                    )));
                }
                let rules = sub
                    .rules
                    .iter()
                    .map(|p| {
                        Ok(Rule {
                            pattern: p.clone(),
                            regex: compile_rule(p)?,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                let keywords = sub
                    .keywords
                    .iter()
                    .filter_map(|w| {
                        let stem = textprep::stem_tokens(w).into_iter().next()?;
                        Some(Keyword {
                            word: w.clone(),
                            stem,
                        })
                    })
                    .collect();
                cells.push(Cell {
                    task_no,
                    subtopic: slug,
                    task_title: task.title.clone(),
                    subtopic_title: sub.title,
                    rules,
                    keywords,
                });
            }
        }
        Ok(Self { exam, level, cells })
    }

    pub fn load(exam: ExamId, level: Level, path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| Error::io(path.display(), e))?;
        Self::from_json(exam, level, &json)
    }

    /// The taxonomy compiled into the binary. Only EGE basic ships one.
    pub fn embedded(exam: ExamId, level: Level) -> Result<Self> {
        match (exam, level) {
            (ExamId::Ege, Level::Basic) => Self::from_json(exam, level, EGE_BASIC_JSON),
            _ => Err(Error::NotConfigured(format!(
                "no built-in taxonomy for {exam}/{level}; pass --taxonomy"
            ))),
        }
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn cell(&self, task_no: u32, subtopic: &str) -> Option<&Cell> {
        self.cells
            .iter()
            .find(|c| c.task_no == task_no && c.subtopic == subtopic)
    }

    pub fn contains(&self, task_no: u32, subtopic: &str) -> bool {
        self.cell(task_no, subtopic).is_some()
    }

    /// Distinct task numbers, ascending.
    pub fn task_numbers(&self) -> Vec<u32> {
        let mut out: Vec<u32> = self.cells.iter().map(|c| c.task_no).collect();
        out.dedup();
        out
    }

    pub fn task_title(&self, task_no: u32) -> Option<&str> {
        self.cells
            .iter()
            .find(|c| c.task_no == task_no)
            .map(|c| c.task_title.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_ege_basic_loads_in_numeric_order() {
        let t = Taxonomy::embedded(ExamId::Ege, Level::Basic).unwrap();
        let tasks = t.task_numbers();
        assert_eq!(tasks.first(), Some(&1));
        assert!(tasks.windows(2).all(|w| w[0] < w[1]));
        assert!(tasks.contains(&10) && tasks.contains(&11));
        assert!(t.contains(1, "okruglenie-do-razryada"));
        assert!(!t.contains(1, "unknown"));
        assert_eq!(
            t.cell(1, "okruglenie-do-razryada").unwrap().record_title(),
            "Задание 1. Округление до заданного разряда"
        );
    }

    #[test]
    fn embedded_is_only_for_ege_basic() {
        let err = Taxonomy::embedded(ExamId::Oge, Level::Basic).unwrap_err();
        assert!(matches!(err, Error::NotConfigured(_)));
    }

    #[test]
    fn invalid_pattern_becomes_literal() {
        let t = Taxonomy::from_json(
            ExamId::Ege,
            Level::Basic,
            r#"{"1": {"title": "T", "subtopics": {"a": {"title": "A", "rules": ["(("]}}}}"#,
        )
        .unwrap();
        let rule = &t.cells()[0].rules[0];
        assert!(rule.regex.is_match("x (( y"));
        assert!(!rule.regex.is_match("x ( y"));
    }

    #[test]
    fn rejects_reserved_and_empty_cells() {
        for bad in [
            r#"{}"#,
            r#"{"0": {"title": "T", "subtopics": {"a": {"title": "A", "rules": ["x"]}}}}"#,
            r#"{"1": {"title": "T", "subtopics": {"unknown": {"title": "A", "rules": ["x"]}}}}"#,
            r#"{"1": {"title": "T", "subtopics": {"a": {"title": "A"}}}}"#,
            r#"{"1": {"title": "T", "subtopics": {"a,b": {"title": "A", "rules": ["x"]}}}}"#,
            r#"{"1": {"title": "T", "subtopics": {"a/b": {"title": "A", "rules": ["x"]}}}}"#,
            r#"{"1": {"title": "T", "subtopics": {"Объём": {"title": "A", "rules": ["x"]}}}}"#,
            r#"{"1": {"title": "T", "subtopics": {"": {"title": "A", "rules": ["x"]}}}}"#,
        ] {
            assert!(
                matches!(
                    Taxonomy::from_json(ExamId::Ege, Level::Basic, bad),
                    Err(Error::Taxonomy(_))
                ),
                "{bad}"
            );
        }
    }

    #[test]
    fn keywords_are_stemmed_at_load() {
        let t = Taxonomy::embedded(ExamId::Ege, Level::Basic).unwrap();
        let cell = t.cell(1, "okruglenie-do-razryada").unwrap();
        assert_eq!(cell.keywords[0].stem, textprep::stem_word("округлите"));
    }
}
