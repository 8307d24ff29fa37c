//! Raw -> labeled / review curation.
//!
//! Safe to re-run: an unchanged raw corpus produces only `skipped` (labeled) and review
//! overwrites on the second pass.

use crate::classify::{Classifier, Label};
use crate::extract;
use crate::relabel::MANUAL_HIT;
use crate::sanitize;
use crate::store::{self, CorpusLayout};
use crate::taxonomy::Taxonomy;
use chrono::{DateTime, FixedOffset};
use fipibank_core::{
    Error, Identity, LabeledRecord, RawRecord, RecordBody, Result, ReviewRecord, ReviewStatus,
    Sanitizer, Validation, UNKNOWN_SUBTOPIC,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CurateSummary {
    pub files: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub review: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Created(PathBuf),
    Updated(PathBuf),
    Skipped(PathBuf),
    Review(PathBuf),
}

fn parse_ts(s: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(s.trim()).ok()
}

/// Combine a stored labeled record with a freshly curated one.
///
/// Content comes from `incoming`. Provenance (`accessedAt`, `sourceUrl`) records the earliest
/// observation; `existing` wins ties and unparsable timestamps. Unknown on-disk fields are kept,
/// and so is the stored identity when the incoming one is synthetic.
pub fn merge(existing: &LabeledRecord, incoming: LabeledRecord) -> LabeledRecord {
    let mut merged = incoming;
    merged.extra = existing.extra.clone();

    let incoming_is_older = match (
        parse_ts(&existing.body.accessed_at),
        parse_ts(&merged.body.accessed_at),
    ) {
        (Some(old), Some(new)) => new < old,
        _ => false,
    };
    if !incoming_is_older {
        merged.body.accessed_at = existing.body.accessed_at.clone();
        merged.body.source_url = existing.body.source_url.clone();
    }

    // A synthetic id is derived from markup and may drift between crawls; never let it
    // replace the identity already on disk.
    if let (Some(kept), Some(Identity::Synthetic { .. }) | None) =
        (existing.body.identity(), merged.body.identity())
    {
        merged.body.set_identity(&kept);
    }
    merged
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Match {
    Id,
    Content,
}

/// Two stable ids are the same record only when the ids agree; otherwise equal checksums are.
fn record_match(stored: &RecordBody, incoming: &RecordBody) -> Option<Match> {
    match (stored.identity(), incoming.identity()) {
        (Some(Identity::Stable { id: a, .. }), Some(Identity::Stable { id: b, .. })) => {
            (a == b).then_some(Match::Id)
        }
        _ => (!incoming.checksum.is_empty() && stored.checksum == incoming.checksum)
            .then_some(Match::Content),
    }
}

fn read_labeled(dir: &Path) -> Vec<(PathBuf, LabeledRecord)> {
    store::list_json_files(dir)
        .into_iter()
        .filter_map(|p| match store::read_json::<LabeledRecord>(&p) {
            Ok(r) => Some((p, r)),
            Err(e) => {
                warn!(path = %p.display(), error = %e, "ignoring unreadable labeled file");
                None
            }
        })
        .collect()
}

/// Id match first, then content match.
fn find_in(dir: &Path, body: &RecordBody) -> Option<(PathBuf, LabeledRecord)> {
    let stored = read_labeled(dir);
    let pos = |want: Match| {
        stored
            .iter()
            .position(|(_, r)| record_match(&r.body, body) == Some(want))
    };
    let i = pos(Match::Id).or_else(|| pos(Match::Content))?;
    stored.into_iter().nth(i)
}

pub struct Curator<'a> {
    layout: &'a CorpusLayout,
    taxonomy: &'a Taxonomy,
    classifier: Classifier<'a>,
    sanitizer: &'a dyn Sanitizer,
}

impl<'a> Curator<'a> {
    pub fn new(
        layout: &'a CorpusLayout,
        taxonomy: &'a Taxonomy,
        classifier: Classifier<'a>,
        sanitizer: &'a dyn Sanitizer,
    ) -> Self {
        Self {
            layout,
            taxonomy,
            classifier,
            sanitizer,
        }
    }

    /// Curate every raw file for the taxonomy's exam/level, in path order, at most `limit`.
    pub fn curate(&self, limit: Option<usize>) -> CurateSummary {
        let raw_dir = self.layout.raw_dir(self.taxonomy.exam, self.taxonomy.level);
        let files = store::list_json_files(&raw_dir);
        let files = files.into_iter().take(limit.unwrap_or(usize::MAX));

        let mut summary = CurateSummary::default();
        for path in files {
            summary.files += 1;
            match self.curate_file(&path) {
                Ok(Outcome::Created(p)) => {
                    info!(path = %p.display(), "created labeled");
                    summary.created += 1;
                }
                Ok(Outcome::Updated(p)) => {
                    info!(path = %p.display(), "updated labeled");
                    summary.updated += 1;
                }
                Ok(Outcome::Skipped(p)) => {
                    debug!(path = %p.display(), "unchanged");
                    summary.skipped += 1;
                }
                Ok(Outcome::Review(p)) => {
                    info!(path = %p.display(), "saved for review");
                    summary.review += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "curate failed");
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    pub fn curate_file(&self, path: &Path) -> Result<Outcome> {
        let raw: RawRecord = store::read_json(path)?;
        self.curate_record(raw)
    }

    pub fn curate_record(&self, raw: RawRecord) -> Result<Outcome> {
        let statement_html = sanitize::sanitize_or_fallback(self.sanitizer, &raw.body.statement_html);
        let text = raw
            .body
            .statement_text
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| extract::html_to_text(&statement_html));
        if statement_html.trim().is_empty() && text.is_empty() {
            return Err(Error::InvalidRecord("empty statement".to_string()));
        }

        let checksum = store::checksum(&statement_html, &raw.body.asset_urls);
        let body = RecordBody {
            statement_html,
            statement_text: Some(text.clone()),
            checksum,
            ..raw.body.clone()
        };

        match self.classifier.classify(&text) {
            Some(label)
                if !label.is_task_guess() && self.taxonomy.contains(label.task_no, &label.subtopic) =>
            {
                let outcome = self.write_labeled(body.clone(), label)?;
                self.drop_stale_review(&body, raw.task_no);
                Ok(outcome)
            }
            guess => {
                // Already labeled (usually by hand): leave it alone and keep review drained.
                if let Some((path, _)) = find_in(&self.labeled_root(), &body) {
                    self.drop_stale_review(&body, raw.task_no);
                    return Ok(Outcome::Skipped(path));
                }
                let task_no = guess
                    .filter(Label::is_task_guess)
                    .map(|l| l.task_no)
                    .or(raw.task_no)
                    .unwrap_or(0);
                self.write_review(body, task_no)
            }
        }
    }

    fn write_labeled(&self, body: RecordBody, label: Label) -> Result<Outcome> {
        let exam = self.taxonomy.exam;
        let level = self.taxonomy.level;
        let cell = self
            .taxonomy
            .cell(label.task_no, &label.subtopic)
            .ok_or_else(|| Error::Taxonomy(format!("{}/{}", label.task_no, label.subtopic)))?;
        let incoming = LabeledRecord {
            exam,
            level,
            task_no: cell.task_no,
            subtopic: cell.subtopic.clone(),
            title: cell.record_title(),
            body,
            validation: Validation {
                confidence: label.confidence,
                hits: label.hits,
            },
            extra: BTreeMap::new(),
        };

        let dir = self.layout.cell_dir(exam, level, cell.task_no, &cell.subtopic);
        if let Some((path, existing)) = find_in(&dir, &incoming.body) {
            let merged = merge(&existing, incoming);
            if merged == existing {
                return Ok(Outcome::Skipped(path));
            }
            store::write_json_pretty(&path, &merged)?;
            return Ok(Outcome::Updated(path));
        }

        // Not in this cell; it may sit in another one from an earlier label.
        if let Some((old, existing)) = find_in(&self.labeled_root(), &incoming.body) {
            if existing.validation.hits.iter().any(|h| h == MANUAL_HIT) {
                return Ok(Outcome::Skipped(old));
            }
            let merged = merge(&existing, incoming);
            let path = self.new_labeled_path(&dir, &merged);
            store::write_json_pretty(&path, &merged)?;
            std::fs::remove_file(&old).map_err(|e| Error::io(old.display(), e))?;
            info!(from = %old.display(), to = %path.display(), "moved to its new cell");
            return Ok(Outcome::Updated(path));
        }

        let path = self.new_labeled_path(&dir, &incoming);
        store::write_json_pretty(&path, &incoming)?;
        Ok(Outcome::Created(path))
    }

    fn labeled_root(&self) -> PathBuf {
        self.layout.labeled_dir(self.taxonomy.exam, self.taxonomy.level)
    }

    fn new_labeled_path(&self, dir: &Path, rec: &LabeledRecord) -> PathBuf {
        let id = rec
            .body
            .identity()
            .filter(|i| !i.is_synthetic())
            .map(|i| i.id().to_string());
        store::free_labeled_path(dir, &rec.title, &rec.body.checksum, id.as_deref())
    }

    fn review_key(body: &RecordBody) -> String {
        body.identity()
            .map(|i| i.id().to_string())
            .unwrap_or_else(|| body.checksum[..16].to_string())
    }

    fn write_review(&self, body: RecordBody, task_no: u32) -> Result<Outcome> {
        let exam = self.taxonomy.exam;
        let level = self.taxonomy.level;
        let path = self
            .layout
            .review_file(exam, level, task_no, &Self::review_key(&body));
        let record = ReviewRecord {
            status: ReviewStatus::NeedsReview,
            exam,
            level,
            task_no,
            subtopic: UNKNOWN_SUBTOPIC.to_string(),
            body,
        };
        store::write_json_pretty(&path, &record)?;
        Ok(Outcome::Review(path))
    }

    /// A record that is now labeled no longer needs review.
    fn drop_stale_review(&self, body: &RecordBody, raw_task: Option<u32>) {
        let key = Self::review_key(body);
        let mut tasks = vec![0];
        tasks.extend(raw_task);
        tasks.extend(self.taxonomy.task_numbers());
        tasks.sort_unstable();
        tasks.dedup();
        for t in tasks {
            let p = self
                .layout
                .review_file(self.taxonomy.exam, self.taxonomy.level, t, &key);
            if p.exists() {
                match std::fs::remove_file(&p) {
                    Ok(()) => info!(path = %p.display(), "removed stale review file"),
                    Err(e) => warn!(path = %p.display(), error = %e, "could not remove stale review file"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ClassifierConfig;
    use crate::sanitize::RegexFallbackSanitizer;
    use fipibank_core::{ExamId, IdMethod, Level};

    fn raw(id: Option<&str>, html: &str, accessed_at: &str) -> RawRecord {
        let mut body = RecordBody {
            statement_html: html.to_string(),
            source_url: format!("https://bank.test/{accessed_at}"),
            accessed_at: accessed_at.to_string(),
            ..RecordBody::default()
        };
        if let Some(id) = id {
            body.set_identity(&Identity::Stable {
                id: id.to_string(),
                method: IdMethod::Attr,
            });
        }
        RawRecord {
            exam: Some(ExamId::Ege),
            level: Some(Level::Basic),
            task_no: Some(1),
            body,
        }
    }

    fn with_curator<T>(f: impl FnOnce(&Curator, &CorpusLayout) -> T) -> T {
        let tmp = tempfile::tempdir().unwrap();
        let layout = CorpusLayout::new(tmp.path());
        let taxonomy = Taxonomy::embedded(ExamId::Ege, Level::Basic).unwrap();
        let classifier = Classifier::new(&taxonomy, ClassifierConfig::default());
        let sanitizer = RegexFallbackSanitizer;
        let curator = Curator::new(&layout, &taxonomy, classifier, &sanitizer);
        f(&curator, &layout)
    }

    #[test]
    fn rounding_card_lands_in_its_cell() {
        with_curator(|c, layout| {
            let out = c
                .curate_record(raw(Some("AB12"), "<p>Округлите 12.345 до десятых</p>", "2024-01-01T00:00:00Z"))
                .unwrap();
            let path = match out {
                Outcome::Created(p) => p,
                other => panic!("expected create, got {other:?}"),
            };
            assert!(path.starts_with(layout.cell_dir(ExamId::Ege, Level::Basic, 1, "okruglenie-do-razryada")));
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            assert!(name.starts_with("zadanie-1-okruglenie-do-zadannogo-razryada-"), "{name}");
            let rec: LabeledRecord = store::read_json(&path).unwrap();
            assert!(rec.validation.confidence >= 0.55);
            assert_eq!(rec.body.fipi_id.as_deref(), Some("AB12"));
        });
    }

    #[test]
    fn earliest_observation_wins_in_either_order() {
        for order in [[0usize, 1], [1, 0]] {
            with_curator(|c, layout| {
                let recs = [
                    raw(Some("AB12"), "<p>Округлите 12.345 до десятых</p>", "2024-01-01T00:00:00Z"),
                    raw(Some("AB12"), "<p>Округлите 12.345 до десятых</p>", "2024-06-01T00:00:00Z"),
                ];
                for i in order {
                    c.curate_record(recs[i].clone()).unwrap();
                }
                let dir = layout.cell_dir(ExamId::Ege, Level::Basic, 1, "okruglenie-do-razryada");
                let files = store::list_json_files(&dir);
                assert_eq!(files.len(), 1);
                let rec: LabeledRecord = store::read_json(&files[0]).unwrap();
                assert_eq!(rec.body.accessed_at, "2024-01-01T00:00:00Z");
                assert_eq!(rec.body.source_url, "https://bank.test/2024-01-01T00:00:00Z");
            });
        }
    }

    #[test]
    fn synthetic_duplicates_merge_on_checksum() {
        with_curator(|c, layout| {
            let mut a = raw(None, "<p>Округлите 7.77 до целых</p>", "2024-01-01T00:00:00Z");
            a.body.set_identity(&Identity::Synthetic {
                id: "SYN-AAAAAAAAAAAA".to_string(),
            });
            let mut b = a.clone();
            b.body.set_identity(&Identity::Synthetic {
                id: "SYN-BBBBBBBBBBBB".to_string(),
            });
            assert!(matches!(c.curate_record(a).unwrap(), Outcome::Created(_)));
            assert!(matches!(c.curate_record(b).unwrap(), Outcome::Skipped(_)));
            let dir = layout.cell_dir(ExamId::Ege, Level::Basic, 1, "okruglenie-do-razryada");
            let files = store::list_json_files(&dir);
            assert_eq!(files.len(), 1);
            let rec: LabeledRecord = store::read_json(&files[0]).unwrap();
            assert_eq!(rec.body.fipi_id.as_deref(), Some("SYN-AAAAAAAAAAAA"));
        });
    }

    #[test]
    fn unrecognized_text_goes_to_review_then_promotion_removes_it() {
        with_curator(|c, layout| {
            let out = c
                .curate_record(raw(Some("CD34"), "<p>Прочитайте текст и ответьте на вопрос</p>", "2024-01-01T00:00:00Z"))
                .unwrap();
            let review = layout.review_file(ExamId::Ege, Level::Basic, 1, "CD34");
            assert_eq!(out, Outcome::Review(review.clone()));
            let v: serde_json::Value = store::read_json(&review).unwrap();
            assert_eq!(v["status"], "needs_review");
            assert_eq!(v["subtopic"], "unknown");

            // Same id, now with text the classifier understands.
            c.curate_record(raw(Some("CD34"), "<p>Округлите 3.14159 до сотых</p>", "2024-01-02T00:00:00Z"))
                .unwrap();
            assert!(!review.exists());
        });
    }

    fn put_raw(layout: &CorpusLayout, page: u32, rec: &RawRecord) {
        let id = rec.body.fipi_id.clone().unwrap();
        let p = layout.raw_file(ExamId::Ege, Level::Basic, 1, page, &id);
        store::write_json_pretty(&p, rec).unwrap();
    }

    #[test]
    fn distinct_ids_with_identical_markup_stay_separate() {
        with_curator(|c, layout| {
            let html = "<p>Округлите 12.345 до десятых</p>";
            put_raw(layout, 1, &raw(Some("AAAA1"), html, "2024-01-01T00:00:00Z"));
            put_raw(layout, 1, &raw(Some("BBBB2"), html, "2024-01-01T00:00:00Z"));

            let first = c.curate(None);
            assert_eq!((first.created, first.updated), (2, 0));
            for _ in 0..2 {
                let again = c.curate(None);
                assert_eq!((again.created, again.updated, again.skipped), (0, 0, 2));
            }

            let dir = layout.cell_dir(ExamId::Ege, Level::Basic, 1, "okruglenie-do-razryada");
            let mut ids: Vec<String> = store::list_json_files(&dir)
                .iter()
                .map(|p| store::read_json::<LabeledRecord>(p).unwrap().body.fipi_id.unwrap())
                .collect();
            ids.sort();
            assert_eq!(ids, ["AAAA1", "BBBB2"]);
        });
    }

    #[test]
    fn hand_promoted_record_stays_out_of_review() {
        with_curator(|c, layout| {
            put_raw(
                layout,
                1,
                &raw(Some("CD34"), "<p>Прочитайте текст и ответьте на вопрос</p>", "2024-01-01T00:00:00Z"),
            );
            assert_eq!(c.curate(None).review, 1);

            let review = layout.review_file(ExamId::Ege, Level::Basic, 1, "CD34");
            let tax = Taxonomy::embedded(ExamId::Ege, Level::Basic).unwrap();
            let moved =
                crate::relabel::relabel(layout, &tax, &review, 1, "okruglenie-do-razryada").unwrap();

            let again = c.curate(None);
            assert_eq!(again.review, 0);
            assert_eq!(again.skipped, 1);
            assert!(!review.exists());
            let rec: LabeledRecord = store::read_json(&moved.to).unwrap();
            assert_eq!(rec.validation.hits, [MANUAL_HIT]);
        });
    }

    #[test]
    fn new_label_moves_the_record_to_its_new_cell() {
        with_curator(|c, layout| {
            let old = match c
                .curate_record(raw(Some("EF56"), "<p>Округлите 12.345 до десятых</p>", "2024-01-01T00:00:00Z"))
                .unwrap()
            {
                Outcome::Created(p) => p,
                other => panic!("expected create, got {other:?}"),
            };
            let coin = "<p>В случайном эксперименте бросают монету. Найдите вероятность того, что выпадет орёл.</p>";
            let new = match c.curate_record(raw(Some("EF56"), coin, "2024-02-01T00:00:00Z")).unwrap() {
                Outcome::Updated(p) => p,
                other => panic!("expected update, got {other:?}"),
            };

            assert!(!old.exists());
            let root = layout.labeled_dir(ExamId::Ege, Level::Basic);
            assert!(new.starts_with(root.join("5")), "{}", new.display());
            assert_eq!(store::list_json_files(&root), [new.clone()]);
            let rec: LabeledRecord = store::read_json(&new).unwrap();
            assert_eq!(rec.task_no, 5);
            assert_eq!(rec.body.accessed_at, "2024-01-01T00:00:00Z");
        });
    }

    #[test]
    fn merge_keeps_unknown_fields_and_stable_identity() {
        let base = LabeledRecord {
            exam: ExamId::Ege,
            level: Level::Basic,
            task_no: 1,
            subtopic: "okruglenie-do-razryada".to_string(),
            title: "t".to_string(),
            body: RecordBody {
                accessed_at: "not a date".to_string(),
                ..RecordBody::default()
            },
            validation: Validation {
                confidence: 1.0,
                hits: vec![],
            },
            extra: BTreeMap::from([("note".to_string(), serde_json::json!("keep"))]),
        };
        let mut existing = base.clone();
        existing.body.set_identity(&Identity::Stable {
            id: "AB12".to_string(),
            method: IdMethod::Text,
        });
        let mut incoming = base;
        incoming.extra.clear();
        incoming.body.accessed_at = "2020-01-01T00:00:00Z".to_string();
        incoming.body.set_identity(&Identity::Synthetic {
            id: "SYN-000000000000".to_string(),
        });

        let merged = merge(&existing, incoming);
        assert_eq!(merged.extra.get("note"), Some(&serde_json::json!("keep")));
        // Unparsable stored timestamp: stored provenance wins.
        assert_eq!(merged.body.accessed_at, "not a date");
        assert_eq!(merged.body.fipi_id.as_deref(), Some("AB12"));
    }

    #[test]
    fn corrupt_raw_file_is_counted_and_batch_continues() {
        with_curator(|c, layout| {
            let dir = layout.raw_page_dir(ExamId::Ege, Level::Basic, 1, 1);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("A.json"), "{broken").unwrap();
            store::write_json_pretty(
                &dir.join("B.json"),
                &raw(Some("AB12"), "<p>Округлите 12.345 до десятых</p>", "2024-01-01T00:00:00Z"),
            )
            .unwrap();
            let s = c.curate(None);
            assert_eq!(s.files, 2);
            assert_eq!(s.failed, 1);
            assert_eq!(s.created, 1);
        });
    }
}
