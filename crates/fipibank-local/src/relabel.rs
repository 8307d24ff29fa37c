//! Manual relabeling: move a record (usually from review) into a taxonomy cell.

use crate::store::{self, CorpusLayout};
use crate::taxonomy::Taxonomy;
use fipibank_core::{Error, LabeledRecord, Result, Validation};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::info;

pub const MANUAL_HIT: &str = "manual";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Relabeled {
    pub from: PathBuf,
    pub to: PathBuf,
    pub task_no: u32,
    pub subtopic: String,
}

/// Rewrite `from` as a labeled record of `(task_no, subtopic)` and remove the source file.
///
/// Unknown fields survive; `status` is dropped and validation becomes `{1.0, ["manual"]}`.
pub fn relabel(
    layout: &CorpusLayout,
    taxonomy: &Taxonomy,
    from: &Path,
    task_no: u32,
    subtopic: &str,
) -> Result<Relabeled> {
    let cell = taxonomy.cell(task_no, subtopic).ok_or_else(|| {
        Error::Taxonomy(format!(
            "{task_no}/{subtopic} is not a {}/{} taxonomy cell",
            taxonomy.exam, taxonomy.level
        ))
    })?;

    let mut obj: Map<String, Value> = match store::read_json::<Value>(from)? {
        Value::Object(m) => m,
        _ => {
            return Err(Error::InvalidRecord(format!(
                "{}: not a JSON object",
                from.display()
            )))
        }
    };
    obj.remove("status");
    obj.insert("exam".into(), Value::from(taxonomy.exam.as_str()));
    obj.insert("level".into(), Value::from(taxonomy.level.as_str()));
    obj.insert("taskNo".into(), Value::from(cell.task_no));
    obj.insert("subtopic".into(), Value::from(cell.subtopic.clone()));
    obj.insert("title".into(), Value::from(cell.record_title()));
    let validation = Validation {
        confidence: 1.0,
        hits: vec![MANUAL_HIT.to_string()],
    };
    obj.insert(
        "validation".into(),
        serde_json::to_value(&validation).map_err(|e| Error::json(from.display(), e))?,
    );

    let mut record: LabeledRecord =
        serde_json::from_value(Value::Object(obj)).map_err(|e| Error::json(from.display(), e))?;
    if record.body.checksum.trim().is_empty() {
        record.body.checksum = store::checksum(&record.body.statement_html, &record.body.asset_urls);
    }

    let stable_id = record
        .body
        .identity()
        .filter(|i| !i.is_synthetic())
        .map(|i| i.id().to_string());
    let to = store::free_labeled_path(
        &layout.cell_dir(taxonomy.exam, taxonomy.level, cell.task_no, &cell.subtopic),
        &record.title,
        &record.body.checksum,
        stable_id.as_deref(),
    );
    store::write_json_pretty(&to, &record)?;
    if to != from {
        std::fs::remove_file(from).map_err(|e| Error::io(from.display(), e))?;
    }
    info!(from = %from.display(), to = %to.display(), "relabeled");

    Ok(Relabeled {
        from: from.to_path_buf(),
        to,
        task_no: cell.task_no,
        subtopic: cell.subtopic.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fipibank_core::{ExamId, Level};

    fn review_file(layout: &CorpusLayout) -> PathBuf {
        let p = layout.review_file(ExamId::Ege, Level::Basic, 0, "Q1");
        store::write_json_pretty(
            &p,
            &serde_json::json!({
                "status": "needs_review",
                "exam": "ege",
                "level": "basic",
                "taskNo": 0,
                "subtopic": "unknown",
                "fipiId": "Q1",
                "idSynthetic": false,
                "idMethod": "attr",
                "statementHtml": "<p>Найдите площадь участка</p>",
                "statementText": "Найдите площадь участка",
                "assetUrls": [],
                "assets": [],
                "sourceUrl": "https://bank.test/q",
                "accessedAt": "2024-01-01T00:00:00Z",
                "checksum": "",
                "reviewerNote": "looks like task 9"
            }),
        )
        .unwrap();
        p
    }

    #[test]
    fn moves_review_file_into_the_cell() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = CorpusLayout::new(tmp.path());
        let tax = Taxonomy::embedded(ExamId::Ege, Level::Basic).unwrap();
        let from = review_file(&layout);

        let r = relabel(&layout, &tax, &from, 9, "ploshchad-figury").unwrap();
        assert!(!from.exists());
        assert!(r.to.starts_with(layout.cell_dir(ExamId::Ege, Level::Basic, 9, "ploshchad-figury")));

        let v: Value = store::read_json(&r.to).unwrap();
        assert!(v.get("status").is_none());
        assert_eq!(v["taskNo"], 9);
        assert_eq!(v["subtopic"], "ploshchad-figury");
        assert_eq!(v["validation"]["hits"][0], "manual");
        assert_eq!(v["validation"]["confidence"], 1.0);
        assert_eq!(v["reviewerNote"], "looks like task 9");
        assert_eq!(v["checksum"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn rejects_cells_outside_the_taxonomy() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = CorpusLayout::new(tmp.path());
        let tax = Taxonomy::embedded(ExamId::Ege, Level::Basic).unwrap();
        let from = review_file(&layout);

        let err = relabel(&layout, &tax, &from, 9, "no-such-subtopic").unwrap_err();
        assert!(matches!(err, Error::Taxonomy(_)));
        assert!(from.exists());
    }
}
