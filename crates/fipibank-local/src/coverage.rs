//! Coverage accounting over the labeled partition, plus the quota gate.

use crate::store::{self, CorpusLayout};
use crate::taxonomy::Taxonomy;
use fipibank_core::{Error, ExamId, Level, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const DEFAULT_QUOTA: u32 = 2;
pub const WANTED_HEADER: &str = "taskNo,subtopic,haveCount,needCount";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CellCount {
    pub have: u32,
    pub need: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub have: u32,
    pub need: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageReport {
    pub exam: ExamId,
    pub level: Level,
    pub quota: u32,
    /// Every taxonomy cell, zeros included.
    pub by_task: BTreeMap<u32, BTreeMap<String, CellCount>>,
    pub totals: Totals,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Shortage {
    pub task_no: u32,
    pub subtopic: String,
    pub have_count: u32,
    pub need_count: u32,
}

fn path_segments(rel: &Path) -> (Option<u32>, Option<String>) {
    let mut parts = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned());
    let task = parts.next().and_then(|s| s.parse::<u32>().ok());
    let sub = parts.next().filter(|s| !s.ends_with(".json"));
    (task, sub)
}

/// One pass over the labeled partition: `(taskNo, subtopic) -> files`, taxonomy cells only.
pub fn count_labeled(layout: &CorpusLayout, taxonomy: &Taxonomy) -> BTreeMap<(u32, String), u32> {
    let root = layout.labeled_dir(taxonomy.exam, taxonomy.level);
    let mut counts: BTreeMap<(u32, String), u32> = BTreeMap::new();
    for path in store::list_json_files(&root) {
        let v: serde_json::Value = match store::read_json(&path) {
            Ok(v) => v,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unparsable labeled file");
                continue;
            }
        };
        let (path_task, path_sub) = path_segments(path.strip_prefix(&root).unwrap_or(&path));
        let task_no = v
            .get("taskNo")
            .and_then(|t| t.as_u64())
            .and_then(|t| u32::try_from(t).ok())
            .or(path_task);
        let subtopic = v
            .get("subtopic")
            .and_then(|s| s.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or(path_sub);
        let (Some(task_no), Some(subtopic)) = (task_no, subtopic) else {
            debug!(path = %path.display(), "no task/subtopic; not counted");
            continue;
        };
        if !taxonomy.contains(task_no, &subtopic) {
            debug!(path = %path.display(), task_no, subtopic, "outside the taxonomy; not counted");
            continue;
        }
        *counts.entry((task_no, subtopic)).or_default() += 1;
    }
    counts
}

pub fn report(layout: &CorpusLayout, taxonomy: &Taxonomy, quota: u32) -> CoverageReport {
    let counts = count_labeled(layout, taxonomy);
    let mut by_task: BTreeMap<u32, BTreeMap<String, CellCount>> = BTreeMap::new();
    let mut totals = Totals::default();
    for cell in taxonomy.cells() {
        let have = counts
            .get(&(cell.task_no, cell.subtopic.clone()))
            .copied()
            .unwrap_or(0);
        let need = quota.saturating_sub(have);
        totals.have += have;
        totals.need += need;
        by_task
            .entry(cell.task_no)
            .or_default()
            .insert(cell.subtopic.clone(), CellCount { have, need });
    }
    CoverageReport {
        exam: taxonomy.exam,
        level: taxonomy.level,
        quota,
        by_task,
        totals,
    }
}

fn title_case(s: &str) -> String {
    let mut c = s.chars();
    match c.next() {
        Some(f) => f.to_uppercase().chain(c).collect(),
        None => String::new(),
    }
}

impl CoverageReport {
    pub fn shortages(&self) -> Vec<Shortage> {
        self.by_task
            .iter()
            .flat_map(|(t, subs)| {
                subs.iter().filter(|(_, c)| c.need > 0).map(|(s, c)| Shortage {
                    task_no: *t,
                    subtopic: s.clone(),
                    have_count: c.have,
                    need_count: c.need,
                })
            })
            .collect()
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "# {} {} Coverage\n",
            self.exam.as_str().to_ascii_uppercase(),
            title_case(self.level.as_str())
        );
        for (t, subs) in &self.by_task {
            let _ = writeln!(out, "## Задание {t}");
            for (s, c) in subs {
                let status = if c.need == 0 {
                    "OK".to_string()
                } else {
                    format!("{}/{}", c.have, self.quota)
                };
                let _ = writeln!(out, "- {s}: {}/{} ({status})", c.have, self.quota);
            }
            out.push('\n');
        }
        let _ = writeln!(
            out,
            "Total: {} have, {} needed",
            self.totals.have, self.totals.need
        );
        out
    }

    /// Shortages only.
    pub fn to_csv(&self) -> String {
        let mut out = String::from(WANTED_HEADER);
        out.push('\n');
        for s in self.shortages() {
            let _ = writeln!(
                out,
                "{},{},{},{}",
                s.task_no, s.subtopic, s.have_count, s.need_count
            );
        }
        out
    }

    /// Write `coverage.md`, `wanted.csv` and `coverage.json` into `dir`.
    pub fn write_artifacts(&self, dir: &Path) -> Result<Artifacts> {
        std::fs::create_dir_all(dir).map_err(|e| Error::io(dir.display(), e))?;
        let artifacts = Artifacts {
            markdown: dir.join("coverage.md"),
            csv: dir.join("wanted.csv"),
            json: dir.join("coverage.json"),
        };
        std::fs::write(&artifacts.markdown, self.to_markdown())
            .map_err(|e| Error::io(artifacts.markdown.display(), e))?;
        std::fs::write(&artifacts.csv, self.to_csv())
            .map_err(|e| Error::io(artifacts.csv.display(), e))?;
        store::write_json_pretty(&artifacts.json, self)?;
        Ok(artifacts)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifacts {
    pub markdown: PathBuf,
    pub csv: PathBuf,
    pub json: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateResult {
    pub passed: bool,
    pub tasks: Vec<u32>,
    pub failing: Vec<Shortage>,
    pub text: String,
}

/// Check the quota for a subset of task numbers. Every taxonomy cell of those tasks counts,
/// including cells with no files yet.
pub fn gate(report: &CoverageReport, tasks: &[u32]) -> GateResult {
    let mut text = String::new();
    let mut failing = Vec::new();
    let label = match (tasks.first(), tasks.last()) {
        (Some(a), Some(b)) if a != b => format!("tasks {a}..{b}"),
        (Some(a), _) => format!("task {a}"),
        _ => "no tasks".to_string(),
    };
    let _ = writeln!(text, "Coverage gate ({}/{}, {label})", report.exam, report.level);
    for t in tasks {
        let _ = writeln!(text, "Task {t}");
        let Some(subs) = report.by_task.get(t) else {
            let _ = writeln!(text, "  (no subtopics found)");
            continue;
        };
        for (s, c) in subs {
            let _ = writeln!(text, "  - {s}: {}/{} (need {})", c.have, report.quota, c.need);
            if c.need > 0 {
                failing.push(Shortage {
                    task_no: *t,
                    subtopic: s.clone(),
                    have_count: c.have,
                    need_count: c.need,
                });
            }
        }
    }
    GateResult {
        passed: failing.is_empty(),
        tasks: tasks.to_vec(),
        failing,
        text,
    }
}

/// Parse `wanted.csv` as written by [`CoverageReport::to_csv`].
pub fn read_wanted(path: &Path) -> Result<Vec<Shortage>> {
    let body = std::fs::read_to_string(path).map_err(|e| Error::io(path.display(), e))?;
    let mut lines = body.lines().map(str::trim).filter(|l| !l.is_empty());
    let header: Vec<&str> = lines
        .next()
        .ok_or_else(|| Error::InvalidRecord(format!("{}: empty file", path.display())))?
        .split(',')
        .map(str::trim)
        .collect();
    let col = |name: &str| {
        header
            .iter()
            .position(|h| *h == name)
            .ok_or_else(|| Error::InvalidRecord(format!("{}: missing column {name}", path.display())))
    };
    let (ti, si, hi, ni) = (
        col("taskNo")?,
        col("subtopic")?,
        col("haveCount")?,
        col("needCount")?,
    );

    let mut out = Vec::new();
    for (lineno, line) in lines.enumerate() {
        let cells: Vec<&str> = line.split(',').map(str::trim).collect();
        let parse = |i: usize| cells.get(i).and_then(|v| v.parse::<u32>().ok());
        let (Some(task_no), Some(subtopic), Some(have), Some(need)) =
            (parse(ti), cells.get(si), parse(hi), parse(ni))
        else {
            warn!(path = %path.display(), line = lineno + 2, "skipping malformed wanted.csv row");
            continue;
        };
        if need > 0 {
            out.push(Shortage {
                task_no,
                subtopic: subtopic.to_string(),
                have_count: have,
                need_count: need,
            });
        }
    }
    Ok(out)
}

/// Human hints for the next crawl, from the shortage list.
pub fn pick_needed_text(shortages: &[Shortage], exam: ExamId, level: Level) -> String {
    if shortages.is_empty() {
        return "All subtopics meet quota. Nothing to pick.\n".to_string();
    }
    let mut out = String::from("Still needed:\n");
    for s in shortages {
        let _ = writeln!(
            out,
            "- Task {} / {}: need {} (have {})",
            s.task_no, s.subtopic, s.need_count, s.have_count
        );
    }
    let mut tasks: Vec<u32> = shortages.iter().map(|s| s.task_no).collect();
    tasks.dedup();
    out.push_str("\nNext:\n");
    for t in tasks {
        let _ = writeln!(
            out,
            "  fipibank crawl --exam {exam} --level {level} --start-task {t} --end-task {t}"
        );
    }
    let _ = writeln!(out, "  fipibank curate --exam {exam} --level {level}");
    let _ = writeln!(out, "  fipibank report --exam {exam} --level {level}");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn taxonomy() -> Taxonomy {
        Taxonomy::from_json(
            ExamId::Ege,
            Level::Basic,
            r#"{
              "1": {"title": "T1", "subtopics": {
                 "a": {"title": "A", "rules": ["a"]},
                 "b": {"title": "B", "rules": ["b"]}}},
              "2": {"title": "T2", "subtopics": {
                 "c": {"title": "C", "rules": ["c"]}}}
            }"#,
        )
        .unwrap()
    }

    fn put(layout: &CorpusLayout, task: u32, sub: &str, name: &str, body: serde_json::Value) {
        let p = layout
            .cell_dir(ExamId::Ege, Level::Basic, task, sub)
            .join(name);
        store::write_json_pretty(&p, &body).unwrap();
    }

    #[test]
    fn report_lists_every_cell_and_prefers_stored_fields() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = CorpusLayout::new(tmp.path());
        let tax = taxonomy();
        put(&layout, 1, "a", "x.json", serde_json::json!({"taskNo": 1, "subtopic": "a"}));
        put(&layout, 1, "a", "y.json", serde_json::json!({}));
        // Stored fields win over the directory it sits in.
        put(&layout, 1, "b", "z.json", serde_json::json!({"taskNo": 2, "subtopic": "c"}));
        // Outside the taxonomy.
        put(&layout, 1, "zzz", "w.json", serde_json::json!({}));
        let bad = layout.cell_dir(ExamId::Ege, Level::Basic, 1, "a").join("bad.json");
        std::fs::write(bad, "{").unwrap();

        let r = report(&layout, &tax, DEFAULT_QUOTA);
        assert_eq!(r.by_task[&1]["a"], CellCount { have: 2, need: 0 });
        assert_eq!(r.by_task[&1]["b"], CellCount { have: 0, need: 2 });
        assert_eq!(r.by_task[&2]["c"], CellCount { have: 1, need: 1 });
        assert_eq!(r.totals, Totals { have: 3, need: 3 });

        let md = r.to_markdown();
        assert!(md.starts_with("# EGE Basic Coverage"));
        assert!(md.contains("- a: 2/2 (OK)"));
        assert!(md.contains("- b: 0/2 (0/2)"));
        assert!(md.contains("- c: 1/2 (1/2)"));

        assert_eq!(r.to_csv(), format!("{WANTED_HEADER}\n1,b,0,2\n2,c,1,1\n"));

        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["byTask"]["1"]["a"]["have"], 2);
        assert_eq!(json["totals"]["need"], 3);
    }

    #[test]
    fn one_more_file_moves_only_its_cell() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = CorpusLayout::new(tmp.path());
        let tax = taxonomy();
        put(&layout, 1, "a", "x.json", serde_json::json!({}));
        let before = report(&layout, &tax, DEFAULT_QUOTA);
        put(&layout, 2, "c", "y.json", serde_json::json!({}));
        let after = report(&layout, &tax, DEFAULT_QUOTA);
        assert_eq!(after.by_task[&2]["c"].have, before.by_task[&2]["c"].have + 1);
        assert_eq!(after.by_task[&1], before.by_task[&1]);
    }

    #[test]
    fn gate_passes_only_when_every_in_scope_cell_meets_quota() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = CorpusLayout::new(tmp.path());
        let tax = taxonomy();
        for (sub, n) in [("a", 2), ("b", 2)] {
            for i in 0..n {
                put(&layout, 1, sub, &format!("{i}.json"), serde_json::json!({}));
            }
        }
        let r = report(&layout, &tax, DEFAULT_QUOTA);
        assert!(gate(&r, &[1]).passed);

        let g = gate(&r, &[1, 2]);
        assert!(!g.passed);
        assert_eq!(g.failing.len(), 1);
        assert_eq!(g.failing[0].subtopic, "c");
        assert!(g.text.contains("  - c: 0/2 (need 2)"));
    }

    #[test]
    fn wanted_csv_parses_by_header() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("wanted.csv");
        std::fs::write(&p, "taskNo,subtopic,haveCount,needCount\n1,b,0,2\n2,c,1,1\nbad,row\n").unwrap();
        let w = read_wanted(&p).unwrap();
        assert_eq!(w.len(), 2);
        assert_eq!(w[1].need_count, 1);
        assert_eq!(w[1].have_count, 1);

        let text = pick_needed_text(&w, ExamId::Ege, Level::Basic);
        assert!(text.contains("- Task 1 / b: need 2 (have 0)"));
        assert!(text.contains("--start-task 2 --end-task 2"));
        assert!(pick_needed_text(&[], ExamId::Ege, Level::Basic).contains("Nothing to pick"));
    }
}
