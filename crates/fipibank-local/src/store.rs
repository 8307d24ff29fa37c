//! On-disk corpus layout and JSON file IO.
//!
//! ```text
//! {root}/_raw/{exam}/{level}/task-{N}/page-{P}/{id}.json        raw, skip-if-exists
//! {root}/{exam}/{level}/{taskNo}/{subtopic}/{slug}-{sum8}.json   labeled
//! {root}/_review/{exam}/{level}/{taskNo|0}/unknown/{key}.json   review
//! ```

use fipibank_core::{Error, ExamId, Level, Result, UNKNOWN_SUBTOPIC};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Serialize)]
struct ChecksumInput<'a> {
    statement_html: &'a str,
    assets: &'a [String],
}

/// Content checksum of a card: sha256 hex over its sanitized statement and asset URLs.
///
/// Computed over a serialized struct so field boundaries are unambiguous.
pub fn checksum(statement_html: &str, asset_urls: &[String]) -> String {
    let input = ChecksumInput {
        statement_html,
        assets: asset_urls,
    };
    // A struct of strings always serializes.
    let bytes = serde_json::to_vec(&input).unwrap_or_default();
    crate::sha256_hex(&bytes)
}

#[derive(Debug, Clone)]
pub struct CorpusLayout {
    root: PathBuf,
}

/// Keep identifiers usable as a single path component.
fn file_key(id: &str) -> String {
    let s: String = id
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if s.is_empty() {
        "_".to_string()
    } else {
        s
    }
}

impl CorpusLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn raw_dir(&self, exam: ExamId, level: Level) -> PathBuf {
        self.root.join("_raw").join(exam.as_str()).join(level.as_str())
    }

    pub fn raw_page_dir(&self, exam: ExamId, level: Level, task_no: u32, page: u32) -> PathBuf {
        self.raw_dir(exam, level)
            .join(format!("task-{task_no}"))
            .join(format!("page-{page}"))
    }

    pub fn raw_file(&self, exam: ExamId, level: Level, task_no: u32, page: u32, id: &str) -> PathBuf {
        self.raw_page_dir(exam, level, task_no, page)
            .join(format!("{}.json", file_key(id)))
    }

    pub fn labeled_dir(&self, exam: ExamId, level: Level) -> PathBuf {
        self.root.join(exam.as_str()).join(level.as_str())
    }

    pub fn cell_dir(&self, exam: ExamId, level: Level, task_no: u32, subtopic: &str) -> PathBuf {
        self.labeled_dir(exam, level)
            .join(task_no.to_string())
            .join(file_key(subtopic))
    }

    pub fn review_dir(&self, exam: ExamId, level: Level) -> PathBuf {
        self.root.join("_review").join(exam.as_str()).join(level.as_str())
    }

    /// `key` is the record's identifier, or `checksum[..16]` when it has none.
    pub fn review_file(&self, exam: ExamId, level: Level, task_no: u32, key: &str) -> PathBuf {
        self.review_dir(exam, level)
            .join(task_no.to_string())
            .join(UNKNOWN_SUBTOPIC)
            .join(format!("{}.json", file_key(key)))
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.root.join("_reports")
    }
}

/// ASCII slug with Russian transliteration (`Задание 1` -> `zadanie-1`).
pub fn mk_slug(s: &str) -> String {
    fn translit(c: char) -> Option<&'static str> {
        Some(match c {
            'а' => "a",
            'б' => "b",
            'в' => "v",
            'г' => "g",
            'д' => "d",
            'е' | 'ё' | 'э' => "e",
            'ж' => "zh",
            'з' => "z",
            'и' => "i",
            'й' | 'ы' => "y",
            'к' => "k",
            'л' => "l",
            'м' => "m",
            'н' => "n",
            'о' => "o",
            'п' => "p",
            'р' => "r",
            'с' => "s",
            'т' => "t",
            'у' => "u",
            'ф' => "f",
            'х' => "h",
            'ц' => "c",
            'ч' => "ch",
            'ш' => "sh",
            'щ' => "shch",
            'ъ' | 'ь' => "",
            'ю' => "yu",
            'я' => "ya",
            _ => return None,
        })
    }

    let mut out = String::new();
    for c in s.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if let Some(t) = translit(c) {
            out.push_str(t);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

/// `{slug(title)}-{checksum8}.json`, the labeled-partition file name.
pub fn labeled_file_name(title: &str, checksum: &str) -> String {
    let short: String = checksum.chars().take(8).collect();
    format!("{}-{short}.json", mk_slug(title))
}

/// Path for a new labeled record in `dir`.
///
/// Two questions with different stable ids can share markup, and so the plain name; the later
/// one gets its id appended.
pub fn free_labeled_path(dir: &Path, title: &str, checksum: &str, stable_id: Option<&str>) -> PathBuf {
    let plain = dir.join(labeled_file_name(title, checksum));
    match stable_id {
        Some(id) if plain.exists() => {
            let short: String = checksum.chars().take(8).collect();
            let key = file_key(id).to_ascii_lowercase();
            dir.join(format!("{}-{short}-{key}.json", mk_slug(title)))
        }
        _ => plain,
    }
}

/// Pretty JSON via temp file + rename, so readers never see a half-written record.
pub fn write_json_pretty<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::io(path.display(), "path has no parent directory"))?;
    fs::create_dir_all(dir).map_err(|e| Error::io(dir.display(), e))?;
    let mut body = serde_json::to_string_pretty(value).map_err(|e| Error::json(path.display(), e))?;
    body.push('\n');
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{file_name}.tmp"));
    fs::write(&tmp, body).map_err(|e| Error::io(tmp.display(), e))?;
    fs::rename(&tmp, path).map_err(|e| Error::io(path.display(), e))
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let s = fs::read_to_string(path).map_err(|e| Error::io(path.display(), e))?;
    serde_json::from_str(&s).map_err(|e| Error::json(path.display(), e))
}

/// Every `*.json` file under `dir`, sorted by path. A missing directory is empty.
pub fn list_json_files(dir: &Path) -> Vec<PathBuf> {
    if !dir.exists() {
        return Vec::new();
    }
    walkdir::WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(e) => Some(e),
            Err(err) => {
                tracing::warn!(error = %err, "skipping unreadable directory entry");
                None
            }
        })
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension().is_some_and(|x| x == "json")
                && !p
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with('.'))
        })
        .collect()
}
