//! `fipibank` crate (library surface).
//!
//! The primary entrypoint is the `fipibank` binary. This module re-exports the backend crates
//! and holds the small CLI helpers the binary and its tests share.

pub use fipibank_core as core;
pub use fipibank_local as local;

use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
    Json,
    Text,
}

impl Output {
    /// Anything other than `text` is JSON.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "txt" => Output::Text,
            _ => Output::Json,
        }
    }
}

/// Load `KEY=VALUE` lines from `path` into the process environment.
///
/// Variables already set are left alone; blank lines and `#` comments are skipped. Returns the
/// number of variables set.
pub fn load_env_file(path: &std::path::Path) -> std::io::Result<usize> {
    let txt = std::fs::read_to_string(path)?;
    let mut set = 0;
    for raw in txt.lines() {
        let s = raw.trim();
        if s.is_empty() || s.starts_with('#') {
            continue;
        }
        let s = s.strip_prefix("export ").unwrap_or(s);
        let Some((k, v)) = s.split_once('=') else {
            continue;
        };
        let k = k.trim();
        let v = v.trim().trim_matches('"');
        if k.is_empty() {
            continue;
        }
        if std::env::var_os(k).is_none() {
            std::env::set_var(k, v);
            set += 1;
        }
    }
    Ok(set)
}

/// Parse a task-number set: `1-5`, `1,3,7`, or a mix like `1-3,9`.
pub fn parse_task_set(s: &str) -> Result<Vec<u32>, String> {
    let mut out = BTreeSet::new();
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let num = |x: &str| {
            x.trim()
                .parse::<u32>()
                .map_err(|_| format!("bad task number {x:?} in {s:?}"))
        };
        match part.split_once('-') {
            Some((a, b)) => {
                let (a, b) = (num(a)?, num(b)?);
                if a > b {
                    return Err(format!("empty task range {part:?}"));
                }
                out.extend(a..=b);
            }
            None => {
                out.insert(num(part)?);
            }
        }
    }
    if out.is_empty() {
        return Err("no task numbers given".to_string());
    }
    Ok(out.into_iter().collect())
}
