//! PRD discovery and ranking for the `next-feature` command. Deliberately
//! thin: spec_full.md calls unit/PRD file loading "plumbing around the
//! core", so this reuses `crate::unit::discover`'s flat directory-scan
//! idiom rather than growing its own parser.
//!
//! A PRD is a single `.md` file directly under the PRD directory. An
//! optional `priority: <int>` line anywhere in the file raises its rank;
//! files without one default to priority 0 and are ordered by name.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct PrdCandidate {
    pub id: String,
    pub path: PathBuf,
    pub priority: i64,
    pub title: String,
}

fn parse_priority(text: &str) -> i64 {
    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("priority:") {
            if let Ok(n) = rest.trim().parse() {
                return n;
            }
        }
    }
    0
}

fn parse_title(text: &str, fallback: &str) -> String {
    text.lines()
        .map(str::trim)
        .find_map(|l| l.strip_prefix("# ").map(str::to_string))
        .unwrap_or_else(|| fallback.to_string())
}

/// Scans `prd_dir` for `.md` files and ranks them by declared priority
/// (descending), tie-broken by id. Errors if `prd_dir` doesn't exist or
/// isn't readable; an empty directory yields an empty, not erroring, list.
pub fn discover(prd_dir: &Path) -> anyhow::Result<Vec<PrdCandidate>> {
    let mut entries: Vec<_> = std::fs::read_dir(prd_dir)
        .with_context(|| format!("reading PRD directory {prd_dir:?}"))?
        .collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    let mut candidates = Vec::new();
    for entry in entries {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| anyhow::anyhow!("non-utf8 PRD filename: {path:?}"))?
            .to_string();
        let text = std::fs::read_to_string(&path).with_context(|| format!("reading PRD {path:?}"))?;
        let priority = parse_priority(&text);
        let title = parse_title(&text, &id);
        candidates.push(PrdCandidate { id, path, priority, title });
    }

    candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
    Ok(candidates)
}

/// Human-readable justification for `next-feature --explain`: the winning
/// candidate's priority and how many others it outranked.
pub fn explain(ranked: &[PrdCandidate]) -> String {
    match ranked.first() {
        None => "no PRDs found".to_string(),
        Some(top) => format!(
            "{} selected: priority {} (outranks {} other candidate(s))",
            top.id,
            top.priority,
            ranked.len() - 1
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranks_by_declared_priority_descending() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("low.md"), "# Low\npriority: 1\n").unwrap();
        std::fs::write(dir.path().join("high.md"), "# High\npriority: 5\n").unwrap();
        let ranked = discover(dir.path()).unwrap();
        assert_eq!(ranked[0].id, "high");
        assert_eq!(ranked[1].id, "low");
    }

    #[test]
    fn missing_priority_defaults_to_zero_and_sorts_by_id() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.md"), "# B\n").unwrap();
        std::fs::write(dir.path().join("a.md"), "# A\n").unwrap();
        let ranked = discover(dir.path()).unwrap();
        assert_eq!(ranked[0].id, "a");
        assert_eq!(ranked[1].id, "b");
    }

    #[test]
    fn ignores_non_markdown_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "irrelevant").unwrap();
        std::fs::write(dir.path().join("feature.md"), "# Feature\n").unwrap();
        let ranked = discover(dir.path()).unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].id, "feature");
    }

    #[test]
    fn explain_reports_winner_and_runner_up_count() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), "# A\npriority: 3\n").unwrap();
        std::fs::write(dir.path().join("b.md"), "# B\npriority: 1\n").unwrap();
        let ranked = discover(dir.path()).unwrap();
        let message = explain(&ranked);
        assert!(message.contains("a selected"));
        assert!(message.contains("outranks 1"));
    }
}
