//! Unit/Task data types. A Unit is the discoverable work item a run is
//! built around; its status is mutated only by the scheduler, under the
//! scheduler's own lock. See `crate::dag` for the graph these are placed
//! into and `crate::scheduler` for the state machine that owns them.

use std::borrow::Borrow;
use std::path::Path;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::dag::GraphNode;

/// Status of a [`Unit`] as tracked by the scheduler. Transitions are
/// validated by `crate::scheduler::Scheduler`, never mutated directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    Ready,
    InProgress,
    Complete,
    Failed,
    Blocked,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Pending => "pending",
            UnitStatus::Ready => "ready",
            UnitStatus::InProgress => "in_progress",
            UnitStatus::Complete => "complete",
            UnitStatus::Failed => "failed",
            UnitStatus::Blocked => "blocked",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UnitStatus::Complete | UnitStatus::Failed | UnitStatus::Blocked
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Complete => "complete",
            TaskStatus::Failed => "failed",
        }
    }
}

/// One step of a unit's ordered task list. Tasks run strictly in order;
/// status is authoritative across restarts (persisted in the unit's own
/// file on disk, loaded back at discovery time).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub index: usize,
    pub title: String,
    pub status: TaskStatus,
}

impl Task {
    pub fn new(index: usize, title: impl Into<String>) -> Self {
        Self {
            index,
            title: title.into(),
            status: TaskStatus::Pending,
        }
    }
}

/// A discoverable unit of work: an ID, an ordered task list, and the IDs
/// of units that must complete before this one becomes ready.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unit {
    pub id: String,
    pub tasks: Vec<Task>,
    pub dependencies: Vec<String>,
    pub provider_override: Option<String>,
    pub status: UnitStatus,
    /// Populated once a worker has claimed this unit and created its worktree.
    pub worktree_path: Option<std::path::PathBuf>,
    pub branch: Option<String>,
}

impl Unit {
    pub fn new(id: impl Into<String>, tasks: Vec<Task>, dependencies: Vec<String>) -> Self {
        Self {
            id: id.into(),
            tasks,
            dependencies,
            provider_override: None,
            status: UnitStatus::Pending,
            worktree_path: None,
            branch: None,
        }
    }

    /// Index of the first task not yet complete, or `None` if all tasks
    /// are complete.
    pub fn next_pending_task(&self) -> Option<&Task> {
        self.tasks
            .iter()
            .find(|t| !matches!(t.status, TaskStatus::Complete))
    }

    pub fn all_tasks_complete(&self) -> bool {
        self.tasks
            .iter()
            .all(|t| matches!(t.status, TaskStatus::Complete))
    }
}

/// Discovers units from a tasks directory: one subdirectory per unit
/// (named by unit ID), containing numbered task files (`01.md`, `02.md`,
/// ...) whose stem gives the task a title. A unit's prerequisites are
/// listed one per line in an optional `DEPENDS_ON` file at the unit's
/// directory root; a missing file means no dependencies.
pub fn discover(tasks_dir: &Path) -> anyhow::Result<Vec<Unit>> {
    let mut units = Vec::new();
    let mut entries: Vec<_> = std::fs::read_dir(tasks_dir)
        .with_context(|| format!("reading tasks directory {tasks_dir:?}"))?
        .collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let id = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow::anyhow!("non-utf8 unit directory name: {path:?}"))?
            .to_string();

        let mut task_files: Vec<_> = std::fs::read_dir(&path)
            .with_context(|| format!("reading unit directory {path:?}"))?
            .collect::<Result<_, _>>()?;
        task_files.retain(|e| e.path().extension().and_then(|e| e.to_str()) == Some("md"));
        task_files.sort_by_key(|e| e.file_name());

        let tasks = task_files
            .iter()
            .enumerate()
            .map(|(position, entry)| {
                let title = entry
                    .path()
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("task")
                    .to_string();
                // Identity is 1-based: `01.md` is task 1, matching the
                // filename a reader would actually point at.
                Task::new(position + 1, title)
            })
            .collect();

        let dependencies = match std::fs::read_to_string(path.join("DEPENDS_ON")) {
            Ok(text) => text.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e).with_context(|| format!("reading DEPENDS_ON for unit {id}")),
        };

        units.push(Unit::new(id, tasks, dependencies));
    }

    Ok(units)
}

impl GraphNode<String> for Unit {
    fn id(&self) -> impl Borrow<String> {
        &self.id
    }

    fn child_ids(&self) -> Vec<impl Borrow<String>> {
        self.dependencies.iter().collect()
    }
}
