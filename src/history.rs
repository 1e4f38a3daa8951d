//! Single-writer persistent store of runs, events, and dependency graph
//! snapshots, backed by SQLite in WAL mode. Only the daemon's
//! `HistoryStore` instance ever writes; everything else reads through
//! the daemon RPC / HTTP API.
//!
//! The teacher has no persistence layer of its own (its "history" is the
//! live terminal status tracker we dropped as out of scope), so this
//! schema is new code, grounded directly on spec_full.md §4.8's logical
//! table layout and on the teacher's general habit of keeping I/O behind
//! a narrow, testable type (`git.rs`'s `Worktree` trait plays the same
//! role for subprocess I/O that this plays for SQL).

use std::path::Path;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::Event;
use crate::redact::redact_payload;

const SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    fn parse(s: &str) -> Self {
        match s {
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            "stopped" => RunStatus::Stopped,
            _ => RunStatus::Running,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub repo_path: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub parallelism: u32,
    pub total_units: u32,
    pub completed_units: u32,
    pub failed_units: u32,
    pub blocked_units: u32,
    pub error: Option<String>,
    pub tasks_dir: String,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Value,
    pub edges: Value,
    pub levels: Value,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ListRunsFilter<'a> {
    pub repo_path: Option<&'a str>,
    pub limit: u32,
    pub offset: u32,
    pub status: Option<RunStatus>,
}

#[derive(Debug, Default)]
pub struct GetEventsFilter<'a> {
    pub limit: u32,
    pub offset: u32,
    pub after_seq: u64,
    pub type_prefix: Option<&'a str>,
    pub unit: Option<&'a str>,
}

pub struct EventPage {
    pub events: Vec<Event>,
    pub has_more: bool,
}

/// Maximum page size enforced regardless of what a caller requests, per
/// spec_full.md §4.8's read contract (`limit<=100` for runs, `<=1000` for
/// events).
const MAX_RUN_PAGE: u32 = 100;
const MAX_EVENT_PAGE: u32 = 1000;

pub struct HistoryStore {
    conn: Mutex<Connection>,
}

impl HistoryStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating history store directory {parent:?}"))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening history store at {path:?}"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> anyhow::Result<()> {
        self.conn.lock().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                repo_path TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                status TEXT NOT NULL,
                parallelism INTEGER NOT NULL,
                total_units INTEGER NOT NULL,
                completed_units INTEGER NOT NULL DEFAULT 0,
                failed_units INTEGER NOT NULL DEFAULT 0,
                blocked_units INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                tasks_dir TEXT NOT NULL,
                dry_run INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                seq INTEGER NOT NULL,
                time TEXT NOT NULL,
                type TEXT NOT NULL,
                unit TEXT,
                task INTEGER,
                pr INTEGER,
                payload TEXT NOT NULL,
                error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_events_run_seq ON events(run_id, seq);
            CREATE TABLE IF NOT EXISTS graphs (
                run_id TEXT PRIMARY KEY REFERENCES runs(id) ON DELETE CASCADE,
                nodes TEXT NOT NULL,
                edges TEXT NOT NULL,
                levels TEXT NOT NULL
            );
            ",
        )?;
        let has_version: bool = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| {
                row.get::<_, i64>(0)
            })?
            > 0;
        if !has_version {
            self.conn.lock().execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
        }
        Ok(())
    }

    pub fn create_run(&self, run: &Run) -> anyhow::Result<()> {
        self.conn.lock().execute(
            "INSERT INTO runs (id, repo_path, started_at, completed_at, status, parallelism,
                total_units, completed_units, failed_units, blocked_units, error, tasks_dir, dry_run)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                run.id,
                run.repo_path,
                run.started_at.to_rfc3339(),
                run.completed_at.map(|t| t.to_rfc3339()),
                run.status.as_str(),
                run.parallelism,
                run.total_units,
                run.completed_units,
                run.failed_units,
                run.blocked_units,
                run.error,
                run.tasks_dir,
                run.dry_run,
            ],
        )?;
        Ok(())
    }

    /// Inserts an event, assigning it the next `seq` for its run.
    /// Redacts the payload before writing, per the store's contract that
    /// no producer may bypass redaction.
    pub fn insert_event(&self, mut event: Event) -> anyhow::Result<Event> {
        let conn = self.conn.lock();
        let next_seq: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM events WHERE run_id = ?1",
                params![event.run_id],
                |row| row.get(0),
            )
            .unwrap_or(1);
        event.seq = next_seq as u64;
        let redacted_payload = redact_payload(&event.payload);
        conn.execute(
            "INSERT INTO events (run_id, seq, time, type, unit, task, pr, payload, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                event.run_id,
                event.seq,
                event.time.to_rfc3339(),
                event.event_type,
                event.unit,
                event.task.map(|t| t as i64),
                event.pr.map(|p| p as i64),
                serde_json::to_string(&redacted_payload)?,
                event.error,
            ],
        )?;
        event.payload = redacted_payload;
        Ok(event)
    }

    /// Inserts a `run.resumed` event carrying the sequence number the run
    /// is resuming from, pairing with a previously-stored `run.stopped`.
    pub fn append_resume_marker(&self, run_id: &str) -> anyhow::Result<Event> {
        let last_seq: i64 = self
            .conn
            .lock()
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM events WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .unwrap_or(0);
        let event = Event::new(
            run_id,
            "run.resumed",
            serde_json::json!({"resumed_from_seq": last_seq}),
        );
        self.insert_event(event)
    }

    pub fn complete_run(&self, run_id: &str, status: RunStatus, error: Option<&str>) -> anyhow::Result<()> {
        self.conn.lock().execute(
            "UPDATE runs SET status = ?1, completed_at = ?2, error = ?3 WHERE id = ?4",
            params![status.as_str(), Utc::now().to_rfc3339(), error, run_id],
        )?;
        Ok(())
    }

    /// Reopens a previously stopped run for `resume`: puts it back into
    /// `Running`, clears its `completed_at`, and refreshes `total_units`
    /// in case re-discovery found a different unit count. Leaves the run's
    /// `id` and accumulated event history untouched, since the point of
    /// resume is to keep both.
    pub fn reopen_run(&self, run_id: &str, total_units: u32) -> anyhow::Result<()> {
        let changed = self.conn.lock().execute(
            "UPDATE runs SET status = ?1, completed_at = NULL, total_units = ?2 WHERE id = ?3",
            params![RunStatus::Running.as_str(), total_units, run_id],
        )?;
        if changed == 0 {
            anyhow::bail!("no run {run_id:?} to resume");
        }
        Ok(())
    }

    pub fn update_progress(
        &self,
        run_id: &str,
        completed_units: u32,
        failed_units: u32,
        blocked_units: u32,
    ) -> anyhow::Result<()> {
        self.conn.lock().execute(
            "UPDATE runs SET completed_units = ?1, failed_units = ?2, blocked_units = ?3 WHERE id = ?4",
            params![completed_units, failed_units, blocked_units, run_id],
        )?;
        Ok(())
    }

    pub fn save_graph(&self, run_id: &str, graph: &GraphSnapshot) -> anyhow::Result<()> {
        self.conn.lock().execute(
            "INSERT INTO graphs (run_id, nodes, edges, levels) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(run_id) DO UPDATE SET nodes = excluded.nodes, edges = excluded.edges, levels = excluded.levels",
            params![
                run_id,
                serde_json::to_string(&graph.nodes)?,
                serde_json::to_string(&graph.edges)?,
                serde_json::to_string(&graph.levels)?,
            ],
        )?;
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> anyhow::Result<Option<Run>> {
        self.conn
            .lock()
            .query_row("SELECT * FROM runs WHERE id = ?1", params![run_id], row_to_run)
            .optional()
            .context("querying run")
    }

    pub fn list_runs(&self, filter: ListRunsFilter) -> anyhow::Result<Vec<Run>> {
        let limit = filter.limit.min(MAX_RUN_PAGE).max(1);
        let mut sql = String::from("SELECT * FROM runs WHERE 1=1");
        let mut conditions: Vec<String> = Vec::new();
        if filter.repo_path.is_some() {
            conditions.push("repo_path = ?".into());
        }
        if filter.status.is_some() {
            conditions.push("status = ?".into());
        }
        for c in &conditions {
            sql.push_str(" AND ");
            sql.push_str(c);
        }
        sql.push_str(" ORDER BY started_at DESC LIMIT ? OFFSET ?");

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let mut idx = 1;
        if let Some(repo_path) = filter.repo_path {
            stmt.raw_bind_parameter(idx, repo_path)?;
            idx += 1;
        }
        if let Some(status) = filter.status {
            stmt.raw_bind_parameter(idx, status.as_str())?;
            idx += 1;
        }
        stmt.raw_bind_parameter(idx, limit)?;
        stmt.raw_bind_parameter(idx + 1, filter.offset)?;
        let mut rows = stmt.raw_query();
        let mut runs = Vec::new();
        while let Some(row) = rows.next()? {
            runs.push(row_to_run(row)?);
        }
        Ok(runs)
    }

    pub fn get_run_events(&self, run_id: &str, filter: GetEventsFilter) -> anyhow::Result<EventPage> {
        let limit = filter.limit.min(MAX_EVENT_PAGE).max(1);
        let mut sql = String::from(
            "SELECT run_id, seq, time, type, unit, task, pr, payload, error FROM events
             WHERE run_id = ?1 AND seq > ?2",
        );
        if filter.type_prefix.is_some() {
            sql.push_str(" AND type LIKE ?3");
        }
        if filter.unit.is_some() {
            sql.push_str(" AND unit = ?4");
        }
        sql.push_str(" ORDER BY seq ASC LIMIT ?5 OFFSET ?6");

        let fetch_limit = limit + 1;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let type_pattern = filter.type_prefix.map(|p| format!("{p}%"));
        let mut rows = stmt.query(params![
            run_id,
            filter.after_seq,
            type_pattern,
            filter.unit,
            fetch_limit,
            filter.offset,
        ])?;
        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            events.push(row_to_event(row)?);
        }
        let has_more = events.len() as u32 > limit;
        events.truncate(limit as usize);
        Ok(EventPage { events, has_more })
    }

    pub fn get_graph(&self, run_id: &str) -> anyhow::Result<Option<GraphSnapshot>> {
        self.conn
            .lock()
            .query_row(
                "SELECT nodes, edges, levels FROM graphs WHERE run_id = ?1",
                params![run_id],
                |row| {
                    let nodes: String = row.get(0)?;
                    let edges: String = row.get(1)?;
                    let levels: String = row.get(2)?;
                    Ok((nodes, edges, levels))
                },
            )
            .optional()?
            .map(|(nodes, edges, levels)| {
                Ok(GraphSnapshot {
                    nodes: serde_json::from_str(&nodes)?,
                    edges: serde_json::from_str(&edges)?,
                    levels: serde_json::from_str(&levels)?,
                })
            })
            .transpose()
    }

    /// Deletes runs (and cascades events/graphs) older than `older_than`.
    pub fn delete_old_runs(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64> {
        let count = self.conn.lock().execute(
            "DELETE FROM runs WHERE started_at < ?1",
            params![older_than.to_rfc3339()],
        )?;
        Ok(count as u64)
    }
}

fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<Run> {
    let started_at: String = row.get("started_at")?;
    let completed_at: Option<String> = row.get("completed_at")?;
    let status: String = row.get("status")?;
    Ok(Run {
        id: row.get("id")?,
        repo_path: row.get("repo_path")?,
        started_at: DateTime::parse_from_rfc3339(&started_at)
            .unwrap()
            .with_timezone(&Utc),
        completed_at: completed_at.map(|s| DateTime::parse_from_rfc3339(&s).unwrap().with_timezone(&Utc)),
        status: RunStatus::parse(&status),
        parallelism: row.get("parallelism")?,
        total_units: row.get("total_units")?,
        completed_units: row.get("completed_units")?,
        failed_units: row.get("failed_units")?,
        blocked_units: row.get("blocked_units")?,
        error: row.get("error")?,
        tasks_dir: row.get("tasks_dir")?,
        dry_run: row.get("dry_run")?,
    })
}

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<Event> {
    let time: String = row.get(2)?;
    let payload: String = row.get(7)?;
    let task: Option<i64> = row.get(5)?;
    let pr: Option<i64> = row.get(6)?;
    Ok(Event {
        run_id: row.get(0)?,
        seq: row.get::<_, i64>(1)? as u64,
        time: DateTime::parse_from_rfc3339(&time).unwrap().with_timezone(&Utc),
        event_type: row.get(3)?,
        unit: row.get(4)?,
        task: task.map(|t| t as usize),
        pr: pr.map(|p| p as u64),
        payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
        error: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sample_run(id: &str) -> Run {
        Run {
            id: id.to_string(),
            repo_path: "/repo".into(),
            started_at: Utc::now(),
            completed_at: None,
            status: RunStatus::Running,
            parallelism: 4,
            total_units: 2,
            completed_units: 0,
            failed_units: 0,
            blocked_units: 0,
            error: None,
            tasks_dir: "tasks".into(),
            dry_run: false,
        }
    }

    #[test]
    fn seq_is_monotonic_per_run() {
        let store = HistoryStore::open_in_memory().unwrap();
        store.create_run(&sample_run("run_1")).unwrap();
        let e1 = store
            .insert_event(Event::new("run_1", "unit.started", json!({})))
            .unwrap();
        let e2 = store
            .insert_event(Event::new("run_1", "unit.completed", json!({})))
            .unwrap();
        assert_eq!(e1.seq, 1);
        assert_eq!(e2.seq, 2);
    }

    #[test]
    fn resume_marker_preserves_run_id_and_continues_seq() {
        let store = HistoryStore::open_in_memory().unwrap();
        store.create_run(&sample_run("run_1")).unwrap();
        store
            .insert_event(Event::new("run_1", "unit.started", json!({})))
            .unwrap();
        store
            .insert_event(Event::new("run_1", "run.stopped", json!({"reason": "user_interrupt"})))
            .unwrap();
        let marker = store.append_resume_marker("run_1").unwrap();
        assert_eq!(marker.run_id, "run_1");
        assert_eq!(marker.seq, 3);
        assert_eq!(marker.payload["resumed_from_seq"], json!(2));
    }

    #[test]
    fn event_payload_is_redacted_before_storage() {
        let store = HistoryStore::open_in_memory().unwrap();
        store.create_run(&sample_run("run_1")).unwrap();
        let stored = store
            .insert_event(Event::new(
                "run_1",
                "task.started",
                json!({"prompt": "full text", "branch": "choo/a"}),
            ))
            .unwrap();
        assert_eq!(stored.payload["prompt"], json!("[redacted]"));
        assert_eq!(stored.payload["branch"], json!("choo/a"));
    }

    #[test]
    fn get_run_events_has_more_semantics() {
        let store = HistoryStore::open_in_memory().unwrap();
        store.create_run(&sample_run("run_1")).unwrap();
        for i in 0..5 {
            store
                .insert_event(Event::new("run_1", format!("event.{i}"), json!({})))
                .unwrap();
        }
        let page1 = store
            .get_run_events(
                "run_1",
                GetEventsFilter {
                    limit: 2,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(page1.events.len(), 2);
        assert!(page1.has_more);

        let page2 = store
            .get_run_events(
                "run_1",
                GetEventsFilter {
                    limit: 2,
                    offset: 4,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(page2.events.len(), 1);
        assert!(!page2.has_more);
    }

    #[test]
    fn watch_from_last_seq_receives_only_new_events() {
        let store = HistoryStore::open_in_memory().unwrap();
        store.create_run(&sample_run("run_1")).unwrap();
        store
            .insert_event(Event::new("run_1", "a", json!({})))
            .unwrap();
        let last = store
            .insert_event(Event::new("run_1", "b", json!({})))
            .unwrap();
        store
            .insert_event(Event::new("run_1", "c", json!({})))
            .unwrap();

        let page = store
            .get_run_events(
                "run_1",
                GetEventsFilter {
                    limit: 100,
                    after_seq: last.seq,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(page.events.len(), 1);
        assert_eq!(page.events[0].event_type, "c");
    }

    #[test]
    fn deleting_run_cascades_events_and_graph() {
        let store = HistoryStore::open_in_memory().unwrap();
        store.create_run(&sample_run("run_old")).unwrap();
        store
            .insert_event(Event::new("run_old", "a", json!({})))
            .unwrap();
        store
            .save_graph(
                "run_old",
                &GraphSnapshot {
                    nodes: json!(["a"]),
                    edges: json!([]),
                    levels: json!({"a": 0}),
                },
            )
            .unwrap();
        store
            .delete_old_runs(Utc::now() + chrono::Duration::seconds(1))
            .unwrap();
        assert!(store.get_run("run_old").unwrap().is_none());
        assert!(store.get_graph("run_old").unwrap().is_none());
    }
}
