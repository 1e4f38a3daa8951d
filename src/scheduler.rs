//! Owns the unit DAG, per-unit status, and the ready queue. All mutation
//! goes through one lock, held only for the transition itself, never
//! across provider invocations or git/host I/O (those happen in
//! `crate::worker`).
//!
//! Grounded on the teacher's locking style in `resource.rs`
//! (`parking_lot::Mutex` guarding a plain `HashMap`, no async held across
//! the critical section) generalized from a resource pool to a unit
//! status table.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;

use crate::dag::Dag;
use crate::error::{DagError, SchedulerError};
use crate::unit::{Unit, UnitStatus};

struct Inner {
    dag: Dag<String, Unit>,
    status: HashMap<String, UnitStatus>,
    ready_queue: VecDeque<String>,
    /// Units already in the ready queue, to keep `NextReady` a true FIFO
    /// without scanning `ready_queue` for membership.
    queued: HashSet<String>,
}

/// DAG of units plus the state machine driving each one from `pending`
/// through to a terminal status. See spec_full.md §4.2.
pub struct Scheduler {
    inner: Mutex<Inner>,
}

impl Scheduler {
    pub fn new(units: Vec<Unit>) -> Result<Self, DagError<String>> {
        let dag = Dag::new(units)?;
        let mut status = HashMap::new();
        let mut ready_queue = VecDeque::new();
        let mut queued = HashSet::new();

        // Stable order: iterate nodes in dag insertion order, but ties at
        // "ready right away" are broken by unit ID per spec_full.md's
        // ordering requirement, so sort the zero-dependency set before
        // enqueuing.
        let mut initially_ready: Vec<String> = Vec::new();
        for unit in dag.nodes() {
            let is_ready = unit.dependencies.is_empty();
            status.insert(
                unit.id.clone(),
                if is_ready {
                    UnitStatus::Ready
                } else {
                    UnitStatus::Pending
                },
            );
            if is_ready {
                initially_ready.push(unit.id.clone());
            }
        }
        initially_ready.sort();
        for id in initially_ready {
            queued.insert(id.clone());
            ready_queue.push_back(id);
        }

        Ok(Self {
            inner: Mutex::new(Inner {
                dag,
                status,
                ready_queue,
                queued,
            }),
        })
    }

    pub fn status_of(&self, id: &str) -> Result<UnitStatus, SchedulerError> {
        let inner = self.inner.lock();
        inner
            .status
            .get(id)
            .copied()
            .ok_or_else(|| SchedulerError::UnknownUnit(id.to_string()))
    }

    /// Atomically pops the next ready unit, in FIFO-by-time-of-readiness
    /// order (ties broken by ID at enqueue time). Returns `None` when the
    /// ready queue is empty; callers should wait for a `MarkFinished`/
    /// `MarkFailed` elsewhere to free up new ready units.
    pub fn next_ready(&self) -> Option<String> {
        let mut inner = self.inner.lock();
        let id = inner.ready_queue.pop_front()?;
        inner.queued.remove(&id);
        inner.status.insert(id.clone(), UnitStatus::InProgress);
        Some(id)
    }

    /// Transitions `id` to `complete`, then promotes any dependent unit
    /// whose prerequisites are now all complete into the ready queue.
    pub fn mark_finished(&self, id: &str) -> Result<Vec<String>, SchedulerError> {
        let mut inner = self.inner.lock();
        Self::require_in_progress(&inner, id)?;
        inner.status.insert(id.to_string(), UnitStatus::Complete);

        let mut newly_ready = Vec::new();
        let dependents = Self::dependents_of(&inner.dag, id);
        let mut sorted_dependents: Vec<String> = dependents.into_iter().collect();
        sorted_dependents.sort();
        for dep_id in sorted_dependents {
            if inner.status.get(&dep_id).copied() != Some(UnitStatus::Pending) {
                continue;
            }
            let unit = inner
                .dag
                .node(&dep_id)
                .expect("dependent id came from the dag itself");
            let all_prereqs_complete = unit
                .dependencies
                .iter()
                .all(|prereq| inner.status.get(prereq).copied() == Some(UnitStatus::Complete));
            if all_prereqs_complete {
                inner.status.insert(dep_id.clone(), UnitStatus::Ready);
                if inner.queued.insert(dep_id.clone()) {
                    inner.ready_queue.push_back(dep_id.clone());
                }
                newly_ready.push(dep_id);
            }
        }
        Ok(newly_ready)
    }

    /// Transitions `id` to `failed`, then marks every unit transitively
    /// depending on it as `blocked`.
    pub fn mark_failed(&self, id: &str) -> Result<Vec<String>, SchedulerError> {
        let mut inner = self.inner.lock();
        Self::require_in_progress(&inner, id)?;
        inner.status.insert(id.to_string(), UnitStatus::Failed);

        let mut blocked = Vec::new();
        let mut frontier: Vec<String> = Self::dependents_of(&inner.dag, id).into_iter().collect();
        let mut seen: HashSet<String> = HashSet::new();
        while let Some(dep_id) = frontier.pop() {
            if !seen.insert(dep_id.clone()) {
                continue;
            }
            if inner
                .status
                .get(&dep_id)
                .copied()
                .map(|s| s.is_terminal())
                .unwrap_or(true)
            {
                continue;
            }
            inner.status.insert(dep_id.clone(), UnitStatus::Blocked);
            inner.queued.remove(&dep_id);
            blocked.push(dep_id.clone());
            frontier.extend(Self::dependents_of(&inner.dag, &dep_id));
        }
        Ok(blocked)
    }

    /// Cooperative cancellation: pending/ready units are left untouched so
    /// a resumed run can pick them back up; callers are responsible for
    /// signalling in-progress workers separately.
    pub fn cancel(&self) {
        // Scheduler state itself needs no mutation on cancel: in-progress
        // units stay in_progress until their worker reports finished/failed,
        // and pending/ready units are already resumable as-is.
    }

    /// Clones the unit `id` out of the DAG, for `crate::worker_pool` to
    /// build a `Worker` from once `next_ready` hands back its ID.
    pub fn unit(&self, id: &str) -> Option<Unit> {
        self.inner.lock().dag.node(&id.to_string()).cloned()
    }

    /// Node IDs and their topological level (longest prerequisite chain),
    /// for `crate::orchestrator` to persist as a `GraphSnapshot`.
    pub fn levels(&self) -> Vec<(String, usize)> {
        self.inner
            .lock()
            .dag
            .levels()
            .into_iter()
            .map(|(id, level)| (id.clone(), level))
            .collect()
    }

    /// `(dependent, prerequisite)` edges, for the same snapshot.
    pub fn edges(&self) -> Vec<(String, String)> {
        self.inner
            .lock()
            .dag
            .edges()
            .into_iter()
            .map(|(a, b)| (a.clone(), b.clone()))
            .collect()
    }

    pub fn total_units(&self) -> usize {
        self.inner.lock().dag.len()
    }

    pub fn counts_by_status(&self) -> HashMap<UnitStatus, usize> {
        let inner = self.inner.lock();
        let mut counts = HashMap::new();
        for status in inner.status.values() {
            *counts.entry(*status).or_insert(0) += 1;
        }
        counts
    }

    fn require_in_progress(inner: &Inner, id: &str) -> Result<(), SchedulerError> {
        match inner.status.get(id) {
            None => Err(SchedulerError::UnknownUnit(id.to_string())),
            Some(UnitStatus::InProgress) => Ok(()),
            Some(other) => Err(SchedulerError::InvalidTransition {
                unit: id.to_string(),
                from: other.as_str(),
                to: "complete-or-failed",
            }),
        }
    }

    fn dependents_of(dag: &Dag<String, Unit>, id: &str) -> HashSet<String> {
        dag.edges()
            .into_iter()
            .filter(|(_, prereq)| prereq.as_str() == id)
            .map(|(dependent, _)| dependent.clone())
            .collect()
    }
}
