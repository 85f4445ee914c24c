//! Planner state tracking.
//!
//! The tracker is the single source of truth which planning reads from. It holds the desired and
//! observed state of every executor, the corrective tasks this planner has in flight, recorded
//! failures, and the cursors of both streams.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use anyhow::Result;

use crate::error::ShutdownError;
use crate::models::{ExecutorId, Task, TaskExecutorState, TaskId, TaskPayload, UnitName, Units};
use crate::streams::StreamEntry;

/// The state owned by a planner.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlannerState {
    /// The target units of each managed executor.
    pub desired: BTreeMap<ExecutorId, Units>,
    /// The latest accepted snapshot of each executor.
    pub actual: BTreeMap<ExecutorId, TaskExecutorState>,
    /// Corrective tasks appended by this planner which have not yet been confirmed or reported on.
    pub in_flight: BTreeMap<TaskId, Task>,
    /// Corrective tasks reported as completed, whose effect has not yet been observed in a
    /// snapshot of their executor.
    pub awaiting_confirmation: BTreeMap<TaskId, Task>,
    /// The time at which a delta most recently failed, keyed by executor & unit.
    pub failures: BTreeMap<(ExecutorId, UnitName), u64>,
    /// The next offset of the task stream to be consumed.
    pub task_cursor: u64,
    /// The next offset of the executor state stream to be consumed.
    pub state_cursor: u64,
}

/// A summary of the effects of consuming one batch from each stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub tasks_consumed: usize,
    pub states_consumed: usize,
    pub stale_snapshots: usize,
    pub failure_reports: usize,
}

impl BatchSummary {
    /// Check if anything at all was consumed.
    pub fn is_empty(&self) -> bool {
        self.tasks_consumed == 0 && self.states_consumed == 0
    }
}

/// The outcome of applying a single task stream record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TaskEffect {
    None,
    Failure,
}

impl PlannerState {
    /// Set the desired units of the given executor.
    pub fn set_desired(&mut self, executor_id: ExecutorId, units: Units) {
        self.desired.insert(executor_id, units);
    }

    /// Stop managing the given executor, returning `true` if it was managed.
    pub fn remove_desired(&mut self, executor_id: &ExecutorId) -> bool {
        self.desired.remove(executor_id).is_some()
    }

    /// Check if a task addressing the given delta is currently in flight.
    ///
    /// Completed tasks still awaiting confirmation count as in flight, as the executor's stored
    /// snapshot does not yet reflect them.
    pub fn has_in_flight(&self, executor_id: &ExecutorId, unit: &UnitName) -> bool {
        self.in_flight
            .values()
            .chain(self.awaiting_confirmation.values())
            .any(|task| &task.executor_id == executor_id && task.unit() == Some(unit))
    }

    /// Look up one of this planner's tracked tasks by ID.
    fn tracked(&self, task_id: &TaskId) -> Option<&Task> {
        self.in_flight.get(task_id).or_else(|| self.awaiting_confirmation.get(task_id))
    }

    /// Check if every managed executor's observed units match its desired units.
    pub fn is_converged(&self) -> bool {
        self.desired.iter().all(|(executor_id, units)| match self.actual.get(executor_id) {
            Some(snapshot) => &snapshot.units == units,
            None => false,
        })
    }

    /// Apply a batch of records consumed from each stream, advancing the cursors past them.
    ///
    /// Task records are applied before snapshots, as snapshots may confirm tasks of the same
    /// batch. Any error returned is an invariant violation, and is always a `ShutdownError`.
    #[tracing::instrument(level = "trace", skip(self, planner_id, tasks, states))]
    pub fn apply_batch(
        &mut self, planner_id: &ExecutorId, tasks: Vec<StreamEntry<Task>>, states: Vec<StreamEntry<TaskExecutorState>>, now: u64,
    ) -> Result<BatchSummary> {
        let next_task_cursor = next_cursor("task", self.task_cursor, &tasks)?;
        let next_state_cursor = next_cursor("executor state", self.state_cursor, &states)?;
        let mut summary = BatchSummary {
            tasks_consumed: tasks.len(),
            states_consumed: states.len(),
            ..Default::default()
        };

        for entry in tasks {
            if self.apply_task_event(planner_id, entry.record, now)? == TaskEffect::Failure {
                summary.failure_reports += 1;
            }
        }
        for entry in states {
            if !self.apply_state_event(entry.record) {
                summary.stale_snapshots += 1;
            }
        }

        self.task_cursor = next_task_cursor;
        self.state_cursor = next_state_cursor;
        Ok(summary)
    }

    /// Apply an executor snapshot, returning `false` if it was rejected as stale.
    pub fn apply_state_event(&mut self, snapshot: TaskExecutorState) -> bool {
        if let Some(stored) = self.actual.get(&snapshot.executor_id) {
            if snapshot.regresses_from(stored) {
                tracing::warn!(
                    executor_id = %snapshot.executor_id,
                    last_task_id = ?snapshot.last_task_id,
                    stored_last_task_id = ?stored.last_task_id,
                    "rejecting stale executor snapshot"
                );
                return false;
            }
        }

        // Executors apply their tasks in order, so confirming a task confirms all earlier ones.
        if let Some(confirmed) = &snapshot.last_task_id {
            let executor_id = &snapshot.executor_id;
            self.in_flight.retain(|id, task| {
                let applied = &task.executor_id == executor_id && matches!(id.causal_cmp(confirmed), Some(Ordering::Less | Ordering::Equal));
                if applied {
                    tracing::debug!(task_id = %id, "in-flight task confirmed by executor snapshot");
                }
                !applied
            });
        }
        let executor_id = &snapshot.executor_id;
        let (confirmed, units) = (snapshot.last_task_id.as_ref(), &snapshot.units);
        self.awaiting_confirmation.retain(|id, task| {
            if &task.executor_id != executor_id {
                return true;
            }
            let applied = confirmed
                .and_then(|confirmed| id.causal_cmp(confirmed))
                .map(|ord| ord != Ordering::Greater)
                .unwrap_or(false);
            !(applied || task.payload.is_reflected_in(units))
        });

        // Failures of converged units are no longer relevant.
        if let Some(desired) = self.desired.get(&snapshot.executor_id) {
            let executor_id = &snapshot.executor_id;
            self.failures.retain(|(failed_executor, unit), _| {
                failed_executor != executor_id || desired.get(unit) != snapshot.units.get(unit)
            });
        }

        self.actual.insert(snapshot.executor_id.clone(), snapshot);
        true
    }

    /// Apply a task stream record.
    fn apply_task_event(&mut self, planner_id: &ExecutorId, task: Task, now: u64) -> Result<TaskEffect> {
        if let Err(err) = task.validate() {
            tracing::warn!(error = ?err, task_id = %task.task_id, "skipping malformed task record");
            return Ok(TaskEffect::None);
        }

        // Terminal reports settle the in-flight task they reference.
        if task.payload.is_terminal() {
            let source_id = match &task.source_task_id {
                Some(source_id) => source_id,
                None => return Ok(TaskEffect::None),
            };
            let source = match self.in_flight.remove(source_id) {
                Some(source) => source,
                None => {
                    tracing::debug!(task_id = %task.task_id, source_task_id = %source_id, "ignoring report for unknown source task");
                    return Ok(TaskEffect::None);
                }
            };
            if let TaskPayload::Failed { reason } = &task.payload {
                tracing::warn!(task_id = %source.task_id, executor_id = %source.executor_id, reason = %reason, "executor reported task failure");
                if let Some(unit) = source.unit() {
                    self.failures.insert((source.executor_id.clone(), unit.clone()), now);
                }
                return Ok(TaskEffect::Failure);
            }
            // A completed task keeps its delta covered until a snapshot shows its effect.
            if !self.is_confirmed(&source) {
                self.awaiting_confirmation.insert(source.task_id.clone(), source);
            }
            return Ok(TaskEffect::None);
        }

        // Only this planner's own corrective tasks are tracked as in flight.
        if task.producer_id() != planner_id {
            return Ok(TaskEffect::None);
        }
        if let Some(tracked) = self.tracked(&task.task_id) {
            if tracked != &task {
                return Err(ShutdownError::invariant(format!("task ID {} observed with conflicting records", task.task_id)).into());
            }
            return Ok(TaskEffect::None);
        }
        if self.is_confirmed(&task) {
            return Ok(TaskEffect::None);
        }
        tracing::debug!(task_id = %task.task_id, "tracking replayed in-flight task");
        self.in_flight.insert(task.task_id.clone(), task);
        Ok(TaskEffect::None)
    }

    /// Record tasks which have just been appended to the task stream by this planner.
    pub fn record_appended(&mut self, tasks: &[Task]) -> Result<()> {
        for task in tasks {
            if self.tracked(&task.task_id).is_some() {
                return Err(ShutdownError::invariant(format!("duplicate task ID {} emitted", task.task_id)).into());
            }
            if let Some(unit) = task.unit() {
                self.failures.remove(&(task.executor_id.clone(), unit.clone()));
            }
            self.in_flight.insert(task.task_id.clone(), task.clone());
        }
        Ok(())
    }

    /// Check if the given task has already been confirmed by a snapshot of its executor.
    fn is_confirmed(&self, task: &Task) -> bool {
        self.actual
            .get(&task.executor_id)
            .and_then(|snapshot| snapshot.last_task_id.as_ref())
            .and_then(|last| task.task_id.causal_cmp(last))
            .map(|ord| ord != Ordering::Greater)
            .unwrap_or(false)
    }
}

/// Compute the cursor following the given entries, ensuring they never precede the cursor and
/// that their offsets strictly increase.
fn next_cursor<T>(stream: &str, cursor: u64, entries: &[StreamEntry<T>]) -> Result<u64> {
    let mut next = cursor;
    for entry in entries {
        if entry.offset < next {
            return Err(ShutdownError::invariant(format!(
                "{} stream rewound, read offset {} while expecting offset {} or later",
                stream, entry.offset, next
            ))
            .into());
        }
        next = entry.offset + 1;
    }
    Ok(next)
}
