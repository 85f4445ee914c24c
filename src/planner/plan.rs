//! Diff & plan.

use std::collections::BTreeSet;

use crate::models::{ExecutorId, Task, TaskId, TaskPayload, UnitName, Units};
use crate::planner::tracker::PlannerState;

/// Compute the corrective tasks which would bring every managed executor to its desired units.
///
/// This is a pure function of its inputs: identical inputs always produce identical tasks, IDs
/// included. Tasks are ordered by executor ID then unit name.
///
/// - Executors without an observed snapshot are unknown, and get no tasks.
/// - Executors which are observed but not managed get no tasks.
/// - A delta with a task already in flight is skipped.
/// - A delta which failed is skipped until `failure_backoff_ticks` have elapsed since the failure.
pub fn plan(state: &PlannerState, producer: &ExecutorId, now: u64, failure_backoff_ticks: u64) -> Vec<Task> {
    let mut tasks = Vec::new();
    let mut seq: u32 = 0;
    for (executor_id, desired) in state.desired.iter() {
        let snapshot = match state.actual.get(executor_id) {
            Some(snapshot) => snapshot,
            None => {
                tracing::trace!(%executor_id, "executor has not reported any state yet, skipping");
                continue;
            }
        };
        for payload in diff_units(desired, &snapshot.units) {
            let unit = match payload.unit() {
                Some(unit) => unit,
                None => continue,
            };
            if state.has_in_flight(executor_id, unit) || in_backoff(state, executor_id, unit, now, failure_backoff_ticks) {
                continue;
            }
            tasks.push(Task {
                task_id: TaskId {
                    producer: producer.clone(),
                    issued_at: now,
                    cursor: state.task_cursor,
                    seq,
                },
                executor_id: executor_id.clone(),
                producer_timestamp: now,
                source_task_id: None,
                payload,
            });
            seq = seq.saturating_add(1);
        }
    }
    tasks
}

/// Compute the corrective payloads which would turn `actual` into `desired`, ordered by unit.
pub fn diff_units(desired: &Units, actual: &Units) -> Vec<TaskPayload> {
    let names: BTreeSet<&UnitName> = desired.keys().chain(actual.keys()).collect();
    names
        .into_iter()
        .filter_map(|unit| match (desired.get(unit), actual.get(unit)) {
            (Some(version), None) => Some(TaskPayload::Install {
                unit: unit.clone(),
                version: version.clone(),
            }),
            (None, Some(version)) => Some(TaskPayload::Uninstall {
                unit: unit.clone(),
                version: version.clone(),
            }),
            (Some(to), Some(from)) if to != from => Some(TaskPayload::Update {
                unit: unit.clone(),
                from: from.clone(),
                to: to.clone(),
            }),
            _ => None,
        })
        .collect()
}

fn in_backoff(state: &PlannerState, executor_id: &ExecutorId, unit: &UnitName, now: u64, failure_backoff_ticks: u64) -> bool {
    state
        .failures
        .get(&(executor_id.clone(), unit.clone()))
        .map(|failed_at| now < failed_at.saturating_add(failure_backoff_ticks))
        .unwrap_or(false)
}
