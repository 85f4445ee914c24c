//! Data models of the service grid.
//!
//! Everything carried on the task stream and the executor state stream is defined here. Records
//! are immutable once appended to a stream, they are only ever superseded by newer records.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// The separator between the scheme and the body of an executor URI.
const URI_SCHEME_SEPARATOR: &str = "://";

/// The identity of a task executor, or of the planner itself, as a URI-like handle.
///
/// E.G., `grid://hosts/10.0.0.5`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExecutorId(String);

impl ExecutorId {
    /// Create a new instance, validating that the given value is a URI-like handle.
    pub fn new(val: impl Into<String>) -> Result<Self> {
        let val = val.into();
        match val.split_once(URI_SCHEME_SEPARATOR) {
            Some((scheme, body)) if !scheme.is_empty() && !body.is_empty() => Ok(Self(val)),
            _ => bail!(AppError::InvalidInput(format!("executor ID `{}` must be of the form `scheme://path`", val))),
        }
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl TryFrom<String> for ExecutorId {
    type Error = anyhow::Error;

    fn try_from(val: String) -> Result<Self> {
        Self::new(val)
    }
}

impl From<ExecutorId> for String {
    fn from(val: ExecutorId) -> Self {
        val.0
    }
}

impl FromStr for ExecutorId {
    type Err = anyhow::Error;

    fn from_str(val: &str) -> Result<Self> {
        Self::new(val)
    }
}

impl fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// The name of a logical unit deployed on an executor.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitName(pub String);

impl From<&str> for UnitName {
    fn from(val: &str) -> Self {
        Self(val.into())
    }
}

impl fmt::Display for UnitName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The version of a logical unit.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitVersion(pub String);

impl From<&str> for UnitVersion {
    fn from(val: &str) -> Self {
        Self(val.into())
    }
}

impl fmt::Display for UnitVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A set of installed (or to-be-installed) units along with their versions.
pub type Units = BTreeMap<UnitName, UnitVersion>;

/// The ID of a task.
///
/// IDs are assigned by the producer of the task. The `producer` scopes the ID globally, and the
/// remaining fields are unique per producer: `issued_at` is the clock value of the planning cycle
/// which emitted the task, `cursor` is the task stream cursor from which that cycle planned and
/// `seq` is the index of the task within the cycle's batch.
///
/// The derived `Ord` is a total order used for map keys only. Use `causal_cmp` when the order of
/// application matters, as IDs of different producers are not comparable.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    pub producer: ExecutorId,
    pub issued_at: u64,
    pub cursor: u64,
    pub seq: u32,
}

impl TaskId {
    /// Compare two IDs in emission order, returning `None` if they come from different producers.
    pub fn causal_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.producer != other.producer {
            return None;
        }
        Some((self.issued_at, self.cursor, self.seq).cmp(&(other.issued_at, other.cursor, other.seq)))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/tasks/{}-{}-{}", self.producer, self.issued_at, self.cursor, self.seq)
    }
}

/// The operation described by a task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TaskPayload {
    /// Install a unit which is not currently present on the executor.
    Install { unit: UnitName, version: UnitVersion },
    /// Move an installed unit from one version to another.
    Update { unit: UnitName, from: UnitVersion, to: UnitVersion },
    /// Remove an installed unit.
    Uninstall { unit: UnitName, version: UnitVersion },
    /// A report that the source task was applied successfully.
    Completed,
    /// A report that the source task could not be applied.
    Failed { reason: String },
}

impl TaskPayload {
    /// The unit addressed by this payload, if it is a corrective operation.
    pub fn unit(&self) -> Option<&UnitName> {
        match self {
            Self::Install { unit, .. } | Self::Update { unit, .. } | Self::Uninstall { unit, .. } => Some(unit),
            Self::Completed | Self::Failed { .. } => None,
        }
    }

    /// Check if this payload is a terminal report on an earlier task.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. })
    }

    /// Check if the effect of this payload is already visible in the given units.
    ///
    /// Terminal reports have no effect of their own, and are never reflected.
    pub fn is_reflected_in(&self, units: &Units) -> bool {
        match self {
            Self::Install { unit, version } => units.get(unit) == Some(version),
            Self::Update { unit, to, .. } => units.get(unit) == Some(to),
            Self::Uninstall { unit, .. } => !units.contains_key(unit),
            Self::Completed | Self::Failed { .. } => false,
        }
    }
}

/// A unit of corrective work addressed to one executor, or a report of work performed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// The ID of this task, which also identifies its producer.
    pub task_id: TaskId,
    /// The executor to which this task is addressed.
    pub executor_id: ExecutorId,
    /// The logical time at which the producer emitted this task.
    pub producer_timestamp: u64,
    /// The task to which this task is a response, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_task_id: Option<TaskId>,
    /// The operation of this task.
    pub payload: TaskPayload,
}

impl Task {
    /// The identity of whoever emitted this task.
    pub fn producer_id(&self) -> &ExecutorId {
        &self.task_id.producer
    }

    /// The unit addressed by this task, if it is a corrective task.
    pub fn unit(&self) -> Option<&UnitName> {
        self.payload.unit()
    }

    /// Validate the structural invariants of this task.
    pub fn validate(&self) -> Result<()> {
        match (&self.payload, &self.source_task_id) {
            (payload, None) if payload.is_terminal() => {
                bail!(AppError::InvalidInput(format!("terminal report {} is missing its source task ID", self.task_id)))
            }
            (_, Some(source)) if source == &self.task_id => {
                bail!(AppError::InvalidInput(format!("task {} references itself as its source", self.task_id)))
            }
            _ => Ok(()),
        }
    }
}

/// A snapshot of one executor's observed configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskExecutorState {
    /// The executor which reported this snapshot.
    pub executor_id: ExecutorId,
    /// The units currently installed on the executor.
    #[serde(default)]
    pub units: Units,
    /// The most recent task applied by the executor, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_task_id: Option<TaskId>,
    /// The executor's logical time when this snapshot was taken.
    pub timestamp: u64,
}

impl TaskExecutorState {
    /// Check if this snapshot is older than the given stored snapshot of the same executor.
    ///
    /// The last applied task decides when both snapshots carry comparable task IDs. When the
    /// IDs are equal or not comparable, the reporting timestamp decides.
    pub fn regresses_from(&self, stored: &TaskExecutorState) -> bool {
        let by_task = match (&self.last_task_id, &stored.last_task_id) {
            (None, Some(_)) => return true,
            (Some(_), None) => return false,
            (Some(new), Some(old)) => new.causal_cmp(old),
            (None, None) => None,
        };
        match by_task {
            Some(Ordering::Less) => true,
            Some(Ordering::Greater) => false,
            Some(Ordering::Equal) | None => self.timestamp < stored.timestamp,
        }
    }
}
