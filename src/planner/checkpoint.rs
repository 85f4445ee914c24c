use std::collections::BTreeMap;

use anyhow::{Context, Result};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use sled::Tree;

use crate::database::Database;
use crate::error::{AppError, ShutdownError, ERR_DB_FLUSH};
use crate::models::{ExecutorId, Task, TaskExecutorState, UnitName, Units};
use crate::planner::tracker::PlannerState;
use crate::utils;

/// The key prefix under which planner checkpoints are stored, suffixed by the planner's ID.
const KEY_PREFIX_CHECKPOINT: &str = "checkpoint/";

/// The committed state of a planner, along with the stream cursors it was built from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub desired: BTreeMap<ExecutorId, Units>,
    pub actual: Vec<TaskExecutorState>,
    pub in_flight: Vec<Task>,
    #[serde(default)]
    pub awaiting_confirmation: Vec<Task>,
    pub failures: Vec<FailureRecord>,
    pub task_cursor: u64,
    pub state_cursor: u64,
}

/// A recorded failure of a delta.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub executor_id: ExecutorId,
    pub unit: UnitName,
    pub failed_at: u64,
}

impl From<&PlannerState> for Checkpoint {
    fn from(state: &PlannerState) -> Self {
        Self {
            desired: state.desired.clone(),
            actual: state.actual.values().cloned().collect(),
            in_flight: state.in_flight.values().cloned().collect(),
            awaiting_confirmation: state.awaiting_confirmation.values().cloned().collect(),
            failures: state
                .failures
                .iter()
                .map(|((executor_id, unit), failed_at)| FailureRecord {
                    executor_id: executor_id.clone(),
                    unit: unit.clone(),
                    failed_at: *failed_at,
                })
                .collect(),
            task_cursor: state.task_cursor,
            state_cursor: state.state_cursor,
        }
    }
}

impl From<Checkpoint> for PlannerState {
    fn from(checkpoint: Checkpoint) -> Self {
        Self {
            desired: checkpoint.desired,
            actual: checkpoint
                .actual
                .into_iter()
                .map(|snapshot| (snapshot.executor_id.clone(), snapshot))
                .collect(),
            in_flight: checkpoint.in_flight.into_iter().map(|task| (task.task_id.clone(), task)).collect(),
            awaiting_confirmation: checkpoint
                .awaiting_confirmation
                .into_iter()
                .map(|task| (task.task_id.clone(), task))
                .collect(),
            failures: checkpoint
                .failures
                .into_iter()
                .map(|record| ((record.executor_id, record.unit), record.failed_at))
                .collect(),
            task_cursor: checkpoint.task_cursor,
            state_cursor: checkpoint.state_cursor,
        }
    }
}

/// Durable storage for planner checkpoints.
pub trait CheckpointStore: Send + Sync {
    /// Load the last committed checkpoint, if any.
    fn load(&self) -> BoxFuture<'_, Result<Option<Checkpoint>>>;

    /// Durably commit the given checkpoint, replacing any previous one.
    fn commit(&self, checkpoint: Checkpoint) -> BoxFuture<'_, Result<()>>;
}

/// A checkpoint store backed by the planner metadata DB tree.
#[derive(Clone)]
pub struct SledCheckpointStore {
    tree: Tree,
    key: Vec<u8>,
}

impl SledCheckpointStore {
    /// Create a new instance storing the checkpoint of the given planner.
    pub fn new(tree: Tree, planner_id: &ExecutorId) -> Self {
        let key = format!("{}{}", KEY_PREFIX_CHECKPOINT, planner_id).into_bytes();
        Self { tree, key }
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn load_checkpoint(&self) -> Result<Option<Checkpoint>> {
        let (tree, key) = (self.tree.clone(), self.key.clone());
        Database::spawn_blocking(move || -> Result<Option<Checkpoint>> {
            let val = tree.get(&key).context("error fetching planner checkpoint")?;
            let checkpoint = val
                .map(|val| utils::decode_model::<Checkpoint>(&val).context("error decoding planner checkpoint, data corrupted"))
                .transpose()
                .map_err(ShutdownError::from)?;
            Ok(checkpoint)
        })
        .await?
    }

    #[tracing::instrument(
        level = "trace",
        skip(self, checkpoint),
        fields(task_cursor = checkpoint.task_cursor, state_cursor = checkpoint.state_cursor)
    )]
    async fn commit_checkpoint(&self, checkpoint: Checkpoint) -> Result<()> {
        let (tree, key) = (self.tree.clone(), self.key.clone());
        Database::spawn_blocking(move || -> Result<()> {
            let bytes = utils::encode_model(&checkpoint).context("error encoding planner checkpoint")?;
            tree.insert(key, bytes)
                .map_err(|err| AppError::StreamUnavailable(format!("error writing planner checkpoint: {}", err)))?;
            tree.flush()
                .map_err(|err| AppError::StreamUnavailable(format!("{}: {}", ERR_DB_FLUSH, err)))?;
            Ok(())
        })
        .await?
    }
}

impl CheckpointStore for SledCheckpointStore {
    fn load(&self) -> BoxFuture<'_, Result<Option<Checkpoint>>> {
        self.load_checkpoint().boxed()
    }

    fn commit(&self, checkpoint: Checkpoint) -> BoxFuture<'_, Result<()>> {
        self.commit_checkpoint(checkpoint).boxed()
    }
}
