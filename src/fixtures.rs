use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::broadcast;

use crate::clock::ManualClock;
use crate::config::Config;
use crate::database::Database;
use crate::error::AppError;
use crate::models::{ExecutorId, Task, TaskExecutorState, TaskId, TaskPayload, UnitName, UnitVersion, Units};
use crate::planner::{Checkpoint, CheckpointStore, PlannerCtl, PlannerHandle, PlannerParams, PlannerSettings, SledCheckpointStore};
use crate::streams::{FencedProducer, LeaderState, SledStream, SledWriterLease, StreamConsumer, StreamProducer, WriterLease};

/// Build an executor ID, panicking if it is invalid.
pub fn executor(id: &str) -> ExecutorId {
    ExecutorId::new(id).expect("invalid test executor ID")
}

/// Build a unit set from the given `(name, version)` pairs.
pub fn units(pairs: &[(&str, &str)]) -> Units {
    pairs.iter().map(|(name, version)| (UnitName::from(*name), UnitVersion::from(*version))).collect()
}

/// Build a corrective task with a predictable ID.
pub fn corrective_task(producer: &ExecutorId, executor_id: &ExecutorId, issued_at: u64, seq: u32, payload: TaskPayload) -> Task {
    Task {
        task_id: TaskId {
            producer: producer.clone(),
            issued_at,
            cursor: 0,
            seq,
        },
        executor_id: executor_id.clone(),
        producer_timestamp: issued_at,
        source_task_id: None,
        payload,
    }
}

/// Build a terminal report on the given task.
pub fn report(source: &Task, issued_at: u64, payload: TaskPayload) -> Task {
    Task {
        task_id: TaskId {
            producer: source.executor_id.clone(),
            issued_at,
            cursor: 0,
            seq: 0,
        },
        executor_id: source.executor_id.clone(),
        producer_timestamp: issued_at,
        source_task_id: Some(source.task_id.clone()),
        payload,
    }
}

/// Build an executor snapshot.
pub fn snapshot(executor_id: &ExecutorId, units: Units, last_task_id: Option<TaskId>, timestamp: u64) -> TaskExecutorState {
    TaskExecutorState {
        executor_id: executor_id.clone(),
        units,
        last_task_id,
        timestamp,
    }
}

/// A full set of planner collaborators backed by a temporary database.
pub struct TestGrid {
    pub config: Arc<Config>,
    pub db: Database,
    pub tasks: Arc<SledStream<Task>>,
    pub states: Arc<SledStream<TaskExecutorState>>,
    pub lease: Arc<SledWriterLease>,
    pub clock: Arc<ManualClock>,
    pub shutdown_tx: broadcast::Sender<()>,
    _tmpdir: tempfile::TempDir,
}

impl TestGrid {
    pub async fn new() -> Result<Self> {
        let (config, tmpdir) = Config::new_test()?;
        let db = Database::new(config.clone()).await?;
        let tasks = Arc::new(SledStream::new(db.get_tasks_tree().await?).await?);
        let states = Arc::new(SledStream::new(db.get_executor_states_tree().await?).await?);
        let lease = Arc::new(tasks.writer_lease());
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            config,
            db,
            tasks,
            states,
            lease,
            clock: Arc::new(ManualClock::new(1_000)),
            shutdown_tx,
            _tmpdir: tmpdir,
        })
    }

    /// A checkpoint store for the given planner.
    pub async fn checkpoints(&self, planner_id: &ExecutorId) -> Result<Arc<SledCheckpointStore>> {
        Ok(Arc::new(SledCheckpointStore::new(self.db.get_planner_metadata_tree().await?, planner_id)))
    }

    /// Planner params wired to this grid.
    pub async fn params(&self, planner_id: &ExecutorId) -> Result<PlannerParams> {
        Ok(PlannerParams {
            planner_executor_id: planner_id.clone(),
            task_consumer: self.tasks.clone(),
            task_producer: self.tasks.clone(),
            state_consumer: self.states.clone(),
            time_provider: self.clock.clone(),
            writer_lease: self.lease.clone(),
            checkpoints: self.checkpoints(planner_id).await?,
            settings: PlannerSettings::from(self.config.as_ref()),
        })
    }

    /// Build a planner controller from the given params.
    pub async fn planner(&self, params: PlannerParams) -> Result<(PlannerCtl, PlannerHandle)> {
        PlannerCtl::new(params, self.shutdown_tx.clone()).await
    }

    /// Read every task in the task stream.
    pub async fn all_tasks(&self) -> Result<Vec<Task>> {
        let entries = self.tasks.read(0, usize::MAX).await?;
        Ok(entries.into_iter().map(|entry| entry.record).collect())
    }

    /// Read every corrective task in the task stream.
    pub async fn corrective_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.all_tasks().await?.into_iter().filter(|task| !task.payload.is_terminal()).collect())
    }

    /// Append a single snapshot to the executor state stream.
    pub async fn report_state(&self, snapshot: TaskExecutorState) -> Result<()> {
        self.states.append(vec![snapshot]).await?;
        Ok(())
    }
}

/// An executor which applies the corrective tasks addressed to it, reporting its state.
pub struct SimulatedExecutor {
    pub id: ExecutorId,
    pub units: Units,
    pub last_task_id: Option<TaskId>,
    cursor: u64,
}

impl SimulatedExecutor {
    pub fn new(id: ExecutorId, units: Units) -> Self {
        Self {
            id,
            units,
            last_task_id: None,
            cursor: 0,
        }
    }

    /// Report the executor's current state.
    pub async fn report(&self, grid: &TestGrid, now: u64) -> Result<()> {
        grid.report_state(snapshot(&self.id, self.units.clone(), self.last_task_id.clone(), now)).await
    }

    /// Apply every new task addressed to this executor, reporting completion & state.
    ///
    /// Returns the number of tasks applied.
    pub async fn process(&mut self, grid: &TestGrid, now: u64) -> Result<usize> {
        self.handle_tasks(grid, now, None).await
    }

    /// Reject every new task addressed to this executor with the given reason.
    pub async fn reject(&mut self, grid: &TestGrid, now: u64, reason: &str) -> Result<usize> {
        self.handle_tasks(grid, now, Some(reason)).await
    }

    async fn handle_tasks(&mut self, grid: &TestGrid, now: u64, reject: Option<&str>) -> Result<usize> {
        let entries = grid.tasks.read(self.cursor, usize::MAX).await?;
        let mut reports = vec![];
        for entry in entries {
            self.cursor = entry.offset + 1;
            let task = entry.record;
            if task.executor_id != self.id || task.payload.is_terminal() {
                continue;
            }
            let payload = match reject {
                Some(reason) => TaskPayload::Failed { reason: reason.into() },
                None => {
                    self.apply(&task.payload);
                    self.last_task_id = Some(task.task_id.clone());
                    TaskPayload::Completed
                }
            };
            let mut report = report(&task, now, payload);
            report.task_id.cursor = entry.offset;
            reports.push(report);
        }

        let count = reports.len();
        if count == 0 {
            return Ok(0);
        }
        grid.tasks.append(reports).await?;
        if reject.is_none() {
            self.report(grid, now).await?;
        }
        Ok(count)
    }

    fn apply(&mut self, payload: &TaskPayload) {
        match payload {
            TaskPayload::Install { unit, version } => {
                self.units.insert(unit.clone(), version.clone());
            }
            TaskPayload::Update { unit, to, .. } => {
                self.units.insert(unit.clone(), to.clone());
            }
            TaskPayload::Uninstall { unit, .. } => {
                self.units.remove(unit);
            }
            TaskPayload::Completed | TaskPayload::Failed { .. } => (),
        }
    }
}

/// A task producer which fails a configured number of appends before delegating.
pub struct FlakyProducer {
    inner: Arc<SledStream<Task>>,
    failures: AtomicUsize,
    pub attempts: AtomicUsize,
}

impl FlakyProducer {
    pub fn new(inner: Arc<SledStream<Task>>, failures: usize) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
        }
    }
}

impl FencedProducer<Task> for FlakyProducer {
    fn append_fenced<'a>(&'a self, holder: &'a ExecutorId, now: u64, batch: Vec<Task>) -> BoxFuture<'a, Result<u64>> {
        async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let should_fail = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |val| val.checked_sub(1))
                .is_ok();
            if should_fail {
                bail!(AppError::StreamUnavailable("simulated append failure".into()));
            }
            self.inner.append_fenced(holder, now, batch).await
        }
        .boxed()
    }
}

/// A writer lease which reports leadership without recording it, or fails when told to.
pub struct StubLease {
    pub fail: AtomicBool,
}

impl StubLease {
    pub fn new() -> Self {
        Self { fail: AtomicBool::new(false) }
    }
}

impl WriterLease for StubLease {
    fn acquire_or_renew<'a>(&'a self, _identity: &'a ExecutorId, _now: u64, _duration: u64) -> BoxFuture<'a, Result<LeaderState>> {
        async move {
            if self.fail.load(Ordering::SeqCst) {
                bail!(AppError::StreamUnavailable("simulated lease failure".into()));
            }
            Ok(LeaderState::Leading)
        }
        .boxed()
    }
}

/// A checkpoint store which can be made to fail commits.
pub struct FlakyCheckpoints {
    inner: Arc<SledCheckpointStore>,
    pub fail_commits: AtomicBool,
}

impl FlakyCheckpoints {
    pub fn new(inner: Arc<SledCheckpointStore>) -> Self {
        Self {
            inner,
            fail_commits: AtomicBool::new(false),
        }
    }
}

impl CheckpointStore for FlakyCheckpoints {
    fn load(&self) -> BoxFuture<'_, Result<Option<Checkpoint>>> {
        self.inner.load()
    }

    fn commit(&self, checkpoint: Checkpoint) -> BoxFuture<'_, Result<()>> {
        async move {
            if self.fail_commits.load(Ordering::SeqCst) {
                bail!(AppError::StreamUnavailable("simulated checkpoint failure".into()));
            }
            self.inner.commit(checkpoint).await
        }
        .boxed()
    }
}
