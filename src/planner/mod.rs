//! Reconciliation planner.
//!
//! The planner continuously compares the desired units of every managed executor against the
//! state those executors report, and appends corrective tasks to the task stream to close the
//! gap. It runs as a single controller task, and all planner state is owned by that task.
//!
//! ## Cycles
//! Each wake-up runs one cycle. A cycle reads new entries from both streams, applies them to a
//! staged copy of the planner state, then, if this planner holds the task stream's writer lease,
//! plans and appends corrective tasks. The staged state is committed as a checkpoint and swapped
//! in only once everything else has succeeded, so an aborted cycle leaves the cursors where they
//! were. Tasks which were appended by a cycle which then aborted are read back from the task
//! stream by the next cycle and tracked as in flight, so they are never planned twice.

mod checkpoint;
mod plan;
mod tracker;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream, WatchStream};

use crate::clock::CurrentTimeProvider;
use crate::config::Config;
use crate::error::ShutdownError;
use crate::models::{ExecutorId, Task, TaskExecutorState, Units};
use crate::streams::{FencedProducer, LeaderState, StreamConsumer, WriterLease};

pub use checkpoint::{Checkpoint, CheckpointStore, SledCheckpointStore};
pub use plan::plan;
pub use tracker::PlannerState;

const METRIC_CYCLES: &str = "servicegrid_planner_cycles";
const METRIC_CYCLES_ABORTED: &str = "servicegrid_planner_cycles_aborted";
const METRIC_TASKS_PLANNED: &str = "servicegrid_planner_tasks_planned";
const METRIC_STALE_SNAPSHOTS: &str = "servicegrid_planner_stale_snapshots";
const METRIC_FAILURE_REPORTS: &str = "servicegrid_planner_failure_reports";
const METRIC_IN_FLIGHT_TASKS: &str = "servicegrid_planner_in_flight_tasks";
const METRIC_KNOWN_EXECUTORS: &str = "servicegrid_planner_known_executors";
const METRIC_IS_LEADER: &str = "servicegrid_planner_is_leader";

const ERR_PLANNER_CLOSED: &str = "planner is no longer running";

/// Tuning values of a planner.
#[derive(Clone, Debug)]
pub struct PlannerSettings {
    /// The interval at which the planner wakes up without new stream data.
    pub tick_interval: Duration,
    /// The number of clock ticks a failed delta must wait before it is planned again.
    pub failure_backoff_ticks: u64,
    /// The number of clock ticks for which the writer lease is held once acquired.
    pub lease_duration_ticks: u64,
    /// The max number of records consumed from each stream per cycle.
    pub max_batch_size: usize,
}

impl From<&Config> for PlannerSettings {
    fn from(config: &Config) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            failure_backoff_ticks: config.failure_backoff_ticks,
            lease_duration_ticks: config.lease_duration_ticks,
            max_batch_size: config.max_batch_size,
        }
    }
}

/// The collaborators & identity of a planner, fixed for the planner's lifetime.
#[derive(Clone)]
pub struct PlannerParams {
    /// The identity of this planner, used as the producer of all tasks it emits.
    pub planner_executor_id: ExecutorId,
    /// The task stream, as consumed by the planner.
    pub task_consumer: Arc<dyn StreamConsumer<Task>>,
    /// The task stream, as appended to by the planner while it holds the writer lease.
    pub task_producer: Arc<dyn FencedProducer<Task>>,
    /// The executor state stream.
    pub state_consumer: Arc<dyn StreamConsumer<TaskExecutorState>>,
    /// The planner's logical clock.
    pub time_provider: Arc<dyn CurrentTimeProvider>,
    /// The task stream's writer lease.
    pub writer_lease: Arc<dyn WriterLease>,
    /// Durable storage for the planner's checkpoints.
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub settings: PlannerSettings,
}

/// The classified result of a single planner cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing was consumed, planned or changed.
    Idle,
    /// New stream entries or desired state were applied, but no tasks were planned.
    Consumed,
    /// The given number of tasks were appended to the task stream.
    Planned(usize),
    /// The cycle hit a transient error and was discarded; it will be retried.
    Aborted,
}

/// A message bound for a planner controller.
pub enum PlannerCtlMsg {
    SetDesiredState { executor_id: ExecutorId, units: Units },
    RemoveDesiredState { executor_id: ExecutorId },
    GetState { tx: oneshot::Sender<PlannerState> },
}

/// A handle to a running planner.
#[derive(Clone)]
pub struct PlannerHandle {
    tx: mpsc::Sender<PlannerCtlMsg>,
}

impl PlannerHandle {
    /// Set the desired units of the given executor, placing it under management.
    pub async fn set_desired_state(&self, executor_id: ExecutorId, units: Units) -> Result<()> {
        self.send(PlannerCtlMsg::SetDesiredState { executor_id, units }).await
    }

    /// Stop managing the given executor.
    pub async fn remove_desired_state(&self, executor_id: ExecutorId) -> Result<()> {
        self.send(PlannerCtlMsg::RemoveDesiredState { executor_id }).await
    }

    /// Fetch a copy of the planner's committed state.
    pub async fn state(&self) -> Result<PlannerState> {
        let (tx, rx) = oneshot::channel();
        self.send(PlannerCtlMsg::GetState { tx }).await?;
        rx.await.map_err(|_| anyhow!(ERR_PLANNER_CLOSED))
    }

    async fn send(&self, msg: PlannerCtlMsg) -> Result<()> {
        self.tx.send(msg).await.map_err(|_| anyhow!(ERR_PLANNER_CLOSED))
    }
}

/// A controller encapsulating the planner's consumption & emission loop.
pub struct PlannerCtl {
    params: PlannerParams,
    /// The planner's committed state.
    state: PlannerState,
    /// The last observed state of the writer lease.
    leader_state: LeaderState,
    /// Set when the desired state changed since the last committed checkpoint.
    dirty: bool,
    /// Set when a committed cycle consumed a full batch, so another cycle should run right away.
    follow_up: bool,

    /// A channel of inbound messages from planner handles.
    msg_rx: ReceiverStream<PlannerCtlMsg>,
    /// A signal of new task stream data.
    task_signal: WatchStream<u64>,
    /// A signal of new executor state stream data.
    state_signal: WatchStream<u64>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl PlannerCtl {
    /// Create a new instance, recovering state from the last committed checkpoint.
    pub async fn new(params: PlannerParams, shutdown_tx: broadcast::Sender<()>) -> Result<(Self, PlannerHandle)> {
        let state = params.checkpoints.load().await?.map(PlannerState::from).unwrap_or_default();
        tracing::debug!(
            task_cursor = state.task_cursor,
            state_cursor = state.state_cursor,
            in_flight = state.in_flight.len(),
            "recovered planner state"
        );

        metrics::register_counter!(METRIC_CYCLES, metrics::Unit::Count, "planner cycles which ran to completion");
        metrics::register_counter!(METRIC_CYCLES_ABORTED, metrics::Unit::Count, "planner cycles aborted due to transient errors");
        metrics::register_counter!(METRIC_TASKS_PLANNED, metrics::Unit::Count, "corrective tasks appended to the task stream");
        metrics::register_counter!(METRIC_STALE_SNAPSHOTS, metrics::Unit::Count, "executor snapshots rejected as stale");
        metrics::register_counter!(METRIC_FAILURE_REPORTS, metrics::Unit::Count, "task failure reports consumed");
        metrics::register_gauge!(METRIC_IN_FLIGHT_TASKS, metrics::Unit::Count, "corrective tasks currently in flight");
        metrics::register_gauge!(METRIC_KNOWN_EXECUTORS, metrics::Unit::Count, "executors which have reported state");
        metrics::register_gauge!(METRIC_IS_LEADER, metrics::Unit::Count, "1 if this planner holds the task stream writer lease");
        metrics::gauge!(METRIC_IN_FLIGHT_TASKS, state.in_flight.len() as f64);
        metrics::gauge!(METRIC_KNOWN_EXECUTORS, state.actual.len() as f64);
        metrics::gauge!(METRIC_IS_LEADER, 0.0);

        let (tx, rx) = mpsc::channel(100);
        let task_signal = WatchStream::new(params.task_consumer.offset_signal());
        let state_signal = WatchStream::new(params.state_consumer.offset_signal());
        Ok((
            Self {
                params,
                state,
                leader_state: LeaderState::Standby,
                dirty: false,
                follow_up: false,
                msg_rx: ReceiverStream::new(rx),
                task_signal,
                state_signal,
                shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
                shutdown_tx,
            },
            PlannerHandle { tx },
        ))
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!(planner = %self.params.planner_executor_id, "planner controller has started");

        let mut ticker = tokio::time::interval(self.params.settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_rx.next() => break,
                Some(msg) = self.msg_rx.next() => {
                    if !self.handle_ctl_msg(msg) {
                        continue;
                    }
                }
                _ = futures::future::ready(()), if self.follow_up => (),
                Some(_) = self.task_signal.next() => (),
                Some(_) = self.state_signal.next() => (),
                _ = ticker.tick() => (),
            }
            if let Err(err) = self.run_cycle().await {
                let invariant_violation = err
                    .downcast_ref::<ShutdownError>()
                    .map(ShutdownError::is_invariant_violation)
                    .unwrap_or(false);
                tracing::error!(error = ?err, invariant_violation, "fatal error in planner cycle, shutting down");
                let _ = self.shutdown_tx.send(());
                break;
            }
        }

        metrics::gauge!(METRIC_IS_LEADER, 0.0);
        tracing::debug!(planner = %self.params.planner_executor_id, "planner controller has shutdown");
        Ok(())
    }

    /// Handle a planner controller message, returning `true` if a cycle should run.
    #[tracing::instrument(level = "trace", skip(self, msg))]
    fn handle_ctl_msg(&mut self, msg: PlannerCtlMsg) -> bool {
        match msg {
            PlannerCtlMsg::SetDesiredState { executor_id, units } => {
                self.set_desired_state(executor_id, units);
                true
            }
            PlannerCtlMsg::RemoveDesiredState { executor_id } => self.remove_desired_state(&executor_id),
            PlannerCtlMsg::GetState { tx } => {
                let _ = tx.send(self.state.clone());
                false
            }
        }
    }

    fn set_desired_state(&mut self, executor_id: ExecutorId, units: Units) {
        tracing::debug!(%executor_id, units = units.len(), "desired state updated");
        self.state.set_desired(executor_id, units);
        self.dirty = true;
    }

    fn remove_desired_state(&mut self, executor_id: &ExecutorId) -> bool {
        let removed = self.state.remove_desired(executor_id);
        if removed {
            tracing::debug!(%executor_id, "executor removed from management");
            self.dirty = true;
        }
        removed
    }

    /// Run a single planner cycle.
    ///
    /// Transient errors abort the cycle and are reported as `CycleOutcome::Aborted`. Any error
    /// returned is fatal for this planner.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn run_cycle(&mut self) -> Result<CycleOutcome> {
        let now = self.params.time_provider.current_time();
        let max = self.params.settings.max_batch_size;
        self.follow_up = false;

        // Consume new entries from both streams into a staged copy of our state.
        let tasks = match self.params.task_consumer.read(self.state.task_cursor, max).await {
            Ok(tasks) => tasks,
            Err(err) => return self.abort_cycle(err, "error reading task stream"),
        };
        let states = match self.params.state_consumer.read(self.state.state_cursor, max).await {
            Ok(states) => states,
            Err(err) => return self.abort_cycle(err, "error reading executor state stream"),
        };
        let full_batch = tasks.len() >= max || states.len() >= max;
        let mut staged = self.state.clone();
        let summary = staged.apply_batch(&self.params.planner_executor_id, tasks, states, now)?;

        // Only the writer lease holder plans, and only once caught up with the task stream so
        // that none of its own earlier tasks are missed.
        let leader_state = match self
            .params
            .writer_lease
            .acquire_or_renew(&self.params.planner_executor_id, now, self.params.settings.lease_duration_ticks)
            .await
        {
            Ok(leader_state) => leader_state,
            Err(err) => return self.abort_cycle(err, "error acquiring writer lease"),
        };
        self.observe_leader_state(leader_state);
        let mut planned = 0;
        if self.leader_state == LeaderState::Leading && !full_batch {
            let batch = plan(&staged, &self.params.planner_executor_id, now, self.params.settings.failure_backoff_ticks);
            if !batch.is_empty() {
                // The append is fenced by the lease as of the time of the write itself.
                let append_at = self.params.time_provider.current_time();
                let append_res = self
                    .params
                    .task_producer
                    .append_fenced(&self.params.planner_executor_id, append_at, batch.clone())
                    .await;
                if let Err(err) = append_res {
                    return self.abort_cycle(err, "error appending planned tasks");
                }
                staged.record_appended(&batch)?;
                planned = batch.len();
                tracing::debug!(planned, "appended corrective tasks");
            }
        }

        if summary.is_empty() && planned == 0 && !self.dirty {
            return Ok(CycleOutcome::Idle);
        }

        // Commit, then swap in the staged state.
        if let Err(err) = self.params.checkpoints.commit(Checkpoint::from(&staged)).await {
            return self.abort_cycle(err, "error committing planner checkpoint");
        }
        self.state = staged;
        self.dirty = false;
        self.follow_up = full_batch;

        metrics::increment_counter!(METRIC_CYCLES);
        metrics::counter!(METRIC_TASKS_PLANNED, planned as u64);
        metrics::counter!(METRIC_STALE_SNAPSHOTS, summary.stale_snapshots as u64);
        metrics::counter!(METRIC_FAILURE_REPORTS, summary.failure_reports as u64);
        metrics::gauge!(METRIC_IN_FLIGHT_TASKS, self.state.in_flight.len() as f64);
        metrics::gauge!(METRIC_KNOWN_EXECUTORS, self.state.actual.len() as f64);

        if planned > 0 {
            Ok(CycleOutcome::Planned(planned))
        } else {
            Ok(CycleOutcome::Consumed)
        }
    }

    /// Abort the current cycle, escalating the given error if it requires shutdown.
    fn abort_cycle(&self, err: anyhow::Error, msg: &str) -> Result<CycleOutcome> {
        if err.downcast_ref::<ShutdownError>().is_some() {
            return Err(err.context(msg.to_string()));
        }
        tracing::warn!(error = ?err, "{}, aborting cycle", msg);
        metrics::increment_counter!(METRIC_CYCLES_ABORTED);
        Ok(CycleOutcome::Aborted)
    }

    fn observe_leader_state(&mut self, leader_state: LeaderState) {
        if leader_state == self.leader_state {
            return;
        }
        match &leader_state {
            LeaderState::Leading => tracing::info!(planner = %self.params.planner_executor_id, "acquired task stream writer lease"),
            LeaderState::Following(holder) => tracing::info!(%holder, "following task stream writer lease holder"),
            LeaderState::Standby => (),
        }
        let is_leader = if leader_state == LeaderState::Leading { 1.0 } else { 0.0 };
        metrics::gauge!(METRIC_IS_LEADER, is_leader);
        self.leader_state = leader_state;
    }
}
