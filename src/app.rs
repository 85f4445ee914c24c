use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::clock::SystemClock;
use crate::config::Config;
use crate::database::Database;
use crate::models::{Task, TaskExecutorState};
use crate::planner::{PlannerCtl, PlannerHandle, PlannerParams, PlannerSettings, SledCheckpointStore};
use crate::server::spawn_http_server;
use crate::streams::SledStream;

/// The application object for when the planner is running as a server.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The application's database system.
    _db: Database,
    /// A handle to the running planner.
    _planner: PlannerHandle,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the planner controller.
    planner_handle: JoinHandle<Result<()>>,
    /// The join handle of the HTTP server.
    http_server: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>, metrics: PrometheusHandle) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(10);

        // Initialize this node's storage.
        let db = Database::new(config.clone()).await.context("error opening database")?;
        let tasks: Arc<SledStream<Task>> = Arc::new(
            SledStream::new(db.get_tasks_tree().await?)
                .await
                .context("error opening task stream")?,
        );
        let states: Arc<SledStream<TaskExecutorState>> = Arc::new(
            SledStream::new(db.get_executor_states_tree().await?)
                .await
                .context("error opening executor state stream")?,
        );
        let metadata = db.get_planner_metadata_tree().await?;

        // Spawn the planner.
        let params = PlannerParams {
            planner_executor_id: config.planner_executor_id.clone(),
            task_consumer: tasks.clone(),
            task_producer: tasks.clone(),
            state_consumer: states,
            time_provider: Arc::new(SystemClock::new()),
            writer_lease: Arc::new(tasks.writer_lease()),
            checkpoints: Arc::new(SledCheckpointStore::new(metadata, &config.planner_executor_id)),
            settings: PlannerSettings::from(config.as_ref()),
        };
        let (planner_ctl, planner) = PlannerCtl::new(params, shutdown_tx.clone())
            .await
            .context("error spawning planner controller")?;
        let planner_handle = planner_ctl.spawn();

        // Seed the desired state, if a document was given.
        if let Some(desired) = config.load_desired_state().await? {
            tracing::info!(executors = desired.len(), "seeding desired state");
            for (executor_id, units) in desired {
                planner.set_desired_state(executor_id, units).await?;
            }
        }

        let http_server = spawn_http_server(&config, metrics, planner.clone(), shutdown_tx.subscribe());

        Ok(Self {
            _config: config,
            _db: db,
            _planner: planner,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            planner_handle,
            http_server,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("planner is shutting down");
        if let Err(err) = self.planner_handle.await.context("error joining planner controller handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down planner controller");
        }
        if let Err(err) = self.http_server.await.context("error joining http server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down http server");
        }

        tracing::debug!("planner shutdown complete");
        Ok(())
    }
}
