use anyhow::Result;
use axum::http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use axum::routing::{get, put};
use axum::{extract, AddExtensionLayer, Json, Router};
use futures::prelude::*;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::models::{ExecutorId, Units};
use crate::planner::{Checkpoint, PlannerHandle};

/// A request to set the desired units of an executor.
#[derive(Debug, Deserialize)]
pub struct SetDesiredStateRequest {
    pub executor_id: ExecutorId,
    pub units: Units,
}

/// A request to stop managing an executor.
#[derive(Debug, Deserialize)]
pub struct RemoveDesiredStateRequest {
    pub executor_id: ExecutorId,
}

/// The planner's committed state, as served over HTTP.
#[derive(Debug, Serialize)]
pub struct PlannerStateView {
    /// True if every managed executor's observed units match its desired units.
    pub converged: bool,
    #[serde(flatten)]
    pub state: Checkpoint,
}

/// Spawn the HTTP server, serving metrics along with the planner's desired state API.
pub fn spawn_http_server(
    config: &Config, metrics: PrometheusHandle, planner: PlannerHandle, mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<Result<()>> {
    let app = Router::new()
        .route("/metrics", get(prometheus_scrape))
        .route("/desired-state", put(set_desired_state).delete(remove_desired_state))
        .route("/state", get(planner_state))
        .layer(AddExtensionLayer::new(metrics))
        .layer(AddExtensionLayer::new(planner));
    let server = axum::Server::bind(&([0, 0, 0, 0], config.http_port).into())
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            let _res = shutdown.recv().await;
        });
    tracing::info!("http server is listening at 0.0.0.0:{}", config.http_port);
    tokio::spawn(server.map_err(anyhow::Error::from))
}

/// Render the current metrics in Prometheus exposition format.
async fn prometheus_scrape(extract::Extension(handle): extract::Extension<PrometheusHandle>) -> (StatusCode, HeaderMap, String) {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static("content-type"), HeaderValue::from_static("text/plain; version=0.0.4"));
    (StatusCode::OK, headers, handle.render())
}

#[tracing::instrument(level = "debug", skip(planner, payload))]
pub(crate) async fn set_desired_state(
    planner: extract::Extension<PlannerHandle>, payload: extract::Json<SetDesiredStateRequest>,
) -> std::result::Result<StatusCode, (StatusCode, String)> {
    let req = payload.0;
    planner.0.set_desired_state(req.executor_id, req.units).await.map_err(unavailable)?;
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(level = "debug", skip(planner, payload))]
pub(crate) async fn remove_desired_state(
    planner: extract::Extension<PlannerHandle>, payload: extract::Json<RemoveDesiredStateRequest>,
) -> std::result::Result<StatusCode, (StatusCode, String)> {
    planner.0.remove_desired_state(payload.0.executor_id).await.map_err(unavailable)?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn planner_state(
    planner: extract::Extension<PlannerHandle>,
) -> std::result::Result<Json<PlannerStateView>, (StatusCode, String)> {
    let state = planner.0.state().await.map_err(unavailable)?;
    Ok(Json(PlannerStateView {
        converged: state.is_converged(),
        state: Checkpoint::from(&state),
    }))
}

fn unavailable(err: anyhow::Error) -> (StatusCode, String) {
    tracing::error!(error = ?err, "error communicating with planner");
    (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
}
