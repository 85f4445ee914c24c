//! The service grid reconciliation planner.

mod app;
mod clock;
mod config;
mod database;
mod error;
#[cfg(test)]
mod fixtures;
mod models;
mod planner;
mod server;
mod streams;
mod utils;
#[cfg(test)]
mod utils_test;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::prelude::*;

use crate::app::App;
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(true)
                .with_level(true)
                .with_ansi(true),
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let cfg = Arc::new(Config::new()?);
    tracing::info!(
        rust_log = %cfg.rust_log,
        planner_executor_id = %cfg.planner_executor_id,
        http_port = %cfg.http_port,
        storage_data_path = %cfg.storage_data_path,
        tick_interval_ms = %cfg.tick_interval_ms,
        "starting service grid planner",
    );

    // Install the global metrics recorder, keeping a handle for rendering.
    let recorder = PrometheusBuilder::new()
        .add_global_label("planner", cfg.planner_executor_id.as_str())
        .build();
    let metrics = recorder.handle();
    metrics::set_boxed_recorder(Box::new(recorder)).context("error installing metrics recorder")?;

    match App::new(cfg, metrics).await {
        Ok(app) => match app.spawn().await {
            Ok(Err(err)) => tracing::error!(error = ?err),
            Err(err) => tracing::error!(error = ?err, "error joining app"),
            Ok(Ok(())) => (),
        },
        Err(err) => tracing::error!(error = ?err, "error starting planner"),
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}
