//! The Corral cluster controller.

mod app;
mod config;
#[cfg(test)]
mod config_test;
mod coordination;
mod nodes;
mod rebalancer;
mod reporter;
mod server;

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
                .with_target(true)
                .with_level(true)
                .with_ansi(true)
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let cfg = Arc::new(Config::new()?);
    let recorder = PrometheusBuilder::new()
        .add_global_label("cluster", cfg.cluster_name.clone())
        .add_global_label("controller", cfg.controller_name.clone())
        .build();
    let metrics_handle = recorder.handle();
    metrics::set_boxed_recorder(Box::new(recorder)).context("error setting prometheus metrics recorder")?;

    tracing::info!(
        cluster = %cfg.cluster_name,
        controller = %cfg.controller_name,
        metrics_port = %cfg.metrics_port,
        storage_data_path = %cfg.storage_data_path,
        local_nodes = ?cfg.local_nodes,
        "starting Corral controller",
    );
    if let Err(err) = App::new(cfg, metrics_handle).await?.spawn().await {
        tracing::error!(error = ?err);
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}
