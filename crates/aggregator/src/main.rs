//! Adaptive metrics aggregation service
//!
//! Ingests Prometheus-style samples, aggregates them according to
//! user-defined rules, tracks per-metric cardinality, and forwards
//! aggregated series to remote-write endpoints.

use aggregator_lib::MetricsService;
use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting aggregator");

    let app_config = config::AppConfig::load()?;
    let (service, mut output_rx) = MetricsService::new(app_config.service_config())?;
    let service = Arc::new(service);

    service.start().await;

    // Drain the in-process output stream; embedders would consume this
    // directly instead
    tokio::spawn(async move {
        while let Some(metric) = output_rx.recv().await {
            info!(
                metric = %metric.name,
                value = metric.value,
                samples = metric.sample_count,
                rule_id = %metric.source_rule,
                "Aggregated metric emitted"
            );
        }
    });

    let state = Arc::new(api::AppState::new(Arc::clone(&service)));
    let api_handle = tokio::spawn(api::serve(app_config.port, state));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    service.stop().await;
    api_handle.abort();
    if let Err(e) = api_handle.await {
        if !e.is_cancelled() {
            warn!(error = %e, "API server task failed");
        }
    }

    Ok(())
}
