mod breaker;
mod config;
mod error;
mod ingest;
mod pipeline;
mod provider;
mod record;
mod retry;
mod scheduler;
mod sites;
mod store;
#[cfg(test)]
mod testing;
mod validate;

use crate::breaker::CircuitBreaker;
use crate::config::Config;
use crate::ingest::SiteIngestor;
use crate::pipeline::{spawn_worker, IngestStats};
use crate::provider::OpenWeatherClient;
use crate::retry::Jitter;
use crate::scheduler::Scheduler;
use crate::store::DocumentStore;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,aqi_ingest=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "aqi-ingest"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let projected_calls = config.projected_daily_calls();
    if config.exceeds_daily_quota() {
        tracing::warn!(
            projected_calls,
            quota = config.daily_call_quota,
            sites = config.sites.len(),
            interval_secs = config.fetch_interval_secs,
            "fetch cadence exceeds the provider's daily call quota; raise AQI_FETCH_INTERVAL_SECS"
        );
    }

    let store = DocumentStore::connect_lazy(
        &config.database_url,
        config.db_pool_size,
        &config.collection,
    )?;
    store
        .ping(config.startup_ping_timeout())
        .await
        .context("document store is unreachable at startup")?;
    store.ensure_collection().await?;
    tracing::info!(collection = %config.collection, "document store reachable");

    let stats = Arc::new(IngestStats::new());
    let (queue, rx) = pipeline::channel(config.queue_capacity, stats.clone());
    let worker_handle = spawn_worker(store.clone(), rx, stats.clone(), config.write_timeout());

    let http = reqwest::Client::builder()
        .user_agent(concat!("aqi-ingest/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")?;
    let provider = Arc::new(OpenWeatherClient::new(
        http,
        config.api_key.clone(),
        &config.base_url,
    ));
    let jitter = match config.jitter_seed {
        Some(seed) => Jitter::seeded(seed),
        None => Jitter::from_entropy(),
    };
    let ingestor = SiteIngestor::new(
        provider,
        Arc::new(CircuitBreaker::new(config.breaker_settings())),
        queue,
        config.retry_policy(),
        Arc::new(jitter),
        config.api_timeout(),
    );

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();
    let mut scheduler_handle = Scheduler::new(
        ingestor,
        config.sites.clone(),
        config.fetch_interval(),
        tracker.clone(),
    )
    .start(cancel.clone());

    tracing::info!(
        sites = config.sites.len(),
        interval_secs = config.fetch_interval_secs,
        projected_calls,
        queue_capacity = config.queue_capacity,
        "aqi-ingest started"
    );

    tokio::select! {
        res = &mut scheduler_handle => {
            if let Err(err) = res { tracing::error!(error=%err, "scheduler task failed"); }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    cancel.cancel();
    if !scheduler_handle.is_finished() {
        if let Err(err) = scheduler_handle.await {
            tracing::error!(error=%err, "scheduler task failed");
        }
    }

    tracker.close();
    let grace = config.shutdown_grace();
    if tokio::time::timeout(grace, tracker.wait()).await.is_err() {
        tracing::warn!(
            in_flight = tracker.len(),
            grace_secs = grace.as_secs(),
            "in-flight site units did not finish within the shutdown grace; abandoning them"
        );
    }

    // The last queue handles live in the scheduler and its units; once they
    // are gone the worker drains what is left and exits.
    match tokio::time::timeout(grace, worker_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::error!(error=%err, "sink worker failed"),
        Err(_) => tracing::warn!("sink worker did not drain within the shutdown grace"),
    }

    let snapshot = stats.snapshot();
    tracing::info!(
        records_enqueued = snapshot.records_enqueued,
        records_written = snapshot.records_written,
        last_write_unix_ms = snapshot.last_write_unix_ms,
        sink_failures = snapshot.sink_failures,
        site_successes = snapshot.site_successes,
        site_failures = snapshot.site_failures,
        units_shed = snapshot.units_shed,
        queue_depth = snapshot.queue_depth,
        last_error = snapshot.last_error.as_deref().unwrap_or(""),
        "aqi-ingest stopped"
    );
    store.close().await;

    Ok(())
}
