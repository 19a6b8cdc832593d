mod adapter;
mod capture;
mod config;
mod consumer;
mod engine;
mod evaluator;
mod executor;
mod http;
mod publisher;
mod rules;
mod scope;

#[cfg(test)]
mod testing;

use anyhow::Context;
use config::EngineConfigManager;
use consumer::{ConsumerSettings, JobConsumer};
use engine::EngineCatalog;
use executor::SnippetRunner;
use http::AppState;
use publisher::ResultPublisher;
use runlet_common::config::PipelineConfig;
use runlet_common::redis::RedisBackend;
use runlet_common::types::OperationKind;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    if std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false) {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Runlet worker booting...");

    let config = PipelineConfig::from_env().context("Invalid pipeline configuration")?;

    // Load engine configurations
    let engine_config = EngineConfigManager::load_default().map_err(|e| {
        error!("Failed to load engine configurations: {:#}", e);
        error!("Make sure config/engines.json exists or set ENGINE_CONFIG");
        e
    })?;
    info!("Loaded engines for: {:?}", engine_config.list_languages());

    // Connect to Redis
    let client = ::redis::Client::open(config.redis_url.as_str())?;
    let backend = Arc::new(RedisBackend::connect(&client).await?);
    info!("Connected to Redis: {}", config.redis_url);

    let cancel = CancellationToken::new();
    let catalog = EngineCatalog::from_config(&engine_config);
    info!("Runnable languages: {:?}", catalog.languages());
    let runner = SnippetRunner::new(backend.clone(), catalog);
    let publisher = ResultPublisher::new(backend.clone(), config.publish.clone(), cancel.clone());

    let mut consumers = Vec::new();
    for kind in OperationKind::STREAMED {
        let Some(settings) = ConsumerSettings::from_config(&config, kind) else {
            continue;
        };
        info!(
            kind = %kind,
            request = %settings.streams.request,
            result = %settings.streams.result,
            "Starting consumer"
        );

        // Blocking reads get their own connection.
        let reader = Arc::new(RedisBackend::connect(&client).await?);
        let consumer = Arc::new(JobConsumer::new(
            settings,
            reader,
            backend.clone(),
            backend.clone(),
            runner.clone(),
            publisher.clone(),
        ));
        consumers.push(tokio::spawn(consumer.run(cancel.clone())));
    }

    let state = Arc::new(AppState {
        runner,
        statuses: backend.clone(),
        status_scope: config.status_scope,
    });
    let app = http::routes(state);

    let listener = TcpListener::bind(config.http_addr.as_str())
        .await
        .with_context(|| format!("Failed to bind to {}", config.http_addr))?;
    info!("HTTP server listening on {}", config.http_addr);

    // Setup graceful shutdown
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => warn!("Received shutdown signal, draining consumers..."),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        shutdown.cancel();
    });

    let server_cancel = cancel.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_cancel.cancelled().await });
    if let Err(e) = server.await {
        error!(error = %e, "HTTP server failed");
        cancel.cancel();
    }

    for handle in consumers {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Consumer stopped with an error"),
            Err(e) => error!(error = %e, "Consumer task failed"),
        }
    }

    info!("Worker shutdown complete");
    Ok(())
}
