use anyhow::{Context, Result};
use friendlink_streams::api::{start_api_server, AppState};
use friendlink_streams::cleanup::{CleanupDispatcher, LinkCleanupService, LinkRepository, ObjectStore};
use friendlink_streams::config::Config;
use friendlink_streams::router::EventRouter;
use friendlink_streams::worker::WorkerSettings;
use friendlink_pipeline::EventConsumer;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Friendlink Streams Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let links = LinkRepository::connect(&config.database)
        .await
        .context("Failed to initialize link repository")?;

    if config.database.run_migrations {
        links
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let objects = ObjectStore::new(&config.s3).await;
    let cleanup = Arc::new(LinkCleanupService::new(links, objects));

    let (dispatcher, _dispatcher_handle) = CleanupDispatcher::start(
        cleanup,
        config.processing.cleanup_queue_capacity,
        config.processing.cleanup_concurrency,
    );

    std::fs::create_dir_all(&config.state.dir).with_context(|| {
        format!(
            "Failed to create state directory {}",
            config.state.dir.display()
        )
    })?;

    let router = Arc::new(EventRouter::new(
        config.kafka.topics.clone(),
        config.state.dir.clone(),
        WorkerSettings::from(&config.processing),
        dispatcher,
        CancellationToken::new(),
    ));

    let consumer = Arc::new(
        EventConsumer::new(config.kafka.clone()).context("Failed to create Kafka consumer")?,
    );
    consumer
        .subscribe_events()
        .context("Failed to subscribe to event topics")?;

    // Spawn Kafka consumer task
    let consumer_handle = {
        let consumer = consumer.clone();
        let router = router.clone();
        tokio::spawn(async move { consumer.run(router).await })
    };

    // Spawn API server task
    let api_cancel = CancellationToken::new();
    let api_handle = {
        let state = AppState {
            router: router.clone(),
        };
        let api_config = config.api.clone();
        let shutdown = api_cancel.clone().cancelled_owned();
        tokio::spawn(async move {
            if let Err(e) = start_api_server(state, &api_config, shutdown).await {
                error!(error = %e, "API server error");
            }
        })
    };

    info!("Streams service started successfully");

    let mut consumer_handle = consumer_handle;
    let finished = tokio::select! {
        _ = shutdown_signal() => None,
        _ = router.failed() => {
            error!("A partition worker failed, stopping the consumer");
            None
        }
        result = &mut consumer_handle => Some(result),
    };
    let consumer_result = match finished {
        Some(result) => result,
        None => {
            info!("Shutting down streams service");
            consumer.shutdown();
            consumer_handle.await
        }
    };

    let consumer_failed = match consumer_result {
        Ok(Ok(())) => false,
        Ok(Err(e)) => {
            error!(error = %e, "Kafka consumer stopped");
            true
        }
        Err(e) => {
            error!(error = %e, "Kafka consumer task failed");
            true
        }
    };

    // Workers apply outstanding cleanup reports and close their stores
    let workers_result = router.shutdown().await;

    api_cancel.cancel();
    if let Err(e) = api_handle.await {
        warn!(error = %e, "API server task failed");
    }

    workers_result.context("Partition workers failed to stop cleanly")?;
    if consumer_failed {
        anyhow::bail!("Kafka consumer stopped with an error");
    }

    info!("Streams service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
