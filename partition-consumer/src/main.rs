use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use partition_consumer::config::{Config, LogFormat};
use partition_consumer::folders::InMemoryFolderService;
use partition_consumer::handlers::UserEventHandler;
use partition_consumer::kafka::{KafkaBrokerClient, PartitionConsumer};
use partition_consumer::server::{health_router, serve, setup_metrics_routes};

fn init_tracing(format: LogFormat) {
    let base_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true);

    let log_layer = match format {
        LogFormat::Plain => base_layer
            .with_filter(EnvFilter::from_default_env())
            .boxed(),
        LogFormat::Json => base_layer
            .json()
            .with_current_span(true)
            .with_filter(EnvFilter::from_default_env())
            .boxed(),
    };

    tracing_subscriber::registry().with(log_layer).init();
}

fn start_server(config: &Config) -> Result<JoinHandle<()>> {
    let router = setup_metrics_routes(health_router())?;
    let bind = config.bind_address();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!(error = ?e, "Metrics server stopped");
        }
    }))
}

async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    let mut term = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = term.recv() => info!("received SIGTERM"),
        _ = interrupt.recv() => info!("received SIGINT"),
    };
    Ok(())
}

fn cancel_on_signal(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(()) => {
                info!("Shutting down gracefully...");
                shutdown.cancel();
            }
            Err(e) => error!(error = ?e, "Failed to install signal handlers"),
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;

    init_tracing(config.log_format);
    info!("Starting partition consumer");
    info!("Configuration loaded: {:?}", config);

    let server_handle = start_server(&config)?;
    info!("Started metrics server on {}", config.bind_address());

    let client = KafkaBrokerClient::new(
        &config.to_client_config(),
        config.rebalance_ack_timeout(),
    )
    .context("Failed to create Kafka consumer")?;

    let folders = Arc::new(InMemoryFolderService::new());
    let handler = Arc::new(UserEventHandler::new(
        config.kafka_consumer_topic.clone(),
        folders,
    ));

    let consumer = PartitionConsumer::new(client, handler, config.to_dispatch_config())
        .with_context(|| format!("Failed to subscribe to {}", config.kafka_consumer_topic))?;
    cancel_on_signal(consumer.shutdown_token());

    // Blocks until shutdown, workers are drained before this returns
    let outcome = consumer.run().await;

    server_handle.abort();

    outcome.context("Partition consumer stopped on a fatal Kafka error")?;
    info!("Partition consumer exited");
    Ok(())
}
