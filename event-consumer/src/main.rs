//! Consume events from Kafka, committing each offset once it was handled.
use std::sync::Arc;

use envconfig::Envconfig;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use consumer_common::metrics::{metrics_router, serve, setup_metrics_recorder};
use consumer_common::probes::probes_router;
use event_consumer::config::Config;
use event_consumer::error::ConsumerError;
use event_consumer::handler::LogHandler;
use event_consumer::kafka::{EventConsumer, KafkaBroker};

#[tokio::main]
async fn main() -> Result<(), ConsumerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::init_from_env().expect("Invalid configuration:");
    let consumer_config = config.consumer_config();

    let recorder_handle = setup_metrics_recorder().expect("failed to install metrics recorder");

    let (broker, events) = KafkaBroker::new(&consumer_config)?;
    let consumer = EventConsumer::new(consumer_config, Arc::new(broker), events);

    // Probes answer while connecting, readiness flips once the broker is ready
    let bind = config.bind();
    let router = metrics_router(recorder_handle).merge(probes_router(consumer.readiness_probe()));
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let handle = consumer.connect(Arc::new(LogHandler)).await?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutting down consumer");

    handle.shutdown().await
}
