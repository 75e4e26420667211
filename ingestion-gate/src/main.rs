use std::{sync::Arc, time::Duration};

use anyhow::{Context, Error};
use envconfig::Envconfig;
use ingestion_gate::{
    api,
    config::Config,
    context::AppContext,
    metrics::{serve, setup_metrics_routes},
    publish::{
        publish_channel, requeue_pending, KafkaQueue, PublishWorker, Publisher, Queue, StdoutQueue,
    },
    store::PgStore,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing(json: bool) {
    let (json_layer, plain_layer) = if json {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_filter(EnvFilter::from_default_env()),
            ),
            None,
        )
    } else {
        (
            None,
            Some(tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env())),
        )
    };

    tracing_subscriber::registry()
        .with(json_layer)
        .with(plain_layer)
        .init();
}

#[tokio::main]
pub async fn main() -> Result<(), Error> {
    let config = Config::init_from_env().context("failed to load configuration from env")?;
    setup_tracing(config.log_json);
    info!("Starting up...");

    let store = Arc::new(
        PgStore::connect(&config.database_url, config.max_pg_connections)
            .await
            .context("failed to connect to postgres")?,
    );
    store.ping().await.context("postgres is not answering")?;

    let mut kafka = None;
    let queue: Arc<dyn Queue> = match config.queue_sink.as_str() {
        "stdout" => Arc::new(StdoutQueue),
        "kafka" => {
            let producer =
                Arc::new(KafkaQueue::new(&config.kafka).context("failed to create kafka producer")?);
            kafka = Some(producer.clone());
            producer
        }
        other => anyhow::bail!("unknown queue sink: {other}"),
    };

    let publish_policy = config.publish_policy();
    let (sender, receiver) = publish_channel(config.publish_channel_capacity);
    let publisher = Publisher::new(store.clone(), queue, publish_policy.retry);
    let worker = PublishWorker::new(publisher, receiver, publish_policy.concurrency).spawn();

    // Nothing is admitted before this point, so every pending row is a leftover
    let requeued = requeue_pending(store.as_ref(), &sender, config.requeue_pending_limit).await?;
    info!(requeued, "startup requeue done");

    let context = Arc::new(AppContext::new(
        store.clone(),
        store.clone(),
        Some(sender),
        config.driver_policy(),
    ));

    let router = api::router(
        context.clone(),
        config.max_body_size,
        config.upload_concurrency,
    );
    let router = setup_metrics_routes(router).context("failed to install metrics recorder")?;
    let bind = config.bind();
    info!("listening on {}", bind);

    tokio::select! {
        res = serve(router, &bind) => res.context("server stopped")?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    // Running batches end failed rather than stranded as running
    if !context.cancel_all(Duration::from_secs(15)).await {
        warn!("some batches may still read running after shutdown");
    }

    // Dropping the last sender lets the worker drain whatever is queued
    drop(context);
    if tokio::time::timeout(Duration::from_secs(30), worker).await.is_err() {
        warn!("publish worker did not drain in time, unpublished records stay pending");
    }
    if let Some(kafka) = kafka {
        kafka.flush(Duration::from_secs(10))?;
    }

    Ok(())
}
