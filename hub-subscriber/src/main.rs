//! Page the hub event feed into the durable ingress queue.
use axum::{routing::get, Router};
use envconfig::Envconfig;
use futures::future::ready;
use health::HealthRegistry;
use hub_subscriber::checkpoint::CheckpointStore;
use hub_subscriber::config::Config;
use hub_subscriber::error::SubscriberError;
use hub_subscriber::hub::HubClient;
use hub_subscriber::subscriber::HubSubscriber;
use ingest_common::metrics::{serve, setup_metrics_routes};
use ingest_common::pgqueue::PgQueue;
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "hub subscriber service"
}

#[tokio::main]
async fn main() -> Result<(), SubscriberError> {
    setup_tracing();
    info!("starting up...");

    let config = Config::init_from_env().expect("invalid configuration:");

    let pool = PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .connect_lazy(&config.database_url)
        .expect("invalid database url");

    let queue = PgQueue::new_from_pool(config.queue_name.as_str(), pool.clone());
    let checkpoints = CheckpointStore::new(pool);
    let hub = HubClient::new(&config.hub_url, config.request_timeout.0, config.page_size)?;

    let health = HealthRegistry::new("liveness");
    let liveness = health
        .register("subscriber".to_string(), time::Duration::seconds(60))
        .await;

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", {
            let health = health.clone();
            get(move || ready(health.get_status()))
        });
    let router = setup_metrics_routes(router);
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let subscriber = HubSubscriber::new(
        hub,
        queue,
        checkpoints,
        config.max_event_attempts,
        config.poll_interval.0,
        config.checkpoint_interval_events,
        config.start_event_id,
        liveness,
    );

    // Hub or database loss is fatal. Supervision restarts us and we resume
    // from the checkpoint.
    subscriber.run().await?;

    Ok(())
}
