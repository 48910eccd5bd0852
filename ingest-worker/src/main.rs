//! Consume hub events from the ingress queue into actions, content and
//! fan-out jobs.
use std::sync::Arc;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use futures::future::ready;
use health::HealthRegistry;
use ingest_common::metrics::{serve, setup_metrics_routes};
use ingest_common::pgqueue::PgQueue;
use ingest_common::retry::RetryPolicy;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use ingest_worker::channels::ChannelDirectory;
use ingest_worker::config::Config;
use ingest_worker::content::ContentStore;
use ingest_worker::error::WorkerError;
use ingest_worker::fanout::FanoutDispatcher;
use ingest_worker::identity::IdentityClient;
use ingest_worker::scrape::{ScrapeWorker, ScraperClient};
use ingest_worker::store::ActionStore;
use ingest_worker::worker::{EventProcessor, EventWorker};

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "event ingest service"
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    setup_tracing();
    info!("starting up...");

    let config = Config::init_from_env().expect("invalid configuration:");

    let pool = PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .connect_lazy(&config.database_url)
        .expect("invalid database url");

    let retry_policy = RetryPolicy::build(
        config.retry_policy.backoff_coefficient,
        config.retry_policy.initial_interval.0,
    )
    .maximum_interval(config.retry_policy.maximum_interval.0)
    .provide();

    let identity = IdentityClient::new(&config.identity_url, config.request_timeout.0)
        .expect("failed to build identity client");
    let scraper = ScraperClient::new(&config.scraper_url, config.request_timeout.0)
        .expect("failed to build scraper client");
    let channels = Arc::new(
        ChannelDirectory::new(
            &config.channel_directory_url,
            config.request_timeout.0,
            identity.clone(),
            config.channel_cache_capacity,
        )
        .expect("failed to build channel directory client"),
    );

    let store = ActionStore::new(pool.clone());
    let contents = ContentStore::new(pool.clone());
    let fanout = Arc::new(FanoutDispatcher::new(
        PgQueue::new_from_pool(config.scrape_queue_name.as_str(), pool.clone()),
        PgQueue::new_from_pool(config.notification_queue_name.as_str(), pool.clone()),
        PgQueue::new_from_pool(config.cache_queue_name.as_str(), pool.clone()),
        config.max_fanout_job_attempts as i32,
    ));

    let health = HealthRegistry::new("liveness");
    let event_liveness = health
        .register("event_worker".to_string(), time::Duration::seconds(60))
        .await;
    let scrape_liveness = health
        .register("scrape_worker".to_string(), time::Duration::seconds(60))
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

    let event_worker = EventWorker::new(
        &config.worker_name,
        PgQueue::new_from_pool(config.queue_name.as_str(), pool.clone()),
        EventProcessor {
            identity,
            store,
            contents: contents.clone(),
            fanout,
            retry_policy: retry_policy.clone(),
        },
        config.poll_interval.0,
        config.max_concurrent_jobs,
        event_liveness,
    );

    let scrape_worker = ScrapeWorker::new(
        &config.worker_name,
        PgQueue::new_from_pool(config.scrape_queue_name.as_str(), pool),
        scraper,
        contents,
        channels,
        config.poll_interval.0,
        retry_policy,
        scrape_liveness,
    );

    // Either loop dying is fatal; supervision restarts the process.
    tokio::select! {
        result = event_worker.run() => {
            error!("event worker exited");
            result
        }
        result = scrape_worker.run() => {
            error!("scrape worker exited");
            result
        }
    }
}
