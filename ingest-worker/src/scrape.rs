//! The scrape worker: consumes the scrape queue to fill in URL metadata and
//! attach channel metadata to casts.
use std::sync::Arc;
use std::time;

use health::HealthHandle;
use ingest_common::pgqueue::{PgJob, PgQueue, RetryError};
use ingest_common::retry::RetryPolicy;
use serde::Deserialize;
use tracing::{error, warn};

use crate::channels::ChannelDirectory;
use crate::content::ContentStore;
use crate::error::{EventError, WorkerError};
use crate::fanout::ScrapeJob;

/// What the external scraper returns for a URL.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeResult {
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub frame: Option<serde_json::Value>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub content_length: Option<u64>,
}

#[derive(Clone)]
pub struct ScraperClient {
    client: reqwest::Client,
    base_url: String,
}

impl ScraperClient {
    pub fn new(base_url: &str, request_timeout: time::Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }

    pub async fn fetch(&self, uri: &str) -> Result<ScrapeResult, EventError> {
        let url = format!("{}/scrape", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("uri", uri)])
            .send()
            .await
            .map_err(EventError::ScrapeRequestError)?
            .error_for_status()
            .map_err(EventError::ScrapeRequestError)?;

        response
            .json::<ScrapeResult>()
            .await
            .map_err(EventError::ScrapeRequestError)
    }
}

pub struct ScrapeWorker {
    name: String,
    queue: PgQueue,
    scraper: ScraperClient,
    contents: ContentStore,
    channels: Arc<ChannelDirectory>,
    poll_interval: time::Duration,
    retry_policy: RetryPolicy,
    liveness: HealthHandle,
}

impl ScrapeWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        queue: PgQueue,
        scraper: ScraperClient,
        contents: ContentStore,
        channels: Arc<ChannelDirectory>,
        poll_interval: time::Duration,
        retry_policy: RetryPolicy,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.to_owned(),
            queue,
            scraper,
            contents,
            channels,
            poll_interval,
            retry_policy,
            liveness,
        }
    }

    async fn handle_job(&self, job: &ScrapeJob) -> Result<(), EventError> {
        if job.channel {
            // Attach channel metadata to a cast. A URL the directory does not
            // know, or a cast with no channel recorded, is a successful no-op.
            let Some(channel_url) = self.contents.channel_url(&job.content_id).await? else {
                return Ok(());
            };
            if let Some(channel) = self.channels.channel_for_url(&channel_url).await? {
                self.contents.attach_channel(&job.content_id, &channel).await?;
                metrics::counter!("scrape_channels_attached").increment(1);
            }
            return Ok(());
        }

        // A redelivered job for an already scraped URL is a no-op.
        if !self.contents.needs_scrape(&job.content_id).await? {
            return Ok(());
        }

        let result = self.scraper.fetch(&job.content_id).await?;
        self.contents
            .apply_scrape(
                &job.content_id,
                result.metadata.as_ref(),
                result.frame.as_ref(),
            )
            .await?;
        metrics::counter!("scrape_urls_scraped").increment(1);

        Ok(())
    }

    async fn process_job(&self, job: PgJob<ScrapeJob>) -> Result<(), WorkerError> {
        let attempt = job.job.attempt;

        match self.handle_job(&job.job.parameters.0).await {
            Ok(()) => {
                job.complete().await?;
                Ok(())
            }
            Err(event_error) if event_error.is_retryable() => {
                warn!(attempt, "scrape failed transiently: {}", event_error);
                let interval = self.retry_policy.retry_interval(attempt as u32);
                match job.retry(event_error.to_string(), interval).await {
                    Ok(_) => Ok(()),
                    Err(RetryError::RetryInvalidError(invalid)) => {
                        metrics::counter!("scrape_jobs_dead_lettered").increment(1);
                        invalid.job.fail(event_error.to_string()).await?;
                        Ok(())
                    }
                    Err(RetryError::DatabaseError(database_error)) => Err(database_error.into()),
                }
            }
            Err(event_error) => {
                metrics::counter!("scrape_jobs_dead_lettered").increment(1);
                error!("scrape failed permanently: {}", event_error);
                job.fail(event_error.to_string()).await?;
                Ok(())
            }
        }
    }

    /// Scrapes are low-volume; one job at a time is plenty.
    pub async fn run(&self) -> Result<(), WorkerError> {
        loop {
            self.liveness.report_healthy().await;

            match self.queue.dequeue::<ScrapeJob>(&self.name).await? {
                Some(job) => self.process_job(job).await?,
                None => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }
}
