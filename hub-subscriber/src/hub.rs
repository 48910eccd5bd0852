//! HTTP client for the hub's paginated event feed.
use std::time;

use ingest_common::protocol::HubEventsPage;
use reqwest::header;

use crate::error::SubscriberError;

pub struct HubClient {
    client: reqwest::Client,
    base_url: String,
    page_size: u32,
}

impl HubClient {
    pub fn new(
        base_url: &str,
        request_timeout: time::Duration,
        page_size: u32,
    ) -> Result<Self, SubscriberError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            page_size,
        })
    }

    /// Fetch one page of events starting at `from_event_id` (inclusive). An
    /// empty `events` vector means the feed is caught up; `next_page_event_id`
    /// is always valid as the next cursor either way.
    pub async fn events_page(&self, from_event_id: u64) -> Result<HubEventsPage, SubscriberError> {
        let url = format!("{}/v1/events", self.base_url);

        let response = self
            .client
            .get(&url)
            .query(&[
                ("from_event_id", from_event_id.to_string()),
                ("pageSize", self.page_size.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?;

        let page = response.json::<HubEventsPage>().await?;

        Ok(page)
    }
}
