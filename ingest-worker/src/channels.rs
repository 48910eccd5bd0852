//! Channel directory lookups with an in-process cache.
//!
//! Channel association is resolved lazily: the first cast into a channel this
//! process sees triggers one directory fetch, everything after that is a cache
//! hit. A miss after a refresh just means the channel is unknown and the cast
//! goes through without channel metadata.
use std::time;

use quick_cache::sync::Cache;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::EventError;
use crate::identity::IdentityClient;
use crate::types::Channel;

#[derive(Deserialize)]
struct AllChannelsResponse {
    result: AllChannelsResult,
}

#[derive(Deserialize)]
struct AllChannelsResult {
    channels: Vec<DirectoryChannel>,
}

#[derive(Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct DirectoryChannel {
    id: String,
    url: String,
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    image_url: Option<String>,
    #[serde(default)]
    lead_fid: Option<u64>,
}

impl DirectoryChannel {
    fn into_channel(self, lead_entity_id: Option<Uuid>) -> Channel {
        Channel {
            id: self.id,
            url: self.url,
            name: self.name,
            description: self.description,
            image_url: self.image_url,
            lead_fid: self.lead_fid,
            lead_entity_id,
        }
    }
}

pub struct ChannelDirectory {
    client: reqwest::Client,
    directory_url: String,
    identities: IdentityClient,
    cache: Cache<String, Channel>,
}

impl ChannelDirectory {
    pub fn new(
        directory_url: &str,
        request_timeout: time::Duration,
        identities: IdentityClient,
        cache_capacity: usize,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            directory_url: directory_url.to_owned(),
            identities,
            cache: Cache::new(cache_capacity),
        })
    }

    /// Resolve the channel a cast was posted into, by channel URL. Returns
    /// None for URLs the directory does not know.
    pub async fn channel_for_url(&self, url: &str) -> Result<Option<Channel>, EventError> {
        let hit = match self.cache.get(url) {
            Some(hit) => hit,
            None => {
                self.refresh().await?;
                match self.cache.get(url) {
                    Some(hit) => hit,
                    None => return Ok(None),
                }
            }
        };

        Ok(Some(self.with_lead_resolved(hit).await?))
    }

    /// Fetch the full directory and cache every channel. Leads stay
    /// unresolved here; the channel a caller actually hits gets its lead
    /// mapped in `with_lead_resolved`.
    async fn refresh(&self) -> Result<(), EventError> {
        let response = self
            .client
            .get(&self.directory_url)
            .send()
            .await
            .map_err(EventError::ChannelDirectoryError)?
            .error_for_status()
            .map_err(EventError::ChannelDirectoryError)?;

        let body: AllChannelsResponse = response
            .json()
            .await
            .map_err(EventError::ChannelDirectoryError)?;

        for directory_channel in body.result.channels {
            let channel = directory_channel.into_channel(None);
            self.cache.insert(channel.url.clone(), channel);
        }

        Ok(())
    }

    /// Map the channel's lead fid to an internal id if that has not happened
    /// yet, and write the resolved entry back to the cache so the lookup runs
    /// at most once per channel per process.
    async fn with_lead_resolved(&self, mut channel: Channel) -> Result<Channel, EventError> {
        let Some(lead_fid) = channel.lead_fid else {
            return Ok(channel);
        };
        if channel.lead_entity_id.is_some() {
            return Ok(channel);
        }

        channel.lead_entity_id = self
            .identities
            .resolve_fids(&[lead_fid])
            .await?
            .get(&lead_fid)
            .copied();
        self.cache.insert(channel.url.clone(), channel.clone());

        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_wire_format_parses() {
        let raw = r#"{
            "result": {
                "channels": [
                    {
                        "id": "gm",
                        "url": "https://warpcast.com/~/channel/gm",
                        "name": "Good Morning",
                        "description": "gm every day",
                        "imageUrl": "https://example.com/gm.png",
                        "leadFid": 191,
                        "createdAt": 1689888729
                    },
                    {
                        "id": "no-lead",
                        "url": "https://warpcast.com/~/channel/no-lead",
                        "name": "Leaderless"
                    }
                ]
            }
        }"#;

        let parsed: AllChannelsResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.result.channels.len(), 2);

        let channel = parsed.result.channels[0].clone().into_channel(None);
        assert_eq!(channel.id, "gm");
        assert_eq!(channel.lead_fid, Some(191));
        assert_eq!(parsed.result.channels[1].lead_fid, None);
    }

    // Nothing is listening on this port, so any HTTP call errors immediately.
    const CLOSED_PORT: &str = "http://localhost:9";

    fn directory() -> ChannelDirectory {
        let timeout = time::Duration::from_millis(200);
        let identities = IdentityClient::new(CLOSED_PORT, timeout).unwrap();
        ChannelDirectory::new(CLOSED_PORT, timeout, identities, 10).unwrap()
    }

    fn gm_channel(lead_entity_id: Option<Uuid>) -> Channel {
        Channel {
            id: "gm".to_owned(),
            url: "https://warpcast.com/~/channel/gm".to_owned(),
            name: "Good Morning".to_owned(),
            description: None,
            image_url: None,
            lead_fid: Some(191),
            lead_entity_id,
        }
    }

    #[tokio::test]
    async fn test_cache_hit_resolves_a_pending_lead() {
        let directory = directory();
        let channel = gm_channel(None);
        directory.cache.insert(channel.url.clone(), channel.clone());

        // The cached entry still has an unmapped lead fid, so the hit must go
        // to the identity service, which is unreachable here.
        let result = directory.channel_for_url(&channel.url).await;
        assert!(matches!(result, Err(EventError::IdentityRequestError(_))));
    }

    #[tokio::test]
    async fn test_cache_hit_with_resolved_lead_makes_no_calls() {
        let directory = directory();
        let lead = Uuid::now_v7();
        let channel = gm_channel(Some(lead));
        directory.cache.insert(channel.url.clone(), channel.clone());

        let hit = directory.channel_for_url(&channel.url).await.unwrap();
        assert_eq!(hit.unwrap().lead_entity_id, Some(lead));
    }
}
