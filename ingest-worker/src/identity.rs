//! Client for the external identity-resolution service.
//!
//! The service owns the mapping from protocol fids to internal user ids. The
//! pipeline treats it as a pure lookup; the only caching is the request-scoped
//! batching done here, one call per hub event.
use std::collections::HashMap;
use std::time;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EventError;

#[derive(Serialize)]
struct IdentitiesRequest<'a> {
    #[serde(rename = "type")]
    id_type: &'static str,
    ids: &'a [u64],
}

#[derive(Deserialize)]
struct IdentitiesResponse {
    identities: Vec<Identity>,
}

#[derive(Deserialize)]
struct Identity {
    id: Uuid,
}

#[derive(Clone)]
pub struct IdentityClient {
    client: reqwest::Client,
    base_url: String,
}

impl IdentityClient {
    pub fn new(base_url: &str, request_timeout: time::Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }

    /// Resolve a batch of fids to internal user ids in a single request. The
    /// service must return exactly one identity per requested fid, in request
    /// order; anything else fails the whole batch permanently since we cannot
    /// tell which mapping is missing.
    pub async fn resolve_fids(&self, fids: &[u64]) -> Result<HashMap<u64, Uuid>, EventError> {
        if fids.is_empty() {
            return Ok(HashMap::new());
        }

        let url = format!("{}/identities", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&IdentitiesRequest {
                id_type: "fid",
                ids: fids,
            })
            .send()
            .await
            .map_err(EventError::IdentityRequestError)?
            .error_for_status()
            .map_err(EventError::IdentityRequestError)?;

        let body: IdentitiesResponse = response
            .json()
            .await
            .map_err(EventError::IdentityRequestError)?;

        map_identities(fids, body.identities)
    }
}

/// Pair requested fids with the returned identities, which the service sends
/// back in request order. Any count mismatch fails the whole batch.
fn map_identities(
    fids: &[u64],
    identities: Vec<Identity>,
) -> Result<HashMap<u64, Uuid>, EventError> {
    if identities.len() != fids.len() {
        return Err(EventError::IdentityCountMismatch {
            requested: fids.len(),
            returned: identities.len(),
        });
    }

    Ok(fids
        .iter()
        .copied()
        .zip(identities.into_iter().map(|identity| identity.id))
        .collect())
}
