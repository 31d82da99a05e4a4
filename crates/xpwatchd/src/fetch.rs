//! Fetch client for the remote character API.
//!
//! One request per character id; every failure mode (transport error,
//! timeout, non-success status, malformed body) collapses to `None`. Retry
//! policy lives in the callers, which simply try again on their next cycle.

use anyhow::{Context, Result};
use std::future::Future;
use std::time::Duration;
use tracing::debug;
use xpwatch_common::CharacterInfo;

/// Source of character state, abstracted so the loops can be driven by a
/// scripted source in tests.
pub trait CharacterSource: Send + Sync + 'static {
    fn fetch(&self, id: &str) -> impl Future<Output = Option<CharacterInfo>> + Send;
}

/// HTTP client for `GET <api_base>/<id>`.
#[derive(Clone)]
pub struct CharacterClient {
    client: reqwest::Client,
    api_base: String,
}

impl CharacterClient {
    pub fn new(api_base: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, id: &str) -> String {
        format!("{}/{}", self.api_base, id)
    }
}

impl CharacterSource for CharacterClient {
    fn fetch(&self, id: &str) -> impl Future<Output = Option<CharacterInfo>> + Send {
        async move {
            let resp = match self.client.get(self.url(id)).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    debug!("Fetch failed for {}: {}", id, e);
                    return None;
                }
            };

            if !resp.status().is_success() {
                debug!("Fetch for {} returned {}", id, resp.status());
                return None;
            }

            match resp.json::<CharacterInfo>().await {
                Ok(info) => Some(info),
                Err(e) => {
                    debug!("Malformed body for {}: {}", id, e);
                    None
                }
            }
        }
    }
}
