//! National Weather Service alert feed.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::ACCEPT;

use super::{AlertSource, FeedSnapshot};
use crate::{Error, Result};

/// Active, actual alerts of every urgency and certainty the service emits.
pub const NWS_ACTIVE_ALERTS_URL: &str = "https://api.weather.gov/alerts/active?status=actual&message_type=alert&urgency=Immediate,Expected,Future,Unknown&certainty=Observed,Likely,Possible,Unknown";

/// Upper bound on a feed body. The active set is usually a few MiB.
const MAX_FEED_RESPONSE_SIZE: usize = 64 * 1024 * 1024;

/// Configuration for the NWS source.
#[derive(Debug, Clone)]
pub struct NwsConfig {
    pub url: String,
    /// The API asks clients to identify themselves.
    pub user_agent: String,
    /// Bound on the whole request, body included.
    pub timeout: Duration,
}

impl Default for NwsConfig {
    fn default() -> Self {
        Self {
            url: NWS_ACTIVE_ALERTS_URL.to_string(),
            user_agent: "watchedsky.social/monitor".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Fetches the NWS active-alerts feature collection over HTTPS.
pub struct NwsAlertSource {
    client: reqwest::Client,
    config: NwsConfig,
}

impl NwsAlertSource {
    pub fn new(config: NwsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| Error::Config(format!("HTTP client init failed: {e}")))?;

        Ok(Self { client, config })
    }

    async fn fetch_body(&self) -> Result<Vec<u8>> {
        let mut response = self
            .client
            .get(&self.config.url)
            .header(ACCEPT, watchedsky_core::GEOJSON_MIME)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = text.chars().take(512).collect();
            return Err(Error::Status {
                endpoint: self.config.url.clone(),
                status: status.as_u16(),
                message,
            });
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > MAX_FEED_RESPONSE_SIZE {
                return Err(Error::Decode(format!(
                    "feed response exceeded {MAX_FEED_RESPONSE_SIZE} byte limit"
                )));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(body)
    }
}

#[async_trait]
impl AlertSource for NwsAlertSource {
    fn name(&self) -> &'static str {
        "nws"
    }

    async fn fetch(&self) -> Result<FeedSnapshot> {
        let body = self.fetch_body().await?;
        let snapshot = FeedSnapshot::from_geojson(&body)?;

        tracing::debug!(
            features = snapshot.features.len(),
            rejected = snapshot.rejected.len(),
            bytes = body.len(),
            "Fetched alert feed"
        );

        Ok(snapshot)
    }
}
