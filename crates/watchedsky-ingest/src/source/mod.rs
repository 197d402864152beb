//! Upstream alert feed adapters.
//!
//! A source returns a snapshot of currently active alerts, not a diff. The
//! poller decides what is new.
//!
//! # Available Sources
//!
//! - [`NwsAlertSource`] - National Weather Service active-alerts API

mod nws;

pub use nws::{NWS_ACTIVE_ALERTS_URL, NwsAlertSource, NwsConfig};

use async_trait::async_trait;
use serde_json::Value;
use watchedsky_core::Feature;

use crate::Result;

/// A source of active alert snapshots.
#[async_trait]
pub trait AlertSource: Send + Sync {
    /// Human-readable name for this source (used in logs and metrics).
    fn name(&self) -> &'static str;

    /// Fetch the current snapshot.
    ///
    /// Transport errors, non-success statuses and bodies that are not a
    /// feature collection fail the whole fetch. Individual features that do
    /// not decode are returned in [`FeedSnapshot::rejected`].
    async fn fetch(&self) -> Result<FeedSnapshot>;
}

/// One fetch worth of alerts.
#[derive(Debug, Clone, Default)]
pub struct FeedSnapshot {
    /// Features that decoded, keyed by the alert's own identifier.
    pub features: Vec<Feature>,
    /// Features that could not be decoded.
    pub rejected: Vec<RejectedFeature>,
}

/// A feed entry dropped during decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedFeature {
    /// The entry's `id`, when it had one.
    pub id: Option<String>,
    pub reason: String,
}

impl FeedSnapshot {
    /// Decode a GeoJSON feature collection body, one feature at a time.
    ///
    /// The store key of an alert is its `properties.id` when present (the
    /// feed's top-level `id` is a URL wrapping it).
    pub fn from_geojson(body: &[u8]) -> Result<Self> {
        #[derive(serde::Deserialize)]
        struct RawCollection {
            features: Vec<Value>,
        }

        let raw: RawCollection = serde_json::from_slice(body)?;
        let mut snapshot = FeedSnapshot::default();

        for value in raw.features {
            let id = value.get("id").and_then(Value::as_str).map(str::to_string);
            match serde_json::from_value::<Feature>(value) {
                Ok(mut feature) => {
                    if let Some(own_id) = feature.string_property("id") {
                        feature.id = own_id.to_string();
                    }
                    snapshot.features.push(feature);
                }
                Err(e) => snapshot.rejected.push(RejectedFeature {
                    id,
                    reason: e.to_string(),
                }),
            }
        }

        Ok(snapshot)
    }
}
