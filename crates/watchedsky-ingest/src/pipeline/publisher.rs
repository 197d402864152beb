//! Alert publication to the ledger.

use std::sync::Arc;

use watchedsky_core::metrics::increment;
use watchedsky_core::{Alert, Feature, GEOJSON_MIME};

use crate::ledger::{ALERT_COLLECTION, AlertRecord, Ledger, RecordRef};
use crate::{Error, Result};

/// Writes alerts into the service's own repository.
///
/// A single call does not retry. The poller queues alerts that failed on a
/// transport error and offers them again on its next tick.
pub struct Publisher {
    ledger: Arc<dyn Ledger>,
}

impl Publisher {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    /// Publish one alert feature.
    ///
    /// Geometry, when present, is uploaded as a GeoJSON blob first and the
    /// record references it.
    pub async fn publish(&self, feature: &Feature) -> Result<RecordRef> {
        let result = self.publish_alert(feature).await;
        if result.is_err() {
            increment("publisher_errors_total", 1);
        }
        result
    }

    async fn publish_alert(&self, feature: &Feature) -> Result<RecordRef> {
        if !feature.is_alert() {
            return Err(Error::NotAnAlert(format!(
                "feature {} has type {}",
                feature.id,
                feature.type_name().unwrap_or("<none>")
            )));
        }
        let alert = Alert::from_feature(feature)?;
        let session = self.ledger.session().ok_or(Error::AuthRequired)?;

        let geometry = match &alert.geometry {
            Some(geometry) => {
                let blob = self
                    .ledger
                    .upload_blob(geometry.to_geojson()?, GEOJSON_MIME)
                    .await?;
                increment("publisher_blobs_uploaded_total", 1);
                Some(blob)
            }
            None => None,
        };

        let record = AlertRecord::new(&alert, geometry);
        let created = self
            .ledger
            .create_record(
                ALERT_COLLECTION,
                &session.did,
                serde_json::to_value(&record)?,
            )
            .await?;
        increment("publisher_records_created_total", 1);

        tracing::debug!(id = %alert.id, uri = %created.uri, cid = %created.cid, "Published alert");
        Ok(created)
    }

    /// Domain id of the newest record in the service's alert collection.
    pub async fn latest_published_id(&self) -> Result<Option<String>> {
        let session = self.ledger.session().ok_or(Error::AuthRequired)?;
        let records = self
            .ledger
            .list_records(ALERT_COLLECTION, &session.did, 1)
            .await?;

        match records.into_iter().next() {
            Some(listed) => {
                let record: AlertRecord = serde_json::from_value(listed.value)?;
                Ok(Some(record.alert.id))
            }
            None => Ok(None),
        }
    }
}
