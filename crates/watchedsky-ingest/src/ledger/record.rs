//! Ledger-side representation of an alert.
//!
//! The record carries every alert property under its camelCase name plus a
//! `$type` of [`ALERT_COLLECTION`]. Geometry is never inline: when present
//! it is a [`BlobRef`] to an uploaded GeoJSON document.

use serde::{Deserialize, Serialize};
use watchedsky_core::Alert;

use super::{ALERT_COLLECTION, BlobRef};
use crate::{Error, Result};

/// An alert as stored in the `social.watchedsky.alert` collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    #[serde(rename = "$type")]
    pub record_type: String,
    #[serde(flatten)]
    pub alert: Alert,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<BlobRef>,
}

impl AlertRecord {
    /// Build a record from an alert. Inline geometry is dropped in favor of
    /// the blob reference.
    pub fn new(alert: &Alert, geometry: Option<BlobRef>) -> Self {
        let mut alert = alert.clone();
        alert.geometry = None;
        Self {
            record_type: ALERT_COLLECTION.to_string(),
            alert,
            geometry,
        }
    }

    /// Decode a DAG-CBOR record block.
    pub fn from_cbor(block: &[u8]) -> Result<Self> {
        Ok(serde_cbor::from_slice(block)?)
    }

    /// Encode as CBOR.
    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        Ok(serde_cbor::to_vec(self)?)
    }

    /// Split into the alert and its geometry reference, checking `$type`.
    pub fn into_parts(self) -> Result<(Alert, Option<BlobRef>)> {
        if self.record_type != ALERT_COLLECTION {
            return Err(Error::NotAnAlert(format!(
                "record type {} (alert {})",
                self.record_type, self.alert.id
            )));
        }
        Ok((self.alert, self.geometry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use watchedsky_core::{Cid, Geometry, Position};

    fn alert() -> Alert {
        Alert {
            id: "urn:oid:2.49.0.1.840.0.77".to_string(),
            affected_zones: vec!["Z1".to_string(), "Z2".to_string()],
            certainty: "Observed".to_string(),
            description: "Flooding is ongoing".to_string(),
            effective: Some("2024-01-01T00:00:00Z".to_string()),
            event: "Flood Warning".to_string(),
            headline: "Flood Warning issued January 1".to_string(),
            message_type: "Alert".to_string(),
            replaced_by: Some("urn:oid:2.49.0.1.840.0.78".to_string()),
            sender_name: "NWS Houston/Galveston TX".to_string(),
            sent: "2024-01-01T00:00:00Z".to_string(),
            severity: "Moderate".to_string(),
            status: "Actual".to_string(),
            urgency: "Expected".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_cbor_roundtrip_normalizes_geometry() {
        let mut original = alert();
        original.geometry = Some(Geometry::Point {
            coordinates: Position::new(-95.3, 29.7),
        });
        let blob = BlobRef::new(Cid::raw(b"geo"), watchedsky_core::GEOJSON_MIME, 3);

        let record = AlertRecord::new(&original, Some(blob.clone()));
        let block = record.to_cbor().unwrap();
        let (decoded, geometry) = AlertRecord::from_cbor(&block).unwrap().into_parts().unwrap();

        assert_eq!(geometry, Some(blob));
        assert_eq!(decoded.geometry, None);
        original.geometry = None;
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_json_shape() {
        let record = AlertRecord::new(&alert(), None);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["$type"], "social.watchedsky.alert");
        assert_eq!(json["senderName"], "NWS Houston/Galveston TX");
        assert_eq!(json["affectedZones"], json!(["Z1", "Z2"]));
        assert!(json.get("geometry").is_none());
        assert!(json.get("instruction").is_none());
    }

    #[test]
    fn test_wrong_type_rejected() {
        let mut value = serde_json::to_value(AlertRecord::new(&alert(), None)).unwrap();
        value["$type"] = json!("app.bsky.feed.post");
        let block = serde_cbor::to_vec(&value).unwrap();
        let err = AlertRecord::from_cbor(&block)
            .unwrap()
            .into_parts()
            .unwrap_err();
        assert!(matches!(err, Error::NotAnAlert(_)));
    }

    #[test]
    fn test_not_a_record() {
        let block = serde_cbor::to_vec(&json!({"text": "hello"})).unwrap();
        assert!(matches!(
            AlertRecord::from_cbor(&block),
            Err(Error::Cbor(_))
        ));
    }
}
