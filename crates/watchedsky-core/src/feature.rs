//! Store-persisted features.
//!
//! A [`Feature`] is the canonical document shape: an identifier, an optional
//! geometry and an open property map. The `@type` property discriminates
//! alerts (`wx:Alert`) from zones (`wx:Zone`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::geometry::Geometry;
use crate::{Error, Result};

/// Property holding the feature discriminator.
pub const TYPE_PROPERTY: &str = "@type";

/// Feature discriminator values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureType {
    Alert,
    Zone,
}

impl FeatureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alert => "wx:Alert",
            Self::Zone => "wx:Zone",
        }
    }
}

impl std::str::FromStr for FeatureType {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "wx:Alert" => Ok(Self::Alert),
            "wx:Zone" => Ok(Self::Zone),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for FeatureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A GeoJSON feature as persisted in the document store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Feature {
    pub id: String,
    #[serde(default)]
    pub geometry: Option<Geometry>,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl Feature {
    /// Create a feature with just an identity and a discriminator.
    pub fn new(id: impl Into<String>, feature_type: FeatureType) -> Self {
        let mut properties = Map::new();
        properties.insert(
            TYPE_PROPERTY.to_string(),
            Value::String(feature_type.as_str().to_string()),
        );
        Self {
            id: id.into(),
            geometry: None,
            properties,
        }
    }

    /// Raw `@type` value, if any.
    pub fn type_name(&self) -> Option<&str> {
        self.properties.get(TYPE_PROPERTY).and_then(Value::as_str)
    }

    /// Parsed discriminator; unknown or absent values yield `None`.
    pub fn feature_type(&self) -> Option<FeatureType> {
        self.type_name().and_then(|t| t.parse().ok())
    }

    pub fn is_alert(&self) -> bool {
        self.feature_type() == Some(FeatureType::Alert)
    }

    /// The `sent` property as a UTC instant.
    pub fn sent(&self) -> Result<DateTime<Utc>> {
        let raw = self
            .properties
            .get("sent")
            .ok_or(Error::MissingField("sent"))?;
        let value = raw.as_str().ok_or_else(|| Error::InvalidField {
            field: "sent",
            reason: format!("expected a string, got {raw}"),
        })?;
        parse_timestamp(value)
    }

    /// Zone identifiers listed in `affectedZones`. Non-string entries are
    /// skipped; a missing property is an empty list.
    pub fn affected_zones(&self) -> Vec<String> {
        match self.properties.get("affectedZones") {
            Some(Value::Array(zones)) => zones
                .iter()
                .filter_map(|z| z.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// String property accessor.
    pub fn string_property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).and_then(Value::as_str)
    }
}

/// Parse an RFC 3339 timestamp into UTC.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|source| Error::Timestamp {
            value: value.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn alert_json() -> Value {
        json!({
            "id": "urn:oid:2.49.0.1.840.0.1",
            "type": "Feature",
            "geometry": null,
            "properties": {
                "@type": "wx:Alert",
                "id": "urn:oid:2.49.0.1.840.0.1",
                "sent": "2024-01-01T01:00:00-05:00",
                "affectedZones": ["Z1", "Z2"],
                "areaDesc": "Somewhere"
            }
        })
    }

    #[test]
    fn test_feature_type_roundtrip() {
        use std::str::FromStr;
        for t in [FeatureType::Alert, FeatureType::Zone] {
            assert_eq!(FeatureType::from_str(t.as_str()), Ok(t));
        }
        assert!(FeatureType::from_str("wx:Office").is_err());
    }

    #[test]
    fn test_decode_feed_feature() {
        let f: Feature = serde_json::from_value(alert_json()).unwrap();
        assert!(f.is_alert());
        assert!(f.geometry.is_none());
        assert_eq!(f.affected_zones(), vec!["Z1", "Z2"]);
        // Unknown properties are kept.
        assert_eq!(f.string_property("areaDesc"), Some("Somewhere"));
    }

    #[test]
    fn test_sent_normalizes_to_utc() {
        let f: Feature = serde_json::from_value(alert_json()).unwrap();
        let sent = f.sent().unwrap();
        assert_eq!(sent.to_rfc3339(), "2024-01-01T06:00:00+00:00");
    }

    #[test]
    fn test_sent_missing_or_invalid() {
        let mut f = Feature::new("a", FeatureType::Alert);
        assert!(matches!(f.sent(), Err(Error::MissingField("sent"))));

        f.properties.insert("sent".into(), json!(12));
        assert!(matches!(f.sent(), Err(Error::InvalidField { .. })));

        f.properties.insert("sent".into(), json!("not a time"));
        assert!(matches!(f.sent(), Err(Error::Timestamp { .. })));
    }

    #[test]
    fn test_zone_has_no_alert_fields() {
        let z = Feature::new("Z1", FeatureType::Zone);
        assert_eq!(z.feature_type(), Some(FeatureType::Zone));
        assert!(z.affected_zones().is_empty());
    }
}
