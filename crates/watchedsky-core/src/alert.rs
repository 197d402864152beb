//! Typed weather alerts.
//!
//! [`Alert`] is the typed view over an alert [`Feature`]. Vocabulary fields
//! (status, severity, urgency, ...) are feed-controlled strings and are not
//! validated here. Temporal fields other than `sent` are carried verbatim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::feature::{Feature, FeatureType, TYPE_PROPERTY, parse_timestamp};
use crate::geometry::Geometry;
use crate::{Error, Result};

/// An immutable weather alert snapshot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    #[serde(default, deserialize_with = "nullable")]
    pub id: String,
    #[serde(default, deserialize_with = "nullable")]
    pub affected_zones: Vec<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub certainty: String,
    #[serde(default, deserialize_with = "nullable")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ends: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub headline: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub onset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaced_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaced_by: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub sender: String,
    #[serde(default, deserialize_with = "nullable")]
    pub sender_name: String,
    pub sent: String,
    #[serde(default, deserialize_with = "nullable")]
    pub severity: String,
    #[serde(default, deserialize_with = "nullable")]
    pub status: String,
    #[serde(default, deserialize_with = "nullable")]
    pub urgency: String,

    /// Shape carried alongside the properties; never serialized as a property.
    #[serde(skip)]
    pub geometry: Option<Geometry>,
}

/// Feeds send `null` for absent text; treat it as the empty value.
fn nullable<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Alert {
    /// Read the typed alert out of an alert feature.
    ///
    /// Fails with [`Error::NotAnAlert`] if the discriminator is anything
    /// other than `wx:Alert`. Properties the alert does not model are ignored.
    pub fn from_feature(feature: &Feature) -> Result<Self> {
        if !feature.is_alert() {
            return Err(Error::NotAnAlert {
                id: feature.id.clone(),
                found: feature.type_name().unwrap_or("<none>").to_string(),
            });
        }

        let mut alert: Alert = serde_json::from_value(Value::Object(feature.properties.clone()))?;
        if alert.id.is_empty() {
            alert.id = feature.id.clone();
        }
        alert.geometry = feature.geometry.clone();
        Ok(alert)
    }

    /// Build the store representation, keyed by the alert id.
    pub fn to_feature(&self) -> Result<Feature> {
        let Value::Object(mut properties) = serde_json::to_value(self)? else {
            return Err(Error::InvalidField {
                field: "properties",
                reason: "alert did not serialize to an object".to_string(),
            });
        };
        properties.insert(
            TYPE_PROPERTY.to_string(),
            Value::String(FeatureType::Alert.as_str().to_string()),
        );

        Ok(Feature {
            id: self.id.clone(),
            geometry: self.geometry.clone(),
            properties,
        })
    }

    /// `sent` as a UTC instant.
    pub fn sent_at(&self) -> Result<DateTime<Utc>> {
        parse_timestamp(&self.sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Position;
    use serde_json::json;

    fn sample() -> Alert {
        Alert {
            id: "urn:oid:2.49.0.1.840.0.abc".to_string(),
            affected_zones: vec!["https://api.weather.gov/zones/forecast/TXZ119".to_string()],
            certainty: "Likely".to_string(),
            description: "A line of storms".to_string(),
            event: "Severe Thunderstorm Warning".to_string(),
            expires: Some("2024-05-01T19:00:00-05:00".to_string()),
            headline: "Severe Thunderstorm Warning issued May 1".to_string(),
            instruction: Some("Move indoors".to_string()),
            message_type: "Alert".to_string(),
            onset: Some("2024-05-01T18:00:00-05:00".to_string()),
            sender: "w-nws.webmaster@noaa.gov".to_string(),
            sender_name: "NWS Fort Worth TX".to_string(),
            sent: "2024-05-01T18:00:00-05:00".to_string(),
            severity: "Severe".to_string(),
            status: "Actual".to_string(),
            urgency: "Immediate".to_string(),
            geometry: Some(Geometry::Point {
                coordinates: Position::new(-97.3, 32.7),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_feature_roundtrip() {
        let alert = sample();
        let feature = alert.to_feature().unwrap();
        assert_eq!(feature.id, alert.id);
        assert!(feature.is_alert());
        assert_eq!(feature.properties["senderName"], "NWS Fort Worth TX");
        assert!(feature.properties.get("geometry").is_none());

        let back = Alert::from_feature(&feature).unwrap();
        assert_eq!(back, alert);
    }

    #[test]
    fn test_optional_fields_omitted() {
        let feature = sample().to_feature().unwrap();
        assert!(!feature.properties.contains_key("replacedBy"));
        assert!(!feature.properties.contains_key("ends"));
    }

    #[test]
    fn test_from_feature_rejects_zone() {
        let zone = Feature::new("Z1", FeatureType::Zone);
        let err = Alert::from_feature(&zone).unwrap_err();
        assert!(matches!(err, Error::NotAnAlert { .. }));
    }

    #[test]
    fn test_from_feature_uses_feature_id_fallback() {
        let mut feature = Feature::new("urn:oid:fallback", FeatureType::Alert);
        feature
            .properties
            .insert("sent".into(), json!("2024-01-01T00:00:00Z"));
        let alert = Alert::from_feature(&feature).unwrap();
        assert_eq!(alert.id, "urn:oid:fallback");
        assert_eq!(alert.sent_at().unwrap().timestamp(), 1_704_067_200);
    }

    #[test]
    fn test_null_text_fields_default() {
        let mut feature = Feature::new("x", FeatureType::Alert);
        feature
            .properties
            .insert("sent".into(), json!("2024-01-01T00:00:00Z"));
        feature.properties.insert("headline".into(), Value::Null);
        feature.properties.insert("instruction".into(), Value::Null);
        let alert = Alert::from_feature(&feature).unwrap();
        assert_eq!(alert.headline, "");
        assert_eq!(alert.instruction, None);
    }

    #[test]
    fn test_from_feature_requires_sent() {
        let feature = Feature::new("x", FeatureType::Alert);
        assert!(matches!(
            Alert::from_feature(&feature),
            Err(Error::Json(_))
        ));
    }
}
