//! `app.bsky.feed.post` records and rich-text facets.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::POST_COLLECTION;

/// Half-open UTF-8 byte range `[byte_start, byte_end)` within post text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ByteSlice {
    pub byte_start: usize,
    pub byte_end: usize,
}

/// Annotation attached to a byte range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "$type")]
pub enum FacetFeature {
    #[serde(rename = "app.bsky.richtext.facet#link")]
    Link { uri: String },
}

/// Rich-text facet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facet {
    pub index: ByteSlice,
    pub features: Vec<FacetFeature>,
}

impl Facet {
    /// A link facet for `uri` placed at `byte_start`.
    pub fn link(byte_start: usize, uri: &str) -> Self {
        Self {
            index: ByteSlice {
                byte_start,
                byte_end: byte_start + uri.len(),
            },
            features: vec![FacetFeature::Link {
                uri: uri.to_string(),
            }],
        }
    }
}

/// A post record as written to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostRecord {
    #[serde(rename = "$type")]
    pub record_type: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub facets: Vec<Facet>,
    pub created_at: String,
}

impl PostRecord {
    pub fn new(text: impl Into<String>, facets: Vec<Facet>, created_at: DateTime<Utc>) -> Self {
        Self {
            record_type: POST_COLLECTION.to_string(),
            text: text.into(),
            facets,
            created_at: created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_link_facet_byte_range() {
        // Multi-byte text before the link shifts byte offsets, not chars.
        let text = "Ünwetter: see https://watchedsky.social/alert/x";
        let uri = "https://watchedsky.social/alert/x";
        let facet = Facet::link(text.len() - uri.len(), uri);
        assert_eq!(facet.index.byte_start, 15);
        assert_eq!(facet.index.byte_end, text.len());
        assert_eq!(
            &text[facet.index.byte_start..facet.index.byte_end],
            "https://watchedsky.social/alert/x"
        );
    }

    #[test]
    fn test_post_json_shape() {
        let facet = Facet::link(3, "https://a.b");
        let created = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let post = PostRecord::new("go https://a.b", vec![facet], created);
        assert_eq!(
            serde_json::to_value(&post).unwrap(),
            json!({
                "$type": "app.bsky.feed.post",
                "text": "go https://a.b",
                "facets": [{
                    "index": {"byteStart": 3, "byteEnd": 14},
                    "features": [{"$type": "app.bsky.richtext.facet#link", "uri": "https://a.b"}]
                }],
                "createdAt": "2024-01-01T00:00:00.000Z"
            })
        );
    }
}
