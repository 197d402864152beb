//! GeoJSON geometry as a closed sum type.
//!
//! The seven GeoJSON geometry kinds map onto the variants of [`Geometry`],
//! discriminated by the `type` member. Positions are encoded as
//! `[longitude, latitude]`; any trailing altitude is accepted on decode and
//! dropped.
//!
//! Encoding and decoding are pure functions ([`Geometry::from_geojson`],
//! [`Geometry::to_geojson`]), so the codec is usable without any I/O.

use serde::{Deserialize, Serialize};

use crate::Result;

/// MIME type used when geometry travels as a standalone document.
pub const GEOJSON_MIME: &str = "application/geo+json";

/// A single longitude/latitude pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "[f64; 2]")]
pub struct Position {
    pub lon: f64,
    pub lat: f64,
}

impl Position {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }
}

impl TryFrom<Vec<f64>> for Position {
    type Error = String;

    fn try_from(values: Vec<f64>) -> std::result::Result<Self, Self::Error> {
        match values.as_slice() {
            [lon, lat, ..] => Ok(Self::new(*lon, *lat)),
            _ => Err(format!(
                "position needs at least 2 coordinates, got {}",
                values.len()
            )),
        }
    }
}

impl From<Position> for [f64; 2] {
    fn from(p: Position) -> Self {
        [p.lon, p.lat]
    }
}

/// A GeoJSON geometry object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Geometry {
    Point { coordinates: Position },
    MultiPoint { coordinates: Vec<Position> },
    LineString { coordinates: Vec<Position> },
    MultiLineString { coordinates: Vec<Vec<Position>> },
    Polygon { coordinates: Vec<Vec<Position>> },
    MultiPolygon { coordinates: Vec<Vec<Vec<Position>>> },
    GeometryCollection { geometries: Vec<Geometry> },
}

impl Geometry {
    /// Decode a GeoJSON geometry document.
    pub fn from_geojson(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Encode as a GeoJSON geometry document.
    pub fn to_geojson(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Build a collection from parts, or `None` when there is nothing to
    /// collect. An empty collection is never produced.
    pub fn collection(geometries: Vec<Geometry>) -> Option<Self> {
        if geometries.is_empty() {
            None
        } else {
            Some(Self::GeometryCollection { geometries })
        }
    }

    /// The GeoJSON `type` name of this geometry.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Point { .. } => "Point",
            Self::MultiPoint { .. } => "MultiPoint",
            Self::LineString { .. } => "LineString",
            Self::MultiLineString { .. } => "MultiLineString",
            Self::Polygon { .. } => "Polygon",
            Self::MultiPolygon { .. } => "MultiPolygon",
            Self::GeometryCollection { .. } => "GeometryCollection",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Geometry {
        Geometry::Polygon {
            coordinates: vec![vec![
                Position::new(-97.0, 32.0),
                Position::new(-96.0, 32.0),
                Position::new(-96.0, 33.0),
                Position::new(-97.0, 32.0),
            ]],
        }
    }

    #[test]
    fn test_decode_point_lon_lat_order() {
        let g = Geometry::from_geojson(br#"{"type":"Point","coordinates":[-97.5,35.4]}"#).unwrap();
        assert_eq!(
            g,
            Geometry::Point {
                coordinates: Position::new(-97.5, 35.4)
            }
        );
    }

    #[test]
    fn test_decode_drops_altitude() {
        let g =
            Geometry::from_geojson(br#"{"type":"Point","coordinates":[1.0,2.0,300.0]}"#).unwrap();
        assert_eq!(
            g,
            Geometry::Point {
                coordinates: Position::new(1.0, 2.0)
            }
        );
    }

    #[test]
    fn test_decode_rejects_short_position() {
        assert!(Geometry::from_geojson(br#"{"type":"Point","coordinates":[1.0]}"#).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let err = Geometry::from_geojson(br#"{"type":"Circle","coordinates":[]}"#).unwrap_err();
        assert!(err.to_string().contains("Circle"));
    }

    #[test]
    fn test_encode_polygon() {
        let json: serde_json::Value =
            serde_json::from_slice(&square().to_geojson().unwrap()).unwrap();
        assert_eq!(json["type"], "Polygon");
        assert_eq!(json["coordinates"][0][1], serde_json::json!([-96.0, 32.0]));
    }

    #[test]
    fn test_nested_collection() {
        let input = br#"{
            "type": "GeometryCollection",
            "geometries": [
                {"type": "MultiPoint", "coordinates": [[0, 0], [1, 1]]},
                {"type": "MultiPolygon", "coordinates": [[[[0, 0], [1, 0], [1, 1], [0, 0]]]]},
                {"type": "LineString", "coordinates": [[0, 0], [2, 2]]}
            ]
        }"#;
        let g = Geometry::from_geojson(input).unwrap();
        let Geometry::GeometryCollection { geometries } = &g else {
            panic!("expected a collection, got {}", g.kind());
        };
        let kinds: Vec<_> = geometries.iter().map(Geometry::kind).collect();
        assert_eq!(kinds, ["MultiPoint", "MultiPolygon", "LineString"]);

        let again = Geometry::from_geojson(&g.to_geojson().unwrap()).unwrap();
        assert_eq!(again, g);
    }

    #[test]
    fn test_collection_empty_is_none() {
        assert!(Geometry::collection(Vec::new()).is_none());
        let c = Geometry::collection(vec![square()]).unwrap();
        assert_eq!(c.kind(), "GeometryCollection");
    }
}
