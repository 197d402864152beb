//! Core types and shared utilities for the WatchedSky alert pipeline.
//!
//! This crate provides:
//! - GeoJSON geometry as a closed sum type with pure encode/decode
//! - The store-persisted [`Feature`] shape and the typed [`Alert`] view
//! - Content identifiers and pluggable block verification
//! - Prometheus metrics helpers
//! - Shared error types

pub mod alert;
pub mod cid;
mod error;
pub mod feature;
pub mod geometry;
pub mod metrics;

pub use alert::Alert;
pub use cid::{Cid, CidVerifier, Sha256Verifier};
pub use error::{Error, Result};
pub use feature::{Feature, FeatureType, parse_timestamp};
pub use geometry::{GEOJSON_MIME, Geometry, Position};
