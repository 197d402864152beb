//! Document store for alert and zone features.
//!
//! The store is the single source of truth for what has been ingested. The
//! poller reads it to recover its cursor and to look up zone geometry; both
//! the poller and the reconciler write to it.
//!
//! # Write semantics
//!
//! - [`DocumentStore::insert_many`] is ordered and all-or-nothing: either
//!   every feature is stored or none is. An identifier that already exists
//!   fails the whole batch.
//! - [`DocumentStore::upsert`] is idempotent under identifier collision.

mod schema;
mod sqlite;

pub use sqlite::{SqliteStore, SqliteStoreConfig};

use async_trait::async_trait;
use watchedsky_core::{Feature, FeatureType};

use crate::Result;

/// Selects features by discriminator and/or identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureFilter {
    /// Equality on `@type`.
    pub feature_type: Option<FeatureType>,
    /// Set membership on the identifier. `Some(empty)` matches nothing.
    pub ids: Option<Vec<String>>,
}

impl FeatureFilter {
    /// All alert features.
    pub fn alerts() -> Self {
        Self {
            feature_type: Some(FeatureType::Alert),
            ids: None,
        }
    }

    /// Zone features with one of the given identifiers.
    pub fn zones(ids: &[String]) -> Self {
        Self {
            feature_type: Some(FeatureType::Zone),
            ids: Some(ids.to_vec()),
        }
    }
}

/// Result ordering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    /// Storage order.
    #[default]
    Unordered,
    SentAscending,
    SentDescending,
}

/// Ordering and paging for [`DocumentStore::find`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FindOptions {
    pub sort: SortOrder,
    pub limit: Option<usize>,
    pub skip: usize,
}

/// Persistent feature storage.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Find features matching `filter`.
    async fn find(&self, filter: &FeatureFilter, options: FindOptions) -> Result<Vec<Feature>>;

    /// Insert features in order as one atomic batch.
    async fn insert_many(&self, features: &[Feature]) -> Result<()>;

    /// Insert or replace a feature keyed by its identifier.
    async fn upsert(&self, feature: &Feature) -> Result<()>;

    /// The alert with the greatest `sent`, if any.
    async fn latest_alert(&self) -> Result<Option<Feature>> {
        let options = FindOptions {
            sort: SortOrder::SentDescending,
            limit: Some(1),
            skip: 0,
        };
        Ok(self
            .find(&FeatureFilter::alerts(), options)
            .await?
            .into_iter()
            .next())
    }

    /// Zone features for the given identifiers. Unknown ids are skipped.
    async fn zones(&self, ids: &[String]) -> Result<Vec<Feature>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.find(&FeatureFilter::zones(ids), FindOptions::default())
            .await
    }
}
