//! Firehose reconciler.
//!
//! Watches the global commit stream for alert records created in the
//! service's own repository and writes each one back into the document
//! store, then posts a notification. Record blocks are verified against the
//! CID the commit declares before anything decodes them.
//!
//! Per record:
//!
//! ```text
//! filter → extract (CAR + tree walk) → verify → decode → hydrate → upsert → notify
//! ```
//!
//! Replays are harmless: the store upsert is keyed by alert id, and a
//! bounded cache of reconciled CIDs suppresses a second notification.

use std::sync::Arc;

use moka::sync::Cache;
use tokio_util::sync::CancellationToken;
use watchedsky_core::metrics::{increment, increment_kind, set_gauge};
use watchedsky_core::{Alert, Cid, CidVerifier, Feature, Geometry};

use super::{ErrorSender, report};
use crate::ledger::{
    ALERT_COLLECTION, AlertRecord, BlobRef, CarBlocks, CommitEvent, Facet, Ledger, Notifier,
    RepoAction, RepoOp, Session,
};
use crate::store::DocumentStore;
use crate::{Error, ErrorKind, Result};

const COMPONENT: &str = "reconciler";

/// Configuration for [`Reconciler`].
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Public site; notifications link to `<base_url>/alert/<id>`.
    pub base_url: String,
    /// Reconciled record CIDs remembered for replay suppression.
    pub seen_capacity: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            base_url: "https://watchedsky.social".to_string(),
            seen_capacity: 10_000,
        }
    }
}

/// What one commit produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReport {
    /// Alert ids upserted, in op order.
    pub persisted: Vec<String>,
    /// Records already reconciled earlier.
    pub replays: usize,
}

/// Consumes ledger commits into the store.
pub struct Reconciler {
    config: ReconcilerConfig,
    ledger: Arc<dyn Ledger>,
    notifier: Arc<dyn Notifier>,
    store: Arc<dyn DocumentStore>,
    verifier: Arc<dyn CidVerifier>,
    identity: Session,
    seen: Cache<Cid, ()>,
}

impl Reconciler {
    /// Create a reconciler for the ledger's current session identity.
    ///
    /// Fails with [`Error::AuthRequired`] when the ledger has no session.
    pub fn new(
        config: ReconcilerConfig,
        ledger: Arc<dyn Ledger>,
        notifier: Arc<dyn Notifier>,
        store: Arc<dyn DocumentStore>,
        verifier: Arc<dyn CidVerifier>,
    ) -> Result<Self> {
        let identity = ledger.session().ok_or(Error::AuthRequired)?;
        let seen = Cache::new(config.seen_capacity);
        Ok(Self {
            config,
            ledger,
            notifier,
            store,
            verifier,
            identity,
            seen,
        })
    }

    /// Reconcile every alert created by one commit.
    ///
    /// Stops at the first failing record; records before it stay persisted.
    pub async fn handle_commit(&self, commit: &CommitEvent) -> Result<CommitReport> {
        increment("reconciler_commits_total", 1);
        set_gauge("reconciler_last_seq", commit.seq as f64);

        let mut summary = CommitReport::default();
        if !self.identity.owns(&commit.repo) {
            return Ok(summary);
        }

        let creates: Vec<&RepoOp> = commit.ops.iter().filter(|op| is_alert_create(op)).collect();
        if creates.is_empty() {
            return Ok(summary);
        }
        if commit.too_big {
            return Err(Error::Decode(format!(
                "commit seq {} from {} omitted its blocks",
                commit.seq, commit.repo
            )));
        }

        let blocks = CarBlocks::parse(&commit.blocks)?;
        let root = commit
            .commit
            .clone()
            .or_else(|| blocks.roots().first().cloned())
            .ok_or_else(|| Error::Decode(format!("commit seq {} has no root", commit.seq)))?;

        for op in creates {
            let declared = op
                .cid
                .as_ref()
                .ok_or_else(|| Error::Decode(format!("create at {} has no CID", op.path)))?;
            let block = self.extract_verified(&blocks, &root, &op.path, declared)?;

            if self.seen.contains_key(declared) {
                increment("reconciler_replays_skipped_total", 1);
                tracing::debug!(path = %op.path, cid = %declared, "Skipping reconciled record");
                summary.replays += 1;
                continue;
            }

            let (alert, blob) = AlertRecord::from_cbor(block)?.into_parts()?;
            let feature = self.hydrate(alert, blob).await?;

            self.store.upsert(&feature).await?;
            increment("reconciler_alerts_persisted_total", 1);

            self.notify(&feature).await?;
            self.seen.insert(declared.clone(), ());

            tracing::info!(id = %feature.id, path = %op.path, seq = commit.seq, "Reconciled alert");
            summary.persisted.push(feature.id);
        }

        Ok(summary)
    }

    /// Record bytes for `path`, checked against the declared CID.
    ///
    /// The commit tree must map `path` to the declared CID and the block
    /// stored under it must hash to that CID.
    fn extract_verified<'a>(
        &self,
        blocks: &'a CarBlocks,
        root: &Cid,
        path: &str,
        declared: &Cid,
    ) -> Result<&'a [u8]> {
        let record_cid = blocks
            .record_cid(root, path)?
            .ok_or_else(|| Error::Decode(format!("{path} is not in the commit tree")))?;
        if record_cid != *declared {
            increment("reconciler_integrity_failures_total", 1);
            tracing::warn!(path, tree = %record_cid, declared = %declared, "Commit tree disagrees with op CID");
            return Err(Error::Integrity {
                path: path.to_string(),
                declared: declared.to_string(),
            });
        }
        let block = blocks
            .get(&record_cid)
            .ok_or_else(|| Error::Decode(format!("record block {record_cid} missing from CAR")))?;

        if !self.verifier.verify(block, declared) {
            increment("reconciler_integrity_failures_total", 1);
            return Err(Error::Integrity {
                path: path.to_string(),
                declared: declared.to_string(),
            });
        }
        Ok(block)
    }

    /// Rebuild the store feature: blob geometry plus stored zone shapes.
    async fn hydrate(&self, mut alert: Alert, blob: Option<BlobRef>) -> Result<Feature> {
        let mut shapes: Vec<Geometry> = Vec::new();

        if let Some(blob) = blob {
            let bytes = self.ledger.get_blob(&blob.cid, &self.identity.did).await?;
            match Geometry::from_geojson(&bytes)? {
                Geometry::GeometryCollection { geometries } => shapes.extend(geometries),
                shape => shapes.push(shape),
            }
        }

        for zone in self.store.zones(&alert.affected_zones).await? {
            if let Some(shape) = zone.geometry {
                if !shapes.contains(&shape) {
                    shapes.push(shape);
                }
            }
        }

        alert.geometry = Geometry::collection(shapes);
        Ok(alert.to_feature()?)
    }

    async fn notify(&self, feature: &Feature) -> Result<()> {
        let severity = feature.string_property("severity").unwrap_or_default();
        let headline = feature.string_property("headline").unwrap_or_default();
        let (text, facet) = notification(&self.config.base_url, &feature.id, severity, headline);

        let post = self.notifier.create_post(&text, vec![facet]).await?;
        increment("reconciler_notifications_total", 1);
        tracing::debug!(id = %feature.id, uri = %post.uri, "Posted notification");
        Ok(())
    }

    /// Follow the commit stream until cancelled.
    ///
    /// Per-commit errors and undecodable frames are reported and skipped. A
    /// transport failure or the end of the stream is returned.
    pub async fn run(&self, cancel: CancellationToken, errors: ErrorSender) -> Result<()> {
        let mut stream = self.ledger.subscribe_commits().await?;
        tracing::info!(did = %self.identity.did, handle = %self.identity.handle, "Firehose reconciler started");

        let result = loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                next = stream.next_commit() => next,
            };

            match next {
                Ok(Some(commit)) => {
                    if let Err(e) = self.handle_commit(&commit).await {
                        increment_kind("reconciler_errors_total", e.kind().as_str());
                        tracing::warn!(seq = commit.seq, error = %e, "Failed to reconcile commit");
                        report(&errors, COMPONENT, e);
                    }
                }
                Ok(None) => break Err(Error::StreamClosed),
                Err(e) if e.kind() == ErrorKind::Decode => {
                    increment_kind("reconciler_errors_total", e.kind().as_str());
                    report(&errors, COMPONENT, e);
                }
                Err(e) => break Err(e),
            }
        };

        if let Err(e) = stream.close().await {
            tracing::debug!(error = %e, "Closing commit stream failed");
        }
        tracing::info!("Firehose reconciler stopped");
        result
    }
}

fn is_alert_create(op: &RepoOp) -> bool {
    op.action == RepoAction::Create
        && op
            .path
            .strip_prefix(ALERT_COLLECTION)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Notification text and the link facet over its trailing URL.
fn notification(base_url: &str, id: &str, severity: &str, headline: &str) -> (String, Facet) {
    let url = format!("{}/alert/{}", base_url.trim_end_matches('/'), id);
    let text = format!(
        "{} Weather Alert: {}. See more at {}",
        severity.to_uppercase(),
        headline,
        url
    );
    let facet = Facet::link(text.len() - url.len(), &url);
    (text, facet)
}
