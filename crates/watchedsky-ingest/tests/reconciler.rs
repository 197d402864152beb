//! Reconciler behavior: filtering, verification, hydration, idempotence.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use watchedsky_core::{Geometry, Sha256Verifier};
use watchedsky_ingest::ledger::{
    ALERT_COLLECTION, AlertRecord, CommitEvent, FacetFeature, POST_COLLECTION, RepoAction,
};
use watchedsky_ingest::store::{FeatureFilter, FindOptions};
use watchedsky_ingest::testutil::{
    CommitBuilder, MemoryLedger, alert, alert_feature, square, zone_feature,
};
use watchedsky_ingest::{
    DocumentStore, Error, ErrorKind, Publisher, Reconciler, ReconcilerConfig, SqliteStore,
    error_channel,
};

const DID: &str = "did:plc:svc";
const HANDLE: &str = "svc.test";
const SENT: &str = "2024-05-20T21:14:00Z";

struct Harness {
    ledger: Arc<MemoryLedger>,
    store: Arc<SqliteStore>,
    reconciler: Reconciler,
}

impl Harness {
    fn new() -> Self {
        let ledger = Arc::new(MemoryLedger::authenticated(DID, HANDLE));
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let reconciler = reconciler(&ledger, &store);
        Self {
            ledger,
            store,
            reconciler,
        }
    }

    /// Publish `feature` and return the commit that carried it.
    async fn publish(&self, feature: &watchedsky_core::Feature) -> CommitEvent {
        Publisher::new(self.ledger.clone())
            .publish(feature)
            .await
            .unwrap();
        self.ledger.commits().pop().unwrap()
    }

    async fn stored(&self, id: &str) -> Option<watchedsky_core::Feature> {
        self.store
            .find(
                &FeatureFilter {
                    feature_type: None,
                    ids: Some(vec![id.to_string()]),
                },
                FindOptions::default(),
            )
            .await
            .unwrap()
            .into_iter()
            .next()
    }
}

fn reconciler(ledger: &Arc<MemoryLedger>, store: &Arc<SqliteStore>) -> Reconciler {
    Reconciler::new(
        ReconcilerConfig {
            base_url: "https://watchedsky.social".to_string(),
            seen_capacity: 100,
        },
        ledger.clone(),
        ledger.clone(),
        store.clone(),
        Arc::new(Sha256Verifier),
    )
    .unwrap()
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

// =============================================================================
// Happy path
// =============================================================================

#[tokio::test]
async fn test_published_alert_is_persisted_and_announced() {
    let h = Harness::new();
    let mut published = alert("urn:oid:2.49.0.1.840.0.1", SENT);
    published.geometry = Some(square(-97.0, 35.0));
    let commit = h.publish(&published.to_feature().unwrap()).await;

    let report = h.reconciler.handle_commit(&commit).await.unwrap();
    assert_eq!(report.persisted, vec![published.id.clone()]);

    let stored = h.stored(&published.id).await.unwrap();
    assert!(stored.is_alert());
    assert_eq!(
        stored.geometry,
        Some(Geometry::GeometryCollection {
            geometries: vec![square(-97.0, 35.0)]
        })
    );

    let posts = h.ledger.posts();
    assert_eq!(posts.len(), 1);
    let url = "https://watchedsky.social/alert/urn:oid:2.49.0.1.840.0.1";
    assert_eq!(
        posts[0].text,
        format!(
            "SEVERE Weather Alert: Severe Thunderstorm Warning urn:oid:2.49.0.1.840.0.1. See more at {url}"
        )
    );
    let facet = &posts[0].facets[0];
    assert_eq!(&posts[0].text[facet.index.byte_start..facet.index.byte_end], url);
    assert_eq!(
        facet.features,
        vec![FacetFeature::Link {
            uri: url.to_string()
        }]
    );
}

#[tokio::test]
async fn test_no_blob_and_no_zones_is_null_geometry() {
    let h = Harness::new();
    let commit = h.publish(&alert_feature("plain", SENT)).await;

    h.reconciler.handle_commit(&commit).await.unwrap();
    assert!(h.stored("plain").await.unwrap().geometry.is_none());
}

#[tokio::test]
async fn test_known_zones_are_added_to_geometry() {
    let h = Harness::new();
    h.store
        .insert_many(&[
            zone_feature("Z1", square(0.0, 0.0)),
            zone_feature("Z2", square(5.0, 5.0)),
        ])
        .await
        .unwrap();

    let mut zoned = alert("zoned", SENT);
    zoned.affected_zones = vec!["Z1".into(), "Z2".into(), "Z9".into()];
    // Published geometry already holds Z1; it must not appear twice.
    zoned.geometry = Some(Geometry::GeometryCollection {
        geometries: vec![square(0.0, 0.0)],
    });
    let commit = h.publish(&zoned.to_feature().unwrap()).await;

    h.reconciler.handle_commit(&commit).await.unwrap();
    match h.stored("zoned").await.unwrap().geometry.unwrap() {
        Geometry::GeometryCollection { geometries } => {
            assert_eq!(geometries, vec![square(0.0, 0.0), square(5.0, 5.0)]);
        }
        other => panic!("expected a collection, got {}", other.kind()),
    }
}

// =============================================================================
// Idempotence
// =============================================================================

#[tokio::test]
async fn test_replay_yields_one_document() {
    let h = Harness::new();
    let commit = h.publish(&alert_feature("a1", SENT)).await;

    let first = h.reconciler.handle_commit(&commit).await.unwrap();
    assert_eq!(first.persisted.len(), 1);
    for _ in 0..4 {
        let replay = h.reconciler.handle_commit(&commit).await.unwrap();
        assert!(replay.persisted.is_empty());
        assert_eq!(replay.replays, 1);
    }
    assert_eq!(h.store.count().unwrap(), 1);
    assert_eq!(h.ledger.posts().len(), 1);

    // A restarted reconciler has no memory of the first pass; the upsert
    // still keeps a single document.
    let restarted = reconciler(&h.ledger, &h.store);
    restarted.handle_commit(&commit).await.unwrap();
    assert_eq!(h.store.count().unwrap(), 1);
}

// =============================================================================
// Filtering
// =============================================================================

#[tokio::test]
async fn test_foreign_repo_ignored() {
    let h = Harness::new();
    let record = AlertRecord::new(&alert("foreign", SENT), None);
    let commit = CommitBuilder::new("did:plc:someone-else")
        .create_alert("3kfor", &record)
        .build();

    let report = h.reconciler.handle_commit(&commit).await.unwrap();
    assert!(report.persisted.is_empty());
    assert_eq!(h.store.count().unwrap(), 0);
}

#[tokio::test]
async fn test_repo_matched_by_handle() {
    let h = Harness::new();
    let record = AlertRecord::new(&alert("by-handle", SENT), None);
    let commit = CommitBuilder::new(HANDLE)
        .create_alert("3khdl", &record)
        .build();

    let report = h.reconciler.handle_commit(&commit).await.unwrap();
    assert_eq!(report.persisted, vec!["by-handle".to_string()]);
}

#[tokio::test]
async fn test_non_create_and_other_collections_ignored() {
    let h = Harness::new();
    let record = AlertRecord::new(&alert("updated", SENT), None);
    let block = record.to_cbor().unwrap();
    let commit = CommitBuilder::new(DID)
        .op(
            RepoAction::Update,
            &format!("{ALERT_COLLECTION}/3kupd"),
            block.clone(),
        )
        .op(RepoAction::Create, &format!("{POST_COLLECTION}/3kpst"), block)
        .delete(&format!("{ALERT_COLLECTION}/3kdel"))
        .build();

    let report = h.reconciler.handle_commit(&commit).await.unwrap();
    assert!(report.persisted.is_empty());
    assert_eq!(h.store.count().unwrap(), 0);
}

// =============================================================================
// Errors
// =============================================================================

#[tokio::test]
async fn test_cid_mismatch_rejected_before_decode() {
    let h = Harness::new();
    let declared = AlertRecord::new(&alert("real", SENT), None).to_cbor().unwrap();
    // The shipped bytes are not even CBOR; a decode error here would mean
    // decoding ran before verification.
    let commit = CommitBuilder::new(DID)
        .tampered(
            &format!("{ALERT_COLLECTION}/3ktmp"),
            &declared,
            vec![0xff, 0xfe, 0xfd],
        )
        .build();

    let err = h.reconciler.handle_commit(&commit).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Integrity);
    match err {
        Error::Integrity { path, .. } => assert_eq!(path, format!("{ALERT_COLLECTION}/3ktmp")),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.store.count().unwrap(), 0);
    assert!(h.ledger.posts().is_empty());
}

#[tokio::test]
async fn test_tree_entry_must_match_declared_cid() {
    let h = Harness::new();
    let record = AlertRecord::new(&alert("a1", SENT), None).to_cbor().unwrap();
    // The shipped block hashes to the op's CID, but the tree says the path
    // holds a different record.
    let commit = CommitBuilder::new(DID)
        .misplaced(&format!("{ALERT_COLLECTION}/3kmis"), b"some other record", record)
        .build();

    let err = h.reconciler.handle_commit(&commit).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Integrity);
    assert!(matches!(err, Error::Integrity { .. }));
    assert_eq!(h.store.count().unwrap(), 0);
    assert!(h.ledger.posts().is_empty());
}

#[tokio::test]
async fn test_wrong_record_type_is_decode_error() {
    let h = Harness::new();
    let mut value = serde_json::to_value(AlertRecord::new(&alert("odd", SENT), None)).unwrap();
    value["$type"] = serde_json::json!("app.bsky.feed.like");
    let commit = CommitBuilder::new(DID)
        .op(
            RepoAction::Create,
            &format!("{ALERT_COLLECTION}/3kodd"),
            serde_cbor::to_vec(&value).unwrap(),
        )
        .build();

    let err = h.reconciler.handle_commit(&commit).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Decode);
    assert_eq!(h.store.count().unwrap(), 0);
}

#[tokio::test]
async fn test_oversized_commit_is_decode_error() {
    let h = Harness::new();
    let record = AlertRecord::new(&alert("big", SENT), None);
    let mut commit = CommitBuilder::new(DID).create_alert("3kbig", &record).build();
    commit.too_big = true;
    commit.blocks.clear();

    let err = h.reconciler.handle_commit(&commit).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Decode);
}

#[tokio::test]
async fn test_requires_session() {
    let ledger = Arc::new(MemoryLedger::new());
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let result = Reconciler::new(
        ReconcilerConfig::default(),
        ledger.clone(),
        ledger,
        store,
        Arc::new(Sha256Verifier),
    );
    assert!(matches!(result, Err(Error::AuthRequired)));
}

// =============================================================================
// Run loop
// =============================================================================

#[tokio::test]
async fn test_run_reconciles_stream_and_stops_on_transport_error() {
    let h = Arc::new(Harness::new());
    let (errors, mut rx) = error_channel();

    let task = {
        let h = h.clone();
        tokio::spawn(async move { h.reconciler.run(CancellationToken::new(), errors).await })
    };
    wait_for(|| h.ledger.subscriber_count() == 1).await;

    h.ledger.emit_decode_error("truncated frame");
    Publisher::new(h.ledger.clone())
        .publish(&alert_feature("live", SENT))
        .await
        .unwrap();
    wait_for(|| h.ledger.posts().len() == 1).await;
    assert_eq!(h.store.count().unwrap(), 1);

    h.ledger.fail_streams("connection reset");
    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::WebSocket(_)));

    let reported = rx.recv().await.unwrap();
    assert_eq!(reported.component, "reconciler");
    assert_eq!(reported.error.kind(), ErrorKind::Decode);
}

#[tokio::test]
async fn test_run_reports_stream_end() {
    let h = Arc::new(Harness::new());
    let (errors, _rx) = error_channel();

    let task = {
        let h = h.clone();
        tokio::spawn(async move { h.reconciler.run(CancellationToken::new(), errors).await })
    };
    wait_for(|| h.ledger.subscriber_count() == 1).await;

    h.ledger.close_streams();
    assert!(matches!(task.await.unwrap(), Err(Error::StreamClosed)));
}

#[tokio::test]
async fn test_run_stops_on_cancel() {
    let h = Arc::new(Harness::new());
    let (errors, _rx) = error_channel();
    let cancel = CancellationToken::new();

    let task = {
        let h = h.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { h.reconciler.run(cancel, errors).await })
    };
    wait_for(|| h.ledger.subscriber_count() == 1).await;

    cancel.cancel();
    task.await.unwrap().unwrap();
}
