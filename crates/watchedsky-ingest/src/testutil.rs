//! In-memory collaborators and fixtures for tests.
//!
//! Available to unit tests and, with the `testutil` feature, to integration
//! tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use watchedsky_core::{Alert, Cid, Feature, FeatureType, Geometry, Position};

use crate::ledger::{
    ALERT_COLLECTION, AlertRecord, BlobRef, CommitEvent, CommitStream, Facet, Ledger,
    ListedRecord, Notifier, POST_COLLECTION, PostRecord, RecordRef, RepoAction, RepoOp, Session,
    encode_car, encode_flat_commit,
};
use crate::source::{AlertSource, FeedSnapshot};
use crate::store::{DocumentStore, FeatureFilter, FindOptions};
use crate::{Error, Result};

// =============================================================================
// Fixtures
// =============================================================================

/// A session for `did` / `handle` with placeholder tokens.
pub fn session(did: &str, handle: &str) -> Session {
    Session {
        did: did.to_string(),
        handle: handle.to_string(),
        access_jwt: "access".to_string(),
        refresh_jwt: "refresh".to_string(),
    }
}

/// A typed alert with plausible feed values.
pub fn alert(id: &str, sent: &str) -> Alert {
    Alert {
        id: id.to_string(),
        certainty: "Likely".to_string(),
        description: format!("Description of {id}"),
        event: "Severe Thunderstorm Warning".to_string(),
        headline: format!("Severe Thunderstorm Warning {id}"),
        message_type: "Alert".to_string(),
        sender: "w-nws.webmaster@noaa.gov".to_string(),
        sender_name: "NWS Norman OK".to_string(),
        sent: sent.to_string(),
        severity: "Severe".to_string(),
        status: "Actual".to_string(),
        urgency: "Immediate".to_string(),
        ..Default::default()
    }
}

/// Store representation of [`alert`].
pub fn alert_feature(id: &str, sent: &str) -> Feature {
    alert(id, sent)
        .to_feature()
        .expect("fixture alert converts to a feature")
}

/// An alert feature listing `zones` and carrying no geometry.
pub fn zoned_alert_feature(id: &str, sent: &str, zones: &[&str]) -> Feature {
    let mut alert = alert(id, sent);
    alert.affected_zones = zones.iter().map(|z| z.to_string()).collect();
    alert
        .to_feature()
        .expect("fixture alert converts to a feature")
}

/// A zone feature with a geometry.
pub fn zone_feature(id: &str, geometry: Geometry) -> Feature {
    let mut zone = Feature::new(id, FeatureType::Zone);
    zone.geometry = Some(geometry);
    zone
}

/// Unit square polygon with its lower-left corner at (`lon`, `lat`).
pub fn square(lon: f64, lat: f64) -> Geometry {
    Geometry::Polygon {
        coordinates: vec![vec![
            Position::new(lon, lat),
            Position::new(lon + 1.0, lat),
            Position::new(lon + 1.0, lat + 1.0),
            Position::new(lon, lat + 1.0),
            Position::new(lon, lat),
        ]],
    }
}

// =============================================================================
// Alert source
// =============================================================================

#[derive(Default)]
struct SourceState {
    features: Vec<Feature>,
    failures_left: usize,
    fetches: usize,
}

/// An [`AlertSource`] returning a fixed snapshot until told otherwise.
#[derive(Default)]
pub struct StaticAlertSource {
    state: Mutex<SourceState>,
}

impl StaticAlertSource {
    pub fn new(features: Vec<Feature>) -> Self {
        Self {
            state: Mutex::new(SourceState {
                features,
                ..Default::default()
            }),
        }
    }

    /// Replace the snapshot returned by later fetches.
    pub fn set_features(&self, features: Vec<Feature>) {
        self.state.lock().features = features;
    }

    /// Fail the next `n` fetches with an HTTP 503.
    pub fn fail_next(&self, n: usize) {
        self.state.lock().failures_left = n;
    }

    pub fn fetches(&self) -> usize {
        self.state.lock().fetches
    }
}

#[async_trait]
impl AlertSource for StaticAlertSource {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn fetch(&self) -> Result<FeedSnapshot> {
        let mut state = self.state.lock();
        state.fetches += 1;
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(Error::Status {
                endpoint: "static".to_string(),
                status: 503,
                message: "unavailable".to_string(),
            });
        }
        Ok(FeedSnapshot {
            features: state.features.clone(),
            rejected: Vec::new(),
        })
    }
}

// =============================================================================
// Document store wrapper
// =============================================================================

/// Wraps a store and injects failures into selected operations.
pub struct FlakyStore {
    inner: Arc<dyn DocumentStore>,
    insert_failures_left: AtomicUsize,
    fail_zone_lookups: AtomicBool,
    insert_calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn DocumentStore>) -> Self {
        Self {
            inner,
            insert_failures_left: AtomicUsize::new(0),
            fail_zone_lookups: AtomicBool::new(false),
            insert_calls: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` batch inserts before they reach the inner store.
    pub fn fail_inserts(&self, n: usize) {
        self.insert_failures_left.store(n, Ordering::SeqCst);
    }

    pub fn fail_zone_lookups(&self, fail: bool) {
        self.fail_zone_lookups.store(fail, Ordering::SeqCst);
    }

    /// Batch inserts attempted, failed ones included.
    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn find(&self, filter: &FeatureFilter, options: FindOptions) -> Result<Vec<Feature>> {
        let zone_lookup = filter.feature_type == Some(FeatureType::Zone);
        if zone_lookup && self.fail_zone_lookups.load(Ordering::SeqCst) {
            return Err(Error::Database("zone lookup unavailable".to_string()));
        }
        self.inner.find(filter, options).await
    }

    async fn insert_many(&self, features: &[Feature]) -> Result<()> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .insert_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::Database("injected insert failure".to_string()));
        }
        self.inner.insert_many(features).await
    }

    async fn upsert(&self, feature: &Feature) -> Result<()> {
        self.inner.upsert(feature).await
    }
}

// =============================================================================
// Ledger
// =============================================================================

enum StreamItem {
    Commit(CommitEvent),
    Decode(String),
    Transport(String),
}

/// A record held by [`MemoryLedger`].
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub repo: String,
    pub collection: String,
    pub uri: String,
    pub cid: Cid,
    pub value: serde_json::Value,
}

#[derive(Default)]
struct LedgerState {
    seq: i64,
    records: Vec<StoredRecord>,
    blobs: HashMap<Cid, Vec<u8>>,
    commits: Vec<CommitEvent>,
    subscribers: Vec<mpsc::UnboundedSender<StreamItem>>,
}

/// An append-only in-memory ledger.
///
/// Every created record becomes a commit with a real CAR block set and is
/// pushed to all open subscriptions. Subscriptions only see commits made
/// after they were opened, like a live firehose without a cursor.
#[derive(Default)]
pub struct MemoryLedger {
    session: Mutex<Option<Session>>,
    state: Mutex<LedgerState>,
    fail_creates: AtomicBool,
}

impl MemoryLedger {
    /// A ledger without a session.
    pub fn new() -> Self {
        Self::default()
    }

    /// A ledger logged in as `did` / `handle`.
    pub fn authenticated(did: &str, handle: &str) -> Self {
        let ledger = Self::default();
        *ledger.session.lock() = Some(session(did, handle));
        ledger
    }

    /// Make record creation fail with a server error.
    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Records of `collection`, oldest first.
    pub fn records(&self, collection: &str) -> Vec<StoredRecord> {
        self.state
            .lock()
            .records
            .iter()
            .filter(|r| r.collection == collection)
            .cloned()
            .collect()
    }

    /// Notification posts, oldest first.
    pub fn posts(&self) -> Vec<PostRecord> {
        self.records(POST_COLLECTION)
            .into_iter()
            .filter_map(|r| serde_json::from_value(r.value).ok())
            .collect()
    }

    /// Every commit made so far, oldest first.
    pub fn commits(&self) -> Vec<CommitEvent> {
        self.state.lock().commits.clone()
    }

    pub fn blob_count(&self) -> usize {
        self.state.lock().blobs.len()
    }

    /// Push a commit to open subscriptions without recording it.
    pub fn emit(&self, commit: CommitEvent) {
        self.broadcast(|| StreamItem::Commit(commit.clone()));
    }

    /// Push an undecodable frame to open subscriptions.
    pub fn emit_decode_error(&self, message: &str) {
        self.broadcast(|| StreamItem::Decode(message.to_string()));
    }

    /// Break open subscriptions with a transport error.
    pub fn fail_streams(&self, message: &str) {
        self.broadcast(|| StreamItem::Transport(message.to_string()));
    }

    /// Open subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// End open subscriptions.
    pub fn close_streams(&self) {
        self.state.lock().subscribers.clear();
    }

    fn broadcast(&self, item: impl Fn() -> StreamItem) {
        self.state
            .lock()
            .subscribers
            .retain(|tx| tx.send(item()).is_ok());
    }

    fn append(&self, repo: &str, collection: &str, value: serde_json::Value) -> Result<RecordRef> {
        let block = serde_cbor::to_vec(&value)?;
        let cid = Cid::dag_cbor(&block);

        let mut state = self.state.lock();
        state.seq += 1;
        let seq = state.seq;
        let path = format!("{collection}/3k{seq:011}");
        let uri = format!("at://{repo}/{path}");

        let (commit_cid, mut blocks) = encode_flat_commit(repo, &[(path.clone(), cid.clone())])?;
        blocks.push((cid.clone(), block));
        let commit = CommitEvent {
            repo: repo.to_string(),
            seq,
            ops: vec![RepoOp {
                action: RepoAction::Create,
                path,
                cid: Some(cid.clone()),
            }],
            blocks: encode_car(&[commit_cid.clone()], &blocks)?,
            commit: Some(commit_cid),
            too_big: false,
            time: Utc::now().to_rfc3339(),
        };

        state.records.push(StoredRecord {
            repo: repo.to_string(),
            collection: collection.to_string(),
            uri: uri.clone(),
            cid: cid.clone(),
            value,
        });
        state.commits.push(commit.clone());
        state
            .subscribers
            .retain(|tx| tx.send(StreamItem::Commit(commit.clone())).is_ok());

        Ok(RecordRef { uri, cid })
    }

    fn require_owner(&self, repo: &str) -> Result<Session> {
        let session = self.session.lock().clone().ok_or(Error::AuthRequired)?;
        if !session.owns(repo) {
            return Err(Error::Xrpc {
                method: "com.atproto.repo.createRecord".to_string(),
                error: "InvalidRequest".to_string(),
                message: format!("session cannot write to {repo}"),
            });
        }
        Ok(session)
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    fn session(&self) -> Option<Session> {
        self.session.lock().clone()
    }

    async fn create_record(
        &self,
        collection: &str,
        repo: &str,
        record: serde_json::Value,
    ) -> Result<RecordRef> {
        let session = self.require_owner(repo)?;
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(Error::Xrpc {
                method: "com.atproto.repo.createRecord".to_string(),
                error: "InternalServerError".to_string(),
                message: "injected failure".to_string(),
            });
        }
        self.append(&session.did, collection, record)
    }

    async fn upload_blob(&self, bytes: Vec<u8>, mime_type: &str) -> Result<BlobRef> {
        if self.session.lock().is_none() {
            return Err(Error::AuthRequired);
        }
        let cid = Cid::raw(&bytes);
        let size = bytes.len() as u64;
        self.state.lock().blobs.insert(cid.clone(), bytes);
        Ok(BlobRef::new(cid, mime_type, size))
    }

    async fn get_blob(&self, cid: &Cid, _did: &str) -> Result<Vec<u8>> {
        self.state
            .lock()
            .blobs
            .get(cid)
            .cloned()
            .ok_or_else(|| Error::Xrpc {
                method: "com.atproto.sync.getBlob".to_string(),
                error: "BlobNotFound".to_string(),
                message: format!("no blob {cid}"),
            })
    }

    async fn list_records(
        &self,
        collection: &str,
        repo: &str,
        limit: usize,
    ) -> Result<Vec<ListedRecord>> {
        let did = match self.session.lock().as_ref() {
            Some(session) if session.owns(repo) => session.did.clone(),
            _ => repo.to_string(),
        };

        Ok(self
            .state
            .lock()
            .records
            .iter()
            .rev()
            .filter(|r| r.collection == collection && r.repo == did)
            .take(limit)
            .map(|r| ListedRecord {
                uri: r.uri.clone(),
                cid: r.cid.clone(),
                value: r.value.clone(),
            })
            .collect())
    }

    async fn subscribe_commits(&self) -> Result<Box<dyn CommitStream>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().subscribers.push(tx);
        Ok(Box::new(MemoryCommitStream { rx }))
    }
}

#[async_trait]
impl Notifier for MemoryLedger {
    async fn create_post(&self, text: &str, facets: Vec<Facet>) -> Result<RecordRef> {
        let session = self.session.lock().clone().ok_or(Error::AuthRequired)?;
        let post = PostRecord::new(text, facets, Utc::now());
        self.append(&session.did, POST_COLLECTION, serde_json::to_value(&post)?)
    }
}

struct MemoryCommitStream {
    rx: mpsc::UnboundedReceiver<StreamItem>,
}

#[async_trait]
impl CommitStream for MemoryCommitStream {
    async fn next_commit(&mut self) -> Result<Option<CommitEvent>> {
        match self.rx.recv().await {
            Some(StreamItem::Commit(commit)) => Ok(Some(commit)),
            Some(StreamItem::Decode(message)) => Err(Error::Decode(message)),
            Some(StreamItem::Transport(message)) => Err(Error::WebSocket(message)),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.rx.close();
        Ok(())
    }
}

// =============================================================================
// Commit builder
// =============================================================================

struct BuiltOp {
    action: RepoAction,
    path: String,
    declared: Option<Cid>,
    /// Tree entry for the path when it differs from `declared`.
    tree: Option<Cid>,
    shipped: Option<Vec<u8>>,
}

/// Builds commits with hand-picked operations and blocks.
pub struct CommitBuilder {
    repo: String,
    seq: i64,
    ops: Vec<BuiltOp>,
}

impl CommitBuilder {
    pub fn new(repo: &str) -> Self {
        Self {
            repo: repo.to_string(),
            seq: 1,
            ops: Vec::new(),
        }
    }

    pub fn seq(mut self, seq: i64) -> Self {
        self.seq = seq;
        self
    }

    /// Create an alert record under `social.watchedsky.alert/<rkey>`.
    pub fn create_alert(self, rkey: &str, record: &AlertRecord) -> Self {
        let block = record.to_cbor().expect("alert record encodes");
        self.op(RepoAction::Create, &format!("{ALERT_COLLECTION}/{rkey}"), block)
    }

    /// An operation whose block is `block`.
    pub fn op(self, action: RepoAction, path: &str, block: Vec<u8>) -> Self {
        let cid = Cid::dag_cbor(&block);
        self.push(action, path, Some(cid), Some(block))
    }

    /// A create that declares the CID of `declared_block` but ships
    /// `shipped_block` under it.
    pub fn tampered(self, path: &str, declared_block: &[u8], shipped_block: Vec<u8>) -> Self {
        let cid = Cid::dag_cbor(declared_block);
        self.push(RepoAction::Create, path, Some(cid), Some(shipped_block))
    }

    /// A create whose tree entry points at the CID of `tree_block` while the
    /// op declares the CID of `record`. The record bytes are shipped under
    /// the tree's key.
    pub fn misplaced(mut self, path: &str, tree_block: &[u8], record: Vec<u8>) -> Self {
        let declared = Cid::dag_cbor(&record);
        self = self.push(RepoAction::Create, path, Some(declared), Some(record));
        if let Some(op) = self.ops.last_mut() {
            op.tree = Some(Cid::dag_cbor(tree_block));
        }
        self
    }

    pub fn delete(self, path: &str) -> Self {
        self.push(RepoAction::Delete, path, None, None)
    }

    fn push(
        mut self,
        action: RepoAction,
        path: &str,
        declared: Option<Cid>,
        shipped: Option<Vec<u8>>,
    ) -> Self {
        self.ops.push(BuiltOp {
            action,
            path: path.to_string(),
            declared,
            tree: None,
            shipped,
        });
        self
    }

    pub fn build(self) -> CommitEvent {
        let entries: Vec<(String, Cid)> = self
            .ops
            .iter()
            .filter_map(|op| {
                let key = op.tree.as_ref().or(op.declared.as_ref())?;
                Some((op.path.clone(), key.clone()))
            })
            .collect();
        let (commit_cid, mut blocks) =
            encode_flat_commit(&self.repo, &entries).expect("tree encodes");
        for op in &self.ops {
            if let (Some(cid), Some(block)) = (op.tree.as_ref().or(op.declared.as_ref()), &op.shipped) {
                blocks.push((cid.clone(), block.clone()));
            }
        }

        CommitEvent {
            repo: self.repo,
            seq: self.seq,
            ops: self
                .ops
                .into_iter()
                .map(|op| RepoOp {
                    action: op.action,
                    path: op.path,
                    cid: op.declared,
                })
                .collect(),
            blocks: encode_car(&[commit_cid.clone()], &blocks).expect("CAR encodes"),
            commit: Some(commit_cid),
            too_big: false,
            time: "2024-01-01T00:00:00Z".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::CarBlocks;

    #[tokio::test]
    async fn test_memory_ledger_commit_materializes() {
        let ledger = MemoryLedger::authenticated("did:plc:svc", "svc.test");
        let mut stream = ledger.subscribe_commits().await.unwrap();

        let record = AlertRecord::new(&alert("a1", "2024-01-01T00:00:00Z"), None);
        let created = ledger
            .create_record(ALERT_COLLECTION, "svc.test", serde_json::to_value(&record).unwrap())
            .await
            .unwrap();

        let commit = stream.next_commit().await.unwrap().unwrap();
        assert_eq!(commit.repo, "did:plc:svc");
        let blocks = CarBlocks::parse(&commit.blocks).unwrap();
        let path = &commit.ops[0].path;
        let found = blocks
            .record_cid(commit.commit.as_ref().unwrap(), path)
            .unwrap()
            .unwrap();
        assert_eq!(found, created.cid);

        let decoded = AlertRecord::from_cbor(blocks.get(&found).unwrap()).unwrap();
        assert_eq!(decoded.alert.id, "a1");
    }

    #[tokio::test]
    async fn test_memory_ledger_requires_session() {
        let ledger = MemoryLedger::new();
        let err = ledger
            .create_record(ALERT_COLLECTION, "did:plc:x", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthRequired));
    }

    #[test]
    fn test_commit_builder_tampering() {
        let good = b"good".to_vec();
        let commit = CommitBuilder::new("did:plc:svc")
            .tampered("social.watchedsky.alert/x", &good, b"evil".to_vec())
            .build();
        let blocks = CarBlocks::parse(&commit.blocks).unwrap();
        let declared = commit.ops[0].cid.clone().unwrap();
        assert_eq!(blocks.get(&declared).unwrap(), b"evil");
    }
}
