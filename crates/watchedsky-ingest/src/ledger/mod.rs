//! The public ledger: an append-only, content-addressed record repository.
//!
//! The pipeline only needs a narrow view of the ledger, captured by the
//! [`Ledger`] trait: write records and blobs into the service's own
//! repository, read blobs and records back, and subscribe to the global
//! commit stream. [`XrpcClient`] implements it against an AT Protocol PDS
//! and relay; tests substitute an in-memory log.
//!
//! # Architecture
//!
//! ```text
//!  Publisher ──createRecord/uploadBlob──▶ PDS ──▶ relay firehose
//!                                                     │
//!                                 subscribeRepos (CBOR frames + CAR blocks)
//!                                                     ▼
//!                                              CommitStream ──▶ Reconciler
//! ```

mod car;
mod firehose;
mod post;
mod record;
mod xrpc;

pub use car::{CarBlocks, encode_car};
#[cfg(any(test, feature = "testutil"))]
pub use car::encode_flat_commit;
pub use firehose::{FirehoseStream, Frame, decode_frame};
pub use post::{ByteSlice, Facet, FacetFeature, PostRecord};
pub use record::AlertRecord;
pub use xrpc::{XrpcClient, XrpcConfig};

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use watchedsky_core::Cid;

use crate::Result;

/// Collection (NSID) holding published alerts.
pub const ALERT_COLLECTION: &str = "social.watchedsky.alert";

/// Collection holding notification posts.
pub const POST_COLLECTION: &str = "app.bsky.feed.post";

/// An authenticated ledger session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub did: String,
    pub handle: String,
    pub access_jwt: String,
    pub refresh_jwt: String,
}

impl Session {
    /// True if `repo` names this session's repository, by DID or handle.
    pub fn owns(&self, repo: &str) -> bool {
        repo == self.did || repo == self.handle
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("did", &self.did)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Address of a written record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordRef {
    pub uri: String,
    pub cid: Cid,
}

/// Reference to an uploaded blob, as embedded in records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    #[serde(rename = "$type", default = "blob_type")]
    pub kind: String,
    #[serde(rename = "ref")]
    pub cid: Cid,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub size: u64,
}

fn blob_type() -> String {
    "blob".to_string()
}

impl BlobRef {
    pub fn new(cid: Cid, mime_type: impl Into<String>, size: u64) -> Self {
        Self {
            kind: blob_type(),
            cid,
            mime_type: mime_type.into(),
            size,
        }
    }
}

/// A record returned by `listRecords`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListedRecord {
    pub uri: String,
    pub cid: Cid,
    pub value: serde_json::Value,
}

/// Kind of change an operation makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoAction {
    Create,
    Update,
    Delete,
    #[serde(other)]
    Unknown,
}

/// One record-level change within a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoOp {
    pub action: RepoAction,
    /// `<collection>/<record key>`.
    pub path: String,
    /// Declared CID of the new record; absent for deletes.
    #[serde(default)]
    pub cid: Option<Cid>,
}

/// A `#commit` event from the repository stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitEvent {
    pub repo: String,
    pub seq: i64,
    #[serde(default)]
    pub ops: Vec<RepoOp>,
    /// CAR file with the commit block and changed tree nodes and records.
    #[serde(default, with = "serde_bytes")]
    pub blocks: Vec<u8>,
    /// Root commit block; CAR roots are used when absent.
    #[serde(default)]
    pub commit: Option<Cid>,
    /// Set when the relay dropped `blocks` because the commit was too large.
    #[serde(default)]
    pub too_big: bool,
    #[serde(default)]
    pub time: String,
}

/// The ledger operations the pipeline depends on.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// The current session, if authenticated.
    fn session(&self) -> Option<Session>;

    /// Write `record` into `collection` of `repo`.
    async fn create_record(
        &self,
        collection: &str,
        repo: &str,
        record: serde_json::Value,
    ) -> Result<RecordRef>;

    /// Upload a content-addressed blob.
    async fn upload_blob(&self, bytes: Vec<u8>, mime_type: &str) -> Result<BlobRef>;

    /// Fetch a blob owned by `did`.
    async fn get_blob(&self, cid: &Cid, did: &str) -> Result<Vec<u8>>;

    /// Most recent records of a collection, newest first.
    async fn list_records(
        &self,
        collection: &str,
        repo: &str,
        limit: usize,
    ) -> Result<Vec<ListedRecord>>;

    /// Open the global commit stream.
    async fn subscribe_commits(&self) -> Result<Box<dyn CommitStream>>;
}

/// A live stream of commits.
#[async_trait]
pub trait CommitStream: Send {
    /// The next commit; `Ok(None)` once the stream has ended.
    ///
    /// Decode errors for a single frame are returned without ending the
    /// stream; transport errors end it.
    async fn next_commit(&mut self) -> Result<Option<CommitEvent>>;

    /// Tear the stream down.
    async fn close(&mut self) -> Result<()>;
}

/// Human-readable notification channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Publish a short post with rich-text facets.
    async fn create_post(&self, text: &str, facets: Vec<Facet>) -> Result<RecordRef>;
}
