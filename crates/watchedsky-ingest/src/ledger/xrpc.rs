//! XRPC client for an AT Protocol PDS.
//!
//! Authenticated calls carry the session's access token. When the PDS
//! answers `ExpiredToken` the session is refreshed once and the call is
//! replayed; a second failure is returned to the caller.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use watchedsky_core::Cid;

use super::firehose::FirehoseStream;
use super::{
    BlobRef, CommitStream, Facet, Ledger, ListedRecord, Notifier, POST_COLLECTION, PostRecord,
    RecordRef, Session,
};
use crate::{Error, Result};

const CREATE_SESSION: &str = "com.atproto.server.createSession";
const REFRESH_SESSION: &str = "com.atproto.server.refreshSession";
const CREATE_RECORD: &str = "com.atproto.repo.createRecord";
const UPLOAD_BLOB: &str = "com.atproto.repo.uploadBlob";
const LIST_RECORDS: &str = "com.atproto.repo.listRecords";
const GET_BLOB: &str = "com.atproto.sync.getBlob";

const EXPIRED_TOKEN: &str = "ExpiredToken";

/// `listRecords` page size ceiling enforced by PDS implementations.
const MAX_LIST_LIMIT: usize = 100;

/// Connection settings for the ledger.
#[derive(Debug, Clone)]
pub struct XrpcConfig {
    pub pds_url: String,
    /// Handle or DID to log in as.
    pub identifier: String,
    /// App password.
    pub password: String,
    /// `subscribeRepos` endpoint of the relay.
    pub firehose_url: String,
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for XrpcConfig {
    fn default() -> Self {
        Self {
            pds_url: "https://bsky.social".to_string(),
            identifier: String::new(),
            password: String::new(),
            firehose_url: "wss://bsky.network/xrpc/com.atproto.sync.subscribeRepos".to_string(),
            timeout: Duration::from_secs(30),
            user_agent: "watchedsky.social/monitor".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Auth {
    None,
    Access,
}

#[derive(Serialize)]
struct CreateSessionInput<'a> {
    identifier: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct XrpcErrorBody {
    error: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct UploadBlobOutput {
    blob: BlobRef,
}

#[derive(Deserialize)]
struct ListRecordsOutput {
    #[serde(default)]
    records: Vec<ListedRecord>,
}

/// Ledger client speaking XRPC over HTTPS, with the relay firehose for
/// commit subscriptions.
pub struct XrpcClient {
    http: reqwest::Client,
    config: XrpcConfig,
    session: RwLock<Option<Session>>,
}

impl XrpcClient {
    pub fn new(config: XrpcConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| Error::Config(format!("HTTP client init failed: {e}")))?;

        Ok(Self {
            http,
            config,
            session: RwLock::new(None),
        })
    }

    /// Create a session with the configured credentials.
    pub async fn login(&self) -> Result<Session> {
        if self.config.identifier.is_empty() || self.config.password.is_empty() {
            return Err(Error::Config(
                "ledger identifier and password are required to log in".to_string(),
            ));
        }

        let input = CreateSessionInput {
            identifier: &self.config.identifier,
            password: &self.config.password,
        };
        let response = self
            .send(Method::POST, CREATE_SESSION, Auth::None, |req| req.json(&input))
            .await?;
        let session: Session = response.json().await?;

        tracing::info!(did = %session.did, handle = %session.handle, "Ledger session created");
        *self.session.write() = Some(session.clone());
        Ok(session)
    }

    /// Exchange the refresh token for a new session.
    pub async fn refresh(&self) -> Result<Session> {
        let refresh_jwt = self
            .session
            .read()
            .as_ref()
            .map(|s| s.refresh_jwt.clone())
            .ok_or(Error::AuthRequired)?;

        let response = self
            .http
            .post(self.url(REFRESH_SESSION))
            .bearer_auth(refresh_jwt)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(REFRESH_SESSION, response).await);
        }
        let session: Session = response.json().await?;

        tracing::info!(did = %session.did, "Ledger session refreshed");
        *self.session.write() = Some(session.clone());
        Ok(session)
    }

    fn url(&self, nsid: &str) -> String {
        format!("{}/xrpc/{}", self.config.pds_url.trim_end_matches('/'), nsid)
    }

    fn access_token(&self) -> Result<String> {
        self.session
            .read()
            .as_ref()
            .map(|s| s.access_jwt.clone())
            .ok_or(Error::AuthRequired)
    }

    fn require_session(&self) -> Result<Session> {
        self.session.read().clone().ok_or(Error::AuthRequired)
    }

    /// Issue a call, refreshing and replaying once on an expired token.
    async fn send<F>(&self, method: Method, nsid: &str, auth: Auth, build: F) -> Result<Response>
    where
        F: Fn(RequestBuilder) -> RequestBuilder + Send + Sync,
    {
        let mut refreshed = false;
        loop {
            let mut request = build(self.http.request(method.clone(), self.url(nsid)));
            if auth == Auth::Access {
                request = request.bearer_auth(self.access_token()?);
            }

            let response = request.send().await?;
            if response.status().is_success() {
                return Ok(response);
            }

            let err = error_from_response(nsid, response).await;
            let expired = matches!(&err, Error::Xrpc { error, .. } if error == EXPIRED_TOKEN);
            if auth == Auth::Access && expired && !refreshed {
                tracing::debug!(nsid, "Access token expired, refreshing");
                self.refresh().await?;
                refreshed = true;
                continue;
            }
            return Err(err);
        }
    }
}

async fn error_from_response(nsid: &str, response: Response) -> Error {
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    error_from_body(nsid, status, &text)
}

/// Map a failed response to a structured XRPC error when the body has one.
fn error_from_body(nsid: &str, status: u16, text: &str) -> Error {
    match serde_json::from_str::<XrpcErrorBody>(text) {
        Ok(body) => Error::Xrpc {
            method: nsid.to_string(),
            error: body.error,
            message: body.message.unwrap_or_default(),
        },
        Err(_) => Error::Status {
            endpoint: nsid.to_string(),
            status,
            message: text.chars().take(512).collect(),
        },
    }
}

#[async_trait]
impl Ledger for XrpcClient {
    fn session(&self) -> Option<Session> {
        self.session.read().clone()
    }

    async fn create_record(
        &self,
        collection: &str,
        repo: &str,
        record: serde_json::Value,
    ) -> Result<RecordRef> {
        self.require_session()?;
        let input = json!({
            "repo": repo,
            "collection": collection,
            "record": record,
        });
        let response = self
            .send(Method::POST, CREATE_RECORD, Auth::Access, |req| req.json(&input))
            .await?;
        let created: RecordRef = response.json().await?;
        tracing::debug!(uri = %created.uri, cid = %created.cid, "Record created");
        Ok(created)
    }

    async fn upload_blob(&self, bytes: Vec<u8>, mime_type: &str) -> Result<BlobRef> {
        self.require_session()?;
        let response = self
            .send(Method::POST, UPLOAD_BLOB, Auth::Access, |req| {
                req.header(CONTENT_TYPE, mime_type).body(bytes.clone())
            })
            .await?;
        let output: UploadBlobOutput = response.json().await?;
        tracing::debug!(cid = %output.blob.cid, size = output.blob.size, "Blob uploaded");
        Ok(output.blob)
    }

    async fn get_blob(&self, cid: &Cid, did: &str) -> Result<Vec<u8>> {
        let cid = cid.to_string();
        let response = self
            .send(Method::GET, GET_BLOB, Auth::None, |req| {
                req.query(&[("did", did), ("cid", cid.as_str())])
            })
            .await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn list_records(
        &self,
        collection: &str,
        repo: &str,
        limit: usize,
    ) -> Result<Vec<ListedRecord>> {
        let limit = limit.clamp(1, MAX_LIST_LIMIT).to_string();
        let response = self
            .send(Method::GET, LIST_RECORDS, Auth::None, |req| {
                req.query(&[
                    ("repo", repo),
                    ("collection", collection),
                    ("limit", limit.as_str()),
                ])
            })
            .await?;
        let output: ListRecordsOutput = response.json().await?;
        Ok(output.records)
    }

    async fn subscribe_commits(&self) -> Result<Box<dyn CommitStream>> {
        let stream = FirehoseStream::connect(&self.config.firehose_url).await?;
        Ok(Box::new(stream))
    }
}

#[async_trait]
impl Notifier for XrpcClient {
    async fn create_post(&self, text: &str, facets: Vec<Facet>) -> Result<RecordRef> {
        let session = self.require_session()?;
        let post = PostRecord::new(text, facets, Utc::now());
        self.create_record(POST_COLLECTION, &session.did, serde_json::to_value(&post)?)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> XrpcClient {
        XrpcClient::new(XrpcConfig {
            pds_url: "https://pds.example/".to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_url_joins_trailing_slash() {
        assert_eq!(
            client().url(CREATE_RECORD),
            "https://pds.example/xrpc/com.atproto.repo.createRecord"
        );
    }

    #[test]
    fn test_error_body_mapping() {
        let err = error_from_body(
            CREATE_RECORD,
            400,
            r#"{"error":"ExpiredToken","message":"Token has expired"}"#,
        );
        match err {
            Error::Xrpc { method, error, message } => {
                assert_eq!(method, CREATE_RECORD);
                assert_eq!(error, "ExpiredToken");
                assert_eq!(message, "Token has expired");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = error_from_body(GET_BLOB, 502, "<html>bad gateway</html>");
        assert!(matches!(err, Error::Status { status: 502, .. }));
    }

    #[tokio::test]
    async fn test_writes_require_session() {
        let client = client();
        assert!(client.session().is_none());

        let err = client
            .create_record("social.watchedsky.alert", "did:plc:x", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthRequired));

        let err = client
            .upload_blob(b"{}".to_vec(), watchedsky_core::GEOJSON_MIME)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthRequired));

        let err = client.create_post("hi", Vec::new()).await.unwrap_err();
        assert!(matches!(err, Error::AuthRequired));
    }

    #[tokio::test]
    async fn test_login_requires_credentials() {
        let err = client().login().await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_refresh_requires_session() {
        let err = client().refresh().await.unwrap_err();
        assert!(matches!(err, Error::AuthRequired));
    }
}
