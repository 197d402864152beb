//! Repository event stream (`com.atproto.sync.subscribeRepos`).
//!
//! Each websocket binary message is two concatenated CBOR values: a header
//! `{op, t}` and a body. `op == 1` carries a message whose kind is named by
//! `t` (`#commit`, `#identity`, ...); `op == -1` is an error frame after
//! which the relay closes the connection. Only commits are surfaced.
//!
//! The stream has no read timeout; it is torn down by [`CommitStream::close`].

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{CommitEvent, CommitStream};
use crate::{Error, Result};

const SUBSCRIBE_REPOS: &str = "com.atproto.sync.subscribeRepos";
const COMMIT_TYPE: &str = "#commit";

#[derive(Debug, Serialize, Deserialize)]
struct FrameHeader {
    op: i64,
    #[serde(default)]
    t: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    message: Option<String>,
}

/// A decoded stream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Commit(CommitEvent),
    /// Error frame; the relay hangs up after sending one.
    Error { error: String, message: String },
    /// A message kind this consumer ignores.
    Other(String),
}

/// Decode one binary websocket message.
pub fn decode_frame(data: &[u8]) -> Result<Frame> {
    let mut de = serde_cbor::Deserializer::from_slice(data);
    let header = FrameHeader::deserialize(&mut de)?;

    match (header.op, header.t) {
        (-1, _) => {
            let body = ErrorBody::deserialize(&mut de)?;
            Ok(Frame::Error {
                error: body.error,
                message: body.message.unwrap_or_default(),
            })
        }
        (1, Some(t)) if t == COMMIT_TYPE => Ok(Frame::Commit(CommitEvent::deserialize(&mut de)?)),
        (1, Some(t)) => Ok(Frame::Other(t)),
        (op, t) => Err(Error::Decode(format!(
            "unexpected frame header op={op} t={t:?}"
        ))),
    }
}

/// Live commit stream over a websocket.
pub struct FirehoseStream {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    url: String,
}

impl FirehoseStream {
    /// Connect to a relay's `subscribeRepos` endpoint.
    pub async fn connect(url: &str) -> Result<Self> {
        let (socket, response) = connect_async(url).await?;
        tracing::info!(url, status = %response.status(), "Connected to firehose");
        Ok(Self {
            socket,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl CommitStream for FirehoseStream {
    async fn next_commit(&mut self) -> Result<Option<CommitEvent>> {
        while let Some(message) = self.socket.next().await {
            match message? {
                Message::Binary(data) => match decode_frame(&data)? {
                    Frame::Commit(commit) => return Ok(Some(commit)),
                    Frame::Error { error, message } => {
                        return Err(Error::Xrpc {
                            method: SUBSCRIBE_REPOS.to_string(),
                            error,
                            message,
                        });
                    }
                    Frame::Other(kind) => tracing::trace!(kind, "Skipping firehose frame"),
                },
                Message::Close(frame) => {
                    tracing::info!(url = %self.url, ?frame, "Firehose closed by relay");
                    return Ok(None);
                }
                _ => {}
            }
        }
        Ok(None)
    }

    async fn close(&mut self) -> Result<()> {
        self.socket.close(None).await?;
        tracing::info!(url = %self.url, "Firehose connection closed");
        Ok(())
    }
}
