//! WatchedSky ingestion pipeline.
//!
//! This crate polls the National Weather Service for active alerts,
//! republishes them to an AT Protocol repository and reconciles the
//! published records back into a local document store from the relay
//! firehose.
//!
//! # Modules
//!
//! - [`source`] - Upstream alert feed adapters
//! - [`store`] - Document store (SQLite)
//! - [`ledger`] - Ledger client: XRPC, firehose, CAR and repository tree decoding
//! - [`pipeline`] - Poller, publisher and reconciler
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   AlertSource   │  NWS active alerts (GeoJSON)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐      ┌─────────────────┐
//! │   AlertPoller   │─────▶│  DocumentStore  │  SQLite - source of truth
//! └────────┬────────┘      └─────────────────┘
//!          │                        ▲
//!          ▼                        │ upsert
//! ┌─────────────────┐      ┌────────┴────────┐
//! │    Publisher    │      │   Reconciler    │──▶ notification post
//! └────────┬────────┘      └────────▲────────┘
//!          │ createRecord           │ verified commits
//!          ▼                        │
//! ┌─────────────────────────────────┴───────┐
//! │          Ledger (PDS + firehose)        │
//! └─────────────────────────────────────────┘
//! ```
//!
//! The store is the source of truth: the poller recovers its cursor from it,
//! and the reconciler writes the canonical copy of each published alert.

pub mod error;
pub mod ledger;
pub mod pipeline;
pub mod shutdown;
pub mod source;
pub mod store;
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

// Re-export commonly used types at crate root
pub use error::{Error, ErrorKind, Result};

// Re-export pipeline components for convenience
pub use pipeline::{
    AlertPoller, CommitReport, ErrorReceiver, ErrorSender, PipelineError, PollerConfig, Publisher,
    Reconciler, ReconcilerConfig, TickReport, error_channel,
};

// Re-export collaborators
pub use ledger::{Ledger, Notifier, XrpcClient, XrpcConfig};
pub use source::{AlertSource, FeedSnapshot, NwsAlertSource, NwsConfig};
pub use store::{DocumentStore, SqliteStore, SqliteStoreConfig};
