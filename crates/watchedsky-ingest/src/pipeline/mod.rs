//! The ingestion → publication → reconciliation pipeline.
//!
//! - [`AlertPoller`] - Cursor-driven polling of the upstream feed into the store
//! - [`Publisher`] - Writes alerts to the ledger as records plus geometry blobs
//! - [`Reconciler`] - Verifies ledger commits and persists them back into the store
//!
//! # Architecture
//!
//! ```text
//! [AlertSource] → [AlertPoller] → [DocumentStore]
//!                       ↓               ↑
//!                  [Publisher]     [Reconciler] → [Notifier]
//!                       ↓               ↑
//!                    Ledger ──commits───┘
//! ```
//!
//! The store is the source of truth. The poller and the reconciler are
//! independent tasks; per-tick and per-event failures are sent to a shared
//! error channel and never stop the loop that produced them.

mod poller;
mod publisher;
mod reconciler;

pub use poller::{AlertPoller, PollerConfig, TickReport, select_new};
pub use publisher::Publisher;
pub use reconciler::{CommitReport, Reconciler, ReconcilerConfig};

use tokio::sync::mpsc;

use crate::Error;

/// A failure from one tick or event, tagged with the component that hit it.
#[derive(Debug)]
pub struct PipelineError {
    pub component: &'static str,
    pub error: Error,
}

/// Channel carrying [`PipelineError`]s to the supervisor.
pub type ErrorSender = mpsc::UnboundedSender<PipelineError>;
pub type ErrorReceiver = mpsc::UnboundedReceiver<PipelineError>;

/// Create the pipeline error channel.
pub fn error_channel() -> (ErrorSender, ErrorReceiver) {
    mpsc::unbounded_channel()
}

/// Send `error` to the supervisor. A closed channel falls back to a log line.
pub(crate) fn report(errors: &ErrorSender, component: &'static str, error: Error) {
    if let Err(mpsc::error::SendError(lost)) = errors.send(PipelineError { component, error }) {
        tracing::warn!(
            component = lost.component,
            error_kind = lost.error.kind().as_str(),
            error = %lost.error,
            "Error channel closed"
        );
    }
}
