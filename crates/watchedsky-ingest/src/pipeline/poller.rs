//! Cursor-driven alert poller.
//!
//! Each tick fetches the active-alerts snapshot, keeps the alerts sent
//! strictly after the cursor, hydrates missing geometry from zone features,
//! stores the batch atomically and only then advances the cursor to the
//! newest `sent` in the batch. Stored alerts are then handed to the
//! publisher, oldest first.
//!
//! The cursor only tracks the store. Alerts whose publication failed on a
//! transport error wait in a pending queue and are offered to the publisher
//! again at the start of every following tick, ahead of newer alerts.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use watchedsky_core::metrics::{increment, increment_kind, set_gauge};
use watchedsky_core::{Feature, Geometry};

use super::{ErrorSender, Publisher, report};
use crate::source::AlertSource;
use crate::store::DocumentStore;
use crate::{Error, ErrorKind, Result};

const COMPONENT: &str = "poller";

/// Configuration for [`AlertPoller`].
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Time between the end of one tick and the start of the next.
    pub interval: Duration,
    /// Stop on the first failed tick instead of retrying next period.
    pub fail_fast: bool,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            fail_fast: false,
        }
    }
}

/// Outcome of a successful tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Features in the snapshot.
    pub fetched: usize,
    /// Ids stored this tick, oldest first.
    pub inserted: Vec<String>,
    /// Alerts written to the ledger, retries included.
    pub published: usize,
    /// Alerts still waiting for publication after this tick.
    pub pending: usize,
    /// Per-alert errors sent to the error channel.
    pub errors: usize,
}

/// Entries sent strictly after `cursor`, oldest first.
///
/// Entries are ordered newest first and the leading run after the cursor is
/// kept. Entries with equal `sent` end up in reverse input order.
pub fn select_new<T>(mut entries: Vec<(DateTime<Utc>, T)>, cursor: DateTime<Utc>) -> Vec<(DateTime<Utc>, T)> {
    entries.sort_by(|a, b| b.0.cmp(&a.0));
    let fresh = entries.iter().take_while(|(sent, _)| *sent > cursor).count();
    entries.truncate(fresh);
    entries.reverse();
    entries
}

/// Polls an [`AlertSource`] into a [`DocumentStore`].
pub struct AlertPoller {
    config: PollerConfig,
    source: Arc<dyn AlertSource>,
    store: Arc<dyn DocumentStore>,
    publisher: Option<Publisher>,
    pending: Vec<Feature>,
    cursor: DateTime<Utc>,
}

impl AlertPoller {
    /// Create a poller whose cursor starts at the Unix epoch.
    pub fn new(
        config: PollerConfig,
        source: Arc<dyn AlertSource>,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            config,
            source,
            store,
            publisher: None,
            pending: Vec::new(),
            cursor: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    /// Publish every stored alert through `publisher`.
    pub fn with_publisher(mut self, publisher: Publisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn cursor(&self) -> DateTime<Utc> {
        self.cursor
    }

    /// Ids of stored alerts waiting to be published, oldest first.
    pub fn pending(&self) -> Vec<String> {
        self.pending.iter().map(|f| f.id.clone()).collect()
    }

    /// Reset the cursor from the newest stored alert.
    pub async fn recover_cursor(&mut self) -> Result<DateTime<Utc>> {
        self.cursor = match self.store.latest_alert().await? {
            Some(latest) => latest.sent()?,
            None => DateTime::<Utc>::UNIX_EPOCH,
        };
        set_gauge("poller_cursor_timestamp_seconds", self.cursor.timestamp() as f64);
        tracing::info!(cursor = %self.cursor, "Recovered poller cursor");
        Ok(self.cursor)
    }

    /// Run one poll.
    ///
    /// Pending publications are retried first, even when the fetch then
    /// fails. Fetch and store failures are returned and leave the cursor
    /// where it was. Per-alert failures (undecodable entries, zone lookups,
    /// publication) go to `errors` and do not fail the tick.
    pub async fn tick(&mut self, errors: &ErrorSender) -> Result<TickReport> {
        let started = Instant::now();
        increment("poller_ticks_total", 1);

        let mut tick = TickReport::default();
        let retry = std::mem::take(&mut self.pending);
        if !retry.is_empty() {
            tracing::info!(pending = retry.len(), "Retrying pending publications");
            self.publish_batch(retry, &mut tick, errors).await;
        }

        let snapshot = self.source.fetch().await?;
        tick.fetched = snapshot.features.len();
        increment("poller_alerts_fetched_total", tick.fetched as u64);

        for rejected in snapshot.rejected {
            increment("poller_alerts_dropped_total", 1);
            tick.errors += 1;
            report(
                errors,
                COMPONENT,
                Error::Decode(format!(
                    "feed entry {}: {}",
                    rejected.id.as_deref().unwrap_or("<no id>"),
                    rejected.reason
                )),
            );
        }

        let mut dated = Vec::with_capacity(snapshot.features.len());
        for feature in snapshot.features {
            match feature.sent() {
                Ok(sent) => dated.push((sent, feature)),
                Err(e) => {
                    increment("poller_alerts_dropped_total", 1);
                    tick.errors += 1;
                    tracing::debug!(id = %feature.id, error = %e, "Dropping alert without a usable sent time");
                    report(errors, COMPONENT, e.into());
                }
            }
        }

        let fresh = select_new(dated, self.cursor);
        let Some(newest) = fresh.iter().map(|(sent, _)| *sent).max() else {
            tracing::debug!(fetched = tick.fetched, cursor = %self.cursor, "No new alerts");
            tick.pending = self.pending.len();
            record_duration(started);
            return Ok(tick);
        };

        let mut batch: Vec<Feature> = fresh.into_iter().map(|(_, feature)| feature).collect();
        for feature in batch.iter_mut() {
            if feature.geometry.is_none() {
                tick.errors += self.hydrate_from_zones(feature, errors).await;
            }
        }

        self.store.insert_many(&batch).await?;
        self.advance_cursor(newest)?;
        tick.inserted = batch.iter().map(|f| f.id.clone()).collect();

        increment("poller_alerts_inserted_total", batch.len() as u64);
        set_gauge("poller_cursor_timestamp_seconds", self.cursor.timestamp() as f64);
        tracing::info!(inserted = batch.len(), cursor = %self.cursor, "Stored new alerts");

        self.publish_batch(batch, &mut tick, errors).await;

        tick.pending = self.pending.len();
        record_duration(started);
        Ok(tick)
    }

    /// Move the cursor to `newest` after a successful insert.
    ///
    /// The batch only holds alerts sent after the cursor, so a cursor that
    /// would move backwards means the selection is broken.
    fn advance_cursor(&mut self, newest: DateTime<Utc>) -> Result<()> {
        if newest <= self.cursor {
            return Err(Error::Invariant(format!(
                "cursor {} would not advance to batch maximum {}",
                self.cursor, newest
            )));
        }
        self.cursor = newest;
        Ok(())
    }

    /// Publish stored alerts in order. Transport failures are queued for the
    /// next tick; anything else is reported and dropped.
    async fn publish_batch(&mut self, batch: Vec<Feature>, tick: &mut TickReport, errors: &ErrorSender) {
        let Some(publisher) = &self.publisher else {
            return;
        };

        for feature in batch {
            match publisher.publish(&feature).await {
                Ok(_) => tick.published += 1,
                Err(e) => {
                    tick.errors += 1;
                    if e.kind() == ErrorKind::Transport {
                        tracing::warn!(id = %feature.id, error = %e, "Failed to publish alert, will retry next tick");
                        self.pending.push(feature);
                    } else {
                        tracing::warn!(id = %feature.id, error = %e, "Failed to publish alert");
                    }
                    report(errors, "publisher", e);
                }
            }
        }
        set_gauge("poller_pending_publications", self.pending.len() as f64);
    }

    /// Fill geometry from stored zones. Returns the number of errors reported.
    async fn hydrate_from_zones(&self, feature: &mut Feature, errors: &ErrorSender) -> usize {
        let zone_ids = feature.affected_zones();
        if zone_ids.is_empty() {
            return 0;
        }

        match self.store.zones(&zone_ids).await {
            Ok(zones) => {
                let shapes: Vec<Geometry> = zones.into_iter().filter_map(|z| z.geometry).collect();
                feature.geometry = Geometry::collection(shapes);
                0
            }
            Err(e) => {
                tracing::warn!(id = %feature.id, error = %e, "Zone lookup failed, storing alert without geometry");
                report(errors, COMPONENT, e);
                1
            }
        }
    }

    /// Tick until cancelled.
    ///
    /// A failed tick is reported and retried next period, or returned when
    /// `fail_fast` is set. The in-flight tick always completes; only the
    /// sleep between ticks is interrupted by cancellation.
    pub async fn run(&mut self, cancel: CancellationToken, errors: ErrorSender) -> Result<()> {
        tracing::info!(
            source = self.source.name(),
            interval_secs = self.config.interval.as_secs(),
            fail_fast = self.config.fail_fast,
            "Alert poller started"
        );

        while !cancel.is_cancelled() {
            match self.tick(&errors).await {
                Ok(tick) => tracing::debug!(
                    fetched = tick.fetched,
                    inserted = tick.inserted.len(),
                    published = tick.published,
                    pending = tick.pending,
                    errors = tick.errors,
                    "Poll tick complete"
                ),
                Err(e) => {
                    increment_kind("poller_tick_failures_total", e.kind().as_str());
                    if self.config.fail_fast {
                        tracing::error!(error = %e, "Poll tick failed, stopping");
                        return Err(e);
                    }
                    tracing::warn!(error = %e, "Poll tick failed, retrying next period");
                    report(&errors, COMPONENT, e);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }

        if !self.pending.is_empty() {
            tracing::warn!(pending = self.pending.len(), "Alert poller stopped with unpublished alerts");
        }
        tracing::info!(cursor = %self.cursor, "Alert poller stopped");
        Ok(())
    }
}

fn record_duration(started: Instant) {
    metrics::histogram!("poller_tick_duration_seconds").record(started.elapsed().as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        watchedsky_core::parse_timestamp(s).unwrap()
    }

    #[test]
    fn test_select_new_after_cursor() {
        let entries = vec![
            (at("2024-01-01T00:00:00Z"), "a"),
            (at("2024-01-01T02:00:00Z"), "c"),
            (at("2024-01-01T01:00:00Z"), "b"),
        ];
        let fresh = select_new(entries, at("2024-01-01T00:00:00Z"));
        let ids: Vec<_> = fresh.iter().map(|(_, id)| *id).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn test_select_new_nothing_newer() {
        let entries = vec![(at("2024-01-01T00:00:00Z"), "a")];
        assert!(select_new(entries, at("2024-01-01T00:00:00Z")).is_empty());
        assert!(select_new(Vec::<(DateTime<Utc>, ())>::new(), DateTime::<Utc>::UNIX_EPOCH).is_empty());
    }

    #[test]
    fn test_select_new_equal_sent_reversed() {
        let t = at("2024-01-01T01:00:00Z");
        let fresh = select_new(vec![(t, "x"), (t, "y"), (t, "z")], at("2024-01-01T00:00:00Z"));
        let ids: Vec<_> = fresh.iter().map(|(_, id)| *id).collect();
        assert_eq!(ids, vec!["z", "y", "x"]);
    }

    #[test]
    fn test_cursor_never_moves_backwards() {
        use crate::testutil::StaticAlertSource;
        use crate::store::SqliteStore;

        let mut poller = AlertPoller::new(
            PollerConfig::default(),
            Arc::new(StaticAlertSource::default()),
            Arc::new(SqliteStore::open_in_memory().unwrap()),
        );
        poller.advance_cursor(at("2024-01-01T01:00:00Z")).unwrap();

        let err = poller.advance_cursor(at("2024-01-01T01:00:00Z")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateInvariant);
        let err = poller.advance_cursor(at("2024-01-01T00:00:00Z")).unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
        assert_eq!(poller.cursor(), at("2024-01-01T01:00:00Z"));
    }

    #[test]
    fn test_default_config() {
        let config = PollerConfig::default();
        assert_eq!(config.interval, Duration::from_secs(300));
        assert!(!config.fail_fast);
    }
}
