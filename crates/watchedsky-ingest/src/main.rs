//! WatchedSky ingestion daemon.
//!
//! Polls the NWS active-alerts feed into the document store, publishes new
//! alerts to the service's AT Protocol repository and reconciles published
//! records back from the relay firehose.
//!
//! # Usage
//!
//! ```bash
//! # Poll only (no ledger credentials)
//! watchedsky-ingest --db-path ./data/watchedsky.db
//!
//! # Full pipeline
//! WATCHEDSKY_BSKY_USERNAME=watchedsky.social \
//! WATCHEDSKY_BSKY_APP_PASSWORD=xxxx-xxxx-xxxx-xxxx \
//!     watchedsky-ingest --poll-interval-secs 120
//! ```
//!
//! Every flag can also be set through its `WATCHEDSKY_*` environment
//! variable, or in a `.env` file (path overridable with `WATCHEDSKY_DOTENV`).
//!
//! # Graceful Shutdown
//!
//! SIGINT and SIGTERM cancel both daemons. The poller finishes its in-flight
//! tick, the reconciler finishes its in-flight commit and closes the stream,
//! and the supervisor drains remaining pipeline errors before exit.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use metrics::gauge;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;
use watchedsky_core::Sha256Verifier;
use watchedsky_core::metrics::{init_metrics, start_metrics_server};
use watchedsky_ingest::shutdown::create_shutdown_token;
use watchedsky_ingest::source::NWS_ACTIVE_ALERTS_URL;
use watchedsky_ingest::{
    AlertPoller, NwsAlertSource, NwsConfig, PipelineError, PollerConfig, Publisher, Reconciler,
    ReconcilerConfig, SqliteStore, SqliteStoreConfig, XrpcClient, XrpcConfig, error_channel,
};

/// WatchedSky ingestion daemon.
#[derive(Parser, Debug)]
#[command(name = "watchedsky-ingest")]
#[command(about = "Weather alert ingestion, publication and reconciliation daemon")]
#[command(version)]
struct Args {
    /// SQLite database path for the document store
    #[arg(long, env = "WATCHEDSKY_DB_PATH", default_value = "./data/watchedsky.db")]
    db_path: PathBuf,

    /// Active-alerts feed URL
    #[arg(long, env = "WATCHEDSKY_FEED_URL", default_value = NWS_ACTIVE_ALERTS_URL)]
    feed_url: String,

    /// Seconds between feed polls
    #[arg(long, env = "WATCHEDSKY_POLL_INTERVAL_SECS", default_value = "300")]
    poll_interval_secs: u64,

    /// Timeout for feed and ledger HTTP requests
    #[arg(long, env = "WATCHEDSKY_HTTP_TIMEOUT_SECS", default_value = "30")]
    http_timeout_secs: u64,

    /// Stop the poller on the first failed tick
    #[arg(long, env = "WATCHEDSKY_FAIL_FAST")]
    fail_fast: bool,

    /// PDS hosting the service repository
    #[arg(long, env = "WATCHEDSKY_PDS_URL", default_value = "https://bsky.social")]
    pds_url: String,

    /// Ledger handle or DID (publishing and reconciliation need it)
    #[arg(long, env = "WATCHEDSKY_BSKY_USERNAME")]
    username: Option<String>,

    /// Ledger app password
    #[arg(long, env = "WATCHEDSKY_BSKY_APP_PASSWORD", hide_env_values = true)]
    app_password: Option<String>,

    /// Relay subscribeRepos endpoint
    #[arg(
        long,
        env = "WATCHEDSKY_FIREHOSE_URL",
        default_value = "wss://bsky.network/xrpc/com.atproto.sync.subscribeRepos"
    )]
    firehose_url: String,

    /// Public site linked from notifications
    #[arg(long, env = "WATCHEDSKY_BASE_URL", default_value = "https://watchedsky.social")]
    base_url: String,

    /// Disable the feed poller
    #[arg(long, env = "WATCHEDSKY_NO_POLLER")]
    no_poller: bool,

    /// Disable the firehose reconciler
    #[arg(long, env = "WATCHEDSKY_NO_FIREHOSE")]
    no_firehose: bool,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, env = "WATCHEDSKY_METRICS_PORT", default_value = "9090")]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before clap reads the environment
    let dotenv = std::env::var("WATCHEDSKY_DOTENV").unwrap_or_else(|_| ".env".to_string());
    if Path::new(&dotenv).exists() {
        dotenvy::from_path(&dotenv).with_context(|| format!("Failed to load {dotenv}"))?;
    }

    // Install rustls crypto provider (reqwest and tungstenite share it)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("watchedsky_ingest=debug".parse()?),
        )
        .init();

    let args = Args::parse();

    tracing::info!("WatchedSky ingestion daemon starting...");

    if args.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(args.metrics_port, metrics_handle)
            .await
            .context("Failed to start metrics server")?;
        gauge!("ingestion_running").set(1.0);
    }

    let timeout = Duration::from_secs(args.http_timeout_secs);

    tracing::info!("Configuration:");
    tracing::info!("  Database: {}", args.db_path.display());
    tracing::info!("  Feed: {}", args.feed_url);
    tracing::info!("  Poll interval: {}s", args.poll_interval_secs);
    tracing::info!("  PDS: {}", args.pds_url);
    tracing::info!("  Firehose: {}", args.firehose_url);
    tracing::info!("  Poller: {}", if args.no_poller { "disabled" } else { "enabled" });
    tracing::info!("  Reconciler: {}", if args.no_firehose { "disabled" } else { "enabled" });

    let store = Arc::new(
        SqliteStore::open(&SqliteStoreConfig {
            db_path: args.db_path.clone(),
        })
        .with_context(|| format!("Failed to open document store at {:?}", args.db_path))?,
    );
    tracing::info!("Document store opened: {} features", store.count()?);

    let ledger = match (&args.username, &args.app_password) {
        (Some(identifier), Some(password)) => {
            let client = XrpcClient::new(XrpcConfig {
                pds_url: args.pds_url.clone(),
                identifier: identifier.clone(),
                password: password.clone(),
                firehose_url: args.firehose_url.clone(),
                timeout,
                ..Default::default()
            })?;
            client.login().await.context("Failed to log in to the ledger")?;
            Some(Arc::new(client))
        }
        _ => {
            tracing::warn!("No ledger credentials; publishing and reconciliation disabled");
            None
        }
    };

    if let Some(ledger) = &ledger {
        match Publisher::new(ledger.clone()).latest_published_id().await {
            Ok(Some(id)) => tracing::info!(id, "Latest published alert"),
            Ok(None) => tracing::info!("No alerts published yet"),
            Err(e) => tracing::warn!(error = %e, "Could not read latest published alert"),
        }
    }

    let cancel = create_shutdown_token();
    let (errors_tx, mut errors_rx) = error_channel();

    let supervisor = tokio::spawn(async move {
        let mut reported = 0usize;
        while let Some(PipelineError { component, error }) = errors_rx.recv().await {
            reported += 1;
            tracing::error!(
                component,
                error_kind = error.kind().as_str(),
                error = %error,
                "Pipeline error"
            );
        }
        reported
    });

    let mut daemons: JoinSet<(&'static str, watchedsky_ingest::Result<()>)> = JoinSet::new();

    if !args.no_poller {
        let source = NwsAlertSource::new(NwsConfig {
            url: args.feed_url.clone(),
            timeout,
            ..Default::default()
        })?;
        let mut poller = AlertPoller::new(
            PollerConfig {
                interval: Duration::from_secs(args.poll_interval_secs),
                fail_fast: args.fail_fast,
            },
            Arc::new(source),
            store.clone(),
        );
        if let Some(ledger) = &ledger {
            poller = poller.with_publisher(Publisher::new(ledger.clone()));
        }
        poller
            .recover_cursor()
            .await
            .context("Failed to recover poller cursor")?;

        let cancel = cancel.clone();
        let errors = errors_tx.clone();
        daemons.spawn(async move { ("poller", poller.run(cancel, errors).await) });
    }

    match (&ledger, args.no_firehose) {
        (Some(ledger), false) => {
            let reconciler = Reconciler::new(
                ReconcilerConfig {
                    base_url: args.base_url.clone(),
                    ..Default::default()
                },
                ledger.clone(),
                ledger.clone(),
                store.clone(),
                Arc::new(Sha256Verifier),
            )?;
            let cancel = cancel.clone();
            let errors = errors_tx.clone();
            daemons.spawn(async move { ("reconciler", reconciler.run(cancel, errors).await) });
        }
        (None, false) => tracing::warn!("Reconciler needs ledger credentials; not started"),
        (_, true) => {}
    }
    drop(errors_tx);

    if daemons.is_empty() {
        tracing::warn!("Nothing to run; poller and reconciler are both disabled");
    }

    // Any daemon ending on its own takes the rest down with it
    let mut failure = None;
    while let Some(joined) = daemons.join_next().await {
        match joined {
            Ok((name, Ok(()))) => tracing::info!("{} stopped", name),
            Ok((name, Err(e))) => {
                tracing::error!(error_kind = e.kind().as_str(), "{} failed: {}", name, e);
                failure.get_or_insert_with(|| anyhow!("{name} failed: {e}"));
            }
            Err(e) => {
                tracing::error!("Daemon task panicked: {}", e);
                failure.get_or_insert_with(|| anyhow!("daemon task panicked: {e}"));
            }
        }
        cancel.cancel();
    }

    let reported = supervisor.await.context("Error supervisor panicked")?;
    gauge!("ingestion_running").set(0.0);

    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("SHUTDOWN COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("Features stored:      {}", store.count().unwrap_or(0));
    tracing::info!("Errors reported:      {}", reported);

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
