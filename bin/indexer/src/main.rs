//! matrixsync indexer: mirrors the registration and matrix contracts into
//! Postgres.
//!
//! Flow:
//! 1. Connect to the chain RPC and PostgreSQL, apply migrations
//! 2. Start the sharded dispatcher in front of the ingestion pipeline
//! 3. Feed it live events (log subscription, or block polling without `WS_URL`)
//! 4. Reconcile periodically: missing users, deferred events, missed events,
//!    contract pause flags, daily counter reset, hierarchy repair
//!
//! Ctrl-C cancels every task; shards finish the events they already accepted.

use std::sync::Arc;

use eyre::Result;
use matrixsync_chain::{ChainReader, RpcChainReader, create_provider};
use matrixsync_core::{Settings, telemetry};
use matrixsync_ingest::{
    DeferredQueue, Dispatcher, LiveListener, LiveSource, Pipeline, ReconcileConfig, Reconciler,
};
use matrixsync_storage::{self as storage, AggregateStore, PgStore};
use tokio_util::sync::CancellationToken;

/// Events waiting on missing local state; oldest dropped beyond this.
const DEFERRED_CAPACITY: usize = 10_000;

#[tokio::main]
async fn main() -> Result<()> {
    // ── Initialisation ──────────────────────────────────────────────────
    telemetry::init("indexer");
    let settings = Settings::from_env()?;

    tracing::info!(
        rpc = %settings.rpc_url,
        ws = settings.ws_url.as_deref().unwrap_or("-"),
        workers = settings.ingest_workers,
        "Starting matrixsync indexer"
    );

    let pool = storage::connect(&settings.database_url).await?;
    tracing::info!("Connected to database");

    sqlx::migrate!("../../migrations").run(&pool).await?;
    tracing::info!("Database migrations applied");

    let provider = create_provider(&settings.rpc_url)?;
    let reader = RpcChainReader::from_settings(provider, &settings)?;
    let (registration, matrix) = (reader.registration_address(), reader.matrix_address());
    let chain: Arc<dyn ChainReader> = Arc::new(reader);
    let head = chain.block_number().await?;
    tracing::info!(head, %registration, %matrix, "Connected to chain RPC");

    let store: Arc<dyn AggregateStore> = Arc::new(PgStore::new(pool));

    // ── Ingestion ───────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let deferred = Arc::new(DeferredQueue::new(DEFERRED_CAPACITY));
    let pipeline = Arc::new(Pipeline::new(
        chain.clone(),
        store.clone(),
        settings.ancestor_walk_depth,
    ));
    let (dispatcher, dispatcher_handle) = Dispatcher::spawn(
        pipeline,
        deferred.clone(),
        settings.ingest_workers,
        cancel.clone(),
    );

    let source = match settings.ws_url.clone() {
        Some(ws_url) => LiveSource::Subscription {
            ws_url,
            registration,
            matrix,
        },
        None => LiveSource::Polling {
            interval: settings.poll_interval(),
        },
    };
    let listener = LiveListener::new(
        chain.clone(),
        dispatcher.clone(),
        source,
        settings.event_backfill_blocks,
    );
    let listener_handle = tokio::spawn(listener.run(cancel.clone()));

    // ── Reconciliation ──────────────────────────────────────────────────
    let reconciler = Arc::new(Reconciler::new(
        chain,
        store,
        dispatcher,
        deferred,
        ReconcileConfig::from_settings(&settings)?,
    ));
    let reconciler_handle = tokio::spawn(reconciler.run(cancel.clone()));

    // ── Shutdown ────────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    cancel.cancel();

    listener_handle.await?;
    reconciler_handle.await?;
    dispatcher_handle.await?;
    tracing::info!("Indexer stopped");
    Ok(())
}
