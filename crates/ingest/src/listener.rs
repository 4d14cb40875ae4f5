//! Live event delivery: a WebSocket log subscription when available, block
//! polling otherwise. Both only hand events to the [`Dispatcher`].

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use alloy::providers::Provider;
use alloy::rpc::types::Filter;
use futures_util::StreamExt;
use matrixsync_chain::{ChainReader, EventKind, NormalizedEvent, create_ws_provider, normalize};
use tokio_util::sync::CancellationToken;

use crate::dispatcher::Dispatcher;

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(60);

/// Where live events come from.
#[derive(Debug, Clone)]
pub enum LiveSource {
    Subscription {
        ws_url: String,
        registration: Address,
        matrix: Address,
    },
    Polling {
        interval: Duration,
    },
}

pub struct LiveListener {
    chain: Arc<dyn ChainReader>,
    dispatcher: Dispatcher,
    source: LiveSource,
    /// Last block whose events were handed off; resume point after a gap.
    cursor: Option<u64>,
    catch_up_limit: u64,
}

impl LiveListener {
    pub fn new(
        chain: Arc<dyn ChainReader>,
        dispatcher: Dispatcher,
        source: LiveSource,
        catch_up_limit: u64,
    ) -> Self {
        Self {
            chain,
            dispatcher,
            source,
            cursor: None,
            catch_up_limit,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        match self.source.clone() {
            LiveSource::Subscription {
                ws_url,
                registration,
                matrix,
            } => self.subscribe(&ws_url, registration, matrix, &cancel).await,
            LiveSource::Polling { interval } => self.poll(interval, &cancel).await,
        }
        tracing::info!("Live listener stopped");
    }

    // ── Subscription ────────────────────────────────────────────────────

    async fn subscribe(
        &mut self,
        ws_url: &str,
        registration: Address,
        matrix: Address,
        cancel: &CancellationToken,
    ) {
        let filter = Filter::new()
            .address(vec![registration, matrix])
            .event_signature(EventKind::ALL.iter().map(|k| k.signature_hash()).collect::<Vec<_>>());
        let mut failures = 0u32;

        while !cancel.is_cancelled() {
            if self.cursor.is_some() {
                self.catch_up().await;
            }
            match self.stream_once(ws_url, &filter, cancel).await {
                Ok(()) => break,
                Err(e) => {
                    failures += 1;
                    let wait = backoff(failures);
                    tracing::warn!(
                        error = %e,
                        failures,
                        wait_ms = wait.as_millis() as u64,
                        "Log subscription lost, reconnecting"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    /// Returns `Ok` on cancellation, `Err` when the stream dies.
    async fn stream_once(
        &mut self,
        ws_url: &str,
        filter: &Filter,
        cancel: &CancellationToken,
    ) -> eyre::Result<()> {
        let provider = create_ws_provider(ws_url).await?;
        let head = provider.get_block_number().await?;
        self.cursor.get_or_insert(head);

        let subscription = provider.subscribe_logs(filter).await?;
        let stream = subscription.into_stream();
        tokio::pin!(stream);
        tracing::info!(head, "Subscribed to contract logs");

        loop {
            let log = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                next = stream.next() => match next {
                    Some(log) => log,
                    None => eyre::bail!("subscription stream ended"),
                },
            };
            match normalize(&log) {
                Ok(event) => {
                    let block = event.block_number;
                    tracing::debug!(kind = %event.kind(), block, "Live event");
                    self.dispatcher.submit(event)?;
                    self.cursor = Some(self.cursor.map_or(block, |c| c.max(block)));
                }
                Err(e) => tracing::warn!(error = %e, "Skipping undecodable log"),
            }
        }
    }

    /// Fetch what was emitted since the cursor, capped at `catch_up_limit`
    /// blocks. Anything older is left to the missed-event backfill.
    async fn catch_up(&mut self) {
        let Some(cursor) = self.cursor else {
            return;
        };
        let head = match self.chain.block_number().await {
            Ok(head) => head,
            Err(e) => {
                tracing::warn!(error = %e, "Catch-up skipped");
                return;
            }
        };
        if head <= cursor {
            return;
        }
        let from = (cursor + 1).max(head.saturating_sub(self.catch_up_limit));
        match self.chain.fetch_events(&EventKind::ALL, from, head).await {
            Ok(events) => {
                tracing::info!(from, to = head, count = events.len(), "Caught up after reconnect");
                if self.hand_off(events) {
                    self.cursor = Some(head);
                }
            }
            Err(e) => tracing::warn!(from, to = head, error = %e, "Catch-up failed"),
        }
    }

    // ── Polling ─────────────────────────────────────────────────────────

    async fn poll(&mut self, interval: Duration, cancel: &CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(interval_secs = interval.as_secs(), "Polling for contract logs");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.poll_once().await;
        }
    }

    /// One polling step: hand off everything in `(cursor, head]`.
    pub async fn poll_once(&mut self) {
        let head = match self.chain.block_number().await {
            Ok(head) => head,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read block number");
                return;
            }
        };
        let Some(cursor) = self.cursor else {
            // Start at the head; history is the backfill's job.
            self.cursor = Some(head);
            return;
        };
        if head <= cursor {
            return;
        }

        match self.chain.fetch_events(&EventKind::ALL, cursor + 1, head).await {
            Ok(events) => {
                if !events.is_empty() {
                    tracing::debug!(from = cursor + 1, to = head, count = events.len(), "Polled events");
                }
                if self.hand_off(events) {
                    self.cursor = Some(head);
                }
            }
            Err(e) => tracing::warn!(from = cursor + 1, to = head, error = %e, "Polling failed"),
        }
    }

    pub fn cursor(&self) -> Option<u64> {
        self.cursor
    }

    fn hand_off(&self, events: Vec<NormalizedEvent>) -> bool {
        for event in events {
            if let Err(e) = self.dispatcher.submit(event) {
                tracing::error!(error = %e, "Dispatcher rejected live event");
                return false;
            }
        }
        true
    }
}

fn backoff(failures: u32) -> Duration {
    let factor = 2u32.saturating_pow(failures.saturating_sub(1));
    RECONNECT_BASE.saturating_mul(factor).min(RECONNECT_MAX)
}
