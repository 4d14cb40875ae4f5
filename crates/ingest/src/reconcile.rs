//! Periodic repair of everything the live listener can miss.
//!
//! Four independent loops, each a single task so a run never overlaps
//! itself:
//! - missing users (plus settings mirror and deferred-queue drain)
//! - missed slot/reward events over a trailing block window
//! - daily counter reset at a fixed local time
//! - full hierarchy recompute

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Days, FixedOffset, NaiveTime, TimeZone, Utc};
use matrixsync_chain::{ChainEvent, ChainReader, EventKind, NormalizedEvent};
use matrixsync_core::{AppError, Settings};
use matrixsync_storage::AggregateStore;
use matrixsync_storage::models::Setting;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::deferred::DeferredQueue;
use crate::dispatcher::Dispatcher;
use crate::hierarchy::recompute_hierarchy;
use crate::pipeline::{Applied, ZERO_ADDRESS};

/// Event kinds re-read by the missed-event backfill.
pub const BACKFILL_KINDS: [EventKind; 2] = [EventKind::SlotPurchased, EventKind::RewardDistributed];

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub reconcile_interval: Duration,
    pub user_backfill_span: u64,
    pub event_backfill_blocks: u64,
    pub daily_reset_time: NaiveTime,
    pub daily_reset_offset: FixedOffset,
    pub hierarchy_repair_interval: Duration,
}

impl ReconcileConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, AppError> {
        Ok(Self {
            reconcile_interval: settings.reconcile_interval(),
            user_backfill_span: settings.user_backfill_span,
            event_backfill_blocks: settings.event_backfill_blocks,
            daily_reset_time: settings.daily_reset_time,
            daily_reset_offset: settings.daily_reset_offset()?,
            hierarchy_repair_interval: settings.hierarchy_repair_interval(),
        })
    }
}

/// Per-item tally of one backfill pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub applied: usize,
    pub duplicates: usize,
    pub failed: usize,
}

impl BatchReport {
    /// Count one result; returns the error if it means the store is down.
    fn record(&mut self, result: Result<Applied, AppError>) -> Result<(), AppError> {
        match result {
            Ok(Applied::Duplicate) => self.duplicates += 1,
            Ok(_) => self.applied += 1,
            Err(e) if e.is_store_unavailable() => {
                self.failed += 1;
                return Err(e);
            }
            Err(_) => self.failed += 1,
        }
        Ok(())
    }
}

pub struct Reconciler {
    chain: Arc<dyn ChainReader>,
    store: Arc<dyn AggregateStore>,
    dispatcher: Dispatcher,
    deferred: Arc<DeferredQueue>,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(
        chain: Arc<dyn ChainReader>,
        store: Arc<dyn AggregateStore>,
        dispatcher: Dispatcher,
        deferred: Arc<DeferredQueue>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            chain,
            store,
            dispatcher,
            deferred,
            config,
        }
    }

    // ── Passes ──────────────────────────────────────────────────────────

    /// Register chain users in the trailing id window that are not stored.
    ///
    /// Ids are submitted in ascending order and awaited one by one, so a
    /// referrer lands before the users it referred.
    pub async fn backfill_missing_users(&self) -> Result<BatchReport, AppError> {
        let total = self.chain.total_users().await?;
        let mut report = BatchReport::default();
        if total == 0 {
            return Ok(report);
        }

        let from = total.saturating_sub(self.config.user_backfill_span).max(1);
        let existing = self
            .store
            .existing_user_ids(db_id(from)?, db_id(total)?)
            .await?;

        for user_id in from..=total {
            if existing.binary_search(&db_id(user_id)?).is_ok() {
                continue;
            }
            let remote = match self.chain.user_by_id(user_id).await {
                Ok(Some(remote)) => remote,
                Ok(None) => {
                    tracing::warn!(user_id, "Chain has no user for id");
                    report.failed += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(user_id, error = %e, "Could not read chain user");
                    report.failed += 1;
                    continue;
                }
            };

            let event = NormalizedEvent {
                block_number: 0,
                log_index: 0,
                transaction_hash: None,
                event: ChainEvent::UserRegistered {
                    user: remote.wallet,
                    user_id,
                    registration_time: remote.registration_time,
                    referrer: remote
                        .referrer_address
                        .unwrap_or_else(|| ZERO_ADDRESS.to_string()),
                },
            };
            let result = self.dispatcher.submit_and_wait(event).await;
            if let Err(e) = &result {
                tracing::warn!(user_id, error = %e, "Backfill of user failed");
            }
            report.record(result)?;
        }

        tracing::info!(
            from,
            to = total,
            applied = report.applied,
            failed = report.failed,
            "Missing-user backfill finished"
        );
        Ok(report)
    }

    /// Resubmit every deferred event. Events that fail again are re-deferred
    /// by the workers.
    pub async fn drain_deferred(&self) -> Result<BatchReport, AppError> {
        let events = self.deferred.drain().await;
        let mut report = BatchReport::default();
        if events.is_empty() {
            return Ok(report);
        }

        let count = events.len();
        let mut outage = None;
        for result in self.dispatcher.submit_batch(events).await {
            if let Err(e) = report.record(result) {
                outage.get_or_insert(e);
            }
        }
        tracing::info!(
            count,
            applied = report.applied,
            still_deferred = report.failed,
            "Drained deferred events"
        );
        match outage {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Mirror the contracts' pause flags into the settings row.
    pub async fn mirror_settings(&self) -> Result<Setting, AppError> {
        let setting = Setting {
            registration: !self.chain.registration_paused().await?,
            slot_purchase: !self.chain.purchasing_paused().await?,
        };
        if self.store.settings().await? != setting {
            self.store.save_settings(setting).await?;
            tracing::info!(
                registration = setting.registration,
                slot_purchase = setting.slot_purchase,
                "Settings updated from chain"
            );
        }
        Ok(setting)
    }

    /// Re-read slot and reward logs over the trailing block window.
    pub async fn backfill_missed_events(&self) -> Result<BatchReport, AppError> {
        let head = self.chain.block_number().await?;
        let from = head.saturating_sub(self.config.event_backfill_blocks);
        let events = self.chain.fetch_events(&BACKFILL_KINDS, from, head).await?;

        let count = events.len();
        let mut report = BatchReport::default();
        let mut outage = None;
        for result in self.dispatcher.submit_batch(events).await {
            if let Err(e) = report.record(result) {
                outage.get_or_insert(e);
            }
        }
        tracing::info!(
            from,
            to = head,
            count,
            applied = report.applied,
            duplicates = report.duplicates,
            failed = report.failed,
            "Missed-event backfill finished"
        );
        match outage {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    pub async fn reset_daily(&self) -> Result<u64, AppError> {
        let users = self.store.reset_daily_counters().await?;
        tracing::info!(users, "Daily counters reset");
        Ok(users)
    }

    /// One user reconciliation cycle: settings, missing users, then the
    /// deferred queue (whose events may have been waiting on those users).
    /// A store outage aborts the rest of the cycle. Missed events are
    /// replayed by their own loop.
    pub async fn reconcile_once(&self) -> Result<(), AppError> {
        if let Err(e) = self.mirror_settings().await {
            if e.is_store_unavailable() {
                return Err(e);
            }
            tracing::warn!(error = %e, "Settings mirror failed");
        }
        match self.backfill_missing_users().await {
            Err(e) if e.is_store_unavailable() => return Err(e),
            Err(e) => tracing::warn!(error = %e, "Missing-user backfill failed"),
            Ok(_) => {}
        }
        self.drain_deferred().await?;
        Ok(())
    }

    // ── Loops ───────────────────────────────────────────────────────────

    /// Run every loop until `cancel` fires. User reconciliation and event
    /// replay each run once immediately, independently of one another.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tokio::join!(
            self.clone().reconcile_loop(cancel.clone()),
            self.clone().event_backfill_loop(cancel.clone()),
            self.clone().daily_reset_loop(cancel.clone()),
            self.hierarchy_loop(cancel),
        );
        tracing::info!("Reconciler stopped");
    }

    async fn reconcile_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let started = tokio::time::Instant::now();
            match self.reconcile_once().await {
                Ok(()) => tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "Reconciliation cycle done"),
                Err(e) => tracing::error!(error = %e, "Reconciliation cycle aborted"),
            }
        }
    }

    async fn event_backfill_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.backfill_missed_events().await {
                tracing::error!(error = %e, "Missed-event backfill failed");
            }
        }
    }

    async fn daily_reset_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let now = Utc::now();
            let next = next_daily_run(now, self.config.daily_reset_time, self.config.daily_reset_offset);
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            tracing::info!(next = %next, "Next daily reset scheduled");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            if let Err(e) = self.reset_daily().await {
                tracing::error!(error = %e, "Daily reset failed");
            }
        }
    }

    async fn hierarchy_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.hierarchy_repair_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; skip it so startup only
        // pays for the reconciliation cycle.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = recompute_hierarchy(self.store.as_ref()).await {
                tracing::error!(error = %e, "Hierarchy recompute failed");
            }
        }
    }
}

fn db_id(user_id: u64) -> Result<i64, AppError> {
    i64::try_from(user_id).map_err(|_| AppError::Decode(format!("userId={user_id} exceeds i64")))
}

/// Next instant strictly after `now` at which the local clock (at `offset`)
/// reads `at`.
pub fn next_daily_run(now: DateTime<Utc>, at: NaiveTime, offset: FixedOffset) -> DateTime<Utc> {
    let local = now.with_timezone(&offset);
    let today = local.date_naive().and_time(at);
    let candidate = offset.from_utc_datetime(&(today - offset));
    let next = if candidate > local {
        candidate
    } else {
        let tomorrow = today.checked_add_days(Days::new(1)).unwrap_or(today);
        offset.from_utc_datetime(&(tomorrow - offset))
    };
    next.with_timezone(&Utc)
}
