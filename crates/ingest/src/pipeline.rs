//! Applies one normalized chain event to the aggregate store.

use std::collections::HashSet;
use std::sync::Arc;

use matrixsync_chain::{ChainEvent, ChainReader, ChainUser, IncomeStats, IncomeType, NormalizedEvent};
use matrixsync_core::AppError;
use matrixsync_storage::AggregateStore;
use matrixsync_storage::models::{
    Income, IncomeBucket, NewOrder, NewTransaction, NewUser, SlotSnapshot, User,
};

/// Registrant referrer value meaning "no referrer".
pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

const UNKNOWN_NAME: &str = "Unknown";

/// What applying an event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// A new row was created.
    Inserted,
    /// Redelivery of an event whose effect is already stored.
    Duplicate,
    /// Existing rows were overwritten with fresh state.
    Updated,
    /// Logged only.
    Informational,
}

/// Per-event-type business rules. Safe to call concurrently; callers
/// serialize events that share an ordering key.
pub struct Pipeline {
    chain: Arc<dyn ChainReader>,
    store: Arc<dyn AggregateStore>,
    ancestor_walk_depth: usize,
}

impl Pipeline {
    pub fn new(
        chain: Arc<dyn ChainReader>,
        store: Arc<dyn AggregateStore>,
        ancestor_walk_depth: usize,
    ) -> Self {
        Self {
            chain,
            store,
            ancestor_walk_depth: ancestor_walk_depth.max(1),
        }
    }

    pub async fn apply(&self, event: &NormalizedEvent) -> Result<Applied, AppError> {
        match &event.event {
            ChainEvent::UserRegistered {
                user,
                user_id,
                registration_time,
                referrer,
            } => {
                self.apply_registration(user, *user_id, *registration_time, referrer)
                    .await
            }
            ChainEvent::SlotPurchased { user, level, price } => {
                self.apply_slot_purchase(user, *level, price, event.transaction_hash.as_deref())
                    .await
            }
            ChainEvent::RewardDistributed {
                receiver,
                from,
                amount,
                level,
                income_type,
            } => {
                self.apply_reward(
                    receiver,
                    from,
                    amount,
                    *level,
                    income_type,
                    event.transaction_hash.as_deref(),
                )
                .await
            }
            other => {
                tracing::info!(
                    kind = %other.kind(),
                    block = event.block_number,
                    log_index = event.log_index,
                    wallet = other.ordering_key(),
                    payload = ?other,
                    "Observed informational event"
                );
                Ok(Applied::Informational)
            }
        }
    }

    // ── UserRegistered ──────────────────────────────────────────────────

    async fn apply_registration(
        &self,
        wallet: &str,
        user_id: u64,
        registration_time: u64,
        referrer: &str,
    ) -> Result<Applied, AppError> {
        let id = to_db_id(user_id)?;
        if self.store.user_by_id(id).await?.is_some() {
            return Ok(Applied::Duplicate);
        }

        let referrer_user = if referrer == ZERO_ADDRESS {
            None
        } else {
            Some(self.resolve_referrer(user_id, referrer).await?)
        };

        let full_name = self.full_name(user_id).await;
        let new = NewUser {
            user_id: id,
            wallet_address: wallet.to_string(),
            full_name,
            referred_by: referrer_user.as_ref().map(|r| r.user_id),
            referrer_address: referrer_user.as_ref().map(|r| r.wallet_address.clone()),
            registration_time: to_timestamp(registration_time)?,
        };

        if self.insert_user(&new, referrer_user.as_ref()).await? {
            tracing::info!(user_id, wallet, referred_by = ?new.referred_by, "Registered user");
            Ok(Applied::Inserted)
        } else {
            Ok(Applied::Duplicate)
        }
    }

    /// Local record of `referrer`, pulling any missing part of its referral
    /// chain from the chain and registering it top-down.
    async fn resolve_referrer(&self, user_id: u64, referrer: &str) -> Result<User, AppError> {
        let unresolved = || AppError::UnresolvedReferrer {
            user_id,
            referrer: referrer.to_string(),
        };

        let mut missing: Vec<ChainUser> = Vec::new();
        let mut seen = HashSet::new();
        let mut wallet = referrer.to_string();
        let mut anchor = loop {
            if let Some(local) = self.store.user_by_address(&wallet).await? {
                break Some(local);
            }
            if missing.len() >= self.ancestor_walk_depth {
                tracing::warn!(user_id, referrer, "Referrer chain deeper than walk limit");
                return Err(unresolved());
            }
            let Some(remote) = self.chain.user_by_address(&wallet).await? else {
                return Err(unresolved());
            };
            if !seen.insert(remote.user_id) {
                tracing::warn!(user_id, referrer, "Cycle in on-chain referrer chain");
                return Err(unresolved());
            }
            let next = remote.referrer_address.clone();
            missing.push(remote);
            match next {
                Some(next) => wallet = next,
                None => break None,
            }
        };

        for remote in missing.into_iter().rev() {
            let new = NewUser {
                user_id: to_db_id(remote.user_id)?,
                wallet_address: remote.wallet.clone(),
                full_name: display_name(remote.full_name),
                referred_by: anchor.as_ref().map(|a| a.user_id),
                referrer_address: anchor.as_ref().map(|a| a.wallet_address.clone()),
                registration_time: to_timestamp(remote.registration_time)?,
            };
            if self.insert_user(&new, anchor.as_ref()).await? {
                tracing::info!(user_id = new.user_id, wallet = %new.wallet_address, "Registered missing referrer");
            }
            anchor = self.store.user_by_id(new.user_id).await?;
        }

        anchor.ok_or_else(unresolved)
    }

    async fn insert_user(&self, new: &NewUser, referrer: Option<&User>) -> Result<bool, AppError> {
        let ancestors = match referrer {
            Some(referrer) => self.ancestors_above(referrer).await?,
            None => Vec::new(),
        };
        match self.store.register_user(new, &ancestors).await {
            Err(err @ AppError::DanglingReference { .. }) => {
                tracing::error!(user_id = new.user_id, error = %err, "Rejected user write");
                Err(err)
            }
            other => other,
        }
    }

    /// Ids above the direct referrer, nearest first. Stops at the root, at a
    /// repeated id, or once referrer plus ancestors span the walk depth.
    async fn ancestors_above(&self, referrer: &User) -> Result<Vec<i64>, AppError> {
        let limit = self.ancestor_walk_depth.saturating_sub(1);
        let mut ancestors = Vec::new();
        let mut visited = HashSet::from([referrer.user_id]);
        let mut next = referrer.referred_by;

        while let Some(id) = next {
            if ancestors.len() >= limit {
                break;
            }
            if !visited.insert(id) {
                tracing::warn!(user_id = referrer.user_id, repeated = id, "Cycle in referral chain");
                break;
            }
            let Some(ancestor) = self.store.user_by_id(id).await? else {
                tracing::warn!(user_id = referrer.user_id, missing = id, "Referral chain is broken");
                break;
            };
            ancestors.push(id);
            next = ancestor.referred_by;
        }
        Ok(ancestors)
    }

    async fn full_name(&self, user_id: u64) -> String {
        match self.chain.user_by_id(user_id).await {
            Ok(Some(remote)) => display_name(remote.full_name),
            Ok(None) => UNKNOWN_NAME.to_string(),
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Could not read full name");
                UNKNOWN_NAME.to_string()
            }
        }
    }

    // ── SlotPurchased ───────────────────────────────────────────────────

    async fn apply_slot_purchase(
        &self,
        wallet: &str,
        level: u32,
        price: &str,
        transaction_hash: Option<&str>,
    ) -> Result<Applied, AppError> {
        let user = self.known_user(wallet).await?;
        let level_i32 = to_level(level)?;

        let inserted = self
            .store
            .upsert_order(&NewOrder {
                user_id: user.user_id,
                user_address: user.wallet_address.clone(),
                level: level_i32,
                price: price.to_string(),
                transaction_hash: transaction_hash.map(str::to_string),
            })
            .await?;

        // Event order is not trusted; the chain has the authoritative slot.
        let slot = self.chain.current_slot(&user.wallet_address).await?;
        self.store
            .set_current_active_slot(user.user_id, to_level(slot.current_active_slot)?)
            .await?;

        self.refresh_slot(&user, level).await?;
        if let Some(referrer_id) = user.referred_by {
            match self.store.user_by_id(referrer_id).await? {
                Some(referrer) => self.refresh_slot(&referrer, level).await?,
                None => tracing::warn!(user_id = user.user_id, referrer_id, "Referrer missing locally"),
            }
        }

        tracing::debug!(
            user_id = user.user_id,
            level,
            current_active_slot = slot.current_active_slot,
            inserted,
            "Applied slot purchase"
        );
        Ok(if inserted { Applied::Inserted } else { Applied::Updated })
    }

    async fn refresh_slot(&self, user: &User, level: u32) -> Result<(), AppError> {
        let details = self
            .chain
            .level_referral_details(&user.wallet_address, level)
            .await?;
        self.store
            .upsert_slot(&SlotSnapshot {
                user_id: user.user_id,
                wallet_address: user.wallet_address.clone(),
                level: to_level(level)?,
                referral_count: details.referral_count,
                recycle_count: details.recycle_count,
                slot_transactions: details.slot_transactions,
                is_upgraded: details.is_upgraded,
                is_active: details.is_active,
            })
            .await
    }

    // ── RewardDistributed ───────────────────────────────────────────────

    async fn apply_reward(
        &self,
        receiver: &str,
        from: &str,
        amount: &str,
        level: u32,
        income_type: &IncomeType,
        transaction_hash: Option<&str>,
    ) -> Result<Applied, AppError> {
        let receiver = self.known_user(receiver).await?;
        let sender = self.known_user(from).await?;

        let outcome = self
            .store
            .record_reward(
                &NewTransaction {
                    receiver_id: receiver.user_id,
                    receiver: receiver.wallet_address.clone(),
                    from_id: sender.user_id,
                    from_address: sender.wallet_address.clone(),
                    amount: amount.to_string(),
                    level: to_level(level)?,
                    income_type: income_type.as_str().to_string(),
                    transaction_hash: transaction_hash.map(str::to_string),
                },
                income_bucket(income_type),
            )
            .await?;

        if outcome.activated {
            tracing::info!(
                user_id = receiver.user_id,
                referrer_id = receiver.referred_by,
                "User activated"
            );
        }

        // Cumulative totals always come from the chain, duplicate or not.
        self.refresh_income(&receiver).await?;
        if sender.user_id != receiver.user_id {
            self.refresh_income(&sender).await?;
        }

        Ok(if outcome.first_seen {
            Applied::Inserted
        } else {
            Applied::Duplicate
        })
    }

    async fn refresh_income(&self, user: &User) -> Result<(), AppError> {
        let stats = self.chain.income_stats(&user.wallet_address).await?;
        self.store.set_income(user.user_id, &income_from(stats)).await
    }

    async fn known_user(&self, wallet: &str) -> Result<User, AppError> {
        self.store
            .user_by_address(wallet)
            .await?
            .ok_or_else(|| AppError::UnknownUser(wallet.to_string()))
    }
}

pub fn income_bucket(income_type: &IncomeType) -> IncomeBucket {
    match income_type {
        IncomeType::Direct => IncomeBucket::Direct,
        IncomeType::Level => IncomeBucket::Level,
        _ => IncomeBucket::Other,
    }
}

fn income_from(stats: IncomeStats) -> Income {
    Income {
        total: stats.total,
        level_income: stats.level_income,
        direct_income: stats.direct_income,
        slot_income: stats.slot_income,
        recycle_income: stats.recycle_income,
        salary_income: stats.salary_income,
    }
}

fn display_name(raw: String) -> String {
    if raw.trim().is_empty() {
        UNKNOWN_NAME.to_string()
    } else {
        raw
    }
}

fn to_db_id(user_id: u64) -> Result<i64, AppError> {
    i64::try_from(user_id).map_err(|_| AppError::Decode(format!("userId={user_id} exceeds i64")))
}

fn to_timestamp(seconds: u64) -> Result<i64, AppError> {
    i64::try_from(seconds).map_err(|_| AppError::Decode(format!("registrationTime={seconds} exceeds i64")))
}

fn to_level(level: u32) -> Result<i32, AppError> {
    i32::try_from(level).map_err(|_| AppError::Decode(format!("level={level} exceeds i32")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeChain, registered, reward, slot_purchase, wallet};
    use matrixsync_storage::MemoryStore;

    fn pipeline(chain: &Arc<FakeChain>, store: &Arc<MemoryStore>) -> Pipeline {
        Pipeline::new(chain.clone(), store.clone(), 10)
    }

    async fn seed_line(chain: &Arc<FakeChain>, pipeline: &Pipeline, ids: &[u64]) {
        let mut parent = None;
        for &id in ids {
            chain.add_user(id, parent);
            pipeline.apply(&registered(id, parent)).await.unwrap();
            parent = Some(id);
        }
    }

    #[tokio::test]
    async fn owner_then_child_updates_partner_counts() {
        let chain = Arc::new(FakeChain::default());
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(&chain, &store);
        seed_line(&chain, &pipeline, &[1, 2]).await;

        let owner = store.user_by_id(1).await.unwrap().unwrap();
        assert!(owner.is_owner);
        assert_eq!(owner.referred_by, None);
        assert_eq!((owner.total_partners, owner.total_team), (1, 1));

        let child = store.user_by_id(2).await.unwrap().unwrap();
        assert_eq!(child.referred_by, Some(1));
        assert_eq!(child.full_name, "user 2");
    }

    #[tokio::test]
    async fn grandchild_bumps_team_of_every_ancestor() {
        let chain = Arc::new(FakeChain::default());
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(&chain, &store);
        seed_line(&chain, &pipeline, &[1, 2, 3, 4]).await;

        let root = store.user_by_id(1).await.unwrap().unwrap();
        assert_eq!((root.total_partners, root.total_team, root.daily_team), (1, 3, 3));
        let mid = store.user_by_id(2).await.unwrap().unwrap();
        assert_eq!((mid.total_partners, mid.total_team), (1, 2));
    }

    #[tokio::test]
    async fn redelivered_registration_is_absorbed() {
        let chain = Arc::new(FakeChain::default());
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(&chain, &store);
        seed_line(&chain, &pipeline, &[1, 2]).await;

        assert_eq!(pipeline.apply(&registered(2, Some(1))).await.unwrap(), Applied::Duplicate);
        let owner = store.user_by_id(1).await.unwrap().unwrap();
        assert_eq!(owner.total_partners, 1);
    }

    #[tokio::test]
    async fn missing_referrer_is_pulled_from_chain() {
        let chain = Arc::new(FakeChain::default());
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(&chain, &store);
        chain.add_user(1, None);
        chain.add_user(2, Some(1));
        chain.add_user(3, Some(2));

        assert_eq!(pipeline.apply(&registered(3, Some(2))).await.unwrap(), Applied::Inserted);

        assert_eq!(store.users().await.len(), 3);
        let root = store.user_by_id(1).await.unwrap().unwrap();
        assert_eq!((root.total_partners, root.total_team), (1, 2));
    }

    #[tokio::test]
    async fn unresolvable_referrer_defers_without_writing() {
        let chain = Arc::new(FakeChain::default());
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(&chain, &store);
        chain.add_user(1, None);
        pipeline.apply(&registered(1, None)).await.unwrap();

        // Referrer 7 is unknown both locally and on chain.
        let err = pipeline.apply(&registered(8, Some(7))).await.unwrap_err();
        assert!(matches!(err, AppError::UnresolvedReferrer { user_id: 8, .. }));
        assert!(err.is_deferrable());
        assert!(store.user_by_id(8).await.unwrap().is_none());

        // Referrer shows up later; the retried event now succeeds.
        chain.add_user(7, Some(1));
        assert_eq!(pipeline.apply(&registered(8, Some(7))).await.unwrap(), Applied::Inserted);
        let seven = store.user_by_id(7).await.unwrap().unwrap();
        assert_eq!(seven.total_partners, 1);
        let root = store.user_by_id(1).await.unwrap().unwrap();
        assert_eq!((root.total_partners, root.total_team), (1, 2));
    }

    #[tokio::test]
    async fn ancestor_walk_stops_at_depth_limit() {
        let chain = Arc::new(FakeChain::default());
        let store = Arc::new(MemoryStore::new());
        let pipeline = Pipeline::new(chain.clone(), store.clone(), 2);
        seed_line(&chain, &pipeline, &[1, 2, 3, 4]).await;

        // User 4 reaches its referrer (3) and one ancestor (2), not the root.
        let root = store.user_by_id(1).await.unwrap().unwrap();
        assert_eq!(root.total_team, 2);
        let two = store.user_by_id(2).await.unwrap().unwrap();
        assert_eq!(two.total_team, 2);
    }

    #[tokio::test]
    async fn ancestor_walk_terminates_on_cycle() {
        let chain = Arc::new(FakeChain::default());
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(&chain, &store);
        seed_line(&chain, &pipeline, &[1, 2, 3]).await;
        store.force_referrer(1, Some(3)).await;

        chain.add_user(4, Some(3));
        assert_eq!(pipeline.apply(&registered(4, Some(3))).await.unwrap(), Applied::Inserted);
        let three = store.user_by_id(3).await.unwrap().unwrap();
        assert_eq!(three.total_partners, 1);
    }

    #[tokio::test]
    async fn slot_purchase_is_idempotent_and_refetches_slot() {
        let chain = Arc::new(FakeChain::default());
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(&chain, &store);
        seed_line(&chain, &pipeline, &[1, 2]).await;
        chain.set_slot(2, 5);

        // Level 5 arrives before level 3; the chain says 5 either way.
        pipeline.apply(&slot_purchase(2, 5, "200")).await.unwrap();
        assert_eq!(pipeline.apply(&slot_purchase(2, 3, "100")).await.unwrap(), Applied::Inserted);
        assert_eq!(pipeline.apply(&slot_purchase(2, 3, "100")).await.unwrap(), Applied::Updated);

        let orders = store.orders().await;
        assert_eq!(orders.iter().filter(|o| o.user_id == 2 && o.level == 3).count(), 1);
        assert_eq!(orders.len(), 2);

        let user = store.user_by_id(2).await.unwrap().unwrap();
        assert_eq!(user.current_active_slot, 5);

        // Snapshot for the buyer and for its referrer at the same level.
        assert_eq!(store.slots_for_user(2).await.unwrap().len(), 2);
        let referrer_slots = store.slots_for_user(1).await.unwrap();
        assert_eq!(referrer_slots.iter().map(|s| s.level).collect::<Vec<_>>(), vec![3, 5]);
    }

    #[tokio::test]
    async fn slot_purchase_for_unknown_wallet_is_deferrable() {
        let chain = Arc::new(FakeChain::default());
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(&chain, &store);

        let err = pipeline.apply(&slot_purchase(9, 1, "100")).await.unwrap_err();
        assert!(matches!(err, AppError::UnknownUser(ref w) if *w == wallet(9)));
        assert!(err.is_deferrable());
        assert!(store.orders().await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_reward_credits_daily_income_once() {
        let chain = Arc::new(FakeChain::default());
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(&chain, &store);
        seed_line(&chain, &pipeline, &[1, 2, 3]).await;
        chain.set_income(1, "100");

        let event = reward(1, 3, "100", 1, "level");
        assert_eq!(pipeline.apply(&event).await.unwrap(), Applied::Inserted);
        assert_eq!(pipeline.apply(&event).await.unwrap(), Applied::Duplicate);

        let a = store.user_by_id(1).await.unwrap().unwrap();
        assert_eq!(a.daily_level_income, "100");
        assert_eq!(a.daily_total_income, "100");
        assert!(a.is_active);
        assert_eq!(a.income.total, "100");
        let keyed = store
            .transactions()
            .await
            .into_iter()
            .filter(|t| t.receiver_id == 1 && t.from_id == 3 && t.amount == "100" && t.level == 1)
            .count();
        assert_eq!(keyed, 1);
    }

    #[tokio::test]
    async fn first_activation_counts_for_referrer() {
        let chain = Arc::new(FakeChain::default());
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(&chain, &store);
        seed_line(&chain, &pipeline, &[1, 2, 3]).await;

        pipeline.apply(&reward(2, 3, "10", 1, "direct")).await.unwrap();
        pipeline.apply(&reward(2, 3, "20", 2, "direct")).await.unwrap();

        let referrer = store.user_by_id(1).await.unwrap().unwrap();
        assert_eq!(referrer.daily_active_partners, 1);
        let two = store.user_by_id(2).await.unwrap().unwrap();
        assert_eq!(two.daily_direct_income, "30");
        assert_eq!(two.daily_level_income, "0");
    }

    #[tokio::test]
    async fn oversized_registration_time_is_a_decode_error() {
        let chain = Arc::new(FakeChain::default());
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(&chain, &store);
        chain.add_user(1, None);

        let mut event = registered(1, None);
        if let ChainEvent::UserRegistered { registration_time, .. } = &mut event.event {
            *registration_time = u64::MAX;
        }
        let err = pipeline.apply(&event).await.unwrap_err();
        assert!(matches!(err, AppError::Decode(_)));
        assert!(store.user_by_id(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retried_reward_keeps_referrer_activation_count() {
        let chain = Arc::new(FakeChain::default());
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(&chain, &store);
        seed_line(&chain, &pipeline, &[1, 2, 3]).await;

        // The reward row commits, then the income refresh fails.
        chain.set_failing(true);
        let first = pipeline.apply(&reward(2, 3, "10", 1, "direct")).await;
        assert!(matches!(first, Err(AppError::Rpc(_))));
        chain.set_failing(false);

        let retry = pipeline.apply(&reward(2, 3, "10", 1, "direct")).await.unwrap();
        assert_eq!(retry, Applied::Duplicate);

        let two = store.user_by_id(2).await.unwrap().unwrap();
        assert!(two.is_active);
        assert_eq!(two.daily_direct_income, "10");
        let referrer = store.user_by_id(1).await.unwrap().unwrap();
        assert_eq!(referrer.daily_active_partners, 1);
    }

    #[tokio::test]
    async fn reward_with_unknown_sender_is_deferred() {
        let chain = Arc::new(FakeChain::default());
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(&chain, &store);
        seed_line(&chain, &pipeline, &[1]).await;

        let err = pipeline.apply(&reward(1, 5, "10", 1, "direct")).await.unwrap_err();
        assert!(err.is_deferrable());
        assert!(store.transactions().await.is_empty());
    }

    #[tokio::test]
    async fn rpc_failure_on_refresh_is_deferrable() {
        let chain = Arc::new(FakeChain::default());
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(&chain, &store);
        seed_line(&chain, &pipeline, &[1, 2]).await;
        chain.set_failing(true);

        let err = pipeline.apply(&slot_purchase(2, 1, "100")).await.unwrap_err();
        assert!(err.is_deferrable());
    }

    #[tokio::test]
    async fn informational_events_do_not_touch_state() {
        let chain = Arc::new(FakeChain::default());
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(&chain, &store);

        let event = NormalizedEvent {
            block_number: 10,
            log_index: 0,
            transaction_hash: None,
            event: ChainEvent::MatrixComplete {
                user: wallet(1),
                level: 2,
            },
        };
        assert_eq!(pipeline.apply(&event).await.unwrap(), Applied::Informational);
        assert!(store.users().await.is_empty());
    }
}
