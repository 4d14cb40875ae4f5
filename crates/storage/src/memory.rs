//! In-process [`AggregateStore`] used by tests and local runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use alloy_primitives::U256;
use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use matrixsync_core::AppError;
use tokio::sync::RwLock;

use crate::models::*;
use crate::store::AggregateStore;

#[derive(Default)]
struct State {
    users: BTreeMap<i64, User>,
    wallets: HashMap<String, i64>,
    orders: BTreeMap<(i64, i32), Order>,
    next_order_id: i64,
    transactions: Vec<Transaction>,
    slots: BTreeMap<(i64, i32), Slot>,
    settings: Setting,
}

impl State {
    fn user_mut(&mut self, user_id: i64) -> Option<&mut User> {
        self.users.get_mut(&user_id)
    }
}

/// All aggregates behind one lock, so each operation is atomic.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`AppError::Database`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Override a user's creation time.
    pub async fn set_user_created_at(&self, user_id: i64, created_at: NaiveDateTime) {
        if let Some(user) = self.state.write().await.user_mut(user_id) {
            user.created_at = created_at;
        }
    }

    /// Override an order's creation time.
    pub async fn set_order_created_at(&self, user_id: i64, level: i32, created_at: NaiveDateTime) {
        if let Some(order) = self.state.write().await.orders.get_mut(&(user_id, level)) {
            order.created_at = created_at;
        }
    }

    /// Overwrite stored counters directly, bypassing the increment path.
    pub async fn force_team_counts(&self, counts: TeamCounts) {
        if let Some(user) = self.state.write().await.user_mut(counts.user_id) {
            user.total_partners = counts.total_partners;
            user.total_team = counts.total_team;
        }
    }

    /// Overwrite `referred_by` directly, bypassing integrity checks.
    pub async fn force_referrer(&self, user_id: i64, referred_by: Option<i64>) {
        if let Some(user) = self.state.write().await.user_mut(user_id) {
            user.referred_by = referred_by;
        }
    }

    pub async fn orders(&self) -> Vec<Order> {
        self.state.read().await.orders.values().cloned().collect()
    }

    pub async fn transactions(&self) -> Vec<Transaction> {
        self.state.read().await.transactions.clone()
    }

    pub async fn users(&self) -> Vec<User> {
        self.state.read().await.users.values().cloned().collect()
    }

    fn check(&self) -> Result<(), AppError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Database("store unavailable".into()));
        }
        Ok(())
    }
}

fn parse_amount(value: &str) -> Result<U256, AppError> {
    U256::from_str_radix(value, 10).map_err(|e| AppError::Decode(format!("amount {value}: {e}")))
}

/// Exact decimal addition of two smallest-unit amounts.
pub fn add_amounts(a: &str, b: &str) -> Result<String, AppError> {
    let sum = parse_amount(a)?.saturating_add(parse_amount(b)?);
    Ok(sum.to_string())
}

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

fn counter_mut(user: &mut User, counter: Counter) -> &mut i64 {
    match counter {
        Counter::TotalPartners => &mut user.total_partners,
        Counter::TotalTeam => &mut user.total_team,
        Counter::DailyPartners => &mut user.daily_partners,
        Counter::DailyTeam => &mut user.daily_team,
        Counter::DailyActivePartners => &mut user.daily_active_partners,
    }
}

fn matches_filter(user: &User, filter: &UserFilter) -> bool {
    let contains = |haystack: &str, needle: &str| haystack.to_lowercase().contains(&needle.to_lowercase());
    filter
        .wallet_address
        .as_deref()
        .is_none_or(|needle| contains(&user.wallet_address, needle))
        && filter
            .full_name
            .as_deref()
            .is_none_or(|needle| contains(&user.full_name, needle))
}

#[async_trait]
impl AggregateStore for MemoryStore {
    async fn user_by_id(&self, user_id: i64) -> Result<Option<User>, AppError> {
        self.check()?;
        Ok(self.state.read().await.users.get(&user_id).cloned())
    }

    async fn user_by_address(&self, wallet: &str) -> Result<Option<User>, AppError> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .wallets
            .get(&wallet.to_lowercase())
            .and_then(|id| state.users.get(id))
            .cloned())
    }

    async fn register_user(&self, user: &NewUser, ancestors: &[i64]) -> Result<bool, AppError> {
        self.check()?;
        let mut state = self.state.write().await;

        if state.users.contains_key(&user.user_id) {
            return Ok(false);
        }
        match user.referred_by {
            Some(referrer) if !state.users.contains_key(&referrer) => {
                return Err(AppError::DanglingReference {
                    user_id: user.user_id,
                    referenced: referrer.to_string(),
                });
            }
            None if state.users.values().any(|u| u.is_owner) => {
                return Err(AppError::DanglingReference {
                    user_id: user.user_id,
                    referenced: "root".into(),
                });
            }
            _ => {}
        }
        let wallet = user.wallet_address.to_lowercase();
        if state.wallets.contains_key(&wallet) {
            return Ok(false);
        }

        let ts = now();
        state.wallets.insert(wallet.clone(), user.user_id);
        state.users.insert(
            user.user_id,
            User {
                user_id: user.user_id,
                wallet_address: wallet,
                full_name: user.full_name.clone(),
                referred_by: user.referred_by,
                referrer_address: user.referrer_address.clone(),
                is_owner: user.referred_by.is_none(),
                registration_time: user.registration_time,
                total_partners: 0,
                total_team: 0,
                daily_partners: 0,
                daily_team: 0,
                daily_active_partners: 0,
                current_active_slot: 0,
                is_active: false,
                income: Income::zero(),
                daily_direct_income: "0".into(),
                daily_level_income: "0".into(),
                daily_total_income: "0".into(),
                created_at: ts,
                updated_at: ts,
            },
        );

        if let Some(referrer) = user.referred_by.and_then(|id| state.user_mut(id)) {
            referrer.total_partners += 1;
            referrer.total_team += 1;
            referrer.daily_partners += 1;
            referrer.daily_team += 1;
            referrer.updated_at = ts;
        }
        for ancestor in ancestors {
            if let Some(ancestor) = state.user_mut(*ancestor) {
                ancestor.total_team += 1;
                ancestor.daily_team += 1;
                ancestor.updated_at = ts;
            }
        }
        Ok(true)
    }

    async fn increment_counters(&self, user_id: i64, deltas: &[(Counter, i64)]) -> Result<(), AppError> {
        self.check()?;
        let mut state = self.state.write().await;
        let Some(user) = state.user_mut(user_id) else {
            tracing::warn!(user_id, "Counter increment for missing user");
            return Ok(());
        };
        for (counter, delta) in deltas {
            *counter_mut(user, *counter) += delta;
        }
        user.updated_at = now();
        Ok(())
    }

    async fn upsert_order(&self, order: &NewOrder) -> Result<bool, AppError> {
        self.check()?;
        let mut state = self.state.write().await;
        let ts = now();
        let key = (order.user_id, order.level);

        if let Some(existing) = state.orders.get_mut(&key) {
            existing.user_address = order.user_address.clone();
            existing.price = order.price.clone();
            if order.transaction_hash.is_some() {
                existing.transaction_hash = order.transaction_hash.clone();
            }
            existing.updated_at = ts;
            return Ok(false);
        }

        state.next_order_id += 1;
        let id = state.next_order_id;
        state.orders.insert(
            key,
            Order {
                id,
                user_id: order.user_id,
                user_address: order.user_address.clone(),
                level: order.level,
                price: order.price.clone(),
                transaction_hash: order.transaction_hash.clone(),
                created_at: ts,
                updated_at: ts,
            },
        );
        Ok(true)
    }

    async fn record_reward(
        &self,
        reward: &NewTransaction,
        bucket: IncomeBucket,
    ) -> Result<RewardOutcome, AppError> {
        self.check()?;
        let mut state = self.state.write().await;

        if state.transactions.iter().any(|t| {
            (t.receiver_id, t.from_id, t.amount.as_str(), t.level) == reward.key()
        }) {
            return Ok(RewardOutcome::default());
        }

        let Some(receiver) = state.users.get(&reward.receiver_id) else {
            return Err(AppError::DanglingReference {
                user_id: reward.receiver_id,
                referenced: reward.receiver.clone(),
            });
        };
        let daily_total = add_amounts(&receiver.daily_total_income, &reward.amount)?;
        let daily_direct = match bucket {
            IncomeBucket::Direct => add_amounts(&receiver.daily_direct_income, &reward.amount)?,
            _ => receiver.daily_direct_income.clone(),
        };
        let daily_level = match bucket {
            IncomeBucket::Level => add_amounts(&receiver.daily_level_income, &reward.amount)?,
            _ => receiver.daily_level_income.clone(),
        };

        let ts = now();
        let id = state.transactions.len() as i64 + 1;
        state.transactions.push(Transaction {
            id,
            receiver_id: reward.receiver_id,
            receiver: reward.receiver.clone(),
            from_id: reward.from_id,
            from_address: reward.from_address.clone(),
            amount: reward.amount.clone(),
            level: reward.level,
            income_type: reward.income_type.clone(),
            transaction_hash: reward.transaction_hash.clone(),
            created_at: ts,
        });

        let mut activated = false;
        let mut referrer = None;
        if let Some(receiver) = state.user_mut(reward.receiver_id) {
            activated = !receiver.is_active;
            referrer = receiver.referred_by;
            receiver.is_active = true;
            receiver.daily_total_income = daily_total;
            receiver.daily_direct_income = daily_direct;
            receiver.daily_level_income = daily_level;
            receiver.updated_at = ts;
        }
        if activated {
            if let Some(referrer) = referrer.and_then(|id| state.user_mut(id)) {
                referrer.daily_active_partners += 1;
                referrer.updated_at = ts;
            }
        }

        Ok(RewardOutcome {
            first_seen: true,
            activated,
        })
    }

    async fn set_current_active_slot(&self, user_id: i64, slot: i32) -> Result<(), AppError> {
        self.check()?;
        if let Some(user) = self.state.write().await.user_mut(user_id) {
            user.current_active_slot = slot;
            user.updated_at = now();
        }
        Ok(())
    }

    async fn set_income(&self, user_id: i64, income: &Income) -> Result<(), AppError> {
        self.check()?;
        if let Some(user) = self.state.write().await.user_mut(user_id) {
            user.income = income.clone();
            user.updated_at = now();
        }
        Ok(())
    }

    async fn upsert_slot(&self, slot: &SlotSnapshot) -> Result<(), AppError> {
        self.check()?;
        self.state.write().await.slots.insert(
            (slot.user_id, slot.level),
            Slot {
                user_id: slot.user_id,
                wallet_address: slot.wallet_address.clone(),
                level: slot.level,
                referral_count: slot.referral_count.clone(),
                recycle_count: slot.recycle_count.clone(),
                slot_transactions: slot.slot_transactions.clone(),
                is_upgraded: slot.is_upgraded,
                is_active: slot.is_active,
                updated_at: now(),
            },
        );
        Ok(())
    }

    async fn reset_daily_counters(&self) -> Result<u64, AppError> {
        self.check()?;
        let mut state = self.state.write().await;
        let ts = now();
        for user in state.users.values_mut() {
            user.daily_partners = 0;
            user.daily_team = 0;
            user.daily_active_partners = 0;
            user.daily_direct_income = "0".into();
            user.daily_level_income = "0".into();
            user.daily_total_income = "0".into();
            user.updated_at = ts;
        }
        Ok(state.users.len() as u64)
    }

    async fn existing_user_ids(&self, from: i64, to: i64) -> Result<Vec<i64>, AppError> {
        self.check()?;
        if from > to {
            return Ok(Vec::new());
        }
        Ok(self.state.read().await.users.range(from..=to).map(|(id, _)| *id).collect())
    }

    async fn referral_edges(&self) -> Result<Vec<(i64, Option<i64>)>, AppError> {
        self.check()?;
        Ok(self
            .state
            .read()
            .await
            .users
            .values()
            .map(|u| (u.user_id, u.referred_by))
            .collect())
    }

    async fn apply_team_counts(&self, counts: &[TeamCounts]) -> Result<u64, AppError> {
        self.check()?;
        let mut state = self.state.write().await;
        let ts = now();
        let mut changed = 0;
        for count in counts {
            let Some(user) = state.user_mut(count.user_id) else {
                continue;
            };
            if user.total_partners != count.total_partners || user.total_team != count.total_team {
                user.total_partners = count.total_partners;
                user.total_team = count.total_team;
                user.updated_at = ts;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn settings(&self) -> Result<Setting, AppError> {
        self.check()?;
        Ok(self.state.read().await.settings)
    }

    async fn save_settings(&self, setting: Setting) -> Result<(), AppError> {
        self.check()?;
        self.state.write().await.settings = setting;
        Ok(())
    }

    async fn search_users(
        &self,
        filter: &UserFilter,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<User>, i64), AppError> {
        self.check()?;
        let state = self.state.read().await;
        let matching: Vec<&User> = state.users.values().filter(|u| matches_filter(u, filter)).collect();
        let total = matching.len() as i64;
        let page = matching
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn slots_for_user(&self, user_id: i64) -> Result<Vec<Slot>, AppError> {
        self.check()?;
        Ok(self
            .state
            .read()
            .await
            .slots
            .range((user_id, i32::MIN)..=(user_id, i32::MAX))
            .map(|(_, slot)| slot.clone())
            .collect())
    }

    async fn transactions_for_user(&self, user_id: i64, limit: i64) -> Result<Vec<Transaction>, AppError> {
        self.check()?;
        Ok(self
            .state
            .read()
            .await
            .transactions
            .iter()
            .rev()
            .filter(|t| t.receiver_id == user_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn direct_referrals_of(&self, referrers: &[i64]) -> Result<Vec<User>, AppError> {
        self.check()?;
        Ok(self
            .state
            .read()
            .await
            .users
            .values()
            .filter(|u| u.referred_by.is_some_and(|r| referrers.contains(&r)))
            .cloned()
            .collect())
    }

    async fn count_users(&self, since: Option<NaiveDateTime>) -> Result<i64, AppError> {
        self.check()?;
        let state = self.state.read().await;
        Ok(state
            .users
            .values()
            .filter(|u| since.is_none_or(|since| u.created_at >= since))
            .count() as i64)
    }

    async fn order_price_sum(&self, since: Option<NaiveDateTime>) -> Result<String, AppError> {
        self.check()?;
        let state = self.state.read().await;
        let mut total = U256::ZERO;
        for order in state.orders.values() {
            if since.is_none_or(|since| order.created_at >= since) {
                total = total.saturating_add(parse_amount(&order.price)?);
            }
        }
        Ok(total.to_string())
    }
}
