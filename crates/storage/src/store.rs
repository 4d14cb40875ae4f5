//! The aggregate store seam shared by the ingest and query crates.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use matrixsync_core::AppError;

use crate::models::*;

/// Persisted aggregates and their invariants.
///
/// Every counter change is an atomic increment inside the store, and every
/// insert is keyed so that redelivered events are absorbed. Errors are
/// [`AppError::Database`] unless stated otherwise.
#[async_trait]
pub trait AggregateStore: Send + Sync {
    async fn user_by_id(&self, user_id: i64) -> Result<Option<User>, AppError>;

    async fn user_by_address(&self, wallet: &str) -> Result<Option<User>, AppError>;

    /// Insert `user` if its id is new, bumping the referrer's counters and
    /// the team counters of `ancestors` (referrer excluded) in the same unit
    /// of work. Returns false when the user already existed.
    ///
    /// Fails with [`AppError::DanglingReference`] when `referred_by` is not
    /// stored or when a second root is offered.
    async fn register_user(&self, user: &NewUser, ancestors: &[i64]) -> Result<bool, AppError>;

    async fn increment_counters(&self, user_id: i64, deltas: &[(Counter, i64)]) -> Result<(), AppError>;

    /// Returns true when the (user, level) order is new.
    async fn upsert_order(&self, order: &NewOrder) -> Result<bool, AppError>;

    /// Insert-if-absent plus the receiver's daily income, `is_active` and,
    /// on first activation, the referrer's `daily_active_partners`, all as
    /// one unit: a retry after failure never double-credits or skips a part.
    async fn record_reward(
        &self,
        reward: &NewTransaction,
        bucket: IncomeBucket,
    ) -> Result<RewardOutcome, AppError>;

    async fn set_current_active_slot(&self, user_id: i64, slot: i32) -> Result<(), AppError>;

    async fn set_income(&self, user_id: i64, income: &Income) -> Result<(), AppError>;

    async fn upsert_slot(&self, slot: &SlotSnapshot) -> Result<(), AppError>;

    /// Zero the daily counters of every user; returns the number of rows touched.
    async fn reset_daily_counters(&self) -> Result<u64, AppError>;

    async fn existing_user_ids(&self, from: i64, to: i64) -> Result<Vec<i64>, AppError>;

    async fn referral_edges(&self) -> Result<Vec<(i64, Option<i64>)>, AppError>;

    /// Returns the number of users whose counts changed.
    async fn apply_team_counts(&self, counts: &[TeamCounts]) -> Result<u64, AppError>;

    async fn settings(&self) -> Result<Setting, AppError>;

    async fn save_settings(&self, setting: Setting) -> Result<(), AppError>;

    // Read side.

    async fn search_users(
        &self,
        filter: &UserFilter,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<User>, i64), AppError>;

    async fn slots_for_user(&self, user_id: i64) -> Result<Vec<Slot>, AppError>;

    async fn transactions_for_user(&self, user_id: i64, limit: i64) -> Result<Vec<Transaction>, AppError>;

    async fn direct_referrals_of(&self, referrers: &[i64]) -> Result<Vec<User>, AppError>;

    async fn count_users(&self, since: Option<NaiveDateTime>) -> Result<i64, AppError>;

    async fn order_price_sum(&self, since: Option<NaiveDateTime>) -> Result<String, AppError>;
}
