use async_trait::async_trait;
use chrono::NaiveDateTime;
use matrixsync_core::AppError;
use sqlx::PgPool;

use crate::models::*;
use crate::repos::{self, UserInsert};
use crate::store::AggregateStore;

/// [`AggregateStore`] over PostgreSQL.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub(crate) fn db_err(e: sqlx::Error) -> AppError {
    AppError::Database(e.to_string())
}

#[async_trait]
impl AggregateStore for PgStore {
    async fn user_by_id(&self, user_id: i64) -> Result<Option<User>, AppError> {
        repos::get_user(&self.pool, user_id).await.map_err(db_err)
    }

    async fn user_by_address(&self, wallet: &str) -> Result<Option<User>, AppError> {
        repos::get_user_by_address(&self.pool, &wallet.to_lowercase())
            .await
            .map_err(db_err)
    }

    async fn register_user(&self, user: &NewUser, ancestors: &[i64]) -> Result<bool, AppError> {
        match repos::register_user(&self.pool, user, ancestors)
            .await
            .map_err(db_err)?
        {
            UserInsert::Inserted => Ok(true),
            UserInsert::AlreadyPresent => Ok(false),
            UserInsert::DanglingReferrer => Err(AppError::DanglingReference {
                user_id: user.user_id,
                referenced: user.referred_by.map(|id| id.to_string()).unwrap_or_default(),
            }),
            UserInsert::DuplicateRoot => Err(AppError::DanglingReference {
                user_id: user.user_id,
                referenced: "root".into(),
            }),
        }
    }

    async fn increment_counters(&self, user_id: i64, deltas: &[(Counter, i64)]) -> Result<(), AppError> {
        let found = repos::increment_counters(&self.pool, user_id, deltas)
            .await
            .map_err(db_err)?;
        if !found {
            tracing::warn!(user_id, "Counter increment for missing user");
        }
        Ok(())
    }

    async fn upsert_order(&self, order: &NewOrder) -> Result<bool, AppError> {
        repos::upsert_order(&self.pool, order).await.map_err(db_err)
    }

    async fn record_reward(
        &self,
        reward: &NewTransaction,
        bucket: IncomeBucket,
    ) -> Result<RewardOutcome, AppError> {
        repos::record_reward(&self.pool, reward, bucket)
            .await
            .map_err(db_err)
    }

    async fn set_current_active_slot(&self, user_id: i64, slot: i32) -> Result<(), AppError> {
        repos::set_current_active_slot(&self.pool, user_id, slot)
            .await
            .map_err(db_err)
    }

    async fn set_income(&self, user_id: i64, income: &Income) -> Result<(), AppError> {
        repos::set_income(&self.pool, user_id, income)
            .await
            .map_err(db_err)
    }

    async fn upsert_slot(&self, slot: &SlotSnapshot) -> Result<(), AppError> {
        repos::upsert_slot(&self.pool, slot).await.map_err(db_err)
    }

    async fn reset_daily_counters(&self) -> Result<u64, AppError> {
        repos::reset_daily_counters(&self.pool).await.map_err(db_err)
    }

    async fn existing_user_ids(&self, from: i64, to: i64) -> Result<Vec<i64>, AppError> {
        repos::existing_user_ids(&self.pool, from, to)
            .await
            .map_err(db_err)
    }

    async fn referral_edges(&self) -> Result<Vec<(i64, Option<i64>)>, AppError> {
        repos::referral_edges(&self.pool).await.map_err(db_err)
    }

    async fn apply_team_counts(&self, counts: &[TeamCounts]) -> Result<u64, AppError> {
        repos::apply_team_counts(&self.pool, counts)
            .await
            .map_err(db_err)
    }

    async fn settings(&self) -> Result<Setting, AppError> {
        repos::get_settings(&self.pool).await.map_err(db_err)
    }

    async fn save_settings(&self, setting: Setting) -> Result<(), AppError> {
        repos::save_settings(&self.pool, setting).await.map_err(db_err)
    }

    async fn search_users(
        &self,
        filter: &UserFilter,
        offset: i64,
        limit: i64,
    ) -> Result<(Vec<User>, i64), AppError> {
        repos::search_users(&self.pool, filter, offset, limit)
            .await
            .map_err(db_err)
    }

    async fn slots_for_user(&self, user_id: i64) -> Result<Vec<Slot>, AppError> {
        repos::slots_for_user(&self.pool, user_id)
            .await
            .map_err(db_err)
    }

    async fn transactions_for_user(&self, user_id: i64, limit: i64) -> Result<Vec<Transaction>, AppError> {
        repos::transactions_for_user(&self.pool, user_id, limit)
            .await
            .map_err(db_err)
    }

    async fn direct_referrals_of(&self, referrers: &[i64]) -> Result<Vec<User>, AppError> {
        repos::direct_referrals_of(&self.pool, referrers)
            .await
            .map_err(db_err)
    }

    async fn count_users(&self, since: Option<NaiveDateTime>) -> Result<i64, AppError> {
        repos::count_users(&self.pool, since).await.map_err(db_err)
    }

    async fn order_price_sum(&self, since: Option<NaiveDateTime>) -> Result<String, AppError> {
        repos::order_price_sum(&self.pool, since)
            .await
            .map_err(db_err)
    }
}
