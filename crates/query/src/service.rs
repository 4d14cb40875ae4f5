use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use matrixsync_core::AppError;
use matrixsync_storage::AggregateStore;
use matrixsync_storage::models::{Slot, Transaction, User, UserFilter};
use serde::Serialize;

use crate::cache::TtlCache;
use crate::clock::{Clock, SystemClock};
use crate::units::wei_to_display;

pub const DEFAULT_PAGE_SIZE: i64 = 30;
pub const MAX_PAGE_SIZE: i64 = 100;
pub const MAX_GENERATIONS: usize = 10;
const DASHBOARD_TRANSACTIONS: i64 = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPage {
    pub users: Vec<User>,
    pub current_page: i64,
    pub total_pages: i64,
    pub total_users: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dashboard {
    pub user: User,
    pub slots: Vec<Slot>,
    pub transactions: Vec<Transaction>,
}

/// One generation below a user: everyone exactly `level` referral hops down.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationLevel {
    pub level: usize,
    pub count: usize,
    pub active: usize,
    pub inactive: usize,
    pub users: Vec<User>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HomeStats {
    pub total_users: i64,
    pub daily_users: i64,
    /// Sum of all slot purchase prices, two decimals.
    pub total_income: String,
    pub daily_income: String,
}

/// Read-only queries over the aggregate store.
pub struct QueryService {
    store: Arc<dyn AggregateStore>,
    home_stats: TtlCache<HomeStats>,
    clock: Arc<dyn Clock>,
}

impl QueryService {
    pub fn new(store: Arc<dyn AggregateStore>, home_stats_ttl: Duration) -> Self {
        Self::with_clock(store, home_stats_ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn AggregateStore>, home_stats_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            home_stats: TtlCache::new(home_stats_ttl, clock.clone()),
            clock,
        }
    }

    /// Page through users matching every given partial, case-insensitive
    /// filter. Pages start at 1.
    pub async fn list_users(
        &self,
        wallet_address: Option<String>,
        full_name: Option<String>,
        page: Option<i64>,
        limit: Option<i64>,
    ) -> Result<UserPage, AppError> {
        let page = page.unwrap_or(1).max(1);
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let filter = UserFilter {
            wallet_address: wallet_address.filter(|s| !s.trim().is_empty()),
            full_name: full_name.filter(|s| !s.trim().is_empty()),
        };

        let offset = (page - 1).saturating_mul(limit);
        let (users, total_users) = self.store.search_users(&filter, offset, limit).await?;
        Ok(UserPage {
            users,
            current_page: page,
            total_pages: (total_users + limit - 1) / limit,
            total_users,
        })
    }

    /// A user with their slots and received transactions, newest first.
    pub async fn user_dashboard(&self, user_id: i64) -> Result<Option<Dashboard>, AppError> {
        let Some(user) = self.store.user_by_id(user_id).await? else {
            return Ok(None);
        };
        let slots = self.store.slots_for_user(user_id).await?;
        let transactions = self
            .store
            .transactions_for_user(user_id, DASHBOARD_TRANSACTIONS)
            .await?;
        Ok(Some(Dashboard {
            user,
            slots,
            transactions,
        }))
    }

    /// Up to ten generations of descendants below `user_id`.
    ///
    /// Walks breadth-first and never revisits a user, so cyclic referral
    /// data ends the walk instead of looping. Stops early at the first empty
    /// generation.
    pub async fn generation_levels(&self, user_id: i64) -> Result<Vec<GenerationLevel>, AppError> {
        let mut visited = HashSet::from([user_id]);
        let mut frontier = vec![user_id];
        let mut levels = Vec::new();

        for level in 1..=MAX_GENERATIONS {
            let mut users: Vec<User> = self
                .store
                .direct_referrals_of(&frontier)
                .await?
                .into_iter()
                .filter(|u| visited.insert(u.user_id))
                .collect();
            if users.is_empty() {
                break;
            }
            users.sort_by_key(|u| u.user_id);

            let active = users.iter().filter(|u| u.is_active).count();
            frontier = users.iter().map(|u| u.user_id).collect();
            levels.push(GenerationLevel {
                level,
                count: users.len(),
                active,
                inactive: users.len() - active,
                users,
            });
        }
        Ok(levels)
    }

    /// Registration and income totals, overall and since the start of the
    /// current UTC day. Served from cache unless `refresh` is set or the
    /// cached value has expired.
    pub async fn home_stats(&self, refresh: bool) -> Result<HomeStats, AppError> {
        if !refresh {
            if let Some(stats) = self.home_stats.get().await {
                tracing::debug!("Serving cached home stats");
                return Ok(stats);
            }
        }

        let since = start_of_day(self.clock.now());
        let stats = HomeStats {
            total_users: self.store.count_users(None).await?,
            daily_users: self.store.count_users(Some(since)).await?,
            total_income: wei_to_display(&self.store.order_price_sum(None).await?)?,
            daily_income: wei_to_display(&self.store.order_price_sum(Some(since)).await?)?,
        };
        self.home_stats.put(stats.clone()).await;
        Ok(stats)
    }

    pub async fn invalidate_home_stats(&self) {
        self.home_stats.invalidate().await;
        tracing::info!("Home stats cache cleared");
    }
}

fn start_of_day(now: DateTime<Utc>) -> chrono::NaiveDateTime {
    now.date_naive().and_time(chrono::NaiveTime::MIN)
}
