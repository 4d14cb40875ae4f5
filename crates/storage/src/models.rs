use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ─── User ───────────────────────────────────────────────────────────────────

/// Cumulative income as last read from the matrix contract (smallest unit).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Income {
    #[sqlx(rename = "income_total")]
    pub total: String,
    #[sqlx(rename = "income_level")]
    pub level_income: String,
    #[sqlx(rename = "income_direct")]
    pub direct_income: String,
    #[sqlx(rename = "income_slot")]
    pub slot_income: String,
    #[sqlx(rename = "income_recycle")]
    pub recycle_income: String,
    #[sqlx(rename = "income_salary")]
    pub salary_income: String,
}

impl Income {
    pub fn zero() -> Self {
        Self {
            total: "0".into(),
            level_income: "0".into(),
            direct_income: "0".into(),
            slot_income: "0".into(),
            recycle_income: "0".into(),
            salary_income: "0".into(),
        }
    }
}

/// One on-chain registrant with its denormalized aggregates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub user_id: i64,
    pub wallet_address: String,
    pub full_name: String,
    pub referred_by: Option<i64>,
    pub referrer_address: Option<String>,
    pub is_owner: bool,
    pub registration_time: i64,

    pub total_partners: i64,
    pub total_team: i64,
    pub daily_partners: i64,
    pub daily_team: i64,
    pub daily_active_partners: i64,

    pub current_active_slot: i32,
    pub is_active: bool,

    #[sqlx(flatten)]
    pub income: Income,
    pub daily_direct_income: String,
    pub daily_level_income: String,
    pub daily_total_income: String,

    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Insert-ready user, built from a `UserRegistered` event or a chain lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub user_id: i64,
    pub wallet_address: String,
    pub full_name: String,
    /// `None` only for the root/owner.
    pub referred_by: Option<i64>,
    pub referrer_address: Option<String>,
    pub registration_time: i64,
}

/// Counter columns that may be incremented atomically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    TotalPartners,
    TotalTeam,
    DailyPartners,
    DailyTeam,
    DailyActivePartners,
}

impl Counter {
    pub fn column(self) -> &'static str {
        match self {
            Counter::TotalPartners => "total_partners",
            Counter::TotalTeam => "total_team",
            Counter::DailyPartners => "daily_partners",
            Counter::DailyTeam => "daily_team",
            Counter::DailyActivePartners => "daily_active_partners",
        }
    }
}

/// Daily income column a reward is credited to (besides the daily total).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomeBucket {
    Direct,
    Level,
    /// Counted in the daily total only.
    Other,
}

impl IncomeBucket {
    pub fn as_str(self) -> &'static str {
        match self {
            IncomeBucket::Direct => "direct",
            IncomeBucket::Level => "level",
            IncomeBucket::Other => "other",
        }
    }
}

/// Exact team counts produced by a full hierarchy recompute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeamCounts {
    pub user_id: i64,
    pub total_partners: i64,
    pub total_team: i64,
}

// ─── Order ──────────────────────────────────────────────────────────────────

/// One slot purchase; at most one per (user, level).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: i64,
    pub user_id: i64,
    pub user_address: String,
    pub level: i32,
    pub price: String,
    pub transaction_hash: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrder {
    pub user_id: i64,
    pub user_address: String,
    pub level: i32,
    pub price: String,
    pub transaction_hash: Option<String>,
}

// ─── Transaction ────────────────────────────────────────────────────────────

/// An income distribution between two users. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: i64,
    pub receiver_id: i64,
    pub receiver: String,
    pub from_id: i64,
    pub from_address: String,
    pub amount: String,
    pub level: i32,
    pub income_type: String,
    pub transaction_hash: Option<String>,
    pub created_at: NaiveDateTime,
}

/// Insert-ready transaction. Idempotency key: (receiver_id, from_id, amount, level).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransaction {
    pub receiver_id: i64,
    pub receiver: String,
    pub from_id: i64,
    pub from_address: String,
    pub amount: String,
    pub level: i32,
    pub income_type: String,
    pub transaction_hash: Option<String>,
}

impl NewTransaction {
    pub fn key(&self) -> (i64, i64, &str, i32) {
        (self.receiver_id, self.from_id, &self.amount, self.level)
    }
}

/// What recording a reward changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewardOutcome {
    /// The transaction row was new and the daily income was credited.
    pub first_seen: bool,
    /// The receiver flipped from inactive to active.
    pub activated: bool,
}

// ─── Slot ───────────────────────────────────────────────────────────────────

/// Cached `getLevelReferralDetails` for one (user, level). Fully overwritable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    pub user_id: i64,
    pub wallet_address: String,
    pub level: i32,
    pub referral_count: String,
    pub recycle_count: String,
    pub slot_transactions: String,
    pub is_upgraded: bool,
    pub is_active: bool,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub user_id: i64,
    pub wallet_address: String,
    pub level: i32,
    pub referral_count: String,
    pub recycle_count: String,
    pub slot_transactions: String,
    pub is_upgraded: bool,
    pub is_active: bool,
}

// ─── Setting ────────────────────────────────────────────────────────────────

/// Process-wide toggles mirrored from the contracts' pause flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Setting {
    pub registration: bool,
    pub slot_purchase: bool,
}

impl Default for Setting {
    fn default() -> Self {
        Self {
            registration: true,
            slot_purchase: true,
        }
    }
}

// ─── Query inputs ───────────────────────────────────────────────────────────

/// Case-insensitive partial-match filter; every given field must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserFilter {
    pub wallet_address: Option<String>,
    pub full_name: Option<String>,
}

impl UserFilter {
    pub fn is_empty(&self) -> bool {
        self.wallet_address.is_none() && self.full_name.is_none()
    }
}
