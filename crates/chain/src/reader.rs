//! Typed, stateless view of the two contracts.

use async_trait::async_trait;
use matrixsync_core::AppError;

use crate::decoder::{EventKind, NormalizedEvent};

/// A registrant as recorded by the registration contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainUser {
    pub user_id: u64,
    pub wallet: String,
    /// `None` for the root user (referrer id zero on chain).
    pub referrer_id: Option<u64>,
    pub referrer_address: Option<String>,
    pub registration_time: u64,
    pub full_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferralStats {
    pub total_referrals: u64,
    pub active_referrals: u64,
    pub total_matrix_entries: u64,
    pub active_matrix_positions: u64,
    pub total_recycles: u64,
}

/// Result of `getCurrentSlotInfo`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotInfo {
    pub current_active_slot: u32,
    pub current_position: String,
    pub entry_time: String,
    pub matrix_size: String,
    pub recycle_count: String,
    pub time_in_position: String,
}

/// Cumulative income totals in the token's smallest unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncomeStats {
    pub total: String,
    pub level_income: String,
    pub direct_income: String,
    pub slot_income: String,
    pub recycle_income: String,
    pub salary_income: String,
}

/// Result of `getLevelReferralDetails` for one (user, level).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LevelDetails {
    pub referral_count: String,
    pub recycle_count: String,
    pub slot_transactions: String,
    pub is_upgraded: bool,
    pub is_active: bool,
}

/// Read access to chain state and history.
///
/// Implementations bound every call in time; errors are always
/// [`AppError::Rpc`], [`AppError::RpcTimeout`] or [`AppError::Decode`].
#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn block_number(&self) -> Result<u64, AppError>;

    async fn total_users(&self) -> Result<u64, AppError>;

    /// `None` when the id has not been assigned.
    async fn user_by_id(&self, user_id: u64) -> Result<Option<ChainUser>, AppError>;

    /// `None` when the wallet never registered.
    async fn user_by_address(&self, wallet: &str) -> Result<Option<ChainUser>, AppError>;

    async fn referral_stats(&self, wallet: &str) -> Result<ReferralStats, AppError>;

    async fn current_slot(&self, wallet: &str) -> Result<SlotInfo, AppError>;

    async fn income_stats(&self, wallet: &str) -> Result<IncomeStats, AppError>;

    async fn level_referral_details(&self, wallet: &str, level: u32) -> Result<LevelDetails, AppError>;

    async fn registration_paused(&self) -> Result<bool, AppError>;

    async fn purchasing_paused(&self) -> Result<bool, AppError>;

    /// Historical events of the given kinds in `[from_block, to_block]`,
    /// normalized and sorted by chain position. Undecodable logs are skipped.
    async fn fetch_events(
        &self,
        kinds: &[EventKind],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<NormalizedEvent>, AppError>;
}

/// Split `[from, to]` into inclusive chunks of at most `chunk` blocks.
pub fn block_chunks(from: u64, to: u64, chunk: u64) -> Vec<(u64, u64)> {
    let chunk = chunk.max(1);
    let mut ranges = Vec::new();
    let mut start = from;
    while start <= to {
        let end = start.saturating_add(chunk - 1).min(to);
        ranges.push((start, end));
        if end == u64::MAX {
            break;
        }
        start = end + 1;
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_cover_range_exactly() {
        assert_eq!(block_chunks(0, 9, 4), vec![(0, 3), (4, 7), (8, 9)]);
        assert_eq!(block_chunks(5, 5, 100), vec![(5, 5)]);
        assert!(block_chunks(10, 9, 4).is_empty());
    }

    #[test]
    fn zero_chunk_size_degrades_to_single_blocks() {
        assert_eq!(block_chunks(1, 3, 0), vec![(1, 1), (2, 2), (3, 3)]);
    }
}
