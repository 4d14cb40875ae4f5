use alloy::primitives::{Address, U256};
use alloy::providers::Provider;
use alloy::rpc::types::Filter;
use async_trait::async_trait;
use matrixsync_core::{AppError, Settings};

use crate::abi::{MatrixPro, Registration};
use crate::decoder::{EventKind, NormalizedEvent, SourceContract, format_address, normalize_batch};
use crate::provider::{ChainProvider, parse_address};
use crate::reader::{
    ChainReader, ChainUser, IncomeStats, LevelDetails, ReferralStats, SlotInfo, block_chunks,
};
use crate::retry::{RetryPolicy, with_retry};

/// [`ChainReader`] over a JSON-RPC provider.
#[derive(Clone)]
pub struct RpcChainReader {
    provider: ChainProvider,
    registration: Address,
    matrix: Address,
    policy: RetryPolicy,
    log_chunk_blocks: u64,
}

impl RpcChainReader {
    pub fn new(
        provider: ChainProvider,
        registration: Address,
        matrix: Address,
        policy: RetryPolicy,
        log_chunk_blocks: u64,
    ) -> Self {
        Self {
            provider,
            registration,
            matrix,
            policy,
            log_chunk_blocks,
        }
    }

    pub fn from_settings(provider: ChainProvider, settings: &Settings) -> Result<Self, AppError> {
        Ok(Self::new(
            provider,
            parse_address(&settings.registration_contract)?,
            parse_address(&settings.matrix_contract)?,
            RetryPolicy::new(settings.rpc_timeout(), settings.rpc_max_retries),
            settings.log_chunk_blocks,
        ))
    }

    pub fn registration_address(&self) -> Address {
        self.registration
    }

    pub fn matrix_address(&self) -> Address {
        self.matrix
    }

    fn registration(&self) -> Registration::RegistrationInstance<ChainProvider> {
        Registration::new(self.registration, self.provider.clone())
    }

    fn matrix(&self) -> MatrixPro::MatrixProInstance<ChainProvider> {
        MatrixPro::new(self.matrix, self.provider.clone())
    }

    /// Log filter for the given kinds over one block range.
    pub fn filter_for(&self, kinds: &[EventKind], from_block: u64, to_block: u64) -> Filter {
        let mut addresses = Vec::new();
        if kinds.iter().any(|k| k.source() == SourceContract::Registration) {
            addresses.push(self.registration);
        }
        if kinds.iter().any(|k| k.source() == SourceContract::Matrix) {
            addresses.push(self.matrix);
        }
        let signatures: Vec<_> = kinds.iter().map(|k| k.signature_hash()).collect();

        Filter::new()
            .address(addresses)
            .event_signature(signatures)
            .from_block(from_block)
            .to_block(to_block)
    }
}

fn wallet(raw: &str) -> Result<Address, AppError> {
    raw.parse()
        .map_err(|e| AppError::Decode(format!("invalid wallet {raw}: {e}")))
}

fn to_u64(value: U256, field: &str) -> Result<u64, AppError> {
    u64::try_from(value).map_err(|_| AppError::Decode(format!("{field}={value} exceeds u64")))
}

fn optional_id(value: U256, field: &str) -> Result<Option<u64>, AppError> {
    let id = to_u64(value, field)?;
    Ok((id != 0).then_some(id))
}

fn optional_address(address: Address) -> Option<String> {
    (address != Address::ZERO).then(|| format_address(&address))
}

#[async_trait]
impl ChainReader for RpcChainReader {
    async fn block_number(&self) -> Result<u64, AppError> {
        let provider = &self.provider;
        with_retry(&self.policy, "eth_blockNumber", || async move {
            provider.get_block_number().await
        })
        .await
    }

    async fn total_users(&self) -> Result<u64, AppError> {
        let contract = &self.registration();
        let total = with_retry(&self.policy, "totalUsers", || async move {
            contract.totalUsers().call().await
        })
        .await?;
        to_u64(total, "totalUsers")
    }

    async fn user_by_id(&self, user_id: u64) -> Result<Option<ChainUser>, AppError> {
        let contract = &self.registration();
        let user = with_retry(&self.policy, "getUserByUserId", || async move {
            contract.getUserByUserId(U256::from(user_id)).call().await
        })
        .await?;

        if user.userAddress == Address::ZERO {
            return Ok(None);
        }
        Ok(Some(ChainUser {
            user_id,
            wallet: format_address(&user.userAddress),
            referrer_id: optional_id(user.referrerId, "referrerId")?,
            referrer_address: optional_address(user.referrerAddress),
            registration_time: to_u64(user.registrationTime, "registrationTime")?,
            full_name: user.fullName,
        }))
    }

    async fn user_by_address(&self, wallet_address: &str) -> Result<Option<ChainUser>, AppError> {
        let address = wallet(wallet_address)?;
        let contract = &self.registration();
        let info = with_retry(&self.policy, "getUserInfo", || async move {
            contract.getUserInfo(address).call().await
        })
        .await?;

        let Some(user_id) = optional_id(info.userId, "userId")? else {
            return Ok(None);
        };
        Ok(Some(ChainUser {
            user_id,
            wallet: format_address(&address),
            referrer_id: optional_id(info.referrerId, "referrerId")?,
            referrer_address: optional_address(info.referrerAddress),
            registration_time: to_u64(info.registrationTime, "registrationTime")?,
            full_name: info.fullName,
        }))
    }

    async fn referral_stats(&self, wallet_address: &str) -> Result<ReferralStats, AppError> {
        let address = wallet(wallet_address)?;
        let contract = &self.matrix();
        let stats = with_retry(&self.policy, "getUserReferralStats", || async move {
            contract.getUserReferralStats(address).call().await
        })
        .await?;

        Ok(ReferralStats {
            total_referrals: to_u64(stats.totalReferrals, "totalReferrals")?,
            active_referrals: to_u64(stats.activeReferrals, "activeReferrals")?,
            total_matrix_entries: to_u64(stats.totalMatrixEntries, "totalMatrixEntries")?,
            active_matrix_positions: to_u64(stats.activeMatrixPositions, "activeMatrixPositions")?,
            total_recycles: to_u64(stats.totalRecycles, "totalRecycles")?,
        })
    }

    async fn current_slot(&self, wallet_address: &str) -> Result<SlotInfo, AppError> {
        let address = wallet(wallet_address)?;
        let contract = &self.matrix();
        let info = with_retry(&self.policy, "getCurrentSlotInfo", || async move {
            contract.getCurrentSlotInfo(address).call().await
        })
        .await?;

        let slot = u32::try_from(info.currentActiveSlot).map_err(|_| {
            AppError::Decode(format!("currentActiveSlot={} exceeds u32", info.currentActiveSlot))
        })?;
        Ok(SlotInfo {
            current_active_slot: slot,
            current_position: info.currentPosition.to_string(),
            entry_time: info.entryTime.to_string(),
            matrix_size: info.matrixSize.to_string(),
            recycle_count: info.recycleCount.to_string(),
            time_in_position: info.timeInPosition.to_string(),
        })
    }

    async fn income_stats(&self, wallet_address: &str) -> Result<IncomeStats, AppError> {
        let address = wallet(wallet_address)?;
        let contract = &self.matrix();
        let income = with_retry(&self.policy, "getUserIncomeStats", || async move {
            contract.getUserIncomeStats(address).call().await
        })
        .await?;

        Ok(IncomeStats {
            total: income.total.to_string(),
            level_income: income.levelIncome.to_string(),
            direct_income: income.directIncome.to_string(),
            slot_income: income.slotIncome.to_string(),
            recycle_income: income.recycleIncome.to_string(),
            salary_income: income.salaryIncome.to_string(),
        })
    }

    async fn level_referral_details(
        &self,
        wallet_address: &str,
        level: u32,
    ) -> Result<LevelDetails, AppError> {
        let address = wallet(wallet_address)?;
        let contract = &self.matrix();
        let details = with_retry(&self.policy, "getLevelReferralDetails", || async move {
            contract
                .getLevelReferralDetails(address, U256::from(level))
                .call()
                .await
        })
        .await?;

        Ok(LevelDetails {
            referral_count: details.referralCount.to_string(),
            recycle_count: details.recycleCount.to_string(),
            slot_transactions: details.slotTransactions.to_string(),
            is_upgraded: details.isUpgraded,
            is_active: details.isActive,
        })
    }

    async fn registration_paused(&self) -> Result<bool, AppError> {
        let contract = &self.registration();
        with_retry(&self.policy, "Registration.paused", || async move {
            contract.paused().call().await
        })
        .await
    }

    async fn purchasing_paused(&self) -> Result<bool, AppError> {
        let contract = &self.matrix();
        with_retry(&self.policy, "MatrixPro.paused", || async move {
            contract.paused().call().await
        })
        .await
    }

    async fn fetch_events(
        &self,
        kinds: &[EventKind],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<NormalizedEvent>, AppError> {
        if kinds.is_empty() {
            return Ok(Vec::new());
        }

        let mut logs = Vec::new();
        for (from, to) in block_chunks(from_block, to_block, self.log_chunk_blocks) {
            let filter = &self.filter_for(kinds, from, to);
            let provider = &self.provider;
            let chunk = with_retry(&self.policy, "eth_getLogs", || async move {
                provider.get_logs(filter).await
            })
            .await?;
            tracing::debug!(from, to, count = chunk.len(), "Fetched logs");
            logs.extend(chunk);
        }

        Ok(normalize_batch(&logs))
    }
}
