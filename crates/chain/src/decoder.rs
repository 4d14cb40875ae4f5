//! Event normalizer: raw chain logs in, canonical [`NormalizedEvent`]s out.
//!
//! Every wide integer leaves this module either as a checked `u64`/`u32` or as
//! a decimal string. Addresses leave it as lower-case `0x` hex.

use std::fmt;

use alloy::primitives::{Address, B256, U256};
use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;
use matrixsync_core::AppError;

use crate::abi::{MatrixPro, Registration};

/// Tracked event signatures, grouped by the contract that emits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    UserRegistered,
    SlotPurchased,
    RewardDistributed,
    MatrixComplete,
    Recycled,
    SlotPositionUpdated,
    SlotsInitialized,
    EmergencyWithdrawn,
}

/// Which contract emits an event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceContract {
    Registration,
    Matrix,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::UserRegistered,
        EventKind::SlotPurchased,
        EventKind::RewardDistributed,
        EventKind::MatrixComplete,
        EventKind::Recycled,
        EventKind::SlotPositionUpdated,
        EventKind::SlotsInitialized,
        EventKind::EmergencyWithdrawn,
    ];

    pub fn signature_hash(self) -> B256 {
        match self {
            EventKind::UserRegistered => Registration::UserRegistered::SIGNATURE_HASH,
            EventKind::SlotPurchased => MatrixPro::SlotPurchased::SIGNATURE_HASH,
            EventKind::RewardDistributed => MatrixPro::RewardDistributed::SIGNATURE_HASH,
            EventKind::MatrixComplete => MatrixPro::MatrixComplete::SIGNATURE_HASH,
            EventKind::Recycled => MatrixPro::Recycled::SIGNATURE_HASH,
            EventKind::SlotPositionUpdated => MatrixPro::SlotPositionUpdated::SIGNATURE_HASH,
            EventKind::SlotsInitialized => MatrixPro::SlotsInitialized::SIGNATURE_HASH,
            EventKind::EmergencyWithdrawn => MatrixPro::EmergencyWithdrawn::SIGNATURE_HASH,
        }
    }

    pub fn source(self) -> SourceContract {
        match self {
            EventKind::UserRegistered => SourceContract::Registration,
            _ => SourceContract::Matrix,
        }
    }

    pub fn from_signature(hash: &B256) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.signature_hash() == *hash)
    }

    pub fn name(self) -> &'static str {
        match self {
            EventKind::UserRegistered => "UserRegistered",
            EventKind::SlotPurchased => "SlotPurchased",
            EventKind::RewardDistributed => "RewardDistributed",
            EventKind::MatrixComplete => "MatrixComplete",
            EventKind::Recycled => "Recycled",
            EventKind::SlotPositionUpdated => "SlotPositionUpdated",
            EventKind::SlotsInitialized => "SlotsInitialized",
            EventKind::EmergencyWithdrawn => "EmergencyWithdrawn",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Category of a distributed reward, as named by the matrix contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IncomeType {
    Direct,
    Level,
    Slot,
    Recycle,
    Salary,
    Other(String),
}

impl IncomeType {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let lower = trimmed.to_ascii_lowercase();
        match lower.strip_suffix("income").unwrap_or(&lower).trim_end_matches(['_', ' ', '-']) {
            "direct" => IncomeType::Direct,
            "level" => IncomeType::Level,
            "slot" => IncomeType::Slot,
            "recycle" => IncomeType::Recycle,
            "salary" => IncomeType::Salary,
            _ => IncomeType::Other(trimmed.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            IncomeType::Direct => "direct",
            IncomeType::Level => "level",
            IncomeType::Slot => "slot",
            IncomeType::Recycle => "recycle",
            IncomeType::Salary => "salary",
            IncomeType::Other(raw) => raw,
        }
    }
}

/// Canonical payload of a tracked event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    UserRegistered {
        user: String,
        user_id: u64,
        registration_time: u64,
        referrer: String,
    },
    SlotPurchased {
        user: String,
        level: u32,
        price: String,
    },
    RewardDistributed {
        receiver: String,
        from: String,
        amount: String,
        level: u32,
        income_type: IncomeType,
    },
    MatrixComplete {
        user: String,
        level: u32,
    },
    Recycled {
        user: String,
        level: u32,
        recycle_count: String,
    },
    SlotPositionUpdated {
        user: String,
        level: u32,
        position: String,
        entry_time: String,
    },
    SlotsInitialized {
        user: String,
    },
    EmergencyWithdrawn {
        token: String,
        amount: String,
    },
}

impl ChainEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ChainEvent::UserRegistered { .. } => EventKind::UserRegistered,
            ChainEvent::SlotPurchased { .. } => EventKind::SlotPurchased,
            ChainEvent::RewardDistributed { .. } => EventKind::RewardDistributed,
            ChainEvent::MatrixComplete { .. } => EventKind::MatrixComplete,
            ChainEvent::Recycled { .. } => EventKind::Recycled,
            ChainEvent::SlotPositionUpdated { .. } => EventKind::SlotPositionUpdated,
            ChainEvent::SlotsInitialized { .. } => EventKind::SlotsInitialized,
            ChainEvent::EmergencyWithdrawn { .. } => EventKind::EmergencyWithdrawn,
        }
    }

    /// Wallet whose events must be applied in block order.
    ///
    /// Rewards are keyed on the receiver: its daily counters and activation
    /// are the state a reward mutates.
    pub fn ordering_key(&self) -> &str {
        match self {
            ChainEvent::UserRegistered { user, .. }
            | ChainEvent::SlotPurchased { user, .. }
            | ChainEvent::MatrixComplete { user, .. }
            | ChainEvent::Recycled { user, .. }
            | ChainEvent::SlotPositionUpdated { user, .. }
            | ChainEvent::SlotsInitialized { user } => user,
            ChainEvent::RewardDistributed { receiver, .. } => receiver,
            ChainEvent::EmergencyWithdrawn { token, .. } => token,
        }
    }
}

/// A decoded log plus its position on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedEvent {
    pub block_number: u64,
    pub log_index: u64,
    pub transaction_hash: Option<String>,
    pub event: ChainEvent,
}

impl NormalizedEvent {
    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }

    /// Chain position used to sort batches before they are applied.
    pub fn position(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }
}

/// Format an address the way it is stored: lower-case, `0x`-prefixed.
pub fn format_address(address: &Address) -> String {
    format!("{address:#x}")
}

/// Lower-case an externally supplied address string for lookups.
pub fn normalize_address(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

fn checked_u64(value: U256, field: &str) -> Result<u64, AppError> {
    u64::try_from(value).map_err(|_| AppError::Decode(format!("{field}={value} exceeds u64")))
}

fn checked_u32(value: U256, field: &str) -> Result<u32, AppError> {
    u32::try_from(value).map_err(|_| AppError::Decode(format!("{field}={value} exceeds u32")))
}

fn decode<E: SolEvent>(log: &Log) -> Result<E, AppError> {
    log.log_decode::<E>()
        .map(|decoded| decoded.inner.data)
        .map_err(|e| AppError::Decode(format!("{}: {e}", E::SIGNATURE)))
}

/// Convert one raw log into a [`NormalizedEvent`].
///
/// Fails with [`AppError::Decode`] when the log is not a tracked event, when
/// its topics do not fit the event signature, or when it was removed by a
/// reorg. Callers skip such logs.
pub fn normalize(log: &Log) -> Result<NormalizedEvent, AppError> {
    if log.removed {
        return Err(AppError::Decode("log was removed by a reorg".into()));
    }
    let block_number = log
        .block_number
        .ok_or_else(|| AppError::Decode("log has no block number".into()))?;
    let log_index = log.log_index.unwrap_or_default();
    let transaction_hash = log.transaction_hash.map(|h| format!("{h:#x}"));

    let topic0 = log
        .topic0()
        .ok_or_else(|| AppError::Decode("log has no topics".into()))?;
    let kind = EventKind::from_signature(topic0)
        .ok_or_else(|| AppError::Decode(format!("untracked event signature {topic0:#x}")))?;

    let event = match kind {
        EventKind::UserRegistered => {
            let d = decode::<Registration::UserRegistered>(log)?;
            ChainEvent::UserRegistered {
                user: format_address(&d.user),
                user_id: checked_u64(d.userId, "userId")?,
                registration_time: checked_u64(d.registrationTime, "registrationTime")?,
                referrer: format_address(&d.referrer),
            }
        }
        EventKind::SlotPurchased => {
            let d = decode::<MatrixPro::SlotPurchased>(log)?;
            ChainEvent::SlotPurchased {
                user: format_address(&d.user),
                level: checked_u32(d.level, "level")?,
                price: d.price.to_string(),
            }
        }
        EventKind::RewardDistributed => {
            let d = decode::<MatrixPro::RewardDistributed>(log)?;
            ChainEvent::RewardDistributed {
                receiver: format_address(&d.user),
                from: format_address(&d.from),
                amount: d.amount.to_string(),
                level: checked_u32(d.level, "level")?,
                income_type: IncomeType::parse(&d.incomeType),
            }
        }
        EventKind::MatrixComplete => {
            let d = decode::<MatrixPro::MatrixComplete>(log)?;
            ChainEvent::MatrixComplete {
                user: format_address(&d.user),
                level: checked_u32(d.level, "level")?,
            }
        }
        EventKind::Recycled => {
            let d = decode::<MatrixPro::Recycled>(log)?;
            ChainEvent::Recycled {
                user: format_address(&d.user),
                level: checked_u32(d.level, "level")?,
                recycle_count: d.recycleCount.to_string(),
            }
        }
        EventKind::SlotPositionUpdated => {
            let d = decode::<MatrixPro::SlotPositionUpdated>(log)?;
            ChainEvent::SlotPositionUpdated {
                user: format_address(&d.user),
                level: checked_u32(d.level, "level")?,
                position: d.position.to_string(),
                entry_time: d.entryTime.to_string(),
            }
        }
        EventKind::SlotsInitialized => {
            let d = decode::<MatrixPro::SlotsInitialized>(log)?;
            ChainEvent::SlotsInitialized {
                user: format_address(&d.user),
            }
        }
        EventKind::EmergencyWithdrawn => {
            let d = decode::<MatrixPro::EmergencyWithdrawn>(log)?;
            ChainEvent::EmergencyWithdrawn {
                token: format_address(&d.token),
                amount: d.amount.to_string(),
            }
        }
    };

    Ok(NormalizedEvent {
        block_number,
        log_index,
        transaction_hash,
        event,
    })
}

/// Normalize a batch, dropping (and logging) logs that fail to decode, and
/// return the survivors in chain order.
pub fn normalize_batch(logs: &[Log]) -> Vec<NormalizedEvent> {
    let mut events: Vec<NormalizedEvent> = logs
        .iter()
        .filter_map(|log| match normalize(log) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!(
                    block = ?log.block_number,
                    log_index = ?log.log_index,
                    error = %e,
                    "Skipping undecodable log"
                );
                None
            }
        })
        .collect();
    events.sort_by_key(NormalizedEvent::position);
    events
}
