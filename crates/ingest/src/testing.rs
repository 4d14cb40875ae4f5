//! Scripted chain double and event builders for the ingest tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use matrixsync_chain::{
    ChainEvent, ChainReader, ChainUser, EventKind, IncomeStats, IncomeType, LevelDetails,
    NormalizedEvent, ReferralStats, SlotInfo,
};
use matrixsync_core::AppError;

pub fn wallet(id: u64) -> String {
    format!("0x{id:040x}")
}

pub fn registered(id: u64, parent: Option<u64>) -> NormalizedEvent {
    NormalizedEvent {
        block_number: id,
        log_index: 0,
        transaction_hash: Some(format!("0x{id:064x}")),
        event: ChainEvent::UserRegistered {
            user: wallet(id),
            user_id: id,
            registration_time: 1_700_000_000 + id,
            referrer: parent.map(wallet).unwrap_or_else(|| crate::pipeline::ZERO_ADDRESS.to_string()),
        },
    }
}

pub fn slot_purchase(id: u64, level: u32, price: &str) -> NormalizedEvent {
    NormalizedEvent {
        block_number: 1_000 + u64::from(level),
        log_index: 1,
        transaction_hash: None,
        event: ChainEvent::SlotPurchased {
            user: wallet(id),
            level,
            price: price.to_string(),
        },
    }
}

pub fn reward(receiver: u64, from: u64, amount: &str, level: u32, income_type: &str) -> NormalizedEvent {
    NormalizedEvent {
        block_number: 2_000 + u64::from(level),
        log_index: 2,
        transaction_hash: None,
        event: ChainEvent::RewardDistributed {
            receiver: wallet(receiver),
            from: wallet(from),
            amount: amount.to_string(),
            level,
            income_type: IncomeType::parse(income_type),
        },
    }
}

#[derive(Default)]
struct FakeState {
    users: BTreeMap<u64, ChainUser>,
    slots: HashMap<String, u32>,
    income: HashMap<String, String>,
    head: u64,
    events: Vec<NormalizedEvent>,
    registration_paused: bool,
    purchasing_paused: bool,
    fetches: Vec<(Vec<EventKind>, u64, u64)>,
}

/// In-memory [`ChainReader`] whose state tests script directly.
#[derive(Default)]
pub struct FakeChain {
    state: Mutex<FakeState>,
    failing: AtomicBool,
}

impl FakeChain {
    pub fn add_user(&self, id: u64, parent: Option<u64>) {
        self.state.lock().unwrap().users.insert(
            id,
            ChainUser {
                user_id: id,
                wallet: wallet(id),
                referrer_id: parent,
                referrer_address: parent.map(wallet),
                registration_time: 1_700_000_000 + id,
                full_name: format!("user {id}"),
            },
        );
    }

    pub fn set_slot(&self, id: u64, slot: u32) {
        self.state.lock().unwrap().slots.insert(wallet(id), slot);
    }

    pub fn set_income(&self, id: u64, total: &str) {
        self.state.lock().unwrap().income.insert(wallet(id), total.to_string());
    }

    pub fn set_head(&self, head: u64) {
        self.state.lock().unwrap().head = head;
    }

    pub fn push_event(&self, event: NormalizedEvent) {
        self.state.lock().unwrap().events.push(event);
    }

    pub fn set_paused(&self, registration: bool, purchasing: bool) {
        let mut state = self.state.lock().unwrap();
        state.registration_paused = registration;
        state.purchasing_paused = purchasing;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> Vec<(Vec<EventKind>, u64, u64)> {
        self.state.lock().unwrap().fetches.clone()
    }

    fn check(&self) -> Result<(), AppError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::Rpc("scripted failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainReader for FakeChain {
    async fn block_number(&self) -> Result<u64, AppError> {
        self.check()?;
        Ok(self.state.lock().unwrap().head)
    }

    async fn total_users(&self) -> Result<u64, AppError> {
        self.check()?;
        Ok(self.state.lock().unwrap().users.keys().next_back().copied().unwrap_or(0))
    }

    async fn user_by_id(&self, user_id: u64) -> Result<Option<ChainUser>, AppError> {
        self.check()?;
        Ok(self.state.lock().unwrap().users.get(&user_id).cloned())
    }

    async fn user_by_address(&self, wallet: &str) -> Result<Option<ChainUser>, AppError> {
        self.check()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .users
            .values()
            .find(|u| u.wallet == wallet)
            .cloned())
    }

    async fn referral_stats(&self, _wallet: &str) -> Result<ReferralStats, AppError> {
        self.check()?;
        Ok(ReferralStats::default())
    }

    async fn current_slot(&self, wallet: &str) -> Result<SlotInfo, AppError> {
        self.check()?;
        let slot = self.state.lock().unwrap().slots.get(wallet).copied().unwrap_or(0);
        Ok(SlotInfo {
            current_active_slot: slot,
            ..SlotInfo::default()
        })
    }

    async fn income_stats(&self, wallet: &str) -> Result<IncomeStats, AppError> {
        self.check()?;
        let total = self
            .state
            .lock()
            .unwrap()
            .income
            .get(wallet)
            .cloned()
            .unwrap_or_else(|| "0".into());
        Ok(IncomeStats {
            total,
            level_income: "0".into(),
            direct_income: "0".into(),
            slot_income: "0".into(),
            recycle_income: "0".into(),
            salary_income: "0".into(),
        })
    }

    async fn level_referral_details(&self, _wallet: &str, level: u32) -> Result<LevelDetails, AppError> {
        self.check()?;
        Ok(LevelDetails {
            referral_count: "1".into(),
            recycle_count: "0".into(),
            slot_transactions: level.to_string(),
            is_upgraded: false,
            is_active: true,
        })
    }

    async fn registration_paused(&self) -> Result<bool, AppError> {
        self.check()?;
        Ok(self.state.lock().unwrap().registration_paused)
    }

    async fn purchasing_paused(&self) -> Result<bool, AppError> {
        self.check()?;
        Ok(self.state.lock().unwrap().purchasing_paused)
    }

    async fn fetch_events(
        &self,
        kinds: &[EventKind],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<NormalizedEvent>, AppError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        state.fetches.push((kinds.to_vec(), from_block, to_block));
        let mut events: Vec<_> = state
            .events
            .iter()
            .filter(|e| kinds.contains(&e.kind()))
            .filter(|e| (from_block..=to_block).contains(&e.block_number))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.position());
        Ok(events)
    }
}
