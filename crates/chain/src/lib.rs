pub mod abi;
pub mod decoder;
pub mod provider;
pub mod reader;
pub mod retry;
pub mod rpc;

pub use abi::{MatrixPro, Registration};
pub use decoder::{
    ChainEvent, EventKind, IncomeType, NormalizedEvent, format_address, normalize,
    normalize_address, normalize_batch,
};
pub use provider::{ChainProvider, create_provider, create_ws_provider, parse_address};
pub use reader::{ChainReader, ChainUser, IncomeStats, LevelDetails, ReferralStats, SlotInfo};
pub use retry::{RetryPolicy, with_retry};
pub use rpc::RpcChainReader;
