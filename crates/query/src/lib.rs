//! Read side over the aggregate store: user search, dashboards, referral
//! generations and cached home-page stats.

pub mod cache;
pub mod clock;
pub mod service;
pub mod units;

pub use cache::TtlCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use service::{Dashboard, GenerationLevel, HomeStats, QueryService, UserPage};
