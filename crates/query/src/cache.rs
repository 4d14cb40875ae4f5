use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::clock::Clock;

struct Entry<T> {
    value: T,
    expires_at: DateTime<Utc>,
}

/// Single-value cache with a fixed lifetime, read against an injected clock.
pub struct TtlCache<T> {
    entry: RwLock<Option<Entry<T>>>,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entry: RwLock::new(None),
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            clock,
        }
    }

    /// The cached value, if one is stored and has not expired.
    pub async fn get(&self) -> Option<T> {
        let now = self.clock.now();
        self.entry
            .read()
            .await
            .as_ref()
            .filter(|e| now < e.expires_at)
            .map(|e| e.value.clone())
    }

    pub async fn put(&self, value: T) {
        let expires_at = self
            .clock
            .now()
            .checked_add_signed(self.ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        *self.entry.write().await = Some(Entry { value, expires_at });
    }

    pub async fn invalidate(&self) {
        *self.entry.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()))
    }

    #[tokio::test]
    async fn value_expires_after_ttl() {
        let clock = clock();
        let cache = TtlCache::new(Duration::from_secs(300), clock.clone());
        assert_eq!(cache.get().await, None);

        cache.put(7u32).await;
        clock.advance(chrono::Duration::seconds(299));
        assert_eq!(cache.get().await, Some(7));

        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(cache.get().await, None);
    }

    #[tokio::test]
    async fn invalidate_clears_immediately() {
        let cache = TtlCache::new(Duration::from_secs(300), clock());
        cache.put("stats".to_string()).await;
        cache.invalidate().await;
        assert_eq!(cache.get().await, None);
    }
}
