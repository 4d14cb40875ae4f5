use std::collections::VecDeque;

use matrixsync_chain::{ChainEvent, NormalizedEvent};
use tokio::sync::Mutex;

/// Events whose application must wait for local state to catch up with the
/// chain. Drained and resubmitted on every reconciliation pass.
///
/// Bounded: when full, the oldest event is dropped and logged at `error`.
/// The user and event backfills recover drops inside their trailing
/// windows; older registrations need a manual replay.
pub struct DeferredQueue {
    events: Mutex<VecDeque<NormalizedEvent>>,
    capacity: usize,
}

impl DeferredQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Queue `event` unless an identical one is already waiting.
    pub async fn push(&self, event: NormalizedEvent) {
        let mut events = self.events.lock().await;
        if events.contains(&event) {
            return;
        }
        if events.len() >= self.capacity {
            if let Some(dropped) = events.pop_front() {
                // Registrations below the backfill window are not replayed
                // by any pass, so the drop has to be visible.
                let user_id = match &dropped.event {
                    ChainEvent::UserRegistered { user_id, .. } => Some(*user_id),
                    _ => None,
                };
                tracing::error!(
                    kind = %dropped.kind(),
                    block = dropped.block_number,
                    wallet = dropped.event.ordering_key(),
                    user_id,
                    capacity = self.capacity,
                    "Deferred queue full, dropping oldest event"
                );
            }
        }
        events.push_back(event);
    }

    /// Take everything queued, oldest first.
    pub async fn drain(&self) -> Vec<NormalizedEvent> {
        self.events.lock().await.drain(..).collect()
    }

    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{registered, slot_purchase};

    #[tokio::test]
    async fn identical_events_are_queued_once() {
        let queue = DeferredQueue::new(8);
        queue.push(registered(2, Some(1))).await;
        queue.push(registered(2, Some(1))).await;
        queue.push(slot_purchase(2, 1, "100")).await;
        assert_eq!(queue.len().await, 2);

        let drained = queue.drain().await;
        assert_eq!(drained[0], registered(2, Some(1)));
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let queue = DeferredQueue::new(2);
        for id in 1..=3 {
            queue.push(registered(id, None)).await;
        }
        let drained = queue.drain().await;
        assert_eq!(drained, vec![registered(2, None), registered(3, None)]);
    }
}
