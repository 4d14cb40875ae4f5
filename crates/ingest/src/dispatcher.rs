//! Per-address sharded worker pool in front of the [`Pipeline`].
//!
//! One unbounded ingress channel accepts events from every source, so the
//! live subscription never waits on storage. A router hashes each event's
//! ordering key onto one of N shard workers: events for one wallet are
//! applied serially in arrival order, different wallets in parallel.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use eyre::eyre;
use matrixsync_chain::NormalizedEvent;
use matrixsync_core::AppError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::deferred::DeferredQueue;
use crate::pipeline::{Applied, Pipeline};

const SHARD_BUFFER: usize = 1024;

type Ack = oneshot::Sender<Result<Applied, AppError>>;

struct Envelope {
    event: NormalizedEvent,
    ack: Option<Ack>,
}

/// Cloneable handle for submitting events.
#[derive(Clone)]
pub struct Dispatcher {
    ingress: mpsc::UnboundedSender<Envelope>,
}

impl Dispatcher {
    /// Start the router and `workers` shard workers.
    ///
    /// The returned handle completes once `cancel` fires (or every handle is
    /// dropped) and the shards have finished what they already accepted.
    pub fn spawn(
        pipeline: Arc<Pipeline>,
        deferred: Arc<DeferredQueue>,
        workers: usize,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (ingress, rx) = mpsc::unbounded_channel();
        let workers = workers.max(1);

        let mut shards = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for shard in 0..workers {
            let (tx, shard_rx) = mpsc::channel(SHARD_BUFFER);
            shards.push(tx);
            handles.push(tokio::spawn(run_shard(
                shard,
                shard_rx,
                pipeline.clone(),
                deferred.clone(),
            )));
        }

        let supervisor = tokio::spawn(async move {
            route(rx, shards, cancel).await;
            for handle in handles {
                if let Err(e) = handle.await {
                    tracing::error!(error = %e, "Shard worker panicked");
                }
            }
            tracing::info!("Dispatcher stopped");
        });

        (Self { ingress }, supervisor)
    }

    /// Fire-and-forget submit. Failures are logged and deferred by the worker.
    pub fn submit(&self, event: NormalizedEvent) -> Result<(), AppError> {
        self.ingress
            .send(Envelope { event, ack: None })
            .map_err(|_| AppError::Other(eyre!("dispatcher is shut down")))
    }

    /// Submit and wait for the pipeline's result.
    pub async fn submit_and_wait(&self, event: NormalizedEvent) -> Result<Applied, AppError> {
        let (ack, done) = oneshot::channel();
        self.ingress
            .send(Envelope {
                event,
                ack: Some(ack),
            })
            .map_err(|_| AppError::Other(eyre!("dispatcher is shut down")))?;
        done.await
            .map_err(|_| AppError::Other(eyre!("dispatcher dropped the event")))?
    }

    /// Submit a batch in order and collect per-event results, index-aligned.
    pub async fn submit_batch(&self, events: Vec<NormalizedEvent>) -> Vec<Result<Applied, AppError>> {
        let mut pending = Vec::with_capacity(events.len());
        for event in events {
            let (ack, done) = oneshot::channel();
            match self.ingress.send(Envelope {
                event,
                ack: Some(ack),
            }) {
                Ok(()) => pending.push(Some(done)),
                Err(_) => pending.push(None),
            }
        }

        let mut results = Vec::with_capacity(pending.len());
        for done in pending {
            let result = match done {
                Some(done) => done
                    .await
                    .unwrap_or_else(|_| Err(AppError::Other(eyre!("dispatcher dropped the event")))),
                None => Err(AppError::Other(eyre!("dispatcher is shut down"))),
            };
            results.push(result);
        }
        results
    }
}

/// Shard index for an ordering key. Case-insensitive on the address.
pub fn shard_for(key: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.to_ascii_lowercase().hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}

async fn route(
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    shards: Vec<mpsc::Sender<Envelope>>,
    cancel: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };
        let shard = shard_for(envelope.event.event.ordering_key(), shards.len());
        if shards[shard].send(envelope).await.is_err() {
            tracing::error!(shard, "Shard worker is gone");
            break;
        }
    }
    // Dropping the senders lets each worker finish its backlog and exit.
}

async fn run_shard(
    shard: usize,
    mut rx: mpsc::Receiver<Envelope>,
    pipeline: Arc<Pipeline>,
    deferred: Arc<DeferredQueue>,
) {
    while let Some(Envelope { event, ack }) = rx.recv().await {
        let result = pipeline.apply(&event).await;

        if let Err(e) = &result {
            let kind = event.kind();
            if e.is_deferrable() || e.is_store_unavailable() {
                tracing::warn!(
                    shard,
                    %kind,
                    block = event.block_number,
                    wallet = event.event.ordering_key(),
                    error = %e,
                    "Deferring event"
                );
                deferred.push(event.clone()).await;
            } else {
                tracing::error!(
                    shard,
                    %kind,
                    block = event.block_number,
                    error = %e,
                    "Dropping event"
                );
            }
        }

        if let Some(ack) = ack {
            // The submitter may have stopped waiting.
            let _ = ack.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeChain, registered, reward, slot_purchase, wallet};
    use matrixsync_storage::{AggregateStore, MemoryStore};

    struct Harness {
        chain: Arc<FakeChain>,
        store: Arc<MemoryStore>,
        deferred: Arc<DeferredQueue>,
        dispatcher: Dispatcher,
        cancel: CancellationToken,
        handle: JoinHandle<()>,
    }

    fn harness(workers: usize) -> Harness {
        let chain = Arc::new(FakeChain::default());
        let store = Arc::new(MemoryStore::new());
        let deferred = Arc::new(DeferredQueue::new(64));
        let pipeline = Arc::new(Pipeline::new(chain.clone(), store.clone(), 10));
        let cancel = CancellationToken::new();
        let (dispatcher, handle) = Dispatcher::spawn(pipeline, deferred.clone(), workers, cancel.clone());
        Harness {
            chain,
            store,
            deferred,
            dispatcher,
            cancel,
            handle,
        }
    }

    #[test]
    fn same_wallet_always_lands_on_same_shard() {
        let key = wallet(42);
        let first = shard_for(&key, 8);
        assert_eq!(shard_for(&key.to_uppercase().replace("0X", "0x"), 8), first);
        assert!(first < 8);
        assert_eq!(shard_for(&key, 1), 0);
    }

    #[tokio::test]
    async fn batch_results_line_up_with_input() {
        let h = harness(4);
        h.chain.add_user(1, None);
        h.chain.add_user(2, Some(1));
        assert_eq!(
            h.dispatcher.submit_and_wait(registered(1, None)).await.unwrap(),
            Applied::Inserted
        );

        let results = h
            .dispatcher
            .submit_batch(vec![registered(2, Some(1)), registered(2, Some(1)), slot_purchase(9, 1, "1")])
            .await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap(), &Applied::Inserted);
        assert_eq!(results[1].as_ref().unwrap(), &Applied::Duplicate);
        assert!(matches!(results[2], Err(AppError::UnknownUser(_))));

        let owner = h.store.user_by_id(1).await.unwrap().unwrap();
        assert_eq!(owner.total_partners, 1);

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_duplicate_rewards_apply_once() {
        let h = harness(8);
        for (id, parent) in [(1, None), (2, Some(1)), (3, Some(2))] {
            h.chain.add_user(id, parent);
            h.dispatcher.submit_and_wait(registered(id, parent)).await.unwrap();
        }

        let event = reward(1, 3, "100", 1, "level");
        let results = h.dispatcher.submit_batch(vec![event.clone(), event.clone(), event]).await;
        let inserted = results
            .iter()
            .filter(|r| matches!(r, Ok(Applied::Inserted)))
            .count();
        assert_eq!(inserted, 1);

        let a = h.store.user_by_id(1).await.unwrap().unwrap();
        assert_eq!(a.daily_level_income, "100");

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn deferrable_failures_are_queued() {
        let h = harness(2);
        let result = h.dispatcher.submit_and_wait(slot_purchase(5, 1, "100")).await;
        assert!(matches!(result, Err(AppError::UnknownUser(_))));
        assert_eq!(h.deferred.len().await, 1);

        h.cancel.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test]
    async fn submit_after_shutdown_fails() {
        let h = harness(1);
        h.cancel.cancel();
        h.handle.await.unwrap();
        assert!(h.dispatcher.submit(registered(1, None)).is_err());
    }
}
