//! Message relay - per-trade FIFO queues with delivery counters
//!
//! Each trade gets a bounded queue, created on first use. A push blocks while
//! the queue is full and never drops messages. The delivery counter counts
//! successful pushes and never decreases; it is the relay's evidence when
//! provider and consumer disagree about how much was delivered.

use crate::RelayError;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use trade_types::{CallContext, Message, TradeId, DEFAULT_QUEUE_CAPACITY};

/// Counter updates buffered per watcher
const COUNTER_UPDATES: usize = 64;

struct TradeQueue {
    tx: mpsc::Sender<Message>,
    /// Pullers take turns on the receiver
    rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    delivered: Mutex<u64>,
    updates: broadcast::Sender<u64>,
}

impl TradeQueue {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let (updates, _) = broadcast::channel(COUNTER_UPDATES);
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            delivered: Mutex::new(0),
            updates,
        }
    }
}

/// Registry of per-trade queues
pub struct MessageRelay {
    queues: DashMap<TradeId, Arc<TradeQueue>>,
    capacity: usize,
}

impl MessageRelay {
    /// Create a relay buffering at most `capacity` messages per trade
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn queue(&self, trade_id: TradeId) -> Arc<TradeQueue> {
        self.queues
            .entry(trade_id)
            .or_insert_with(|| Arc::new(TradeQueue::new(self.capacity)))
            .value()
            .clone()
    }

    /// Enqueue a message, waiting for room while the trade's queue is full
    ///
    /// Returns the delivery counter including this message. A cancelled push
    /// leaves queue and counter untouched. A push still waiting when the trade
    /// is closed fails with `QueueClosed` and is not counted.
    pub async fn push(&self, cx: &CallContext, message: Message) -> Result<u64, RelayError> {
        let trade_id = message.trade_id;
        let queue = self.queue(trade_id);

        let permit = cx
            .run(queue.tx.reserve())
            .await?
            .map_err(|_| RelayError::QueueClosed(trade_id))?;

        let counter = {
            // Holding the entry keeps `close` out until the message is counted
            let current = self.queues.get(&trade_id);
            if !current
                .as_ref()
                .is_some_and(|entry| Arc::ptr_eq(entry.value(), &queue))
            {
                return Err(RelayError::QueueClosed(trade_id));
            }
            let mut delivered = queue.delivered.lock();
            *delivered += 1;
            permit.send(message);
            *delivered
        };
        // Nobody watching is fine
        let _ = queue.updates.send(counter);

        tracing::debug!(trade_id = %trade_id, op = "push", "Queued message {}", counter);
        Ok(counter)
    }

    /// Dequeue the oldest message of a trade, waiting until one arrives
    pub async fn pull(&self, cx: &CallContext, trade_id: TradeId) -> Result<Message, RelayError> {
        let queue = self.queue(trade_id);
        let message = cx
            .run(async {
                let mut rx = queue.rx.lock().await;
                rx.recv().await
            })
            .await?
            .ok_or(RelayError::QueueClosed(trade_id))?;

        tracing::debug!(trade_id = %trade_id, op = "pull", "Delivered message");
        Ok(message)
    }

    /// Delivery counter of a trade, 0 for trades never pushed to
    pub fn find_counter(&self, trade_id: TradeId) -> u64 {
        self.queues
            .get(&trade_id)
            .map(|queue| *queue.delivered.lock())
            .unwrap_or(0)
    }

    /// Counter updates of a trade, one per successful push
    ///
    /// The stream ends once the trade is closed and its last user is gone.
    pub fn watch(&self, trade_id: TradeId) -> broadcast::Receiver<u64> {
        self.queue(trade_id).updates.subscribe()
    }

    /// Drop the queue and counter of a finished trade
    ///
    /// Meant to follow settlement. Later use of the id starts from an empty
    /// queue and a zero counter; pushes blocked on the old queue fail.
    pub fn close(&self, trade_id: TradeId) -> bool {
        let removed = self.queues.remove(&trade_id).is_some();
        if removed {
            tracing::info!(trade_id = %trade_id, "Closed trade queue");
        }
        removed
    }

    /// Number of trades with a live queue
    pub fn active_trades(&self) -> usize {
        self.queues.len()
    }
}

impl Default for MessageRelay {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;
    use trade_types::Canceled;

    fn message(trade_id: u64, payload: &[u8]) -> Message {
        Message::new(TradeId(trade_id), payload.to_vec())
    }

    #[tokio::test]
    async fn test_trade_42_scenario() {
        let relay = MessageRelay::default();
        let cx = CallContext::new();

        relay.push(&cx, message(42, &[0x01])).await.unwrap();
        relay.push(&cx, message(42, &[0x02])).await.unwrap();
        assert_eq!(relay.find_counter(TradeId(42)), 2);

        assert_eq!(relay.pull(&cx, TradeId(42)).await.unwrap().payload, vec![0x01]);
        assert_eq!(relay.pull(&cx, TradeId(42)).await.unwrap().payload, vec![0x02]);
        assert_eq!(relay.find_counter(TradeId(42)), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_fails_waiting_push() {
        let relay = Arc::new(MessageRelay::new(1));
        let cx = CallContext::new();
        relay.push(&cx, message(5, &[1])).await.unwrap();
        let old = relay.queues.get(&TradeId(5)).unwrap().value().clone();

        let blocked = {
            let relay = relay.clone();
            let cx = cx.clone();
            tokio::spawn(async move { relay.push(&cx, message(5, &[2])).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!blocked.is_finished());

        assert!(relay.close(TradeId(5)));
        // Make room in the removed queue so the waiting push gets its permit
        assert_eq!(old.rx.lock().await.recv().await.unwrap().payload, vec![1]);

        assert_eq!(blocked.await.unwrap(), Err(RelayError::QueueClosed(TradeId(5))));
        assert_eq!(*old.delivered.lock(), 1);
        assert_eq!(relay.find_counter(TradeId(5)), 0);
        assert_eq!(relay.active_trades(), 0);
    }

    #[tokio::test]
    async fn test_counter_unknown_trade() {
        let relay = MessageRelay::default();
        assert_eq!(relay.find_counter(TradeId(7)), 0);
        assert_eq!(relay.active_trades(), 0);
    }

    #[tokio::test]
    async fn test_counter_concurrent_pushes() {
        let relay = Arc::new(MessageRelay::default());
        let mut tasks = Vec::new();
        for i in 0..20u8 {
            let relay = relay.clone();
            tasks.push(tokio::spawn(async move {
                relay.push(&CallContext::new(), message(1, &[i])).await.unwrap()
            }));
        }

        let mut counters = Vec::new();
        for task in tasks {
            counters.push(task.await.unwrap());
        }
        counters.sort_unstable();

        assert_eq!(counters, (1..=20).collect::<Vec<u64>>());
        assert_eq!(relay.find_counter(TradeId(1)), 20);
    }

    #[tokio::test]
    async fn test_trades_are_independent() {
        let relay = MessageRelay::default();
        let cx = CallContext::new();
        relay.push(&cx, message(1, b"a")).await.unwrap();
        relay.push(&cx, message(2, b"b")).await.unwrap();
        relay.push(&cx, message(1, b"c")).await.unwrap();

        assert_eq!(relay.find_counter(TradeId(1)), 2);
        assert_eq!(relay.find_counter(TradeId(2)), 1);
        assert_eq!(relay.pull(&cx, TradeId(2)).await.unwrap().payload, b"b".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_blocks_until_pull() {
        let relay = Arc::new(MessageRelay::new(1));
        let cx = CallContext::new();
        relay.push(&cx, message(5, b"A")).await.unwrap();

        let pusher = {
            let relay = relay.clone();
            tokio::spawn(async move { relay.push(&CallContext::new(), message(5, b"B")).await })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!pusher.is_finished());
        assert_eq!(relay.find_counter(TradeId(5)), 1);

        assert_eq!(relay.pull(&cx, TradeId(5)).await.unwrap().payload, b"A".to_vec());
        assert_eq!(pusher.await.unwrap().unwrap(), 2);
        assert_eq!(relay.pull(&cx, TradeId(5)).await.unwrap().payload, b"B".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_deadline_leaves_counter() {
        let relay = MessageRelay::new(1);
        let cx = CallContext::new();
        relay.push(&cx, message(3, b"A")).await.unwrap();

        let bounded = cx.with_timeout(Duration::from_millis(100));
        let result = relay.push(&bounded, message(3, b"B")).await;

        assert_eq!(result, Err(RelayError::Canceled(Canceled::DeadlineExceeded)));
        assert_eq!(relay.find_counter(TradeId(3)), 1);
    }

    #[tokio::test]
    async fn test_pull_cancelled() {
        let relay = Arc::new(MessageRelay::default());
        let cx = CallContext::new();

        let puller = {
            let relay = relay.clone();
            let cx = cx.clone();
            tokio::spawn(async move { relay.pull(&cx, TradeId(9)).await })
        };
        cx.cancel();

        assert_eq!(puller.await.unwrap(), Err(RelayError::Canceled(Canceled::Cancelled)));
    }

    #[tokio::test]
    async fn test_watch_and_close() {
        let relay = MessageRelay::default();
        let cx = CallContext::new();
        let mut updates = relay.watch(TradeId(8));

        relay.push(&cx, message(8, b"x")).await.unwrap();
        assert_eq!(updates.recv().await.unwrap(), 1);

        assert!(relay.close(TradeId(8)));
        assert!(!relay.close(TradeId(8)));
        assert_eq!(relay.active_trades(), 0);
        assert_eq!(relay.find_counter(TradeId(8)), 0);
        assert!(updates.recv().await.is_err());
    }

    proptest! {
        #[test]
        fn prop_fifo_per_trade(payloads in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..16),
            0..64,
        )) {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let pulled = runtime.block_on(async {
                let relay = MessageRelay::default();
                let cx = CallContext::new();
                for payload in &payloads {
                    relay.push(&cx, Message::new(TradeId(1), payload.clone())).await.unwrap();
                }
                let mut pulled = Vec::new();
                for _ in 0..payloads.len() {
                    pulled.push(relay.pull(&cx, TradeId(1)).await.unwrap().payload);
                }
                pulled
            });
            prop_assert_eq!(pulled, payloads);
        }
    }
}
