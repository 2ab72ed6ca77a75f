//! In-process transport routing endpoint names to local relays

use crate::{
    transport::WATCH_BUFFER, MessageRelay, RelayConnection, Transport, TransportError,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{broadcast, mpsc};
use trade_types::{CallContext, Message, TradeId};

/// Transport for relays living in the same process
#[derive(Clone, Default)]
pub struct LocalTransport {
    relays: Arc<RwLock<HashMap<String, Arc<MessageRelay>>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `relay` under `endpoint`
    pub fn register(&self, endpoint: impl Into<String>, relay: Arc<MessageRelay>) {
        self.relays.write().insert(endpoint.into(), relay);
    }

    pub fn with_relay(self, endpoint: impl Into<String>, relay: Arc<MessageRelay>) -> Self {
        self.register(endpoint, relay);
        self
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(
        &self,
        cx: &CallContext,
        endpoint: &str,
    ) -> Result<Box<dyn RelayConnection>, TransportError> {
        cx.check()?;
        let relay = self
            .relays
            .read()
            .get(endpoint)
            .cloned()
            .ok_or_else(|| TransportError::Connect {
                endpoint: endpoint.to_string(),
                reason: "no relay registered under this name".to_string(),
            })?;
        Ok(Box::new(LocalConnection { relay }))
    }
}

struct LocalConnection {
    relay: Arc<MessageRelay>,
}

#[async_trait]
impl RelayConnection for LocalConnection {
    async fn push(&mut self, cx: &CallContext, message: Message) -> Result<u64, TransportError> {
        Ok(self.relay.push(cx, message).await?)
    }

    async fn pull(&mut self, cx: &CallContext, trade_id: TradeId) -> Result<Message, TransportError> {
        Ok(self.relay.pull(cx, trade_id).await?)
    }

    async fn counter(&mut self, cx: &CallContext, trade_id: TradeId) -> Result<u64, TransportError> {
        cx.check()?;
        Ok(self.relay.find_counter(trade_id))
    }

    async fn watch(self: Box<Self>, trade_id: TradeId) -> Result<mpsc::Receiver<u64>, TransportError> {
        let mut updates = self.relay.watch(trade_id);
        let initial = self.relay.find_counter(trade_id);
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);

        tokio::spawn(async move {
            if tx.send(initial).await.is_err() {
                return;
            }
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    update = updates.recv() => match update {
                        Ok(value) if value > initial => {
                            if tx.send(value).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::debug!(trade_id = %trade_id, "Counter watch skipped {} updates", missed);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_endpoint() {
        let transport = LocalTransport::new();
        let result = transport.connect(&CallContext::new(), "nowhere").await;
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }

    #[tokio::test]
    async fn test_push_pull_watch() {
        let relay = Arc::new(MessageRelay::default());
        let transport = LocalTransport::new().with_relay("relay-1", relay.clone());
        let cx = CallContext::new();

        let mut conn = transport.connect(&cx, "relay-1").await.unwrap();
        assert_eq!(conn.push(&cx, Message::new(TradeId(1), vec![7])).await.unwrap(), 1);

        let mut counters = transport
            .connect(&cx, "relay-1")
            .await
            .unwrap()
            .watch(TradeId(1))
            .await
            .unwrap();
        assert_eq!(counters.recv().await, Some(1));

        conn.push(&cx, Message::new(TradeId(1), vec![8])).await.unwrap();
        assert_eq!(counters.recv().await, Some(2));

        assert_eq!(conn.pull(&cx, TradeId(1)).await.unwrap().payload, vec![7]);
        assert_eq!(conn.counter(&cx, TradeId(1)).await.unwrap(), 2);
    }
}
