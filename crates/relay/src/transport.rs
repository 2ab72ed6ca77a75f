//! Client side of a relay

use crate::TransportError;
use async_trait::async_trait;
use tokio::sync::mpsc;
use trade_types::{CallContext, Message, TradeId};

/// Counter updates buffered per watch
pub const WATCH_BUFFER: usize = 64;

/// Open connection to one relay
#[async_trait]
pub trait RelayConnection: Send {
    /// Queue a message; returns the trade's delivery counter after the push
    async fn push(&mut self, cx: &CallContext, message: Message) -> Result<u64, TransportError>;

    /// Take the oldest queued message of a trade, waiting for one
    async fn pull(&mut self, cx: &CallContext, trade_id: TradeId) -> Result<Message, TransportError>;

    /// Current delivery counter of a trade
    async fn counter(&mut self, cx: &CallContext, trade_id: TradeId) -> Result<u64, TransportError>;

    /// Follow the delivery counter of a trade
    ///
    /// The first value is the counter at subscription time. The connection is
    /// dedicated to the watch; dropping the receiver ends it.
    async fn watch(self: Box<Self>, trade_id: TradeId) -> Result<mpsc::Receiver<u64>, TransportError>;
}

/// Connects to relays by endpoint
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        cx: &CallContext,
        endpoint: &str,
    ) -> Result<Box<dyn RelayConnection>, TransportError>;
}
