//! Dispute reconciler - the relay's part in settlement
//!
//! For every trade brokered by this relay, waits until the ledger either
//! settles it or reports a dispute. A dispute is resolved with the relay's
//! delivery counter. Either way the trade's queue is torn down afterwards.

use crate::MessageRelay;
use ledger_gateway::{EventStream, Keystore, LedgerError, LedgerGateway};
use std::sync::Arc;
use tokio::task::JoinSet;
use trade_types::{CallContext, CreatedTrade, Dispute, Settled, Trade, TradeId};

/// Resolves disputes of trades brokered by the keystore's account
#[derive(Clone)]
pub struct DisputeReconciler {
    ledger: Arc<dyn LedgerGateway>,
    relay: Arc<MessageRelay>,
    keystore: Arc<Keystore>,
    passphrase: String,
}

impl DisputeReconciler {
    /// Create a new reconciler
    pub fn new(
        ledger: Arc<dyn LedgerGateway>,
        relay: Arc<MessageRelay>,
        keystore: Arc<Keystore>,
        passphrase: impl Into<String>,
    ) -> Self {
        Self {
            ledger,
            relay,
            keystore,
            passphrase: passphrase.into(),
        }
    }

    /// Subscribe to trades brokered by this relay
    pub async fn subscribe(&self) -> Result<EventStream<CreatedTrade>, LedgerError> {
        self.ledger
            .watch_created_trade(vec![self.keystore.account().clone()])
            .await
    }

    /// Watch brokered trades until `cx` is cancelled or the subscription fails
    pub async fn run(&self, cx: &CallContext) -> Result<(), LedgerError> {
        let created = self.subscribe().await?;
        self.serve(cx, created).await
    }

    /// Run with an existing created-trade subscription
    ///
    /// Each trade gets its own watcher task. A failing watcher is logged and
    /// does not affect the others. Watchers outlive a failed subscription and
    /// only stop once `cx` is cancelled.
    pub async fn serve(
        &self,
        cx: &CallContext,
        mut created: EventStream<CreatedTrade>,
    ) -> Result<(), LedgerError> {
        tracing::info!("Dispute reconciler running for broker {}", self.keystore.account());
        let mut watchers = JoinSet::new();

        loop {
            tokio::select! {
                event = created.next_in(cx) => {
                    let event = match event {
                        Ok(event) => event,
                        Err(e) => {
                            watchers.detach_all();
                            return Err(e);
                        }
                    };
                    match self.prepare(event.trade).await {
                        Ok((trade, disputes, settled)) => {
                            let reconciler = self.clone();
                            let cx = cx.child();
                            watchers.spawn(async move {
                                let id = trade.id;
                                match reconciler.watch_trade(&cx, trade, disputes, settled).await {
                                    Ok(()) => tracing::debug!(trade_id = %id, "Trade watcher finished"),
                                    Err(e) => tracing::error!(trade_id = %id, "Trade watcher failed: {}", e),
                                }
                            });
                        }
                        Err(e) => {
                            tracing::warn!(trade_id = %event.trade, "Cannot watch trade: {}", e);
                        }
                    }
                }
                Some(joined) = watchers.join_next() => {
                    if let Err(e) = joined {
                        tracing::error!("Trade watcher panicked: {}", e);
                    }
                }
            }
        }
    }

    /// Load the trade and subscribe to its outcome
    async fn prepare(
        &self,
        trade_id: TradeId,
    ) -> Result<(Trade, EventStream<Dispute>, EventStream<Settled>), LedgerError> {
        let trade = self.ledger.find_trade(trade_id).await?;
        let disputes = self.ledger.watch_dispute(&trade.settlement).await?;
        let settled = self.ledger.watch_settled(&trade.settlement).await?;
        tracing::info!(trade_id = %trade.id, "Watching settlement {}", trade.settlement);
        Ok((trade, disputes, settled))
    }

    async fn watch_trade(
        &self,
        cx: &CallContext,
        trade: Trade,
        mut disputes: EventStream<Dispute>,
        mut settled: EventStream<Settled>,
    ) -> Result<(), LedgerError> {
        tokio::select! {
            dispute = disputes.next_in(cx) => {
                let dispute = dispute?;
                let counter = self.relay.find_counter(trade.id);
                tracing::warn!(
                    trade_id = %trade.id,
                    "Dispute: provider {} consumer {}, relay counted {}",
                    dispute.provider_counter,
                    dispute.consumer_counter,
                    counter
                );

                let credential = self.keystore.unlock(&self.passphrase).await?;
                self.ledger
                    .resolve_dispute(&credential, &trade.settlement, counter)
                    .await?;
                tracing::info!(trade_id = %trade.id, "Resolved dispute with counter {}", counter);
            }
            event = settled.next_in(cx) => {
                let event = event?;
                tracing::info!(trade_id = %trade.id, "Trade settled with counter {}", event.counter);
            }
        }

        self.relay.close(trade.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_gateway::{InMemoryLedger, RequestedTradingFilter, SettlementStatus};
    use std::time::Duration;
    use trade_types::{Address, Broker, Device, Location, Message, Product, ProductId, TradeWindow};

    struct Setup {
        ledger: Arc<InMemoryLedger>,
        relay: Arc<MessageRelay>,
        consumer: Keystore,
        provider: Keystore,
        cx: CallContext,
    }

    async fn fixture() -> (Setup, DisputeReconciler) {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.register_broker(Broker {
            address: Address::from("broker"),
            name: "relay".to_string(),
            endpoint: "relay".to_string(),
            location: Location::Euw,
        });
        for name in ["provider", "consumer"] {
            ledger.register_device(Device {
                address: Address::from(name),
                name: name.to_string(),
                public_key: Vec::new(),
            });
        }
        ledger
            .register_product(Product {
                id: ProductId(1),
                device: Address::from("provider"),
                name: "humidity".to_string(),
                description: String::new(),
                data_type: "humidity".to_string(),
                frequency: 60,
                cost: 1,
            })
            .unwrap();

        let relay = Arc::new(MessageRelay::default());
        let reconciler = DisputeReconciler::new(
            ledger.clone(),
            relay.clone(),
            Arc::new(Keystore::new(Address::from("broker"), "broker-pass")),
            "broker-pass",
        );
        let setup = Setup {
            ledger,
            relay,
            consumer: Keystore::new(Address::from("consumer"), "c"),
            provider: Keystore::new(Address::from("provider"), "p"),
            cx: CallContext::new(),
        };
        (setup, reconciler)
    }

    async fn setup() -> Setup {
        let (setup, reconciler) = fixture().await;
        let created = reconciler.subscribe().await.unwrap();
        {
            let cx = setup.cx.clone();
            tokio::spawn(async move { reconciler.serve(&cx, created).await });
        }
        setup
    }

    async fn open_trade(s: &Setup) -> Trade {
        let mut requested = s
            .ledger
            .watch_requested_trading(RequestedTradingFilter::default())
            .await
            .unwrap();
        {
            let credential = s.consumer.unlock("c").await.unwrap();
            let window = TradeWindow::starting_in(Duration::ZERO, Duration::from_secs(60));
            s.ledger
                .request_trading(&credential, ProductId(1), &Address::from("broker"), window)
                .await
                .unwrap();
        }
        let request = requested.next().await.unwrap().request;
        let mut accepted = s.ledger.watch_accepted_trading_request(vec![request]).await.unwrap();
        {
            let credential = s.provider.unlock("p").await.unwrap();
            s.ledger.accept_trading_request(&credential, request).await.unwrap();
        }
        let trade_id = accepted.next().await.unwrap().trade;
        s.ledger.find_trade(trade_id).await.unwrap()
    }

    async fn settle(keystore: &Keystore, passphrase: &str, s: &Setup, trade: &Trade, counter: u64) {
        let credential = keystore.unlock(passphrase).await.unwrap();
        s.ledger
            .settle_trade(&credential, &trade.settlement, counter)
            .await
            .unwrap();
    }

    async fn wait_for_close(relay: &MessageRelay) {
        for _ in 0..100 {
            if relay.active_trades() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("trade queue was not closed");
    }

    #[tokio::test]
    async fn test_dispute_resolved_with_relay_counter() {
        let s = setup().await;
        let trade = open_trade(&s).await;
        let mut settled = s.ledger.watch_settled(&trade.settlement).await.unwrap();

        // Give the reconciler time to subscribe to the trade's outcome
        tokio::time::sleep(Duration::from_millis(50)).await;

        let cx = CallContext::new();
        for payload in [1u8, 2, 3] {
            s.relay.push(&cx, Message::new(trade.id, vec![payload])).await.unwrap();
        }

        settle(&s.provider, "p", &s, &trade, 5).await;
        settle(&s.consumer, "c", &s, &trade, 1).await;

        let event = settled.next_in(&cx.with_timeout(Duration::from_secs(5))).await.unwrap();
        assert_eq!(event.counter, 3);
        assert_eq!(
            s.ledger.settlement(&trade.settlement).unwrap().status,
            SettlementStatus::Settled { counter: 3 }
        );
        wait_for_close(&s.relay).await;
        s.cx.cancel();
    }

    #[tokio::test]
    async fn test_settled_trade_closes_queue() {
        let s = setup().await;
        let trade = open_trade(&s).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let cx = CallContext::new();
        s.relay.push(&cx, Message::new(trade.id, vec![1])).await.unwrap();
        assert_eq!(s.relay.active_trades(), 1);

        settle(&s.provider, "p", &s, &trade, 1).await;
        settle(&s.consumer, "c", &s, &trade, 1).await;

        wait_for_close(&s.relay).await;
        s.cx.cancel();
    }

    #[tokio::test]
    async fn test_watchers_outlive_subscription_error() {
        let (s, reconciler) = fixture().await;
        let trade = open_trade(&s).await;
        let mut settled = s.ledger.watch_settled(&trade.settlement).await.unwrap();

        let (tx, created) = EventStream::channel(4);
        tx.send(Ok(CreatedTrade {
            trade: trade.id,
            broker: Address::from("broker"),
        }))
        .await
        .unwrap();
        tx.send(Err(LedgerError::Subscription("reset".to_string())))
            .await
            .unwrap();

        let result = reconciler.serve(&s.cx, created).await;
        assert!(matches!(result, Err(LedgerError::Subscription(_))));

        let cx = CallContext::new();
        for payload in [1u8, 2, 3] {
            s.relay.push(&cx, Message::new(trade.id, vec![payload])).await.unwrap();
        }
        settle(&s.provider, "p", &s, &trade, 5).await;
        settle(&s.consumer, "c", &s, &trade, 1).await;

        let event = settled.next_in(&cx.with_timeout(Duration::from_secs(5))).await.unwrap();
        assert_eq!(event.counter, 3);
        assert_eq!(
            s.ledger.settlement(&trade.settlement).unwrap().status,
            SettlementStatus::Settled { counter: 3 }
        );
        wait_for_close(&s.relay).await;
        s.cx.cancel();
    }
}
