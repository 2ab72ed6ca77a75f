//! Producer side of a trade

use super::{await_window_start, transition, CoordinatorError, TradeOutcome};
use crate::{
    crypto::{encode_measurement, PublicKey},
    EncryptedTransport, ProducerConfig, SensorSource, MEASUREMENT_BUFFER,
};
use ledger_gateway::{EventStream, Keystore, LedgerError, LedgerGateway, RequestedTradingFilter};
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
};
use trade_types::{
    CallContext, Canceled, Message, ProductId, RequestedTrading, Trade,
};

/// Producer lifecycle of a trade
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProducerPhase {
    Listening,
    Accepting,
    AwaitingDeposit,
    AwaitingWindowStart,
    Streaming,
    Settling,
    Done,
}

/// Sells the products of a set of sensors
///
/// Every trading request runs as its own task. The published phase is the
/// latest transition of any of them.
#[derive(Clone)]
pub struct ProducerCoordinator {
    ledger: Arc<dyn LedgerGateway>,
    transport: EncryptedTransport,
    keystore: Arc<Keystore>,
    passphrase: Arc<str>,
    sensors: Arc<HashMap<ProductId, Arc<SensorSource>>>,
    config: ProducerConfig,
    phase: Arc<watch::Sender<ProducerPhase>>,
}

impl ProducerCoordinator {
    /// Create a new producer coordinator serving `sensors`
    pub fn new(
        ledger: Arc<dyn LedgerGateway>,
        transport: EncryptedTransport,
        keystore: Arc<Keystore>,
        passphrase: &str,
        sensors: Vec<Arc<SensorSource>>,
        config: ProducerConfig,
    ) -> Self {
        let (phase, _) = watch::channel(ProducerPhase::Listening);
        let sensors: HashMap<_, _> = sensors.into_iter().map(|s| (s.id(), s)).collect();
        Self {
            ledger,
            transport,
            keystore,
            passphrase: Arc::from(passphrase),
            sensors: Arc::new(sensors),
            config,
            phase: Arc::new(phase),
        }
    }

    pub fn phase(&self) -> watch::Receiver<ProducerPhase> {
        self.phase.subscribe()
    }

    fn enter(&self, trade: Option<&Trade>, next: ProducerPhase) {
        transition(&*self.phase, "Producer", trade.map(|t| t.id), next);
    }

    /// Subscribe to trading requests for the served products
    pub async fn subscribe(&self) -> Result<EventStream<RequestedTrading>, CoordinatorError> {
        if self.sensors.is_empty() {
            return Err(CoordinatorError::NoMatch("sensor"));
        }
        let filter = RequestedTradingFilter {
            requesters: Vec::new(),
            products: self.sensors.keys().copied().collect(),
        };
        Ok(self.ledger.watch_requested_trading(filter).await?)
    }

    /// Serve trading requests until `cx` is cancelled or the subscription fails
    pub async fn listen(&self, cx: &CallContext) -> Result<(), CoordinatorError> {
        let requests = self.subscribe().await?;
        self.serve(cx, requests).await
    }

    /// Serve requests from an existing subscription
    ///
    /// Trades already in progress keep running when the subscription fails;
    /// they only stop once `cx` is cancelled.
    pub async fn serve(
        &self,
        cx: &CallContext,
        mut requests: EventStream<RequestedTrading>,
    ) -> Result<(), CoordinatorError> {
        self.enter(None, ProducerPhase::Listening);
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                event = requests.next_in(cx) => {
                    let event = match event {
                        Ok(event) => event,
                        Err(e) => {
                            sessions.detach_all();
                            return Err(e.into());
                        }
                    };
                    tracing::info!(
                        "Trading request {} for product {} from {}",
                        event.request,
                        event.product,
                        event.requester
                    );
                    let producer = self.clone();
                    let cx = cx.child();
                    sessions.spawn(async move {
                        let request = event.request;
                        match producer.handle_request(&cx, event).await {
                            Ok(outcome) => tracing::info!(
                                trade_id = %outcome.trade_id,
                                "Trade completed with {} messages",
                                outcome.delivered
                            ),
                            Err(e) => tracing::error!("Trade for request {} failed: {}", request, e),
                        }
                    });
                }
                Some(joined) = sessions.join_next() => {
                    if let Err(e) = joined {
                        tracing::error!("Trade task panicked: {}", e);
                    }
                }
            }
        }
    }

    /// Run one trade from acceptance to settlement
    pub async fn handle_request(
        &self,
        cx: &CallContext,
        event: RequestedTrading,
    ) -> Result<TradeOutcome, CoordinatorError> {
        let sensor = self
            .sensors
            .get(&event.product)
            .cloned()
            .ok_or(CoordinatorError::UnknownProduct(event.product))?;

        self.enter(None, ProducerPhase::Accepting);
        let mut accepted = self
            .ledger
            .watch_accepted_trading_request(vec![event.request])
            .await?;
        let mut deposits = self
            .ledger
            .watch_deposited(vec![self.keystore.account().clone()])
            .await?;
        {
            let credential = self.keystore.unlock(&self.passphrase).await?;
            self.ledger
                .accept_trading_request(&credential, event.request)
                .await?;
        }
        let trade_id = accepted.next_in(cx).await?.trade;
        let trade = self.ledger.find_trade(trade_id).await?;

        self.enter(Some(&trade), ProducerPhase::AwaitingDeposit);
        let deposit_cx = match self.config.deposit_timeout {
            Some(timeout) => cx.with_timeout(timeout),
            None => cx.clone(),
        };
        let deposit = deposits
            .next_matching(&deposit_cx, |d| d.settlement == trade.settlement)
            .await;
        match deposit {
            Ok(deposit) => {
                tracing::info!(trade_id = %trade.id, "Received deposit of {}", deposit.value);
            }
            Err(LedgerError::Canceled(Canceled::DeadlineExceeded)) if cx.check().is_ok() => {
                return Err(CoordinatorError::DepositTimeout(trade.id));
            }
            Err(e) => return Err(e.into()),
        }

        let device = self.ledger.find_device(&trade.consumer).await?;
        let recipient = PublicKey::from_sec1_bytes(&device.public_key).map_err(|source| {
            CoordinatorError::DeviceKey {
                device: device.address.clone(),
                source,
            }
        })?;
        let broker = self.ledger.find_broker(&trade.broker).await?;

        self.enter(Some(&trade), ProducerPhase::AwaitingWindowStart);
        await_window_start(cx, &trade.window).await?;

        self.enter(Some(&trade), ProducerPhase::Streaming);
        let pushed = self
            .stream(cx, &trade, &sensor, &recipient, &broker.endpoint)
            .await?;

        self.enter(Some(&trade), ProducerPhase::Settling);
        {
            let credential = self.keystore.unlock(&self.passphrase).await?;
            self.ledger
                .settle_trade(&credential, &trade.settlement, pushed)
                .await?;
        }

        self.enter(Some(&trade), ProducerPhase::Done);
        Ok(TradeOutcome {
            trade_id: trade.id,
            delivered: pushed,
        })
    }

    /// Push sensor measurements until the window closes
    async fn stream(
        &self,
        cx: &CallContext,
        trade: &Trade,
        sensor: &SensorSource,
        recipient: &PublicKey,
        endpoint: &str,
    ) -> Result<u64, CoordinatorError> {
        let window_cx = cx.with_deadline(trade.window.end_instant());
        let (tx, mut rx) = mpsc::channel(MEASUREMENT_BUFFER);
        sensor.attach(tx.clone());

        let mut pushed = 0u64;
        while let Ok(Some(value)) = window_cx.run(rx.recv()).await {
            let message = Message::new(trade.id, encode_measurement(value));
            match self
                .transport
                .encrypt_and_push(&window_cx, endpoint, recipient, message)
                .await
            {
                Ok(counter) => {
                    pushed += 1;
                    tracing::debug!(trade_id = %trade.id, "Pushed measurement {} (relay counter {})", value, counter);
                }
                Err(e) if e.is_canceled() => break,
                Err(e) => {
                    tracing::warn!(trade_id = %trade.id, op = "encrypt_and_push", "Push failed: {}", e);
                }
            }
        }

        if let Err(e) = sensor.detach(&tx) {
            tracing::warn!(trade_id = %trade.id, "Detaching from sensor failed: {}", e);
        }
        cx.check()?;
        tracing::info!(trade_id = %trade.id, "Window closed after {} pushes", pushed);
        Ok(pushed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{crypto::generate_keypair, SensorConfig};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use ledger_gateway::InMemoryLedger;
    use parking_lot::Mutex;
    use std::time::Duration;
    use trade_relay::{LocalTransport, MessageRelay, RelayConnection, Transport, TransportError};
    use trade_types::{Address, RequestId, TradeId, TradeWindow};

    /// Records when each push was issued
    struct RecordingTransport {
        inner: LocalTransport,
        pushes: Arc<Mutex<Vec<DateTime<Utc>>>>,
    }

    struct RecordingConnection {
        inner: Box<dyn RelayConnection>,
        pushes: Arc<Mutex<Vec<DateTime<Utc>>>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn connect(
            &self,
            cx: &CallContext,
            endpoint: &str,
        ) -> Result<Box<dyn RelayConnection>, TransportError> {
            Ok(Box::new(RecordingConnection {
                inner: self.inner.connect(cx, endpoint).await?,
                pushes: self.pushes.clone(),
            }))
        }
    }

    #[async_trait]
    impl RelayConnection for RecordingConnection {
        async fn push(&mut self, cx: &CallContext, message: Message) -> Result<u64, TransportError> {
            self.pushes.lock().push(Utc::now());
            self.inner.push(cx, message).await
        }

        async fn pull(&mut self, cx: &CallContext, trade_id: TradeId) -> Result<Message, TransportError> {
            self.inner.pull(cx, trade_id).await
        }

        async fn counter(&mut self, cx: &CallContext, trade_id: TradeId) -> Result<u64, TransportError> {
            self.inner.counter(cx, trade_id).await
        }

        async fn watch(
            self: Box<Self>,
            trade_id: TradeId,
        ) -> Result<mpsc::Receiver<u64>, TransportError> {
            self.inner.watch(trade_id).await
        }
    }

    fn trade(window: TradeWindow) -> Trade {
        Trade {
            id: TradeId(1),
            request: RequestId(1),
            provider: Address::from("provider"),
            consumer: Address::from("consumer"),
            broker: Address::from("broker"),
            product: ProductId(1),
            window,
            cost: 1,
            settlement: Address::from("settlement-1"),
        }
    }

    #[tokio::test]
    async fn test_pushes_stay_inside_window() {
        let (provider_key, _) = generate_keypair();
        let (_, consumer_public) = generate_keypair();
        let relay = Arc::new(MessageRelay::default());
        let pushes = Arc::new(Mutex::new(Vec::new()));
        let transport = RecordingTransport {
            inner: LocalTransport::new().with_relay("relay", relay.clone()),
            pushes: pushes.clone(),
        };

        let sensor = Arc::new(
            SensorSource::new(SensorConfig {
                id: ProductId(1),
                min: 0,
                max: 10,
                frequency: Duration::from_millis(50),
                timeout: Duration::from_millis(20),
            })
            .unwrap(),
        );
        let runner = {
            let sensor = sensor.clone();
            tokio::spawn(async move { sensor.run().await })
        };

        let producer = ProducerCoordinator::new(
            Arc::new(InMemoryLedger::new()),
            EncryptedTransport::new(Arc::new(transport), Arc::new(provider_key)),
            Arc::new(Keystore::new(Address::from("provider"), "p")),
            "p",
            vec![sensor.clone()],
            ProducerConfig::default(),
        );

        // The sensor is already ticking while the window has not opened
        let window = TradeWindow::starting_in(Duration::from_millis(500), Duration::from_secs(1));
        let trade = trade(window);
        let cx = CallContext::new();

        await_window_start(&cx, &trade.window).await.unwrap();
        assert_eq!(relay.find_counter(trade.id), 0);
        let pushed = producer
            .stream(&cx, &trade, &sensor, &consumer_public, "relay")
            .await
            .unwrap();
        let finished = Utc::now();

        assert!(pushed > 0);
        assert_eq!(relay.find_counter(trade.id), pushed);
        assert_eq!(sensor.subscriber_count(), 0);

        let pushes = pushes.lock();
        assert_eq!(pushes.len() as u64, pushed);
        let slack = chrono::Duration::milliseconds(10);
        assert!(pushes.iter().all(|at| *at >= window.start && *at < window.end + slack));
        assert!(finished >= window.end - slack);
        assert!(finished < window.end + chrono::Duration::milliseconds(500));

        sensor.stop();
        runner.await.unwrap();
    }
}
