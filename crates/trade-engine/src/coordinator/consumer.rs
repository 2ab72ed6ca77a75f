//! Consumer side of a trade

use super::{await_window_start, transition, CoordinatorError, TradeOutcome};
use crate::{crypto::decode_measurement, ConsumerConfig, EncryptedTransport};
use ledger_gateway::{Keystore, LedgerGateway, RequestedTradingFilter};
use std::sync::Arc;
use tokio::sync::watch;
use trade_types::{Broker, CallContext, Product, Trade};

/// Consumer lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumerPhase {
    Searching,
    RequestedTrade,
    WaitingAcceptance,
    Accepted,
    AwaitingWindowStart,
    Streaming,
    Settling,
    Done,
}

/// Buys one product for one window
pub struct ConsumerCoordinator {
    ledger: Arc<dyn LedgerGateway>,
    transport: EncryptedTransport,
    keystore: Arc<Keystore>,
    passphrase: String,
    config: ConsumerConfig,
    phase: watch::Sender<ConsumerPhase>,
}

impl ConsumerCoordinator {
    /// Create a new consumer coordinator
    pub fn new(
        ledger: Arc<dyn LedgerGateway>,
        transport: EncryptedTransport,
        keystore: Arc<Keystore>,
        passphrase: impl Into<String>,
        config: ConsumerConfig,
    ) -> Self {
        let (phase, _) = watch::channel(ConsumerPhase::Searching);
        Self {
            ledger,
            transport,
            keystore,
            passphrase: passphrase.into(),
            config,
            phase,
        }
    }

    /// Follow the phase of this consumer
    pub fn phase(&self) -> watch::Receiver<ConsumerPhase> {
        self.phase.subscribe()
    }

    fn enter(&self, trade: Option<&Trade>, next: ConsumerPhase) {
        transition(&self.phase, "Consumer", trade.map(|t| t.id), next);
    }

    /// Run one trade from discovery to settlement
    pub async fn run(&self, cx: &CallContext) -> Result<TradeOutcome, CoordinatorError> {
        self.enter(None, ConsumerPhase::Searching);
        let (broker, product) = self.discover().await?;
        tracing::info!(
            "Selected product {} ({}) via broker {}",
            product.id,
            product.name,
            broker.name
        );

        self.enter(None, ConsumerPhase::RequestedTrade);
        let trade = self.request(cx, &broker, &product).await?;

        self.enter(Some(&trade), ConsumerPhase::Accepted);
        let value = self.config.deposit.unwrap_or(trade.cost);
        {
            let credential = self.keystore.unlock(&self.passphrase).await?;
            self.ledger.deposit(&credential, &trade.settlement, value).await?;
        }
        tracing::info!(trade_id = %trade.id, "Deposited {}", value);

        self.enter(Some(&trade), ConsumerPhase::AwaitingWindowStart);
        await_window_start(cx, &trade.window).await?;

        self.enter(Some(&trade), ConsumerPhase::Streaming);
        let delivered = self.stream(cx, &trade, &broker.endpoint).await?;

        self.enter(Some(&trade), ConsumerPhase::Settling);
        {
            let credential = self.keystore.unlock(&self.passphrase).await?;
            self.ledger
                .settle_trade(&credential, &trade.settlement, delivered)
                .await?;
        }

        self.enter(Some(&trade), ConsumerPhase::Done);
        Ok(TradeOutcome {
            trade_id: trade.id,
            delivered,
        })
    }

    /// One discovery pass: first matching broker, first matching product
    async fn discover(&self) -> Result<(Broker, Product), CoordinatorError> {
        let broker = self
            .ledger
            .search_brokers(&self.config.broker_query)
            .await?
            .into_iter()
            .next()
            .ok_or(CoordinatorError::NoMatch("broker"))?;
        let product = self
            .ledger
            .search_products(&self.config.product_query)
            .await?
            .into_iter()
            .next()
            .ok_or(CoordinatorError::NoMatch("product"))?;
        Ok((broker, product))
    }

    /// Request the product and wait for the provider's answer
    async fn request(
        &self,
        cx: &CallContext,
        broker: &Broker,
        product: &Product,
    ) -> Result<Trade, CoordinatorError> {
        let filter = RequestedTradingFilter {
            requesters: vec![self.keystore.account().clone()],
            products: vec![product.id],
        };
        let mut requested = self.ledger.watch_requested_trading(filter).await?;
        let mut accepted = self.ledger.watch_accepted_trading_request(Vec::new()).await?;
        let mut declined = self.ledger.watch_declined_trading_request(Vec::new()).await?;

        {
            let credential = self.keystore.unlock(&self.passphrase).await?;
            self.ledger
                .request_trading(
                    &credential,
                    product.id,
                    &broker.address,
                    self.config.window.next_window(),
                )
                .await?;
        }
        let request = requested.next_in(cx).await?.request;
        tracing::info!("Trading request {} submitted", request);

        self.enter(None, ConsumerPhase::WaitingAcceptance);
        let trade_id = tokio::select! {
            event = accepted.next_matching(cx, |e| e.request == request) => event?.trade,
            event = declined.next_matching(cx, |e| e.request == request) => {
                event?;
                return Err(CoordinatorError::Declined(request));
            }
        };

        Ok(self.ledger.find_trade(trade_id).await?)
    }

    /// Pull until the window closes; returns the number of messages received
    pub(crate) async fn stream(
        &self,
        cx: &CallContext,
        trade: &Trade,
        endpoint: &str,
    ) -> Result<u64, CoordinatorError> {
        let window_cx = cx.with_deadline(trade.window.end_instant());
        let mut delivered = 0u64;

        while window_cx.check().is_ok() {
            match self.transport.decrypt_and_pull(&window_cx, endpoint, trade.id).await {
                Ok(message) => {
                    delivered += 1;
                    match decode_measurement(&message.payload) {
                        Ok(value) => tracing::debug!(trade_id = %trade.id, "Measurement {}: {}", delivered, value),
                        Err(e) => tracing::warn!(trade_id = %trade.id, "Undecodable measurement: {}", e),
                    }
                }
                Err(e) if e.is_canceled() => break,
                Err(e) => {
                    tracing::warn!(trade_id = %trade.id, op = "decrypt_and_pull", "Pull failed: {}", e);
                    if window_cx.sleep(self.config.pull_retry).await.is_err() {
                        break;
                    }
                }
            }
        }

        cx.check()?;
        tracing::info!(trade_id = %trade.id, "Window closed after {} messages", delivered);
        Ok(delivered)
    }
}
