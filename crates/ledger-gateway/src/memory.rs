//! In-memory ledger
//!
//! Full `LedgerGateway` implementation kept in process memory. Settlement
//! follows the on-chain settlement rules:
//! - the consumer deposits into the trade's settlement
//! - provider and consumer each submit a delivery counter once
//! - equal counters settle the trade, different counters open a dispute
//! - the broker resolves a dispute with its own counter
//! - after the window ends anyone involved may settle with the counters set so far

use crate::{Credential, EventStream, LedgerError, LedgerGateway, RequestedTradingFilter, EVENT_BUFFER};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use trade_types::{
    AcceptedTradingRequest, Address, Broker, BrokerSearchQuery, CounterSet, CreatedTrade,
    DeclinedTradingRequest, Deposited, Device, Dispute, Product, ProductId, ProductSearchQuery,
    RequestId, RequestedTrading, Settled, Trade, TradeId, TradeWindow, TradingRequest,
};

/// Capacity of the ledger-wide event bus
const EVENT_BUS_CAPACITY: usize = 1024;

/// Every event the ledger emits
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerEvent {
    RequestedTrading(RequestedTrading),
    Accepted(AcceptedTradingRequest),
    Declined(DeclinedTradingRequest),
    CreatedTrade(CreatedTrade),
    Deposited(Deposited),
    CounterSet(CounterSet),
    Dispute(Dispute),
    Settled(Settled),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RequestStatus {
    Pending,
    Accepted,
    Declined,
}

/// Settlement lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettlementStatus {
    Open,
    Disputed,
    Settled { counter: u64 },
}

/// Snapshot of a trade's settlement
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SettlementSummary {
    pub trade: TradeId,
    pub deposited: u64,
    pub provider_counter: Option<u64>,
    pub consumer_counter: Option<u64>,
    pub status: SettlementStatus,
}

#[derive(Default)]
struct LedgerState {
    brokers: BTreeMap<Address, Broker>,
    devices: BTreeMap<Address, Device>,
    products: BTreeMap<ProductId, Product>,
    requests: BTreeMap<RequestId, (TradingRequest, RequestStatus)>,
    trades: BTreeMap<TradeId, Trade>,
    settlements: BTreeMap<Address, SettlementSummary>,
    next_request: u64,
    next_trade: u64,
}

impl LedgerState {
    fn trade_for(&self, settlement: &Address) -> Result<(&Trade, &SettlementSummary), LedgerError> {
        let summary = self
            .settlements
            .get(settlement)
            .ok_or_else(|| LedgerError::not_found("settlement", settlement))?;
        let trade = self
            .trades
            .get(&summary.trade)
            .ok_or_else(|| LedgerError::not_found("trade", summary.trade))?;
        Ok((trade, summary))
    }

    fn settlement_mut(&mut self, settlement: &Address) -> Result<&mut SettlementSummary, LedgerError> {
        self.settlements
            .get_mut(settlement)
            .ok_or_else(|| LedgerError::not_found("settlement", settlement))
    }
}

/// Ledger kept in process memory
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
    events: broadcast::Sender<LedgerEvent>,
}

impl InMemoryLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            state: Mutex::new(LedgerState::default()),
            events,
        }
    }

    // ============ Registration ============

    pub fn register_broker(&self, broker: Broker) {
        tracing::info!("Registered broker {} at {}", broker.address, broker.endpoint);
        self.state.lock().brokers.insert(broker.address.clone(), broker);
    }

    pub fn register_device(&self, device: Device) {
        tracing::info!("Registered device {}", device.address);
        self.state.lock().devices.insert(device.address.clone(), device);
    }

    /// Register a product of an already registered device
    pub fn register_product(&self, product: Product) -> Result<(), LedgerError> {
        let mut state = self.state.lock();
        if !state.devices.contains_key(&product.device) {
            return Err(LedgerError::not_found("device", &product.device));
        }
        if state.products.contains_key(&product.id) {
            return Err(LedgerError::InvalidState(format!(
                "product {} already registered",
                product.id
            )));
        }
        tracing::info!("Registered product {} of device {}", product.id, product.device);
        state.products.insert(product.id, product);
        Ok(())
    }

    /// Current state of a settlement
    pub fn settlement(&self, settlement: &Address) -> Option<SettlementSummary> {
        self.state.lock().settlements.get(settlement).cloned()
    }

    /// Raw subscription to every ledger event
    pub fn subscribe_all(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: LedgerEvent) {
        tracing::debug!(?event, "Ledger event");
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Subscribe now and forward the events `pick` selects into a stream
    fn watch<T, F>(&self, mut pick: F) -> EventStream<T>
    where
        T: Send + 'static,
        F: FnMut(LedgerEvent) -> Option<T> + Send + 'static,
    {
        let mut rx = self.events.subscribe();
        let (tx, stream) = EventStream::channel(EVENT_BUFFER);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    event = rx.recv() => match event {
                        Ok(event) => {
                            let Some(item) = pick(event) else { continue };
                            if tx.send(Ok(item)).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            let error = LedgerError::Subscription(format!("lagged behind by {missed} events"));
                            let _ = tx.send(Err(error)).await;
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        stream
    }

    /// Turn a pending request into a trade, emitting acceptance and creation
    fn open_trade(&self, state: &mut LedgerState, id: RequestId) -> Result<TradeId, LedgerError> {
        let provider = provider_of(state, id)?;
        let (request, status) = state
            .requests
            .get_mut(&id)
            .ok_or_else(|| LedgerError::not_found("trading request", id))?;
        if *status != RequestStatus::Pending {
            return Err(LedgerError::InvalidState(format!(
                "trading request {id} is {status:?}"
            )));
        }
        *status = RequestStatus::Accepted;
        let request = request.clone();

        state.next_trade += 1;
        let trade_id = TradeId(state.next_trade);
        let settlement = Address::new(format!("settlement-{trade_id}"));
        let trade = Trade {
            id: trade_id,
            request: request.id,
            provider,
            consumer: request.consumer.clone(),
            broker: request.broker.clone(),
            product: request.product,
            window: request.window,
            cost: request.cost,
            settlement: settlement.clone(),
        };

        state.settlements.insert(
            settlement,
            SettlementSummary {
                trade: trade_id,
                deposited: 0,
                provider_counter: None,
                consumer_counter: None,
                status: SettlementStatus::Open,
            },
        );
        state.trades.insert(trade_id, trade);

        tracing::info!("Created trade {} for request {}", trade_id, id);
        self.emit(LedgerEvent::Accepted(AcceptedTradingRequest {
            request: id,
            trade: trade_id,
        }));
        self.emit(LedgerEvent::CreatedTrade(CreatedTrade {
            trade: trade_id,
            broker: request.broker,
        }));
        Ok(trade_id)
    }

    fn settle(&self, summary: &mut SettlementSummary, settlement: &Address, counter: u64) {
        summary.status = SettlementStatus::Settled { counter };
        tracing::info!("Settled trade {} with counter {}", summary.trade, counter);
        self.emit(LedgerEvent::Settled(Settled {
            settlement: settlement.clone(),
            counter,
        }));
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn unauthorized(credential: &Credential<'_>, action: &'static str) -> LedgerError {
    LedgerError::Unauthorized {
        account: credential.account().clone(),
        action,
    }
}

fn any_or_contains<T: PartialEq>(list: &[T], value: &T) -> bool {
    list.is_empty() || list.contains(value)
}

#[async_trait]
impl LedgerGateway for InMemoryLedger {
    async fn search_brokers(&self, query: &BrokerSearchQuery) -> Result<Vec<Broker>, LedgerError> {
        let state = self.state.lock();
        Ok(state.brokers.values().filter(|b| query.matches(b)).cloned().collect())
    }

    async fn search_products(&self, query: &ProductSearchQuery) -> Result<Vec<Product>, LedgerError> {
        let state = self.state.lock();
        Ok(state.products.values().filter(|p| query.matches(p)).cloned().collect())
    }

    async fn find_trade(&self, id: TradeId) -> Result<Trade, LedgerError> {
        self.state
            .lock()
            .trades
            .get(&id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("trade", id))
    }

    async fn find_trading_request(&self, id: RequestId) -> Result<TradingRequest, LedgerError> {
        self.state
            .lock()
            .requests
            .get(&id)
            .map(|(request, _)| request.clone())
            .ok_or_else(|| LedgerError::not_found("trading request", id))
    }

    async fn find_broker(&self, address: &Address) -> Result<Broker, LedgerError> {
        self.state
            .lock()
            .brokers
            .get(address)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("broker", address))
    }

    async fn find_device(&self, address: &Address) -> Result<Device, LedgerError> {
        self.state
            .lock()
            .devices
            .get(address)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("device", address))
    }

    async fn request_trading(
        &self,
        credential: &Credential<'_>,
        product: ProductId,
        broker: &Address,
        window: TradeWindow,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock();
        let cost = state
            .products
            .get(&product)
            .map(|p| p.cost)
            .ok_or_else(|| LedgerError::not_found("product", product))?;
        if !state.brokers.contains_key(broker) {
            return Err(LedgerError::not_found("broker", broker));
        }

        state.next_request += 1;
        let id = RequestId(state.next_request);
        let request = TradingRequest {
            id,
            product,
            cost,
            window,
            consumer: credential.account().clone(),
            broker: broker.clone(),
        };
        state.requests.insert(id, (request, RequestStatus::Pending));

        tracing::info!("Trading request {} for product {} by {}", id, product, credential.account());
        self.emit(LedgerEvent::RequestedTrading(RequestedTrading {
            request: id,
            requester: credential.account().clone(),
            product,
        }));
        Ok(())
    }

    async fn accept_trading_request(
        &self,
        credential: &Credential<'_>,
        id: RequestId,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock();
        let provider = provider_of(&state, id)?;
        if &provider != credential.account() {
            return Err(unauthorized(credential, "accept trading request"));
        }
        self.open_trade(&mut state, id).map(|_| ())
    }

    async fn decline_trading_request(
        &self,
        credential: &Credential<'_>,
        id: RequestId,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock();
        let provider = provider_of(&state, id)?;
        if &provider != credential.account() {
            return Err(unauthorized(credential, "decline trading request"));
        }

        let Some((_, status)) = state.requests.get_mut(&id) else {
            return Err(LedgerError::not_found("trading request", id));
        };
        if *status != RequestStatus::Pending {
            return Err(LedgerError::InvalidState(format!(
                "trading request {id} is {status:?}"
            )));
        }
        *status = RequestStatus::Declined;

        tracing::info!("Declined trading request {}", id);
        self.emit(LedgerEvent::Declined(DeclinedTradingRequest { request: id }));
        Ok(())
    }

    async fn create_trade(
        &self,
        credential: &Credential<'_>,
        id: RequestId,
    ) -> Result<TradeId, LedgerError> {
        let mut state = self.state.lock();
        let provider = provider_of(&state, id)?;
        let broker = state
            .requests
            .get(&id)
            .map(|(request, _)| request.broker.clone())
            .ok_or_else(|| LedgerError::not_found("trading request", id))?;
        if &provider != credential.account() && &broker != credential.account() {
            return Err(unauthorized(credential, "create trade"));
        }
        self.open_trade(&mut state, id)
    }

    async fn deposit(
        &self,
        credential: &Credential<'_>,
        settlement: &Address,
        value: u64,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock();
        let (trade, summary) = state.trade_for(settlement)?;
        if &trade.consumer != credential.account() {
            return Err(unauthorized(credential, "deposit"));
        }
        if summary.status != SettlementStatus::Open {
            return Err(LedgerError::InvalidState(format!(
                "settlement {settlement} is {:?}",
                summary.status
            )));
        }
        let payee = trade.provider.clone();

        let summary = state.settlement_mut(settlement)?;
        summary.deposited = summary.deposited.saturating_add(value);

        tracing::info!("Deposited {} into {}", value, settlement);
        self.emit(LedgerEvent::Deposited(Deposited {
            settlement: settlement.clone(),
            payee,
            value,
        }));
        Ok(())
    }

    async fn settle_trade(
        &self,
        credential: &Credential<'_>,
        settlement: &Address,
        counter: u64,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock();
        let (trade, _) = state.trade_for(settlement)?;
        let is_provider = &trade.provider == credential.account();
        if !is_provider && &trade.consumer != credential.account() {
            return Err(unauthorized(credential, "settle trade"));
        }

        let summary = state.settlement_mut(settlement)?;
        if summary.status != SettlementStatus::Open {
            return Err(LedgerError::InvalidState(format!(
                "settlement {settlement} is {:?}",
                summary.status
            )));
        }
        let slot = if is_provider {
            &mut summary.provider_counter
        } else {
            &mut summary.consumer_counter
        };
        if slot.is_some() {
            return Err(LedgerError::InvalidState(format!(
                "counter of {} already set on {settlement}",
                credential.account()
            )));
        }
        *slot = Some(counter);

        tracing::info!("Counter {} set on {} by {}", counter, settlement, credential.account());
        self.emit(LedgerEvent::CounterSet(CounterSet {
            settlement: settlement.clone(),
            setter: credential.account().clone(),
            counter,
        }));

        if let (Some(provider_counter), Some(consumer_counter)) =
            (summary.provider_counter, summary.consumer_counter)
        {
            if provider_counter == consumer_counter {
                self.settle(summary, settlement, provider_counter);
            } else {
                summary.status = SettlementStatus::Disputed;
                tracing::warn!(
                    "Dispute on {}: provider {} consumer {}",
                    settlement,
                    provider_counter,
                    consumer_counter
                );
                self.emit(LedgerEvent::Dispute(Dispute {
                    settlement: settlement.clone(),
                    provider_counter,
                    consumer_counter,
                }));
            }
        }
        Ok(())
    }

    async fn resolve_dispute(
        &self,
        credential: &Credential<'_>,
        settlement: &Address,
        counter: u64,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock();
        let (trade, _) = state.trade_for(settlement)?;
        if &trade.broker != credential.account() {
            return Err(unauthorized(credential, "resolve dispute"));
        }

        let summary = state.settlement_mut(settlement)?;
        if summary.status != SettlementStatus::Disputed {
            return Err(LedgerError::InvalidState(format!(
                "settlement {settlement} is not disputed"
            )));
        }
        self.settle(summary, settlement, counter);
        Ok(())
    }

    async fn resolve_timeout(
        &self,
        credential: &Credential<'_>,
        settlement: &Address,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock();
        let (trade, _) = state.trade_for(settlement)?;
        let account = credential.account();
        if ![&trade.provider, &trade.consumer, &trade.broker].contains(&account) {
            return Err(unauthorized(credential, "resolve timeout"));
        }
        if !trade.window.has_ended() {
            return Err(LedgerError::InvalidState(format!(
                "window of {settlement} has not ended"
            )));
        }

        let summary = state.settlement_mut(settlement)?;
        if summary.status != SettlementStatus::Open {
            return Err(LedgerError::InvalidState(format!(
                "settlement {settlement} is {:?}",
                summary.status
            )));
        }
        let counter = summary
            .provider_counter
            .or(summary.consumer_counter)
            .unwrap_or(0);
        self.settle(summary, settlement, counter);
        Ok(())
    }

    async fn watch_requested_trading(
        &self,
        filter: RequestedTradingFilter,
    ) -> Result<EventStream<RequestedTrading>, LedgerError> {
        Ok(self.watch(move |event| match event {
            LedgerEvent::RequestedTrading(e) if filter.matches(&e) => Some(e),
            _ => None,
        }))
    }

    async fn watch_accepted_trading_request(
        &self,
        ids: Vec<RequestId>,
    ) -> Result<EventStream<AcceptedTradingRequest>, LedgerError> {
        Ok(self.watch(move |event| match event {
            LedgerEvent::Accepted(e) if any_or_contains(&ids, &e.request) => Some(e),
            _ => None,
        }))
    }

    async fn watch_declined_trading_request(
        &self,
        ids: Vec<RequestId>,
    ) -> Result<EventStream<DeclinedTradingRequest>, LedgerError> {
        Ok(self.watch(move |event| match event {
            LedgerEvent::Declined(e) if any_or_contains(&ids, &e.request) => Some(e),
            _ => None,
        }))
    }

    async fn watch_created_trade(
        &self,
        brokers: Vec<Address>,
    ) -> Result<EventStream<CreatedTrade>, LedgerError> {
        Ok(self.watch(move |event| match event {
            LedgerEvent::CreatedTrade(e) if any_or_contains(&brokers, &e.broker) => Some(e),
            _ => None,
        }))
    }

    async fn watch_deposited(
        &self,
        payees: Vec<Address>,
    ) -> Result<EventStream<Deposited>, LedgerError> {
        Ok(self.watch(move |event| match event {
            LedgerEvent::Deposited(e) if any_or_contains(&payees, &e.payee) => Some(e),
            _ => None,
        }))
    }

    async fn watch_counter_set(
        &self,
        settlement: &Address,
        setters: Vec<Address>,
    ) -> Result<EventStream<CounterSet>, LedgerError> {
        let settlement = settlement.clone();
        Ok(self.watch(move |event| match event {
            LedgerEvent::CounterSet(e)
                if e.settlement == settlement && any_or_contains(&setters, &e.setter) =>
            {
                Some(e)
            }
            _ => None,
        }))
    }

    async fn watch_settled(&self, settlement: &Address) -> Result<EventStream<Settled>, LedgerError> {
        let settlement = settlement.clone();
        Ok(self.watch(move |event| match event {
            LedgerEvent::Settled(e) if e.settlement == settlement => Some(e),
            _ => None,
        }))
    }

    async fn watch_dispute(&self, settlement: &Address) -> Result<EventStream<Dispute>, LedgerError> {
        let settlement = settlement.clone();
        Ok(self.watch(move |event| match event {
            LedgerEvent::Dispute(e) if e.settlement == settlement => Some(e),
            _ => None,
        }))
    }
}

fn provider_of(state: &LedgerState, id: RequestId) -> Result<Address, LedgerError> {
    let (request, _) = state
        .requests
        .get(&id)
        .ok_or_else(|| LedgerError::not_found("trading request", id))?;
    state
        .products
        .get(&request.product)
        .map(|p| p.device.clone())
        .ok_or_else(|| LedgerError::not_found("product", request.product))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Keystore;
    use std::time::Duration;
    use trade_types::{CallContext, Location};

    struct Fixture {
        ledger: InMemoryLedger,
        consumer: Keystore,
        provider: Keystore,
        broker: Keystore,
    }

    fn fixture() -> Fixture {
        let ledger = InMemoryLedger::new();
        ledger.register_broker(Broker {
            address: Address::from("broker"),
            name: "relay-1".to_string(),
            endpoint: "relay-1".to_string(),
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
                name: "temperature".to_string(),
                description: String::new(),
                data_type: "temperature".to_string(),
                frequency: 60,
                cost: 10,
            })
            .unwrap();

        Fixture {
            ledger,
            consumer: Keystore::new(Address::from("consumer"), "c"),
            provider: Keystore::new(Address::from("provider"), "p"),
            broker: Keystore::new(Address::from("broker"), "b"),
        }
    }

    /// Request and accept a trade, returning it
    async fn open(f: &Fixture, window: TradeWindow) -> Trade {
        let mut requested = f
            .ledger
            .watch_requested_trading(RequestedTradingFilter::default())
            .await
            .unwrap();
        {
            let credential = f.consumer.unlock("c").await.unwrap();
            f.ledger
                .request_trading(&credential, ProductId(1), &Address::from("broker"), window)
                .await
                .unwrap();
        }
        let request = requested.next().await.unwrap().request;

        let mut accepted = f.ledger.watch_accepted_trading_request(vec![request]).await.unwrap();
        let credential = f.provider.unlock("p").await.unwrap();
        f.ledger.accept_trading_request(&credential, request).await.unwrap();
        let trade = accepted.next().await.unwrap().trade;
        f.ledger.find_trade(trade).await.unwrap()
    }

    fn future_window() -> TradeWindow {
        TradeWindow::starting_in(Duration::from_secs(1), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_equal_counters_settle() {
        let f = fixture();
        let trade = open(&f, future_window()).await;
        assert_eq!(trade.provider, Address::from("provider"));
        assert_eq!(trade.cost, 10);

        let mut settled = f.ledger.watch_settled(&trade.settlement).await.unwrap();
        let mut deposited = f
            .ledger
            .watch_deposited(vec![Address::from("provider")])
            .await
            .unwrap();

        {
            let credential = f.consumer.unlock("c").await.unwrap();
            f.ledger.deposit(&credential, &trade.settlement, 10).await.unwrap();
            f.ledger.settle_trade(&credential, &trade.settlement, 5).await.unwrap();
        }
        assert_eq!(deposited.next().await.unwrap().value, 10);

        {
            let credential = f.provider.unlock("p").await.unwrap();
            f.ledger.settle_trade(&credential, &trade.settlement, 5).await.unwrap();
        }

        let event = settled.next().await.unwrap();
        assert_eq!(event.counter, 5);
        let summary = f.ledger.settlement(&trade.settlement).unwrap();
        assert_eq!(summary.status, SettlementStatus::Settled { counter: 5 });
        assert_eq!(summary.deposited, 10);
    }

    #[tokio::test]
    async fn test_dispute_resolved_by_broker() {
        let f = fixture();
        let trade = open(&f, future_window()).await;
        let mut dispute = f.ledger.watch_dispute(&trade.settlement).await.unwrap();
        let mut settled = f.ledger.watch_settled(&trade.settlement).await.unwrap();

        {
            let credential = f.provider.unlock("p").await.unwrap();
            f.ledger.settle_trade(&credential, &trade.settlement, 7).await.unwrap();
        }
        {
            let credential = f.consumer.unlock("c").await.unwrap();
            f.ledger.settle_trade(&credential, &trade.settlement, 4).await.unwrap();

            let result = f.ledger.resolve_dispute(&credential, &trade.settlement, 4).await;
            assert!(matches!(result, Err(LedgerError::Unauthorized { .. })));
        }

        let event = dispute.next().await.unwrap();
        assert_eq!((event.provider_counter, event.consumer_counter), (7, 4));

        let credential = f.broker.unlock("b").await.unwrap();
        f.ledger.resolve_dispute(&credential, &trade.settlement, 6).await.unwrap();
        assert_eq!(settled.next().await.unwrap().counter, 6);

        let again = f.ledger.resolve_dispute(&credential, &trade.settlement, 6).await;
        assert!(matches!(again, Err(LedgerError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_counter_set_once() {
        let f = fixture();
        let trade = open(&f, future_window()).await;
        let credential = f.provider.unlock("p").await.unwrap();

        f.ledger.settle_trade(&credential, &trade.settlement, 1).await.unwrap();
        let result = f.ledger.settle_trade(&credential, &trade.settlement, 2).await;
        assert!(matches!(result, Err(LedgerError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_only_provider_accepts() {
        let f = fixture();
        let mut requested = f
            .ledger
            .watch_requested_trading(RequestedTradingFilter {
                requesters: vec![Address::from("consumer")],
                products: vec![ProductId(1)],
            })
            .await
            .unwrap();

        let credential = f.consumer.unlock("c").await.unwrap();
        f.ledger
            .request_trading(&credential, ProductId(1), &Address::from("broker"), future_window())
            .await
            .unwrap();
        let request = requested.next().await.unwrap().request;

        let result = f.ledger.accept_trading_request(&credential, request).await;
        assert!(matches!(result, Err(LedgerError::Unauthorized { .. })));
    }

    #[tokio::test]
    async fn test_decline() {
        let f = fixture();
        let mut declined = f.ledger.watch_declined_trading_request(Vec::new()).await.unwrap();
        {
            let credential = f.consumer.unlock("c").await.unwrap();
            f.ledger
                .request_trading(&credential, ProductId(1), &Address::from("broker"), future_window())
                .await
                .unwrap();
        }

        let credential = f.provider.unlock("p").await.unwrap();
        f.ledger.decline_trading_request(&credential, RequestId(1)).await.unwrap();
        assert_eq!(declined.next().await.unwrap().request, RequestId(1));

        let result = f.ledger.accept_trading_request(&credential, RequestId(1)).await;
        assert!(matches!(result, Err(LedgerError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_broker_creates_trade() {
        let f = fixture();
        let mut created = f
            .ledger
            .watch_created_trade(vec![Address::from("broker")])
            .await
            .unwrap();
        {
            let credential = f.consumer.unlock("c").await.unwrap();
            f.ledger
                .request_trading(&credential, ProductId(1), &Address::from("broker"), future_window())
                .await
                .unwrap();
        }

        let credential = f.broker.unlock("b").await.unwrap();
        let trade = f.ledger.create_trade(&credential, RequestId(1)).await.unwrap();
        assert_eq!(created.next().await.unwrap().trade, trade);
    }

    #[tokio::test]
    async fn test_resolve_timeout() {
        let f = fixture();
        let now = chrono::Utc::now();
        let window = TradeWindow::new(now - chrono::Duration::seconds(2), now - chrono::Duration::seconds(1));
        let trade = open(&f, window).await;

        let credential = f.provider.unlock("p").await.unwrap();
        f.ledger.settle_trade(&credential, &trade.settlement, 3).await.unwrap();
        f.ledger.resolve_timeout(&credential, &trade.settlement).await.unwrap();

        let summary = f.ledger.settlement(&trade.settlement).unwrap();
        assert_eq!(summary.status, SettlementStatus::Settled { counter: 3 });
    }

    #[tokio::test]
    async fn test_resolve_timeout_before_end() {
        let f = fixture();
        let trade = open(&f, future_window()).await;
        let credential = f.consumer.unlock("c").await.unwrap();

        let result = f.ledger.resolve_timeout(&credential, &trade.settlement).await;
        assert!(matches!(result, Err(LedgerError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_watch_filters_other_settlements() {
        let f = fixture();
        let first = open(&f, future_window()).await;
        let second = open(&f, future_window()).await;
        let mut counters = f
            .ledger
            .watch_counter_set(&second.settlement, vec![Address::from("provider")])
            .await
            .unwrap();

        let credential = f.provider.unlock("p").await.unwrap();
        f.ledger.settle_trade(&credential, &first.settlement, 1).await.unwrap();
        f.ledger.settle_trade(&credential, &second.settlement, 2).await.unwrap();

        let cx = CallContext::new().with_timeout(Duration::from_secs(1));
        let event = counters.next_in(&cx).await.unwrap();
        assert_eq!(event.settlement, second.settlement);
        assert_eq!(event.counter, 2);
    }

    #[tokio::test]
    async fn test_search() {
        let f = fixture();
        let brokers = f
            .ledger
            .search_brokers(&BrokerSearchQuery {
                locations: vec![Location::Na],
            })
            .await
            .unwrap();
        assert!(brokers.is_empty());

        let products = f
            .ledger
            .search_products(&ProductSearchQuery {
                data_type: "temperature".to_string(),
                max_cost: 20,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(products.len(), 1);
    }
}
