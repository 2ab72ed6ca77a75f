//! Ledger gateway trait

use crate::{Credential, EventStream, LedgerError};
use async_trait::async_trait;
use trade_types::{
    AcceptedTradingRequest, Address, Broker, BrokerSearchQuery, CounterSet, CreatedTrade,
    DeclinedTradingRequest, Deposited, Device, Dispute, Product, ProductId, ProductSearchQuery,
    RequestId, RequestedTrading, Settled, Trade, TradeWindow, TradingRequest, TradeId,
};

/// Filter for requested-trading events. Empty lists match everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestedTradingFilter {
    pub requesters: Vec<Address>,
    pub products: Vec<ProductId>,
}

impl RequestedTradingFilter {
    pub fn matches(&self, event: &RequestedTrading) -> bool {
        (self.requesters.is_empty() || self.requesters.contains(&event.requester))
            && (self.products.is_empty() || self.products.contains(&event.product))
    }
}

/// Operations the engine needs from the ledger
///
/// Mutating calls take an unlocked `Credential`; the signing account is the
/// credential's account. Every `watch_*` call is subscribed by the time it
/// returns, so events caused by calls made afterwards are never missed.
/// Empty filter lists match every event.
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    // ============ Queries ============

    async fn search_brokers(&self, query: &BrokerSearchQuery) -> Result<Vec<Broker>, LedgerError>;

    async fn search_products(&self, query: &ProductSearchQuery) -> Result<Vec<Product>, LedgerError>;

    async fn find_trade(&self, id: TradeId) -> Result<Trade, LedgerError>;

    async fn find_trading_request(&self, id: RequestId) -> Result<TradingRequest, LedgerError>;

    async fn find_broker(&self, address: &Address) -> Result<Broker, LedgerError>;

    async fn find_device(&self, address: &Address) -> Result<Device, LedgerError>;

    // ============ Transactions ============

    async fn request_trading(
        &self,
        credential: &Credential<'_>,
        product: ProductId,
        broker: &Address,
        window: TradeWindow,
    ) -> Result<(), LedgerError>;

    async fn accept_trading_request(
        &self,
        credential: &Credential<'_>,
        id: RequestId,
    ) -> Result<(), LedgerError>;

    async fn decline_trading_request(
        &self,
        credential: &Credential<'_>,
        id: RequestId,
    ) -> Result<(), LedgerError>;

    /// Create the trade for a pending request without a separate accept
    async fn create_trade(
        &self,
        credential: &Credential<'_>,
        id: RequestId,
    ) -> Result<TradeId, LedgerError>;

    async fn deposit(
        &self,
        credential: &Credential<'_>,
        settlement: &Address,
        value: u64,
    ) -> Result<(), LedgerError>;

    /// Submit the caller's delivery counter for a trade
    async fn settle_trade(
        &self,
        credential: &Credential<'_>,
        settlement: &Address,
        counter: u64,
    ) -> Result<(), LedgerError>;

    /// Resolve a dispute with the broker's counter
    async fn resolve_dispute(
        &self,
        credential: &Credential<'_>,
        settlement: &Address,
        counter: u64,
    ) -> Result<(), LedgerError>;

    /// Settle a trade whose window passed without both counters
    async fn resolve_timeout(
        &self,
        credential: &Credential<'_>,
        settlement: &Address,
    ) -> Result<(), LedgerError>;

    // ============ Watches ============

    async fn watch_requested_trading(
        &self,
        filter: RequestedTradingFilter,
    ) -> Result<EventStream<RequestedTrading>, LedgerError>;

    async fn watch_accepted_trading_request(
        &self,
        ids: Vec<RequestId>,
    ) -> Result<EventStream<AcceptedTradingRequest>, LedgerError>;

    async fn watch_declined_trading_request(
        &self,
        ids: Vec<RequestId>,
    ) -> Result<EventStream<DeclinedTradingRequest>, LedgerError>;

    async fn watch_created_trade(
        &self,
        brokers: Vec<Address>,
    ) -> Result<EventStream<CreatedTrade>, LedgerError>;

    async fn watch_deposited(
        &self,
        payees: Vec<Address>,
    ) -> Result<EventStream<Deposited>, LedgerError>;

    async fn watch_counter_set(
        &self,
        settlement: &Address,
        setters: Vec<Address>,
    ) -> Result<EventStream<CounterSet>, LedgerError>;

    async fn watch_settled(&self, settlement: &Address) -> Result<EventStream<Settled>, LedgerError>;

    async fn watch_dispute(&self, settlement: &Address) -> Result<EventStream<Dispute>, LedgerError>;
}
