//! Ledger events observed by the engine

use crate::{Address, ProductId, RequestId, TradeId};
use serde::{Deserialize, Serialize};

/// A consumer requested to buy a product
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedTrading {
    pub request: RequestId,
    pub requester: Address,
    pub product: ProductId,
}

/// The provider accepted a trading request; the ledger created `trade`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedTradingRequest {
    pub request: RequestId,
    pub trade: TradeId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclinedTradingRequest {
    pub request: RequestId,
}

/// A trade brokered by `broker` was created
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedTrade {
    pub trade: TradeId,
    pub broker: Address,
}

/// Funds were deposited into a settlement for `payee`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposited {
    pub settlement: Address,
    pub payee: Address,
    pub value: u64,
}

/// A party submitted its delivery counter to a settlement
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSet {
    pub settlement: Address,
    pub setter: Address,
    pub counter: u64,
}

/// Provider and consumer counters disagree
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dispute {
    pub settlement: Address,
    pub provider_counter: u64,
    pub consumer_counter: u64,
}

/// The settlement paid out for `counter` delivered messages
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settled {
    pub settlement: Address,
    pub counter: u64,
}
