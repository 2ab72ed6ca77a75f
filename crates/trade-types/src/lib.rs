//! Shared types for the trade session engine
//!
//! Type definitions shared by the ledger gateway, the message relay and the
//! producer/consumer coordinators. Ledger-owned entities (`Trade`,
//! `TradingRequest`, `Product`, ...) are read-only views here.

pub mod context;
pub mod events;
pub mod query;

pub use context::{CallContext, Canceled};
pub use events::*;
pub use query::{BrokerSearchQuery, ProductSearchQuery};

use borsh::{BorshDeserialize, BorshSerialize};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

/// Default number of undelivered messages a relay buffers per trade
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
            Serialize, Deserialize, BorshSerialize, BorshDeserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

id_type!(
    /// Trade identifier, assigned by the ledger when a trade is created
    TradeId
);
id_type!(
    /// Trading request identifier (a trade before it is accepted)
    RequestId
);
id_type!(
    /// Product identifier; one sensor source serves one product
    ProductId
);

/// Ledger account address
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A relayed message. The payload is ciphertext while on the relay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct Message {
    pub trade_id: TradeId,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(trade_id: TradeId, payload: Vec<u8>) -> Self {
        Self { trade_id, payload }
    }
}

/// Interval `[start, end)` during which data may be streamed for a trade
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TradeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Window opening `lead` from now and lasting `duration`
    pub fn starting_in(lead: Duration, duration: Duration) -> Self {
        let start = Utc::now() + to_delta(lead);
        Self {
            start,
            end: start + to_delta(duration),
        }
    }

    /// Time left until the window opens, `None` once it has opened
    pub fn until_start(&self) -> Option<Duration> {
        remaining(self.start)
    }

    /// Time left until the window closes, `None` once it has closed
    pub fn until_end(&self) -> Option<Duration> {
        remaining(self.end)
    }

    pub fn has_ended(&self) -> bool {
        self.until_end().is_none()
    }

    /// Window end as a tokio instant, usable as a deadline
    pub fn end_instant(&self) -> tokio::time::Instant {
        tokio::time::Instant::now() + self.until_end().unwrap_or_default()
    }

    pub fn duration(&self) -> Duration {
        (self.end - self.start).to_std().unwrap_or_default()
    }
}

fn to_delta(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

fn remaining(at: DateTime<Utc>) -> Option<Duration> {
    (at - Utc::now()).to_std().ok().filter(|d| !d.is_zero())
}

/// Broker (relay operator) location, as registered on the ledger
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Location {
    Br,
    Eune,
    #[default]
    Euw,
    Lan,
    Las,
    Na,
    Oce,
    Ru,
    Tr,
    Jp,
    Ph,
    Sg,
    Tw,
    Vn,
    Th,
    Kr,
    Cn,
}

/// Relay node registered on the ledger
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Broker {
    pub address: Address,
    pub name: String,
    /// host:port of the relay endpoint
    pub endpoint: String,
    pub location: Location,
}

/// Device registered on the ledger. Producers encrypt for its public key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub address: Address,
    pub name: String,
    /// SEC1-encoded public key
    pub public_key: Vec<u8>,
}

/// Data product offered by a producing device
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    /// Address of the producing device (the provider)
    pub device: Address,
    pub name: String,
    pub description: String,
    pub data_type: String,
    /// Measurements per minute
    pub frequency: u64,
    pub cost: u64,
}

/// Request of a consumer to buy a product over a window
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradingRequest {
    pub id: RequestId,
    pub product: ProductId,
    pub cost: u64,
    pub window: TradeWindow,
    pub consumer: Address,
    pub broker: Address,
}

/// Trade created by the ledger once a trading request is accepted
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub request: RequestId,
    pub provider: Address,
    pub consumer: Address,
    pub broker: Address,
    pub product: ProductId,
    pub window: TradeWindow,
    pub cost: u64,
    /// Settlement handle of this trade
    pub settlement: Address,
}
