//! Relay wire protocol
//!
//! One borsh-encoded `RelayRequest` per binary WebSocket frame, answered by
//! one `RelayResponse`. `Watch` turns the connection into a stream of
//! `CounterUpdate` frames until either side closes it.

use borsh::{BorshDeserialize, BorshSerialize};
use trade_types::{Message, TradeId};

/// Client to relay
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum RelayRequest {
    Push { message: Message },
    Pull { trade_id: TradeId },
    Counter { trade_id: TradeId },
    Watch { trade_id: TradeId },
}

/// Relay to client
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum RelayResponse {
    /// Message queued; delivery counter after the push
    Pushed { counter: u64 },
    Message(Message),
    Counter { trade_id: TradeId, value: u64 },
    CounterUpdate { trade_id: TradeId, value: u64 },
    Error { message: String },
}

impl RelayRequest {
    pub fn to_bytes(&self) -> Result<Vec<u8>, borsh::io::Error> {
        borsh::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, borsh::io::Error> {
        borsh::from_slice(data)
    }

    /// Operation name for logs
    pub fn op(&self) -> &'static str {
        match self {
            Self::Push { .. } => "push",
            Self::Pull { .. } => "pull",
            Self::Counter { .. } => "counter",
            Self::Watch { .. } => "watch",
        }
    }
}

impl RelayResponse {
    pub fn to_bytes(&self) -> Result<Vec<u8>, borsh::io::Error> {
        borsh::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, borsh::io::Error> {
        borsh::from_slice(data)
    }
}
