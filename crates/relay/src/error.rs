//! Relay and transport errors

use thiserror::Error;
use trade_types::{Canceled, TradeId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error(transparent)]
    Canceled(#[from] Canceled),

    #[error("queue of trade {0} is closed")]
    QueueClosed(TradeId),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("codec error: {0}")]
    Codec(#[from] borsh::io::Error),

    #[error("relay returned an error: {0}")]
    Remote(String),

    #[error("unexpected response to {0}")]
    UnexpectedResponse(&'static str),

    #[error("connection closed")]
    ConnectionClosed,

    #[error(transparent)]
    Canceled(#[from] Canceled),
}

impl From<RelayError> for TransportError {
    fn from(error: RelayError) -> Self {
        match error {
            RelayError::Canceled(reason) => Self::Canceled(reason),
            other => Self::Remote(other.to_string()),
        }
    }
}
