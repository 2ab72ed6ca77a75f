//! Trade Relay - store-and-forward messaging between producer and consumer
//!
//! A relay node (the broker of a trade) runs:
//! - `MessageRelay`: one bounded FIFO queue plus delivery counter per trade
//! - `RelayServer`: the queues exposed over WebSocket (`protocol` frames)
//! - `DisputeReconciler`: settles disputes of brokered trades with the counter
//!
//! Clients reach a relay through a `Transport`: `WsTransport` for remote
//! relays, `LocalTransport` for relays in the same process.

pub mod error;
pub mod local;
pub mod protocol;
pub mod reconciler;
pub mod relay;
pub mod server;
pub mod transport;
pub mod ws;

pub use error::{RelayError, TransportError};
pub use local::LocalTransport;
pub use protocol::{RelayRequest, RelayResponse};
pub use reconciler::DisputeReconciler;
pub use relay::MessageRelay;
pub use server::RelayServer;
pub use transport::{RelayConnection, Transport};
pub use ws::WsTransport;
