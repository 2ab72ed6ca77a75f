//! Ledger Gateway - trading, settlement and dispute operations on the ledger
//!
//! The ledger is the system of record for trades. This crate defines how the
//! engine talks to it:
//! - `LedgerGateway`: request/accept/settle operations and typed event watches
//! - `Keystore`: the signing credential, unlocked only for the scope of a call
//! - `InMemoryLedger`: a complete in-process ledger for tests and dev networks

pub mod credential;
pub mod error;
pub mod gateway;
pub mod memory;
pub mod stream;

pub use credential::{Credential, CredentialError, Keystore};
pub use error::LedgerError;
pub use gateway::{LedgerGateway, RequestedTradingFilter};
pub use memory::{InMemoryLedger, LedgerEvent, SettlementStatus, SettlementSummary};
pub use stream::EventStream;

/// Buffered events per watch before the producer side waits
pub const EVENT_BUFFER: usize = 64;
