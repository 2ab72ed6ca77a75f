//! Trade Engine - producer and consumer sides of a data trade
//!
//! - `SensorSource`: periodic measurements fanned out to attached channels
//! - `EncryptedTransport`: relay push/pull with end-to-end encryption
//! - `ConsumerCoordinator` / `ProducerCoordinator`: the trade lifecycle, from
//!   discovery through streaming to settlement on the ledger

pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod encrypted_transport;
pub mod sensor;

pub use config::{ConsumerConfig, ProducerConfig, WindowConfig};
pub use coordinator::{
    ConsumerCoordinator, ConsumerPhase, CoordinatorError, ProducerCoordinator, ProducerPhase,
    TradeOutcome,
};
pub use crypto::{generate_keypair, CryptoError, DecryptError, KeyProvider, PublicKey, SecretKey};
pub use encrypted_transport::{EncryptedTransport, EncryptedTransportError};
pub use sensor::{SensorConfig, SensorError, SensorSource};

/// Measurements buffered between a sensor and a streaming trade
pub const MEASUREMENT_BUFFER: usize = 16;
