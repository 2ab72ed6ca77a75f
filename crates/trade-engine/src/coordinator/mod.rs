//! Trade coordinators
//!
//! Each side of a trade is a phase machine driven by ledger events. Phase
//! changes are published on a `watch` channel and logged with the trade id.
//! Every subscription to a ledger event is opened before the call that causes
//! the event.

pub mod consumer;
pub mod producer;

pub use consumer::{ConsumerCoordinator, ConsumerPhase};
pub use producer::{ProducerCoordinator, ProducerPhase};

use crate::crypto::CryptoError;
use ledger_gateway::{CredentialError, LedgerError};
use std::fmt::Debug;
use thiserror::Error;
use tokio::sync::watch;
use trade_types::{Address, CallContext, Canceled, ProductId, RequestId, TradeId, TradeWindow};

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("no matching {0} found")]
    NoMatch(&'static str),

    #[error("trading request {0} was declined")]
    Declined(RequestId),

    #[error("no sensor serves product {0}")]
    UnknownProduct(ProductId),

    #[error("deposit for trade {0} did not arrive in time")]
    DepositTimeout(TradeId),

    #[error("device {device} has an unusable public key: {source}")]
    DeviceKey {
        device: Address,
        #[source]
        source: CryptoError,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Canceled(#[from] Canceled),
}

impl CoordinatorError {
    pub fn is_canceled(&self) -> bool {
        matches!(
            self,
            Self::Canceled(_) | Self::Ledger(LedgerError::Canceled(_))
        )
    }
}

/// Result of a completed trade
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TradeOutcome {
    pub trade_id: TradeId,
    /// Messages pushed (producer) or pulled (consumer), as submitted for settlement
    pub delivered: u64,
}

fn transition<P: Copy + Debug>(
    phase: &watch::Sender<P>,
    role: &'static str,
    trade_id: Option<TradeId>,
    next: P,
) {
    phase.send_replace(next);
    match trade_id {
        Some(trade_id) => tracing::info!(trade_id = %trade_id, "{} entered {:?}", role, next),
        None => tracing::info!("{} entered {:?}", role, next),
    }
}

/// Sleep until the window opens; returns at once if it already has
async fn await_window_start(cx: &CallContext, window: &TradeWindow) -> Result<(), Canceled> {
    match window.until_start() {
        Some(wait) => cx.sleep(wait).await,
        None => cx.check(),
    }
}
