//! Ledger gateway errors

use crate::credential::CredentialError;
use thiserror::Error;
use trade_types::{Address, Canceled};

#[derive(Error, Debug, Clone)]
pub enum LedgerError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("account {account} may not {action}")]
    Unauthorized { account: Address, action: &'static str },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("subscription failed: {0}")]
    Subscription(String),

    #[error("subscription closed")]
    SubscriptionClosed,

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Canceled(#[from] Canceled),
}

impl LedgerError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}
