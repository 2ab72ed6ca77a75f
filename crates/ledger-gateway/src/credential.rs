//! Signing credential with scoped unlock
//!
//! The keystore is shared by every task that sends ledger transactions. It is
//! unlocked for exactly one call at a time: `unlock` hands out a `Credential`
//! guard and dropping the guard locks the keystore again, on success and
//! error paths alike.

use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use trade_types::Address;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("wrong passphrase for account {0}")]
    WrongPassphrase(Address),
}

/// Passphrase-protected signing account
pub struct Keystore {
    account: Address,
    passphrase_digest: [u8; 32],
    /// Serializes unlocks; held by the live `Credential`
    access: Mutex<()>,
    unlocked: AtomicBool,
}

impl Keystore {
    /// Create a keystore for `account` protected by `passphrase`
    pub fn new(account: Address, passphrase: &str) -> Self {
        Self {
            account,
            passphrase_digest: digest(passphrase),
            access: Mutex::new(()),
            unlocked: AtomicBool::new(false),
        }
    }

    /// Account this keystore signs for
    pub fn account(&self) -> &Address {
        &self.account
    }

    /// Whether a credential is currently handed out
    pub fn is_unlocked(&self) -> bool {
        self.unlocked.load(Ordering::SeqCst)
    }

    /// Unlock the keystore for the lifetime of the returned guard
    ///
    /// Waits while another task holds the credential.
    pub async fn unlock(&self, passphrase: &str) -> Result<Credential<'_>, CredentialError> {
        let guard = self.access.lock().await;
        if digest(passphrase) != self.passphrase_digest {
            return Err(CredentialError::WrongPassphrase(self.account.clone()));
        }

        self.unlocked.store(true, Ordering::SeqCst);
        tracing::trace!(account = %self.account, "Unlocked keystore");

        Ok(Credential {
            keystore: self,
            _access: guard,
        })
    }
}

/// Unlocked signing credential; locks the keystore when dropped
pub struct Credential<'a> {
    keystore: &'a Keystore,
    _access: MutexGuard<'a, ()>,
}

impl Credential<'_> {
    /// Account transactions are signed for
    pub fn account(&self) -> &Address {
        &self.keystore.account
    }
}

impl Drop for Credential<'_> {
    fn drop(&mut self) {
        self.keystore.unlocked.store(false, Ordering::SeqCst);
        tracing::trace!(account = %self.keystore.account, "Locked keystore");
    }
}

fn digest(passphrase: &str) -> [u8; 32] {
    Sha256::digest(passphrase.as_bytes()).into()
}
