//! Encrypted transport - end-to-end encryption on top of a relay transport
//!
//! Producers encrypt for the consumer device's public key before pushing;
//! consumers decrypt with their own secret key after pulling. The relay only
//! ever sees ciphertext.

use crate::crypto::{self, CryptoError, DecryptError, KeyProvider, PublicKey};
use std::sync::Arc;
use thiserror::Error;
use trade_relay::{Transport, TransportError};
use trade_types::{CallContext, Message, TradeId};

#[derive(Error, Debug)]
pub enum EncryptedTransportError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("encryption failed: {0}")]
    Encrypt(#[from] CryptoError),

    #[error("decryption failed: {0}")]
    Decrypt(#[from] DecryptError),
}

impl EncryptedTransportError {
    /// Whether the call ended because its context was cancelled or expired
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Transport(TransportError::Canceled(_)))
    }
}

/// Relay client that encrypts on push and decrypts on pull
#[derive(Clone)]
pub struct EncryptedTransport {
    transport: Arc<dyn Transport>,
    keys: Arc<dyn KeyProvider>,
}

impl EncryptedTransport {
    /// Create a new encrypted transport
    pub fn new(transport: Arc<dyn Transport>, keys: Arc<dyn KeyProvider>) -> Self {
        Self { transport, keys }
    }

    /// Encrypt `message` for `recipient` and push it to the relay at `endpoint`
    ///
    /// Returns the trade's delivery counter after the push.
    pub async fn encrypt_and_push(
        &self,
        cx: &CallContext,
        endpoint: &str,
        recipient: &PublicKey,
        message: Message,
    ) -> Result<u64, EncryptedTransportError> {
        let mut conn = self.transport.connect(cx, endpoint).await?;
        let payload = crypto::encrypt(recipient, &message.payload)?;
        let counter = conn.push(cx, Message::new(message.trade_id, payload)).await?;
        Ok(counter)
    }

    /// Pull the next message of `trade_id` from `endpoint` and decrypt it
    pub async fn decrypt_and_pull(
        &self,
        cx: &CallContext,
        endpoint: &str,
        trade_id: TradeId,
    ) -> Result<Message, EncryptedTransportError> {
        let mut conn = self.transport.connect(cx, endpoint).await?;
        let message = conn.pull(cx, trade_id).await?;
        let payload = crypto::decrypt(self.keys.secret_key(), &message.payload)?;
        Ok(Message::new(message.trade_id, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{generate_keypair, SecretKey};
    use std::time::Duration;
    use trade_relay::{LocalTransport, MessageRelay};

    fn transport_with(secret: SecretKey) -> (Arc<MessageRelay>, EncryptedTransport) {
        let relay = Arc::new(MessageRelay::default());
        let transport = LocalTransport::new().with_relay("relay", relay.clone());
        (relay, EncryptedTransport::new(Arc::new(transport), Arc::new(secret)))
    }

    #[tokio::test]
    async fn test_push_pull_roundtrip() {
        let (secret, public) = generate_keypair();
        let (relay, transport) = transport_with(secret);
        let cx = CallContext::new();

        let counter = transport
            .encrypt_and_push(&cx, "relay", &public, Message::new(TradeId(1), b"21.5".to_vec()))
            .await
            .unwrap();
        assert_eq!(counter, 1);
        assert_eq!(relay.find_counter(TradeId(1)), 1);

        let message = transport.decrypt_and_pull(&cx, "relay", TradeId(1)).await.unwrap();
        assert_eq!(message.payload, b"21.5".to_vec());
    }

    #[tokio::test]
    async fn test_relay_holds_ciphertext() {
        let (secret, public) = generate_keypair();
        let (relay, transport) = transport_with(secret);
        let cx = CallContext::new();

        transport
            .encrypt_and_push(&cx, "relay", &public, Message::new(TradeId(2), b"plain".to_vec()))
            .await
            .unwrap();

        let stored = relay.pull(&cx, TradeId(2)).await.unwrap();
        assert_ne!(stored.payload, b"plain".to_vec());
    }

    #[tokio::test]
    async fn test_wrong_key_is_decrypt_error() {
        let (_, public) = generate_keypair();
        let (other, _) = generate_keypair();
        let (_relay, transport) = transport_with(other);
        let cx = CallContext::new();

        transport
            .encrypt_and_push(&cx, "relay", &public, Message::new(TradeId(3), vec![1]))
            .await
            .unwrap();

        let result = transport.decrypt_and_pull(&cx, "relay", TradeId(3)).await;
        assert!(matches!(result, Err(EncryptedTransportError::Decrypt(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_deadline() {
        let (secret, _) = generate_keypair();
        let (_relay, transport) = transport_with(secret);
        let cx = CallContext::new().with_timeout(Duration::from_secs(1));

        let result = transport.decrypt_and_pull(&cx, "relay", TradeId(4)).await;
        assert!(result.as_ref().is_err_and(|e| e.is_canceled()));
    }
}
