//! Payload encryption for relayed messages
//!
//! Ephemeral-static ECDH on secp256k1, HKDF-SHA256 and XChaCha20-Poly1305.
//! A ciphertext is self-contained:
//!
//! `ephemeral public key (33, SEC1 compressed) || nonce (24) || AEAD ciphertext`

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use k256::{ecdh::EphemeralSecret, elliptic_curve::sec1::ToEncodedPoint};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

const EPHEMERAL_KEY_LEN: usize = 33;
const NONCE_LEN: usize = 24;
const KDF_INFO: &[u8] = b"trade-session/xchacha20poly1305";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid secret key")]
    InvalidSecretKey,

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecryptError {
    #[error("ciphertext too short ({0} bytes)")]
    Truncated(usize),

    #[error("invalid ephemeral key")]
    InvalidEphemeralKey,

    /// Wrong key or tampered ciphertext
    #[error("authentication failed")]
    Authentication,

    #[error("malformed plaintext: {0}")]
    Malformed(String),
}

/// secp256k1 secret key, zeroized on drop
#[derive(Clone)]
pub struct SecretKey(k256::SecretKey);

impl SecretKey {
    /// Generate a random key
    pub fn generate() -> Self {
        Self(k256::SecretKey::random(&mut OsRng))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        k256::SecretKey::from_slice(bytes)
            .map(Self)
            .map_err(|_| CryptoError::InvalidSecretKey)
    }

    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.0.to_bytes().to_vec())
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.public_key())
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// secp256k1 public key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKey(k256::PublicKey);

impl PublicKey {
    /// Parse a SEC1 encoded key, compressed or not
    pub fn from_sec1_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        k256::PublicKey::from_sec1_bytes(bytes)
            .map(Self)
            .map_err(|_| CryptoError::InvalidPublicKey)
    }

    /// SEC1 compressed encoding
    pub fn to_sec1_bytes(&self) -> Vec<u8> {
        self.0.to_encoded_point(true).as_bytes().to_vec()
    }
}

/// Generate a fresh keypair
pub fn generate_keypair() -> (SecretKey, PublicKey) {
    let secret = SecretKey::generate();
    let public = secret.public_key();
    (secret, public)
}

fn derive_key(shared_secret: &[u8], ephemeral: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    // 32 bytes is well below the HKDF-SHA256 output limit
    let _ = Hkdf::<Sha256>::new(Some(ephemeral), shared_secret).expand(KDF_INFO, key.as_mut_slice());
    key
}

/// Encrypt `plaintext` for the holder of `recipient`'s secret key
pub fn encrypt(recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = EphemeralSecret::random(&mut OsRng);
    let ephemeral_public = ephemeral.public_key().to_encoded_point(true);
    let shared = ephemeral.diffie_hellman(&recipient.0);
    let key = derive_key(shared.raw_secret_bytes().as_slice(), ephemeral_public.as_bytes());

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
    let sealed = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut out = Vec::with_capacity(EPHEMERAL_KEY_LEN + NONCE_LEN + sealed.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Decrypt a ciphertext produced by [`encrypt`]
pub fn decrypt(secret: &SecretKey, ciphertext: &[u8]) -> Result<Vec<u8>, DecryptError> {
    if ciphertext.len() < EPHEMERAL_KEY_LEN + NONCE_LEN {
        return Err(DecryptError::Truncated(ciphertext.len()));
    }
    let (ephemeral, rest) = ciphertext.split_at(EPHEMERAL_KEY_LEN);
    let (nonce, sealed) = rest.split_at(NONCE_LEN);

    let ephemeral_public =
        k256::PublicKey::from_sec1_bytes(ephemeral).map_err(|_| DecryptError::InvalidEphemeralKey)?;
    let shared = k256::ecdh::diffie_hellman(secret.0.to_nonzero_scalar(), ephemeral_public.as_affine());
    let key = derive_key(shared.raw_secret_bytes().as_slice(), ephemeral);

    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
    cipher
        .decrypt(XNonce::from_slice(nonce), sealed)
        .map_err(|_| DecryptError::Authentication)
}

/// Source of the local device's decryption key
pub trait KeyProvider: Send + Sync {
    fn secret_key(&self) -> &SecretKey;
}

impl KeyProvider for SecretKey {
    fn secret_key(&self) -> &SecretKey {
        self
    }
}

/// Measurement payload: `i64` little-endian
pub fn encode_measurement(value: i64) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

pub fn decode_measurement(payload: &[u8]) -> Result<i64, DecryptError> {
    let bytes: [u8; 8] = payload
        .try_into()
        .map_err(|_| DecryptError::Malformed(format!("expected 8 bytes, got {}", payload.len())))?;
    Ok(i64::from_le_bytes(bytes))
}
