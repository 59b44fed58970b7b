//! Key agreement and payload encryption for the CDP session core.
//!
//! The handshake exchanges P-256 public keys and nonces
//! ([`keys::EncryptionInfo`]); the derived 32-byte secret keys a
//! [`cryptor::Cryptor`] that encrypts and authenticates every subsequent
//! frame payload.

#![forbid(unsafe_code)]

pub mod cryptor;
pub mod hash;
pub mod keys;
pub mod transcript;

pub use cryptor::{Cryptor, CryptorError, DEFAULT_HMAC_SIZE};
pub use keys::{auth_thumbprint, derive_shared_secret, EncryptionInfo, KeyAgreementError};
