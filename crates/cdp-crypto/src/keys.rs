//! Session key material and ECDH shared-secret derivation.
//!
//! [`EncryptionInfo`] holds one side's key material: a P-256 keypair (or
//! just the public half when wrapping a peer key), a 64-bit nonce, and an
//! optional device certificate. Certificate provisioning and trust
//! evaluation happen outside this crate; the bytes are opaque here.

use bytes::Bytes;
use hkdf::Hkdf;
use p256::ecdh;
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::{EncodedPoint, FieldBytes, PublicKey, SecretKey};
use rand_core::OsRng;
use sha2::Sha256;
use thiserror::Error;

use crate::transcript::Transcript;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyAgreementError {
    #[error("invalid public key point")]
    InvalidPoint,

    #[error("key material has no private half")]
    MissingPrivateKey,

    #[error("random generator failure")]
    Rng,
}

/// One side's handshake key material.
#[derive(Clone)]
pub struct EncryptionInfo {
    secret: Option<SecretKey>,
    public: PublicKey,
    pub nonce: u64,
    pub certificate: Option<Bytes>,
}

impl EncryptionInfo {
    /// Generate a fresh keypair and nonce.
    pub fn create() -> Result<Self, KeyAgreementError> {
        let secret = SecretKey::random(&mut OsRng);
        let public = secret.public_key();
        let mut nonce_bytes = [0u8; 8];
        getrandom::getrandom(&mut nonce_bytes).map_err(|_| KeyAgreementError::Rng)?;
        Ok(Self {
            secret: Some(secret),
            public,
            nonce: u64::from_be_bytes(nonce_bytes),
            certificate: None,
        })
    }

    /// Attach a device certificate (opaque DER bytes).
    pub fn with_certificate(mut self, certificate: impl Into<Bytes>) -> Self {
        self.certificate = Some(certificate.into());
        self
    }

    /// Wrap a peer public key from its SEC1 affine coordinates. The result
    /// has no private half.
    pub fn from_remote(x: &[u8], y: &[u8], nonce: u64) -> Result<Self, KeyAgreementError> {
        if x.len() != 32 || y.len() != 32 {
            return Err(KeyAgreementError::InvalidPoint);
        }
        let point = EncodedPoint::from_affine_coordinates(
            FieldBytes::from_slice(x),
            FieldBytes::from_slice(y),
            false,
        );
        let public = Option::<PublicKey>::from(PublicKey::from_encoded_point(&point))
            .ok_or(KeyAgreementError::InvalidPoint)?;
        Ok(Self { secret: None, public, nonce, certificate: None })
    }

    pub fn public_x(&self) -> [u8; 32] {
        let point = self.public.to_encoded_point(false);
        let mut out = [0u8; 32];
        out.copy_from_slice(point.x().expect("uncompressed point has coordinates"));
        out
    }

    pub fn public_y(&self) -> [u8; 32] {
        let point = self.public.to_encoded_point(false);
        let mut out = [0u8; 32];
        out.copy_from_slice(point.y().expect("uncompressed point has coordinates"));
        out
    }

    /// Certificate bytes, empty when none is provisioned.
    pub fn certificate_bytes(&self) -> Bytes {
        self.certificate.clone().unwrap_or_default()
    }
}

/// Derive the 32-byte session secret: P-256 ECDH, then HKDF-SHA256 with
/// both nonces mixed into the salt in role order (connection host first),
/// so either side computes the same value.
pub fn derive_shared_secret(
    local: &EncryptionInfo,
    remote: &EncryptionInfo,
    local_is_host: bool,
) -> Result<[u8; 32], KeyAgreementError> {
    let secret = local.secret.as_ref().ok_or(KeyAgreementError::MissingPrivateKey)?;
    let shared = ecdh::diffie_hellman(secret.to_nonzero_scalar(), remote.public.as_affine());

    let (host_nonce, client_nonce) = if local_is_host {
        (local.nonce, remote.nonce)
    } else {
        (remote.nonce, local.nonce)
    };
    let mut salt = [0u8; 16];
    salt[..8].copy_from_slice(&host_nonce.to_be_bytes());
    salt[8..].copy_from_slice(&client_nonce.to_be_bytes());

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared.raw_secret_bytes());
    let mut out = [0u8; 32];
    hk.expand(b"cdp session secret v1", &mut out)
        .expect("output size matches digest size, infallible");
    Ok(out)
}

/// Authentication thumbprint: canonical hash binding a certificate to both
/// session nonces. A peer proves it saw the same handshake by producing the
/// matching value.
pub fn auth_thumbprint(certificate: &[u8], host_nonce: u64, client_nonce: u64) -> [u8; 32] {
    let mut t = Transcript::new("cdp_auth_thumbprint_v1");
    t.append_bytes(1, certificate);
    t.append_u64(2, host_nonce);
    t.append_u64(3, client_nonce);
    t.finalize()
}
