//! Session payload encryption.
//!
//! The cryptor is built once per session from the ECDH-derived secret and
//! never replaced. Each frame's payload region is AES-256-CBC encrypted
//! with an IV keyed from the frame's sequence number and fragment index,
//! and authenticated by HMAC-SHA256 over the exact header bytes plus the
//! ciphertext, truncated to the negotiated size.
//!
//! Sequence-number uniqueness is the caller's responsibility.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use bytes::{BufMut, Bytes, BytesMut};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use cdp_proto::{CommonHeader, Frame};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// HMAC trailer size advertised when the peer does not negotiate one.
pub const DEFAULT_HMAC_SIZE: u16 = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptorError {
    /// HMAC mismatch or malformed trailer. Terminal for the session.
    #[error("payload integrity check failed")]
    Integrity,

    #[error("decryption failed")]
    Decrypt,

    #[error("invalid hmac size: {0}")]
    InvalidHmacSize(u16),
}

/// Immutable per-session cipher state. Freely shared behind an `Arc`.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Cryptor {
    enc_key: [u8; 32],
    mac_key: [u8; 32],
    iv_key: [u8; 32],
    #[zeroize(skip)]
    hmac_size: usize,
}

impl std::fmt::Debug for Cryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cryptor")
            .field("hmac_size", &self.hmac_size)
            .finish_non_exhaustive()
    }
}

impl Cryptor {
    /// Derive the cipher, MAC and IV subkeys from the 32-byte session
    /// secret. `hmac_size` is the negotiated trailer length (1..=32).
    pub fn new(secret: &[u8; 32], hmac_size: u16) -> Result<Self, CryptorError> {
        if hmac_size == 0 || hmac_size > 32 {
            return Err(CryptorError::InvalidHmacSize(hmac_size));
        }

        // Nonces are already mixed into the secret; no extra salt here.
        let hk = Hkdf::<Sha256>::new(None, secret);
        let mut enc_key = [0u8; 32];
        let mut mac_key = [0u8; 32];
        let mut iv_key = [0u8; 32];
        hk.expand(b"cdp aes key v1", &mut enc_key)
            .expect("output size matches digest size, infallible");
        hk.expand(b"cdp hmac key v1", &mut mac_key)
            .expect("output size matches digest size, infallible");
        hk.expand(b"cdp iv key v1", &mut iv_key)
            .expect("output size matches digest size, infallible");

        Ok(Self { enc_key, mac_key, iv_key, hmac_size: hmac_size as usize })
    }

    pub fn hmac_size(&self) -> usize {
        self.hmac_size
    }

    fn derive_iv(&self, sequence_number: u32, fragment_index: u16) -> [u8; 16] {
        let mut mac = HmacSha256::new_from_slice(&self.iv_key)
            .expect("HMAC accepts keys of any size");
        mac.update(&sequence_number.to_be_bytes());
        mac.update(&fragment_index.to_be_bytes());
        let tag = mac.finalize().into_bytes();
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&tag[..16]);
        iv
    }

    pub fn encrypt(&self, sequence_number: u32, fragment_index: u16, plaintext: &[u8]) -> Vec<u8> {
        let iv = self.derive_iv(sequence_number, fragment_index);
        Aes256CbcEnc::new(&self.enc_key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
    }

    pub fn decrypt(
        &self,
        sequence_number: u32,
        fragment_index: u16,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptorError> {
        let iv = self.derive_iv(sequence_number, fragment_index);
        Aes256CbcDec::new(&self.enc_key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptorError::Decrypt)
    }

    /// Full HMAC over the associated data: exact header bytes, then the
    /// ciphertext. Truncation to `hmac_size` happens at the call sites.
    pub fn compute_tag(&self, header_bytes: &[u8], ciphertext: &[u8]) -> [u8; 32] {
        let mut mac = HmacSha256::new_from_slice(&self.mac_key)
            .expect("HMAC accepts keys of any size");
        mac.update(header_bytes);
        mac.update(ciphertext);
        let out = mac.finalize().into_bytes();
        let mut tag = [0u8; 32];
        tag.copy_from_slice(&out);
        tag
    }

    /// Constant-time verification of a truncated trailer.
    pub fn verify_tag(
        &self,
        header_bytes: &[u8],
        ciphertext: &[u8],
        trailer: &[u8],
    ) -> Result<(), CryptorError> {
        if trailer.len() != self.hmac_size {
            return Err(CryptorError::Integrity);
        }
        let mut mac = HmacSha256::new_from_slice(&self.mac_key)
            .expect("HMAC accepts keys of any size");
        mac.update(header_bytes);
        mac.update(ciphertext);
        mac.verify_truncated_left(trailer).map_err(|_| CryptorError::Integrity)
    }

    /// Encrypt `plaintext` under `header` and emit one complete wire frame:
    /// header (payload size and encrypted flag filled in), ciphertext,
    /// truncated HMAC. The returned buffer is the atomic write unit.
    pub fn seal(&self, header: &mut CommonHeader, plaintext: &[u8]) -> Bytes {
        let ciphertext =
            self.encrypt(header.sequence_number, header.fragment_index, plaintext);
        header.set_encrypted(true);
        header.payload_size = ciphertext.len() as u32;
        let header_bytes = header.to_bytes();
        let tag = self.compute_tag(&header_bytes, &ciphertext);

        let mut out =
            BytesMut::with_capacity(header_bytes.len() + ciphertext.len() + self.hmac_size);
        out.put_slice(&header_bytes);
        out.put_slice(&ciphertext);
        out.put_slice(&tag[..self.hmac_size]);
        out.freeze()
    }

    /// Verify and decrypt one parsed frame.
    pub fn open(&self, frame: &Frame) -> Result<Vec<u8>, CryptorError> {
        self.verify_tag(&frame.header_bytes, &frame.payload, &frame.trailer)?;
        self.decrypt(
            frame.header.sequence_number,
            frame.header.fragment_index,
            &frame.payload,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdp_proto::MessageKind;

    fn cryptor(secret_byte: u8) -> Cryptor {
        Cryptor::new(&[secret_byte; 32], DEFAULT_HMAC_SIZE).unwrap()
    }

    fn sealed_frame(c: &Cryptor, plaintext: &[u8]) -> Frame {
        let mut header = CommonHeader::new(MessageKind::Session);
        header.sequence_number = 7;
        Frame::parse(c.seal(&mut header, plaintext)).unwrap()
    }

    #[test]
    fn test_seal_open_round_trip() {
        let c = cryptor(0x42);
        let frame = sealed_frame(&c, b"secret payload");
        assert!(frame.header.is_encrypted());
        assert_eq!(frame.trailer.len(), 32);
        assert_eq!(c.open(&frame).unwrap(), b"secret payload");
    }

    #[test]
    fn test_bit_flip_fails_integrity() {
        let c = cryptor(0x42);
        let mut header = CommonHeader::new(MessageKind::Session);
        header.sequence_number = 3;
        let mut raw = c.seal(&mut header, b"important").to_vec();
        let flip_at = raw.len() - 40; // inside the ciphertext
        raw[flip_at] ^= 0x01;
        let frame = Frame::parse(Bytes::from(raw)).unwrap();
        assert_eq!(c.open(&frame), Err(CryptorError::Integrity));
    }

    #[test]
    fn test_header_tamper_fails_integrity() {
        let c = cryptor(0x42);
        let frame = sealed_frame(&c, b"payload");
        let mut tampered = frame.clone();
        let mut hb = frame.header_bytes.to_vec();
        let last = hb.len() - 2;
        hb[last] ^= 0xFF;
        tampered.header_bytes = Bytes::from(hb);
        assert_eq!(c.open(&tampered), Err(CryptorError::Integrity));
    }

    #[test]
    fn test_wrong_secret_fails() {
        let frame = sealed_frame(&cryptor(0x11), b"payload");
        assert_eq!(cryptor(0x22).open(&frame), Err(CryptorError::Integrity));
    }

    #[test]
    fn test_trailer_length_checked() {
        let c = cryptor(0x42);
        let mut frame = sealed_frame(&c, b"payload");
        frame.trailer = frame.trailer.slice(..16);
        assert_eq!(c.open(&frame), Err(CryptorError::Integrity));
    }

    #[test]
    fn test_truncated_hmac_size() {
        let c = Cryptor::new(&[9u8; 32], 16).unwrap();
        let mut header = CommonHeader::new(MessageKind::Session);
        header.sequence_number = 1;
        let frame = Frame::parse(c.seal(&mut header, b"short mac")).unwrap();
        assert_eq!(frame.trailer.len(), 16);
        assert_eq!(c.open(&frame).unwrap(), b"short mac");
    }

    #[test]
    fn test_invalid_hmac_size_rejected() {
        assert!(matches!(
            Cryptor::new(&[0u8; 32], 0),
            Err(CryptorError::InvalidHmacSize(0))
        ));
        assert!(matches!(
            Cryptor::new(&[0u8; 32], 64),
            Err(CryptorError::InvalidHmacSize(64))
        ));
    }

    #[test]
    fn test_iv_depends_on_sequence_and_fragment() {
        let c = cryptor(0x42);
        let a = c.encrypt(1, 0, b"same plaintext");
        let b = c.encrypt(2, 0, b"same plaintext");
        let d = c.encrypt(1, 1, b"same plaintext");
        assert_ne!(a, b);
        assert_ne!(a, d);
        // identical inputs produce identical ciphertext
        assert_eq!(a, c.encrypt(1, 0, b"same plaintext"));
    }

    #[test]
    fn test_empty_payload() {
        let c = cryptor(0x01);
        let frame = sealed_frame(&c, b"");
        // PKCS#7 always emits at least one block
        assert_eq!(frame.payload.len(), 16);
        assert_eq!(c.open(&frame).unwrap(), b"");
    }
}
