//! Deterministic transcript builder for canonical hashing.
//!
//! Appends (tag, len, bytes) tuples so the same logical data hashes the
//! same on both endpoints regardless of how the caller assembled it.

use bytes::{BufMut, BytesMut};

use crate::hash::sha256;

#[derive(Clone, Debug, Default)]
pub struct Transcript {
    buf: BytesMut,
}

impl Transcript {
    /// New transcript with the given domain separator.
    pub fn new(domain: &'static str) -> Self {
        let mut t = Self { buf: BytesMut::with_capacity(128) };
        t.append_bytes(0, domain.as_bytes());
        t
    }

    pub fn append_bytes(&mut self, tag: u32, data: &[u8]) -> &mut Self {
        self.buf.put_u32(tag);
        self.buf.put_u32(data.len() as u32);
        self.buf.extend_from_slice(data);
        self
    }

    pub fn append_u64(&mut self, tag: u32, v: u64) -> &mut Self {
        self.buf.put_u32(tag);
        self.buf.put_u32(8);
        self.buf.put_u64(v);
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// SHA-256 over the transcript contents.
    pub fn finalize(self) -> [u8; 32] {
        sha256(&self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_determinism() {
        let mut a = Transcript::new("test");
        a.append_bytes(1, b"data").append_u64(2, 42);
        let mut b = Transcript::new("test");
        b.append_bytes(1, b"data").append_u64(2, 42);
        assert_eq!(a.finalize(), b.finalize());
    }

    #[test]
    fn test_domain_separation() {
        let mut a = Transcript::new("domain_a");
        a.append_bytes(1, b"data");
        let mut b = Transcript::new("domain_b");
        b.append_bytes(1, b"data");
        assert_ne!(a.finalize(), b.finalize());
    }

    #[test]
    fn test_tag_matters() {
        let mut a = Transcript::new("test");
        a.append_bytes(1, b"data");
        let mut b = Transcript::new("test");
        b.append_bytes(2, b"data");
        assert_ne!(a.finalize(), b.finalize());
    }
}
