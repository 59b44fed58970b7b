//! Common header and frame codec.
//!
//! Every wire frame starts with a [`CommonHeader`], followed by the payload
//! region (`payload_size` bytes, plaintext or ciphertext) and an optional
//! trailer holding the truncated HMAC once session encryption is live.
//!
//! Wire format (big-endian):
//! ```text
//! sig:u16  msg_type:u8  flags:u16  payload_size:u32  session_id:u64
//! sequence_number:u32  fragment_index:u16  fragment_count:u16
//! request_id:u64  channel_id:u64  reply_to_id:u64
//! additional headers: (type:u8 != 0, len:u8, value)*  terminated by 0x00
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtoError, Result};

/// First two bytes of every frame.
pub const FRAME_SIGNATURE: u16 = 0x3030;

/// Host-role flag: bit 31 of the composite session id, toggled on replies
/// so each side's frames carry its own originator view.
pub const SESSION_ID_HOST_FLAG: u64 = 0x8000_0000;

/// Header flag: the payload region is ciphertext and a HMAC trailer follows.
pub const FLAG_ENCRYPTED: u16 = 0x0001;

/// Fixed size of the header up to (and excluding) the additional-header list.
const FIXED_HEADER_LEN: usize = 2 + 1 + 2 + 4 + 8 + 4 + 2 + 2 + 8 + 8 + 8;

/// Top-level frame kinds carried in `msg_type`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Connect = 1,
    Control = 2,
    Session = 3,
    ReliabilityResponse = 4,
}

impl MessageKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Connect),
            2 => Some(Self::Control),
            3 => Some(Self::Session),
            4 => Some(Self::ReliabilityResponse),
            _ => None,
        }
    }
}

/// One additional-header TLV. `header_type` is never zero; zero terminates
/// the list on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdditionalHeader {
    pub header_type: u8,
    pub value: Bytes,
}

impl AdditionalHeader {
    pub fn new(header_type: u8, value: impl Into<Bytes>) -> Self {
        Self { header_type, value: value.into() }
    }
}

/// Parsed common header for one wire frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommonHeader {
    pub msg_type: u8,
    pub flags: u16,
    pub payload_size: u32,
    pub session_id: u64,
    pub sequence_number: u32,
    pub fragment_index: u16,
    pub fragment_count: u16,
    pub request_id: u64,
    pub channel_id: u64,
    pub reply_to_id: u64,
    pub additional_headers: Vec<AdditionalHeader>,
}

impl CommonHeader {
    /// New header of the given kind with zeroed routing fields and a single
    /// fragment.
    pub fn new(kind: MessageKind) -> Self {
        Self {
            msg_type: kind as u8,
            flags: 0,
            payload_size: 0,
            session_id: 0,
            sequence_number: 0,
            fragment_index: 0,
            fragment_count: 1,
            request_id: 0,
            channel_id: 0,
            reply_to_id: 0,
            additional_headers: Vec::new(),
        }
    }

    pub fn kind(&self) -> Option<MessageKind> {
        MessageKind::from_u8(self.msg_type)
    }

    /// This endpoint's session id: high half of the composite.
    pub fn local_session_id(&self) -> u32 {
        (self.session_id >> 32) as u32
    }

    /// The peer's session id: low half with the host-role flag masked off.
    pub fn remote_session_id(&self) -> u32 {
        (self.session_id & !SESSION_ID_HOST_FLAG) as u32
    }

    pub fn has_host_flag(&self) -> bool {
        self.session_id & SESSION_ID_HOST_FLAG != 0
    }

    /// Outbound copy of a received header with the host-role flag toggled,
    /// so the reply carries the correct originator bit.
    pub fn correct_client_session_bit(&self) -> Self {
        let mut out = self.clone();
        out.session_id ^= SESSION_ID_HOST_FLAG;
        out
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    pub fn set_encrypted(&mut self, on: bool) {
        if on {
            self.flags |= FLAG_ENCRYPTED;
        } else {
            self.flags &= !FLAG_ENCRYPTED;
        }
    }

    /// Encoded size of this header in bytes.
    pub fn encoded_len(&self) -> usize {
        let extra: usize = self
            .additional_headers
            .iter()
            .map(|h| 2 + h.value.len())
            .sum();
        FIXED_HEADER_LEN + extra + 1
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(FRAME_SIGNATURE);
        buf.put_u8(self.msg_type);
        buf.put_u16(self.flags);
        buf.put_u32(self.payload_size);
        buf.put_u64(self.session_id);
        buf.put_u32(self.sequence_number);
        buf.put_u16(self.fragment_index);
        buf.put_u16(self.fragment_count);
        buf.put_u64(self.request_id);
        buf.put_u64(self.channel_id);
        buf.put_u64(self.reply_to_id);
        for h in &self.additional_headers {
            debug_assert!(h.header_type != 0 && h.value.len() <= u8::MAX as usize);
            buf.put_u8(h.header_type);
            buf.put_u8(h.value.len() as u8);
            buf.put_slice(&h.value);
        }
        buf.put_u8(0);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode a header, advancing `buf` past it.
    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        if buf.len() < FIXED_HEADER_LEN + 1 {
            return Err(ProtoError::BufferTooShort {
                need: FIXED_HEADER_LEN + 1,
                have: buf.len(),
            });
        }

        let sig = buf.get_u16();
        if sig != FRAME_SIGNATURE {
            return Err(ProtoError::BadSignature(sig));
        }

        let msg_type = buf.get_u8();
        let flags = buf.get_u16();
        let payload_size = buf.get_u32();
        let session_id = buf.get_u64();
        let sequence_number = buf.get_u32();
        let fragment_index = buf.get_u16();
        let fragment_count = buf.get_u16();
        let request_id = buf.get_u64();
        let channel_id = buf.get_u64();
        let reply_to_id = buf.get_u64();

        let mut additional_headers = Vec::new();
        loop {
            if buf.is_empty() {
                return Err(ProtoError::AdditionalHeaderOverrun);
            }
            let header_type = buf.get_u8();
            if header_type == 0 {
                break;
            }
            if buf.is_empty() {
                return Err(ProtoError::AdditionalHeaderOverrun);
            }
            let len = buf.get_u8() as usize;
            if buf.len() < len {
                return Err(ProtoError::AdditionalHeaderOverrun);
            }
            let value = buf.split_to(len);
            additional_headers.push(AdditionalHeader { header_type, value });
        }

        Ok(Self {
            msg_type,
            flags,
            payload_size,
            session_id,
            sequence_number,
            fragment_index,
            fragment_count,
            request_id,
            channel_id,
            reply_to_id,
            additional_headers,
        })
    }
}

/// Compose a composite session id from this endpoint's view.
pub fn compose_session_id(local: u32, remote: u32, host_flag: bool) -> u64 {
    let mut id = ((local as u64) << 32) | (remote as u64 & !SESSION_ID_HOST_FLAG);
    if host_flag {
        id |= SESSION_ID_HOST_FLAG;
    }
    id
}

/// One parsed wire frame: header, the exact header bytes (HMAC associated
/// data), the payload region and the trailer.
#[derive(Clone, Debug)]
pub struct Frame {
    pub header: CommonHeader,
    pub header_bytes: Bytes,
    pub payload: Bytes,
    pub trailer: Bytes,
}

impl Frame {
    /// Parse one complete frame. The trailer is whatever follows the
    /// `payload_size` region; its length is validated against the
    /// negotiated HMAC size by the cryptor, not here.
    pub fn parse(buf: Bytes) -> Result<Self> {
        let original = buf.clone();
        let mut cursor = buf;
        let header = CommonHeader::decode(&mut cursor)?;
        let header_len = original.len() - cursor.len();
        let header_bytes = original.slice(..header_len);

        let payload_len = header.payload_size as usize;
        if cursor.len() < payload_len {
            return Err(ProtoError::BufferTooShort {
                need: payload_len,
                have: cursor.len(),
            });
        }
        let payload = cursor.split_to(payload_len);
        let trailer = cursor;

        Ok(Self { header, header_bytes, payload, trailer })
    }

    /// Encode an unencrypted frame: header (payload size filled in) followed
    /// by the plaintext payload. No trailer.
    pub fn encode_plain(mut header: CommonHeader, payload: &[u8]) -> Bytes {
        header.set_encrypted(false);
        header.payload_size = payload.len() as u32;
        let mut buf = BytesMut::with_capacity(header.encoded_len() + payload.len());
        header.encode(&mut buf);
        buf.put_slice(payload);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_header() -> CommonHeader {
        let mut h = CommonHeader::new(MessageKind::Control);
        h.session_id = compose_session_id(0xE, 0x2A, true);
        h.sequence_number = 7;
        h.request_id = 0xAA;
        h.channel_id = 3;
        h.additional_headers
            .push(AdditionalHeader::new(129, vec![0x30, 0x00, 0x00, 0x01]));
        h
    }

    #[test]
    fn test_header_round_trip() {
        let h = sample_header();
        let mut bytes = h.to_bytes();
        let decoded = CommonHeader::decode(&mut bytes).unwrap();
        assert_eq!(h, decoded);
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_encoded_len_matches() {
        let h = sample_header();
        assert_eq!(h.to_bytes().len(), h.encoded_len());
    }

    #[test]
    fn test_session_id_halves() {
        let h = sample_header();
        assert_eq!(h.local_session_id(), 0xE);
        assert_eq!(h.remote_session_id(), 0x2A);
        assert!(h.has_host_flag());
    }

    #[test]
    fn test_correct_client_session_bit_toggles() {
        let h = sample_header();
        let flipped = h.correct_client_session_bit();
        assert!(!flipped.has_host_flag());
        // halves are untouched
        assert_eq!(flipped.local_session_id(), h.local_session_id());
        assert_eq!(flipped.remote_session_id(), h.remote_session_id());
        let back = flipped.correct_client_session_bit();
        assert_eq!(back, h);
    }

    #[test]
    fn test_bad_signature() {
        let mut bytes = BytesMut::from(&sample_header().to_bytes()[..]);
        bytes[0] = 0xFF;
        let result = CommonHeader::decode(&mut bytes.freeze());
        assert!(matches!(result, Err(ProtoError::BadSignature(_))));
    }

    #[test]
    fn test_truncated_header() {
        let bytes = sample_header().to_bytes();
        let mut short = bytes.slice(..10);
        let result = CommonHeader::decode(&mut short);
        assert!(matches!(result, Err(ProtoError::BufferTooShort { .. })));
    }

    #[test]
    fn test_additional_header_overrun() {
        let mut h = CommonHeader::new(MessageKind::Connect);
        h.additional_headers
            .push(AdditionalHeader::new(5, vec![1, 2, 3, 4]));
        let bytes = h.to_bytes();
        // cut inside the TLV value
        let mut cut = bytes.slice(..bytes.len() - 3);
        let result = CommonHeader::decode(&mut cut);
        assert!(matches!(result, Err(ProtoError::AdditionalHeaderOverrun)));
    }

    #[test]
    fn test_frame_parse_splits_payload_and_trailer() {
        let mut h = CommonHeader::new(MessageKind::Session);
        h.payload_size = 5;
        let mut buf = BytesMut::new();
        h.encode(&mut buf);
        buf.put_slice(b"hello");
        buf.put_slice(&[0xAB; 32]); // trailer

        let frame = Frame::parse(buf.freeze()).unwrap();
        assert_eq!(frame.payload.as_ref(), b"hello");
        assert_eq!(frame.trailer.len(), 32);
        assert_eq!(frame.header_bytes.len(), frame.header.encoded_len());
    }

    #[test]
    fn test_frame_parse_payload_too_short() {
        let mut h = CommonHeader::new(MessageKind::Session);
        h.payload_size = 100;
        let mut buf = BytesMut::new();
        h.encode(&mut buf);
        buf.put_slice(b"only a little");
        let result = Frame::parse(buf.freeze());
        assert!(matches!(result, Err(ProtoError::BufferTooShort { .. })));
    }

    #[test]
    fn test_encode_plain() {
        let frame = Frame::encode_plain(CommonHeader::new(MessageKind::Connect), b"body");
        let parsed = Frame::parse(frame).unwrap();
        assert_eq!(parsed.payload.as_ref(), b"body");
        assert!(parsed.trailer.is_empty());
        assert!(!parsed.header.is_encrypted());
    }

    #[test]
    fn test_unknown_message_kind() {
        assert_eq!(MessageKind::from_u8(0), None);
        assert_eq!(MessageKind::from_u8(99), None);
        assert_eq!(MessageKind::from_u8(3), Some(MessageKind::Session));
    }

    proptest! {
        #[test]
        fn prop_header_round_trip(
            msg_type in 1u8..=4,
            flags in any::<u16>(),
            session_id in any::<u64>(),
            sequence_number in any::<u32>(),
            fragment_index in any::<u16>(),
            fragment_count in any::<u16>(),
            request_id in any::<u64>(),
            channel_id in any::<u64>(),
            reply_to_id in any::<u64>(),
            value in prop::collection::vec(any::<u8>(), 0..32),
        ) {
            let h = CommonHeader {
                msg_type,
                flags,
                payload_size: 0,
                session_id,
                sequence_number,
                fragment_index,
                fragment_count,
                request_id,
                channel_id,
                reply_to_id,
                additional_headers: vec![AdditionalHeader::new(129, value)],
            };
            let mut bytes = h.to_bytes();
            let decoded = CommonHeader::decode(&mut bytes)?;
            prop_assert_eq!(h, decoded);
        }
    }
}
