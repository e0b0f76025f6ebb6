//! QUIC/HTTP-3 wire primitives: varints, unidirectional stream types, and frame
//! headers. Adapted from `web-transport-proto`'s wire layer
//! (`settings.rs`, `connect.rs`, `capsule.rs`), but operating over in-memory
//! `Buf`/`BufMut` windows rather than `AsyncRead`/`AsyncWrite` streams: the
//! driver buffers stream bytes itself (see `stream.rs`) and parses complete
//! frames out of that buffer instead of awaiting on the stream directly.

use bytes::{Buf, BufMut};
use thiserror::Error;

/// A QUIC variable-length integer (RFC 9000 §16), 0..=2^62-1.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarInt(u64);

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("unexpected end of buffer")]
pub struct VarIntUnexpectedEnd;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("varint value out of range")]
pub struct VarIntBoundsExceeded;

impl VarInt {
    pub const MAX: u64 = (1 << 62) - 1;

    pub const fn from_u32(v: u32) -> Self {
        Self(v as u64)
    }

    pub fn try_from_u64(v: u64) -> Result<Self, VarIntBoundsExceeded> {
        if v > Self::MAX {
            Err(VarIntBoundsExceeded)
        } else {
            Ok(Self(v))
        }
    }

    pub const fn into_inner(self) -> u64 {
        self.0
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, VarIntUnexpectedEnd> {
        if !buf.has_remaining() {
            return Err(VarIntUnexpectedEnd);
        }

        let first = buf.chunk()[0];
        let tag = first >> 6;
        let len = 1usize << tag;
        if buf.remaining() < len {
            return Err(VarIntUnexpectedEnd);
        }

        let mut value = (first & 0x3f) as u64;
        let mut tmp = [0u8; 8];
        buf.copy_to_slice(&mut tmp[..len]);
        for &byte in &tmp[1..len] {
            value = (value << 8) | byte as u64;
        }

        Ok(Self(value))
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        let v = self.0;
        if v <= 0x3f {
            buf.put_u8(v as u8);
        } else if v <= 0x3fff {
            buf.put_u16(0x4000 | v as u16);
        } else if v <= 0x3fff_ffff {
            buf.put_u32(0x8000_0000 | v as u32);
        } else {
            buf.put_u64(0xc000_0000_0000_0000 | v);
        }
    }

    /// Number of bytes `encode` would write.
    pub fn size(&self) -> usize {
        match self.0 {
            v if v <= 0x3f => 1,
            v if v <= 0x3fff => 2,
            v if v <= 0x3fff_ffff => 4,
            _ => 8,
        }
    }
}

impl std::fmt::Debug for VarInt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<VarInt> for u64 {
    fn from(v: VarInt) -> Self {
        v.0
    }
}

impl TryFrom<u64> for VarInt {
    type Error = VarIntBoundsExceeded;

    fn try_from(v: u64) -> Result<Self, Self::Error> {
        Self::try_from_u64(v)
    }
}

macro_rules! wire_ids {
    ($name:ident { $($variant:ident = $val:expr),* $(,)? }) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub VarInt);

        impl $name {
            $(pub const $variant: $name = $name(VarInt::from_u32($val));)*
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match *self {
                    $($name::$variant => write!(f, stringify!($variant)),)*
                    other => write!(f, concat!(stringify!($name), "({:?})"), other.0),
                }
            }
        }
    };
}

// RFC 9114 §11.2.4 unidirectional stream types, plus the WebTransport stream type
// from draft-ietf-webtrans-http3.
wire_ids!(StreamUni {
    CONTROL = 0x00,
    PUSH = 0x01,
    QPACK_ENCODER = 0x02,
    QPACK_DECODER = 0x03,
    WEBTRANSPORT = 0x54,
});

// RFC 9114 §7.2 frame types, plus the WebTransport bidi-stream frame type.
wire_ids!(Frame {
    DATA = 0x00,
    HEADERS = 0x01,
    SETTINGS = 0x04,
    WEBTRANSPORT = 0x41,
});

/// The maximum size this server will trust a declared frame length to be,
/// before it has buffered that many bytes. Bounds memory use per stream
/// independent of the 64 KiB echo-buffer cap, since control frames (HEADERS,
/// SETTINGS) are small by construction.
pub const MAX_FRAME_SIZE: u64 = 64 * 1024;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("incomplete frame")]
    Incomplete,
    #[error("frame too large")]
    TooLarge,
}

/// Peek a frame header (type + length) out of `buf` without consuming it unless the
/// full frame (header + payload) is present. Returns `(Frame, payload_len, header_len)`.
pub fn peek_frame_header<B: Buf>(buf: &B) -> Result<(Frame, u64, usize), FrameError> {
    let mut cursor = std::io::Cursor::new(buf.chunk());
    // NOTE: Requires the frame header to be contiguous in the first chunk, which
    // holds in practice because stream_recv coalesces into one contiguous Vec per
    // read (see `stream::StreamBuffer`).
    let typ = VarInt::decode(&mut cursor).map_err(|_| FrameError::Incomplete)?;
    let len = VarInt::decode(&mut cursor).map_err(|_| FrameError::Incomplete)?;
    let header_len = cursor.position() as usize;
    let payload_len = len.into_inner();
    if payload_len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge);
    }
    Ok((Frame(typ), payload_len, header_len))
}

pub fn encode_frame_header<B: BufMut>(buf: &mut B, frame: Frame, payload_len: usize) {
    frame.0.encode(buf);
    VarInt::try_from_u64(payload_len as u64)
        .expect("frame payload too large")
        .encode(buf);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn varint_roundtrip_boundaries() {
        for v in [0u64, 0x3f, 0x40, 0x3fff, 0x4000, 0x3fff_ffff, 0x4000_0000, VarInt::MAX] {
            let vi = VarInt::try_from_u64(v).unwrap();
            let mut buf = BytesMut::new();
            vi.encode(&mut buf);
            assert_eq!(buf.len(), vi.size());
            let decoded = VarInt::decode(&mut buf.freeze()).unwrap();
            assert_eq!(decoded.into_inner(), v);
        }
    }

    #[test]
    fn varint_rejects_out_of_range() {
        assert!(VarInt::try_from_u64(VarInt::MAX + 1).is_err());
    }

    #[test]
    fn varint_decode_unexpected_end() {
        let mut buf = &[0x40u8][..]; // claims a 2-byte varint but only 1 byte present
        assert!(VarInt::decode(&mut buf).is_err());
    }

    #[test]
    fn frame_header_roundtrip() {
        let mut buf = BytesMut::new();
        encode_frame_header(&mut buf, Frame::HEADERS, 42);
        buf.extend_from_slice(&[0u8; 42]);

        let (typ, len, header_len) = peek_frame_header(&buf).unwrap();
        assert_eq!(typ, Frame::HEADERS);
        assert_eq!(len, 42);
        assert_eq!(header_len + len as usize, buf.len());
    }

    #[test]
    fn frame_header_rejects_oversized_payload() {
        let mut buf = BytesMut::new();
        encode_frame_header(&mut buf, Frame::SETTINGS, (MAX_FRAME_SIZE + 1) as usize);
        assert_eq!(peek_frame_header(&buf), Err(FrameError::TooLarge));
    }

    #[test]
    fn stream_uni_debug_names() {
        assert_eq!(format!("{:?}", StreamUni::CONTROL), "CONTROL");
        assert_eq!(format!("{:?}", StreamUni::WEBTRANSPORT), "WEBTRANSPORT");
    }
}
