//! The `CLOSE_WEBTRANSPORT_SESSION` capsule (draft-ietf-webtrans-http3): a
//! real WebTransport client terminates a session by sending this capsule on
//! its CONNECT stream, rather than only resetting streams.
//!
//! Grounded on `web-transport-proto::capsule::Capsule`, trimmed to the one
//! variant this server needs to recognize (GREASE and anything else is
//! acknowledged by being skipped, not acted on).

use bytes::{Buf, BufMut};

use crate::wire::{VarInt, VarIntUnexpectedEnd};

const CLOSE_WEBTRANSPORT_SESSION_TYPE: u64 = 0x2843;
const MAX_REASON_LEN: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capsule {
    CloseWebTransportSession { code: u32, reason: String },
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapsuleError {
    Incomplete,
    ReasonTooLong,
    InvalidUtf8,
}

impl From<VarIntUnexpectedEnd> for CapsuleError {
    fn from(_: VarIntUnexpectedEnd) -> Self {
        CapsuleError::Incomplete
    }
}

/// Try to decode one capsule (type + length-prefixed payload) from the front
/// of `buf`. Returns `Ok(None)` if the buffer doesn't yet hold a complete
/// capsule; the caller should wait for more bytes rather than treat that as
/// an error.
pub fn decode(buf: &[u8]) -> Result<Option<(Capsule, usize)>, CapsuleError> {
    let mut cursor = buf;
    let before = cursor.remaining();

    let typ = match VarInt::decode(&mut cursor) {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };
    let len = match VarInt::decode(&mut cursor) {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };
    let payload_len = len.into_inner() as usize;
    if payload_len > MAX_REASON_LEN + 4 {
        return Err(CapsuleError::ReasonTooLong);
    }
    if cursor.remaining() < payload_len {
        return Ok(None);
    }

    let header_len = before - cursor.remaining();
    let payload = &cursor[..payload_len];
    let total = header_len + payload_len;

    if typ.into_inner() != CLOSE_WEBTRANSPORT_SESSION_TYPE {
        return Ok(Some((Capsule::Other, total)));
    }

    if payload.len() < 4 {
        return Err(CapsuleError::Incomplete);
    }
    let code = u32::from_be_bytes(payload[0..4].try_into().unwrap());
    let reason = String::from_utf8(payload[4..].to_vec()).map_err(|_| CapsuleError::InvalidUtf8)?;

    Ok(Some((Capsule::CloseWebTransportSession { code, reason }, total)))
}

pub fn encode_close<B: BufMut>(buf: &mut B, code: u32, reason: &str) {
    VarInt::try_from_u64(CLOSE_WEBTRANSPORT_SESSION_TYPE)
        .unwrap()
        .encode(buf);
    VarInt::try_from_u64(4 + reason.len() as u64)
        .expect("reason too long for a capsule")
        .encode(buf);
    buf.put_u32(code);
    buf.put_slice(reason.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_close_capsule() {
        let mut buf = Vec::new();
        encode_close(&mut buf, 42, "bye");

        let (capsule, consumed) = decode(&buf).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(
            capsule,
            Capsule::CloseWebTransportSession {
                code: 42,
                reason: "bye".to_string()
            }
        );
    }

    #[test]
    fn waits_for_full_payload() {
        let mut buf = Vec::new();
        encode_close(&mut buf, 1, "reason too long to fit yet");
        let short = &buf[..buf.len() - 1];
        assert_eq!(decode(short).unwrap(), None);
    }

    #[test]
    fn unknown_capsule_type_is_skipped_not_rejected() {
        let mut buf = Vec::new();
        VarInt::try_from_u64(0x17).unwrap().encode(&mut buf); // arbitrary unrelated type
        VarInt::try_from_u64(3).unwrap().encode(&mut buf);
        buf.extend_from_slice(b"abc");

        let (capsule, consumed) = decode(&buf).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(capsule, Capsule::Other);
    }
}
