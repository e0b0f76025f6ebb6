//! HTTP/3 SETTINGS frame codec (RFC 9114 §7.2.4), adapted from
//! `web-transport-proto::settings` to operate over the in-memory `Buf`
//! windows `wire.rs` defines instead of an `AsyncRead` stream — this
//! server's H3 control stream is parsed out of a buffer the driver already
//! accumulated (see `stream.rs`), not read frame-by-frame from an async
//! reader.

use std::collections::HashMap;

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::wire::{encode_frame_header, peek_frame_header, Frame, FrameError, VarInt};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Setting(pub VarInt);

impl Setting {
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, crate::wire::VarIntUnexpectedEnd> {
        Ok(Setting(VarInt::decode(buf)?))
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        self.0.encode(buf)
    }

    // RFC 9114 §7.2.4.1.
    pub fn is_grease(&self) -> bool {
        let val = self.0.into_inner();
        if val < 0x21 {
            return false;
        }
        (val - 0x21) % 0x1f == 0
    }
}

impl std::fmt::Debug for Setting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Setting::QPACK_MAX_TABLE_CAPACITY => write!(f, "QPACK_MAX_TABLE_CAPACITY"),
            Setting::QPACK_BLOCKED_STREAMS => write!(f, "QPACK_BLOCKED_STREAMS"),
            Setting::ENABLE_CONNECT_PROTOCOL => write!(f, "ENABLE_CONNECT_PROTOCOL"),
            Setting::H3_DATAGRAM => write!(f, "H3_DATAGRAM"),
            Setting::WT_MAX_SESSIONS => write!(f, "WT_MAX_SESSIONS"),
            x if x.is_grease() => write!(f, "GREASE[{:x?}]", x.0.into_inner()),
            x => write!(f, "UNKNOWN[{:x?}]", x.0.into_inner()),
        }
    }
}

macro_rules! settings {
    {$($name:ident = $val:expr,)*} => {
        impl Setting {
            $(pub const $name: Setting = Setting(VarInt::from_u32($val));)*
        }
    }
}

settings! {
    QPACK_MAX_TABLE_CAPACITY = 0x1,
    QPACK_BLOCKED_STREAMS = 0x7,
    ENABLE_CONNECT_PROTOCOL = 0x8,
    // RFC 9297.
    H3_DATAGRAM = 0x33,
    // This differs from the pre-standardization `0xc671706a` value
    // `web-transport-proto` still carries for older drafts/Chrome
    // compatibility. This server only needs to speak one value.
    WT_MAX_SESSIONS = 0x14e9cd29,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("unexpected end of input")]
    UnexpectedEnd,
    #[error("unexpected frame {0:?}")]
    UnexpectedFrame(Frame),
    #[error("frame too large")]
    FrameTooLarge,
}

impl From<FrameError> for SettingsError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Incomplete => SettingsError::UnexpectedEnd,
            FrameError::TooLarge => SettingsError::FrameTooLarge,
        }
    }
}

#[derive(Default, Debug, PartialEq)]
pub struct Settings(HashMap<Setting, VarInt>);

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, setting: Setting) -> Option<u64> {
        self.0.get(&setting).map(|v| v.into_inner())
    }

    pub fn insert(&mut self, setting: Setting, value: u64) {
        self.0
            .insert(setting, VarInt::try_from_u64(value).expect("value too large"));
    }

    /// Decode the payload of a single SETTINGS frame (the frame header must
    /// already have been consumed by the caller via `peek_frame_header`).
    pub fn decode_payload<B: Buf>(mut data: B) -> Result<Self, SettingsError> {
        let mut settings = Settings::default();
        while data.has_remaining() {
            let id = Setting::decode(&mut data).map_err(|_| SettingsError::UnexpectedEnd)?;
            let value = VarInt::decode(&mut data).map_err(|_| SettingsError::UnexpectedEnd)?;
            if !id.is_grease() {
                settings.0.insert(id, value);
            }
        }
        Ok(settings)
    }

    /// Parse a full SETTINGS frame (type + length + payload) out of `buf`,
    /// returning the decoded settings and the number of bytes consumed.
    pub fn decode_frame(buf: &[u8]) -> Result<(Self, usize), SettingsError> {
        let (typ, len, header_len) = peek_frame_header(&buf)?;
        if typ != Frame::SETTINGS {
            return Err(SettingsError::UnexpectedFrame(typ));
        }
        let total = header_len + len as usize;
        if buf.len() < total {
            return Err(SettingsError::UnexpectedEnd);
        }
        let settings = Self::decode_payload(&buf[header_len..total])?;
        Ok((settings, total))
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        let mut payload = Vec::new();
        for (id, value) in &self.0 {
            id.encode(&mut payload);
            value.encode(&mut payload);
        }
        encode_frame_header(buf, Frame::SETTINGS, payload.len());
        buf.put_slice(&payload);
    }

    /// The fixed settings this server advertises on its control stream:
    /// QPACK bounds, Extended CONNECT, H3 DATAGRAM, and the WebTransport
    /// session-count advertisement.
    pub fn server_defaults() -> Self {
        let mut settings = Settings::new();
        settings.insert(Setting::QPACK_MAX_TABLE_CAPACITY, 4096);
        settings.insert(Setting::QPACK_BLOCKED_STREAMS, 100);
        settings.insert(Setting::ENABLE_CONNECT_PROTOCOL, 1);
        settings.insert(Setting::H3_DATAGRAM, 1);
        settings.insert(Setting::WT_MAX_SESSIONS, 100);
        settings
    }

    /// Whether the peer's settings are consistent with a client that intends
    /// to use WebTransport. Informational only; never gates behavior.
    pub fn peer_supports_webtransport(&self) -> bool {
        self.get(Setting::ENABLE_CONNECT_PROTOCOL) == Some(1)
            && self.get(Setting::H3_DATAGRAM) == Some(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let settings = Settings::server_defaults();
        let mut buf = Vec::new();
        settings.encode(&mut buf);

        let (decoded, consumed) = Settings::decode_frame(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded.get(Setting::WT_MAX_SESSIONS), Some(100));
        assert!(decoded.peer_supports_webtransport());
    }

    #[test]
    fn decode_rejects_wrong_frame_type() {
        let mut buf = Vec::new();
        encode_frame_header(&mut buf, Frame::HEADERS, 0);
        let err = Settings::decode_frame(&buf).unwrap_err();
        assert!(matches!(err, SettingsError::UnexpectedFrame(f) if f == Frame::HEADERS));
    }

    #[test]
    fn decode_skips_grease_settings() {
        let mut payload = Vec::new();
        Setting(VarInt::from_u32(0x21)).encode(&mut payload); // first GREASE value
        VarInt::from_u32(1234).encode(&mut payload);
        Setting::ENABLE_CONNECT_PROTOCOL.encode(&mut payload);
        VarInt::from_u32(1).encode(&mut payload);

        let mut buf = Vec::new();
        encode_frame_header(&mut buf, Frame::SETTINGS, payload.len());
        buf.extend_from_slice(&payload);

        let (decoded, _) = Settings::decode_frame(&buf).unwrap();
        assert_eq!(decoded.get(Setting::ENABLE_CONNECT_PROTOCOL), Some(1));
        assert_eq!(decoded.0.len(), 1);
    }

    #[test]
    fn wt_max_sessions_uses_spec_id_not_draft_id() {
        assert_eq!(Setting::WT_MAX_SESSIONS.0.into_inner(), 0x14e9cd29);
    }

    #[test]
    fn decode_frame_waits_for_full_payload() {
        let mut buf = Vec::new();
        encode_frame_header(&mut buf, Frame::SETTINGS, 10);
        buf.extend_from_slice(b"short");
        assert_eq!(Settings::decode_frame(&buf), Err(SettingsError::UnexpectedEnd));
    }
}
