//! Per-connection state: the negotiated protocol, the stream table, and the
//! structured close reason.
//!
//! `ConnectionError` is adopted from `ez::connection::ConnectionError`,
//! trimmed to the variants this server can actually produce: there
//! is no `Connection` handle to `Drop`, since this crate drives everything
//! from inside `driver::EchoDriver`'s callbacks rather than handing stream
//! handles out to a separate task.

use thiserror::Error;
use tokio_quiche::quiche;

use crate::stream::StreamTable;

#[derive(Clone, Error, Debug)]
pub enum ConnectionError {
    #[error("quiche error: {0}")]
    Quiche(#[from] quiche::Error),

    #[error("remote CONNECTION_CLOSE: code={0} reason={1}")]
    Remote(u64, String),

    #[error("local CONNECTION_CLOSE: code={0} reason={1}")]
    Local(u64, String),

    #[error("unknown error: {0}")]
    Unknown(String),
}

/// The connection's negotiated application protocol, set once immediately
/// after the handshake completes and never changed thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Echo,
    H3,
}

impl Proto {
    pub fn from_alpn(alpn: &[u8]) -> Option<Self> {
        match alpn {
            b"h3" => Some(Proto::H3),
            b"echo" => Some(Proto::Echo),
            _ => None,
        }
    }
}

/// Per-connection state. One instance lives for the lifetime of
/// one QUIC connection; `EchoDriver` owns it and mutates it from the
/// `ApplicationOverQuic` callbacks.
pub struct ConnectionState {
    pub streams: StreamTable,
    pub handshake_done: bool,
    pub proto: Option<Proto>,
    /// The H3 control/QPACK unidirectional streams have been opened.
    pub h3_activated: bool,
    pub wt_session_stream: Option<crate::stream::StreamId>,
    pub last_error: Option<ConnectionError>,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            streams: StreamTable::new(),
            handshake_done: false,
            proto: None,
            h3_activated: false,
            wt_session_stream: None,
            last_error: None,
        }
    }

    /// Set `proto` from the negotiated ALPN. A no-op if already set: `proto`
    /// is determined exactly once, immediately after the handshake.
    pub fn set_proto_from_alpn(&mut self, alpn: &[u8]) {
        if self.proto.is_some() {
            return;
        }
        self.proto = Proto::from_alpn(alpn);
    }

    pub fn is_h3(&self) -> bool {
        matches!(self.proto, Some(Proto::H3))
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proto_from_alpn_matches_preference_list() {
        assert_eq!(Proto::from_alpn(b"h3"), Some(Proto::H3));
        assert_eq!(Proto::from_alpn(b"echo"), Some(Proto::Echo));
        assert_eq!(Proto::from_alpn(b"h2"), None);
    }

    #[test]
    fn proto_is_set_exactly_once() {
        let mut state = ConnectionState::new();
        state.set_proto_from_alpn(b"h3");
        assert_eq!(state.proto, Some(Proto::H3));
        state.set_proto_from_alpn(b"echo");
        assert_eq!(state.proto, Some(Proto::H3), "proto must not change once set");
    }
}
