//! Extended CONNECT (RFC 8441 / RFC 9220) dispatch for WebTransport and
//! WebSocket-over-H3. Grounded on `h3::connect::Connecting`'s handshake
//! shape, simplified: this server never originates Extended CONNECT, only
//! accepts it, so there is no client-side state machine to carry.

use crate::h3::request::Response;
use crate::stream::StreamClass;

/// The result of dispatching an Extended CONNECT request.
pub enum ConnectOutcome {
    /// `:protocol = webtransport`: classify the stream `WtBidi` and make it
    /// the session stream.
    WebTransport(Response),
    /// `:protocol = websocket`: classify the stream `Ws`.
    WebSocket(Response),
    /// Any other `:protocol`, or a CONNECT with no protocol at all.
    Reject(Response),
}

impl ConnectOutcome {
    pub fn response(&self) -> &Response {
        match self {
            ConnectOutcome::WebTransport(r) | ConnectOutcome::WebSocket(r) | ConnectOutcome::Reject(r) => r,
        }
    }

    pub fn stream_class(&self) -> Option<StreamClass> {
        match self {
            ConnectOutcome::WebTransport(_) => Some(StreamClass::WtBidi),
            ConnectOutcome::WebSocket(_) => Some(StreamClass::Ws),
            ConnectOutcome::Reject(_) => None,
        }
    }
}

/// WebTransport's draft version this server implements: the response header
/// a compliant WT client expects alongside `:status=200`.
const WT_DRAFT_HEADER: &str = "sec-webtransport-http3-draft";
const WT_DRAFT_VALUE: &str = "draft02";

/// Dispatch a CONNECT request by its `:protocol` pseudo-header.
pub fn dispatch_connect(protocol: Option<&str>) -> ConnectOutcome {
    match protocol {
        Some("webtransport") => {
            let resp = Response::new(200).header(WT_DRAFT_HEADER, WT_DRAFT_VALUE);
            ConnectOutcome::WebTransport(resp)
        }
        Some("websocket") => ConnectOutcome::WebSocket(Response::new(200)),
        _ => ConnectOutcome::Reject(Response::new(405)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webtransport_gets_draft_header() {
        let outcome = dispatch_connect(Some("webtransport"));
        assert_eq!(outcome.response().status, 200);
        assert_eq!(outcome.stream_class(), Some(StreamClass::WtBidi));
        assert!(outcome
            .response()
            .headers
            .iter()
            .any(|f| f.name == WT_DRAFT_HEADER && f.value == WT_DRAFT_VALUE));
    }

    #[test]
    fn websocket_is_plain_200() {
        let outcome = dispatch_connect(Some("websocket"));
        assert_eq!(outcome.response().status, 200);
        assert_eq!(outcome.stream_class(), Some(StreamClass::Ws));
    }

    #[test]
    fn unknown_protocol_is_rejected() {
        let outcome = dispatch_connect(Some("ftp"));
        assert_eq!(outcome.response().status, 405);
        assert!(outcome.stream_class().is_none());
    }

    #[test]
    fn missing_protocol_is_rejected() {
        let outcome = dispatch_connect(None);
        assert_eq!(outcome.response().status, 405);
    }
}
