//! The `ApplicationOverQuic` implementation: this server's entire QUIC/H3
//! callback surface, grounded on `ez::driver::Driver` but
//! collapsed from its task-handle-oriented design (streams handed out as
//! `SendStream`/`RecvStream` to a separate async consumer) into a single
//! reactive driver, since this server has no separate application task —
//! every byte this crate receives is either echoed or turned into an H3
//! response entirely inside the QUIC callback surface.

use std::collections::HashMap;
use std::collections::VecDeque;

use tokio_quiche::buf_factory::{BufFactory, PooledBuf};
use tokio_quiche::quic::{HandshakeInfo, QuicheConnection};
use tokio_quiche::metrics::Metrics;
use tokio_quiche::{ApplicationOverQuic, BoxError, QuicResult};

use crate::clock::Clock;
use crate::connection::{ConnectionError, ConnectionState, Proto};
use crate::entropy::TraceId;
use crate::h3::{self, Settings};
use crate::qpack;
use crate::stream::{StreamClass, StreamId};
use crate::wire::{peek_frame_header, Frame, StreamUni, VarInt};
use crate::write_engine;

/// Server-initiated unidirectional stream ids (RFC 9000 §2.1: server-initiated
/// uni streams are `id % 4 == 3`), opened once during H3 activation.
const CONTROL_STREAM_ID: u64 = 3;
const QPACK_ENCODER_STREAM_ID: u64 = 7;
const QPACK_DECODER_STREAM_ID: u64 = 11;

pub struct EchoDriver {
    conn: ConnectionState,
    trace_id: TraceId,
    clock: Clock,

    /// Bytes accumulated per bidirectional H3 stream while waiting for a
    /// complete HEADERS frame.
    h3_recv: HashMap<StreamId, Vec<u8>>,
    /// The sniffed type of each peer-initiated unidirectional stream, once
    /// its leading stream-type varint has been read.
    uni_kind: HashMap<StreamId, StreamUni>,
    /// Control-stream SETTINGS has already been parsed for this connection.
    control_settings_seen: bool,

    /// Datagrams queued for echo, each still carrying its WebTransport
    /// session-id quarter-stream-id prefix.
    pending_datagrams: VecDeque<Vec<u8>>,

    read_buf: PooledBuf,
}

impl EchoDriver {
    pub fn new() -> Self {
        Self {
            conn: ConnectionState::new(),
            trace_id: TraceId::generate(),
            clock: Clock::new(),
            h3_recv: HashMap::new(),
            uni_kind: HashMap::new(),
            control_settings_seen: false,
            pending_datagrams: VecDeque::new(),
            read_buf: BufFactory::get_max_buf(),
        }
    }

    fn on_handshake(&mut self, qconn: &mut QuicheConnection) -> Result<(), ConnectionError> {
        let alpn = qconn.application_proto().to_vec();
        self.conn.handshake_done = true;
        self.conn.set_proto_from_alpn(&alpn);

        tracing::info!(
            trace_id = %self.trace_id,
            alpn = %String::from_utf8_lossy(&alpn),
            proto = ?self.conn.proto,
            "handshake complete"
        );

        if self.conn.is_h3() {
            self.try_activate_h3(qconn)?;
        }

        Ok(())
    }

    /// Open the control + QPACK encoder/decoder unidirectional streams and
    /// announce this server's settings. Requires at least 3
    /// peer-granted unidirectional stream credits; if not yet available this
    /// is retried on every subsequent write pass.
    fn try_activate_h3(&mut self, qconn: &mut QuicheConnection) -> Result<(), ConnectionError> {
        if self.conn.h3_activated {
            return Ok(());
        }
        if qconn.peer_streams_left_uni() < 3 {
            return Ok(());
        }

        let mut control = Vec::new();
        StreamUni::CONTROL.0.encode(&mut control);
        Settings::server_defaults().encode(&mut control);
        write_uni_once(qconn, CONTROL_STREAM_ID, &control)?;

        let mut qpack_encoder = Vec::new();
        StreamUni::QPACK_ENCODER.0.encode(&mut qpack_encoder);
        write_uni_once(qconn, QPACK_ENCODER_STREAM_ID, &qpack_encoder)?;

        let mut qpack_decoder = Vec::new();
        StreamUni::QPACK_DECODER.0.encode(&mut qpack_decoder);
        write_uni_once(qconn, QPACK_DECODER_STREAM_ID, &qpack_decoder)?;

        self.conn.h3_activated = true;
        tracing::debug!(trace_id = %self.trace_id, "H3 activated: control+QPACK streams opened");
        Ok(())
    }

    fn process_reads_inner(&mut self, qconn: &mut QuicheConnection) -> Result<(), ConnectionError> {
        while let Some(raw_id) = qconn.stream_readable_next() {
            let id = StreamId::from(raw_id);
            loop {
                let (len, fin) = match qconn.stream_recv(raw_id, &mut self.read_buf) {
                    Ok(v) => v,
                    Err(tokio_quiche::quiche::Error::Done) => break,
                    Err(e) => return Err(e.into()),
                };

                let bytes = self.read_buf[..len].to_vec();
                self.handle_stream_data(qconn, id, &bytes, fin)?;

                if fin {
                    break;
                }
            }
        }

        self.drain_datagrams(qconn)?;

        Ok(())
    }

    fn handle_stream_data(
        &mut self,
        qconn: &mut QuicheConnection,
        id: StreamId,
        bytes: &[u8],
        fin: bool,
    ) -> Result<(), ConnectionError> {
        match self.conn.proto {
            Some(Proto::Echo) | None => self.handle_echo_data(id, bytes, fin),
            Some(Proto::H3) => self.handle_h3_data(qconn, id, bytes, fin)?,
        }
        Ok(())
    }

    /// Plain echo: push received bytes straight back onto the same stream.
    fn handle_echo_data(&mut self, id: StreamId, bytes: &[u8], fin: bool) {
        let record = self.conn.streams.get_or_create(id, StreamClass::RawEcho);
        record.push(bytes);
        if fin {
            record.set_fin_received();
            record.echo_fin_on_drain();
        }
    }

    fn handle_h3_data(
        &mut self,
        qconn: &mut QuicheConnection,
        id: StreamId,
        bytes: &[u8],
        fin: bool,
    ) -> Result<(), ConnectionError> {
        if !id.is_bidirectional() {
            self.handle_h3_uni_data(id, bytes);
            return Ok(());
        }

        let class = self.conn.streams.get(id).map(|r| r.class);

        // The WebTransport session stream (the original CONNECT stream)
        // carries capsules, not raw payload; any other stream already
        // classified WtBidi or Ws is a data stream and just gets its payload
        // appended for echo.
        match class {
            Some(StreamClass::WtBidi) if self.conn.wt_session_stream == Some(id) => {
                self.handle_wt_session_data(id, bytes, fin);
                return Ok(());
            }
            Some(StreamClass::WtBidi) | Some(StreamClass::Ws) => {
                let record = self.conn.streams.get_mut(id).expect("just checked");
                record.push(bytes);
                if fin {
                    record.set_fin_received();
                    record.echo_fin_on_drain();
                }
                return Ok(());
            }
            _ => {}
        }

        let buf = self.h3_recv.entry(id).or_default();
        buf.extend_from_slice(bytes);

        // A stream with no record yet, arriving after a WT session is
        // established, might be a client-opened WebTransport data stream:
        // those are prefixed with a WEBTRANSPORT_STREAM frame type and the
        // session id they belong to, rather than a HEADERS frame.
        if class.is_none() && self.conn.wt_session_stream.is_some() {
            match wt_stream_header(self.h3_recv.get(&id).unwrap()) {
                WtStreamHeader::Matched { session_id, consumed } => {
                    let mut payload = self.h3_recv.remove(&id).unwrap();
                    payload.drain(..consumed);
                    let record = self.conn.streams.get_or_create(id, StreamClass::WtBidi);
                    record.wt_session_id = Some(session_id);
                    record.push(&payload);
                    if fin {
                        record.set_fin_received();
                        record.echo_fin_on_drain();
                    }
                    return Ok(());
                }
                WtStreamHeader::Incomplete => return Ok(()),
                WtStreamHeader::NotWebTransport => {}
            }
        }

        self.try_parse_headers(qconn, id)?;

        Ok(())
    }

    /// Parse capsules off the WebTransport session stream. A well-behaved
    /// client signals session teardown this way instead of only resetting
    /// streams.
    fn handle_wt_session_data(&mut self, id: StreamId, bytes: &[u8], fin: bool) {
        let buf = self.h3_recv.entry(id).or_default();
        buf.extend_from_slice(bytes);

        loop {
            let buf_ref = self.h3_recv.get(&id).unwrap();
            match crate::capsule::decode(buf_ref) {
                Ok(Some((capsule, consumed))) => {
                    self.h3_recv.get_mut(&id).unwrap().drain(..consumed);
                    if let crate::capsule::Capsule::CloseWebTransportSession { code, reason } = capsule {
                        tracing::info!(stream_id = %id, code, %reason, "WebTransport session closed by capsule");
                        if self.conn.wt_session_stream == Some(id) {
                            self.conn.wt_session_stream = None;
                        }
                        if let Some(record) = self.conn.streams.get_mut(id) {
                            record.mark_send_fin();
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(stream_id = %id, ?err, "malformed capsule on session stream");
                    self.h3_recv.get_mut(&id).unwrap().clear();
                    break;
                }
            }
        }

        if fin {
            if let Some(record) = self.conn.streams.get_mut(id) {
                record.set_fin_received();
            }
            if self.conn.wt_session_stream == Some(id) {
                self.conn.wt_session_stream = None;
            }
        }
    }

    fn try_parse_headers(&mut self, qconn: &mut QuicheConnection, id: StreamId) -> Result<(), ConnectionError> {
        loop {
            let buf = match self.h3_recv.get(&id) {
                Some(b) if !b.is_empty() => b,
                _ => return Ok(()),
            };

            let (typ, len, header_len) = match peek_frame_header(&buf.as_slice()) {
                Ok(v) => v,
                Err(_) => return Ok(()), // incomplete frame header, wait for more bytes
            };

            let total = header_len + len as usize;
            if buf.len() < total {
                return Ok(()); // frame header known, payload still incomplete
            }

            if typ != Frame::HEADERS {
                // Anything else on a request stream before headers is out of
                // scope for this server; drop it and keep waiting.
                let buf = self.h3_recv.get_mut(&id).unwrap();
                buf.drain(..total);
                continue;
            }

            let payload = buf[header_len..total].to_vec();
            let buf = self.h3_recv.get_mut(&id).unwrap();
            buf.drain(..total);

            let fields = match qpack::decode_field_section(&payload) {
                Ok(f) => f,
                Err(err) => {
                    tracing::warn!(stream_id = %id, %err, "malformed field section, resetting stream");
                    let _ = qconn.stream_shutdown(id.into(), tokio_quiche::quiche::Shutdown::Write, 0x100);
                    return Ok(());
                }
            };

            self.dispatch_headers(id, &fields);
        }
    }

    /// Dispatch a complete field section on its pseudo-headers.
    fn dispatch_headers(&mut self, id: StreamId, fields: &[qpack::Field]) {
        let method = qpack::find(fields, ":method").unwrap_or("").to_string();
        let path = qpack::find(fields, ":path").unwrap_or("/").to_string();
        let protocol = qpack::find(fields, ":protocol").map(str::to_string);

        if method == "CONNECT" {
            let outcome = h3::dispatch_connect(protocol.as_deref());
            let class = outcome.stream_class();
            let frame = outcome.response().encode_headers_frame();

            let record = self
                .conn
                .streams
                .get_or_create(id, class.unwrap_or(StreamClass::H3Request));
            record.method = Some(method);
            record.path = Some(path);
            record.protocol = protocol;
            record.push(&frame);

            match class {
                Some(StreamClass::WtBidi) => {
                    record.wt_session_id = Some(id.into());
                    self.conn.wt_session_stream = Some(id);
                }
                None => record.mark_send_fin(),
                _ => {}
            }
        } else {
            let resp = h3::dispatch_request(&method, &path);
            let frame = resp.encode_headers_frame();

            let record = self.conn.streams.get_or_create(id, StreamClass::H3Request);
            record.method = Some(method);
            record.path = Some(path);
            record.push(&frame);
            record.mark_send_fin();
        }
    }

    fn handle_h3_uni_data(&mut self, id: StreamId, bytes: &[u8]) {
        let buf = self.h3_recv.entry(id).or_default();
        buf.extend_from_slice(bytes);

        if !self.uni_kind.contains_key(&id) {
            let typ = match VarInt::decode(&mut &buf[..]) {
                Ok(v) => StreamUni(v),
                Err(_) => return, // wait for the stream-type varint
            };
            let consumed = typ.0.size();
            self.uni_kind.insert(id, typ);
            let buf = self.h3_recv.get_mut(&id).unwrap();
            buf.drain(..consumed);
        }

        let kind = self.uni_kind[&id];
        if kind == StreamUni::CONTROL && !self.control_settings_seen {
            let buf = self.h3_recv.get(&id).unwrap();
            if let Ok((settings, consumed)) = Settings::decode_frame(buf) {
                self.control_settings_seen = true;
                if !settings.peer_supports_webtransport() {
                    tracing::debug!(trace_id = %self.trace_id, "peer control SETTINGS do not advertise WebTransport");
                }
                let buf = self.h3_recv.get_mut(&id).unwrap();
                buf.drain(..consumed);
            }
            return;
        }

        // QPACK encoder/decoder instructions: this server never populates a
        // dynamic table (see qpack.rs), so there is nothing to apply. Drop
        // whatever accumulated so the buffer doesn't grow unbounded.
        self.h3_recv.get_mut(&id).unwrap().clear();
    }

    /// Parse the quarter-stream-id prefix, verify it names the live WT
    /// session, and re-encode the same prefix on echo rather than blindly
    /// mirroring the received bytes.
    fn drain_datagrams(&mut self, qconn: &mut QuicheConnection) -> Result<(), ConnectionError> {
        let mut buf = vec![0u8; 65535];
        loop {
            let len = match qconn.dgram_recv(&mut buf) {
                Ok(len) => len,
                Err(tokio_quiche::quiche::Error::Done) => break,
                Err(e) => return Err(e.into()),
            };

            let mut cursor = &buf[..len];
            let quarter_id = match VarInt::decode(&mut cursor) {
                Ok(v) => v.into_inner(),
                Err(_) => {
                    tracing::warn!("dropped datagram with malformed session-id prefix");
                    continue;
                }
            };

            let session_stream = quarter_id * 4;
            if self.conn.wt_session_stream != Some(StreamId::from(session_stream)) {
                tracing::warn!(quarter_id, "dropped datagram for unknown WebTransport session");
                continue;
            }

            let mut echoed = Vec::with_capacity(len);
            VarInt::try_from_u64(quarter_id)
                .expect("quarter id fits a varint, it came from one")
                .encode(&mut echoed);
            echoed.extend_from_slice(cursor);
            self.pending_datagrams.push_back(echoed);
        }
        Ok(())
    }

    fn process_writes_inner(&mut self, qconn: &mut QuicheConnection) -> Result<(), ConnectionError> {
        if self.conn.is_h3() && self.conn.handshake_done {
            self.try_activate_h3(qconn)?;
        }

        while let Some(dgram) = self.pending_datagrams.pop_front() {
            match qconn.dgram_send(&dgram) {
                Ok(()) => {}
                Err(tokio_quiche::quiche::Error::Done) => {
                    self.pending_datagrams.push_front(dgram);
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }

        write_engine::flush(qconn, &mut self.conn.streams)
    }

    fn abort_on_error(&mut self, err: ConnectionError) {
        tracing::warn!(trace_id = %self.trace_id, %err, "connection callback failed");
        self.conn.last_error = Some(err);
    }
}

impl Default for EchoDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn write_uni_once(qconn: &mut QuicheConnection, id: u64, payload: &[u8]) -> Result<(), ConnectionError> {
    let n = qconn.stream_send(id, payload, false)?;
    if n < payload.len() {
        tracing::warn!(stream_id = id, sent = n, total = payload.len(), "short write opening H3 control stream");
    }
    Ok(())
}

enum WtStreamHeader {
    Matched { session_id: u64, consumed: usize },
    Incomplete,
    NotWebTransport,
}

/// Peek the WEBTRANSPORT_STREAM header (frame type + session-id varint) a
/// client prepends to every bidirectional stream it opens within an
/// established WebTransport session, without consuming `buf`.
fn wt_stream_header(buf: &[u8]) -> WtStreamHeader {
    let mut cursor = buf;
    let typ = match VarInt::decode(&mut cursor) {
        Ok(v) => Frame(v),
        Err(_) => return WtStreamHeader::Incomplete,
    };
    if typ != Frame::WEBTRANSPORT {
        return WtStreamHeader::NotWebTransport;
    }
    let session_id = match VarInt::decode(&mut cursor) {
        Ok(v) => v.into_inner(),
        Err(_) => return WtStreamHeader::Incomplete,
    };
    WtStreamHeader::Matched {
        session_id,
        consumed: buf.len() - cursor.len(),
    }
}

impl ApplicationOverQuic for EchoDriver {
    fn on_conn_established(
        &mut self,
        qconn: &mut QuicheConnection,
        _handshake_info: &HandshakeInfo,
    ) -> QuicResult<()> {
        if let Err(e) = self.on_handshake(qconn) {
            self.abort_on_error(e);
        }
        Ok(())
    }

    fn should_act(&self) -> bool {
        true
    }

    fn buffer(&mut self) -> &mut [u8] {
        &mut self.read_buf
    }

    async fn wait_for_data(&mut self, _qconn: &mut QuicheConnection) -> Result<(), BoxError> {
        // This driver has no independent async work source (no channel, no
        // timer of its own): every state change originates from a QUIC
        // event, which tokio-quiche already wakes us for via process_reads
        // and process_writes. There is nothing else to wait on.
        std::future::pending::<()>().await;
        Ok(())
    }

    fn process_reads(&mut self, qconn: &mut QuicheConnection) -> QuicResult<()> {
        if let Err(e) = self.process_reads_inner(qconn) {
            self.abort_on_error(e);
        }
        Ok(())
    }

    fn process_writes(&mut self, qconn: &mut QuicheConnection) -> QuicResult<()> {
        if let Err(e) = self.process_writes_inner(qconn) {
            self.abort_on_error(e);
        }
        Ok(())
    }

    fn on_conn_close<M: Metrics>(
        &mut self,
        qconn: &mut QuicheConnection,
        _metrics: &M,
        connection_result: &QuicResult<()>,
    ) {
        let err = if let Some(err) = self.conn.last_error.clone() {
            err
        } else if let Some(local) = qconn.local_error() {
            ConnectionError::Local(local.error_code, String::from_utf8_lossy(&local.reason).to_string())
        } else if let Some(peer) = qconn.peer_error() {
            ConnectionError::Remote(peer.error_code, String::from_utf8_lossy(&peer.reason).to_string())
        } else if let Err(e) = connection_result {
            ConnectionError::Unknown(e.to_string())
        } else {
            ConnectionError::Unknown("connection closed".to_string())
        };

        let lifetime_ms = self.clock.now_nanos() / 1_000_000;
        tracing::info!(trace_id = %self.trace_id, %err, lifetime_ms, "connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_driver_has_no_protocol_yet() {
        let driver = EchoDriver::new();
        assert!(driver.conn.proto.is_none());
        assert!(!driver.conn.h3_activated);
    }

    #[test]
    fn wt_stream_header_matches_and_reports_consumed_len() {
        let mut buf = Vec::new();
        Frame::WEBTRANSPORT.0.encode(&mut buf);
        VarInt::from_u32(9).encode(&mut buf);
        buf.extend_from_slice(b"payload");

        match wt_stream_header(&buf) {
            WtStreamHeader::Matched { session_id, consumed } => {
                assert_eq!(session_id, 9);
                assert_eq!(&buf[consumed..], b"payload");
            }
            _ => panic!("expected a match"),
        }
    }

    #[test]
    fn wt_stream_header_rejects_headers_frame() {
        let mut buf = Vec::new();
        Frame::HEADERS.0.encode(&mut buf);
        assert!(matches!(wt_stream_header(&buf), WtStreamHeader::NotWebTransport));
    }

    #[test]
    fn wt_stream_header_waits_for_session_id() {
        let mut buf = Vec::new();
        Frame::WEBTRANSPORT.0.encode(&mut buf);
        assert!(matches!(wt_stream_header(&buf), WtStreamHeader::Incomplete));
    }
}
