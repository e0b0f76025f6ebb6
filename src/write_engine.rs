//! Drains per-stream echo buffers into QUIC STREAM frames.
//!
//! Grounded on `ez::send::SendState::flush`: the same `stream_send` /
//! `stream_capacity` / `stream_shutdown` calls, simplified because this
//! server has no queued-`Bytes` write buffer of its own — `StreamRecord`'s
//! `sendbuf` already plays that role (see `stream.rs`) and is shared between
//! the raw-echo and HTTP/3 paths, so there's one drain loop instead of
//! separate H3-writev and echo-scan code paths: both paths already produce
//! plain `StreamRecord`s by the time the write engine runs.

use tokio_quiche::quic::QuicheConnection;
use tokio_quiche::quiche;

use crate::connection::ConnectionError;
use crate::stream::{StreamRecord, StreamTable};

/// Flush one stream's unsent bytes (and FIN, if due) onto the transport.
/// Returns `Ok(true)` if the stream is fully drained and should be removed
/// from the stream table.
fn flush_one(
    qconn: &mut QuicheConnection,
    record: &mut StreamRecord,
) -> Result<bool, ConnectionError> {
    let id: u64 = record.stream_id.into();

    while record.has_unsent() {
        let chunk = record.unsent();
        match qconn.stream_send(id, chunk, false) {
            Ok(n) => {
                if n == 0 {
                    break;
                }
                record.advance(n);
            }
            Err(quiche::Error::Done) => break,
            Err(quiche::Error::StreamStopped(code)) => {
                tracing::trace!(stream_id = %record.stream_id, code, "peer sent STOP_SENDING");
                return Ok(true);
            }
            Err(e) => return Err(e.into()),
        }
    }

    if !record.has_unsent() && record.should_send_fin() {
        match qconn.stream_send(id, &[], true) {
            Ok(_) | Err(quiche::Error::Done) => return Ok(true),
            Err(quiche::Error::StreamStopped(_)) => return Ok(true),
            Err(e) => return Err(e.into()),
        }
    }

    Ok(false)
}

/// One pass over every stream with unsent data or a pending FIN.
/// Called after every dispatch and every timer tick by `driver::EchoDriver`.
pub fn flush(qconn: &mut QuicheConnection, streams: &mut StreamTable) -> Result<(), ConnectionError> {
    let mut drained = Vec::new();

    for record in streams.drainable() {
        if flush_one(qconn, record)? {
            drained.push(record.stream_id);
        }
    }

    for id in drained {
        streams.remove(id);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{StreamClass, StreamId};

    #[test]
    fn fully_drained_record_without_fin_stays_in_table() {
        // Without a live QuicheConnection this only exercises the
        // record-level bookkeeping `flush_one` itself doesn't touch.
        let mut record = StreamRecord::new(StreamId::from(0), StreamClass::RawEcho);
        record.push(b"hi");
        assert!(record.has_unsent());
        record.advance(2);
        assert!(!record.has_unsent());
        assert!(!record.is_fully_drained(), "no FIN queued yet");
    }

    #[test]
    fn echo_fin_on_drain_follows_peer_fin() {
        let mut record = StreamRecord::new(StreamId::from(0), StreamClass::RawEcho);
        record.push(b"hi");
        record.advance(2);
        record.set_fin_received();
        record.echo_fin_on_drain();
        assert!(record.is_fully_drained());
    }
}
