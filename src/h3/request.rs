//! Plain (non-CONNECT) HTTP/3 requests: `GET /`, `GET
//! /.well-known/webtransport`, any other `GET`, and anything else.

use crate::qpack::{self, Field};
use crate::wire::{encode_frame_header, Frame};

/// A response this server will serialize as a HEADERS frame. Responses in
/// this server are header-only; no chunked body frames are ever produced.
pub struct Response {
    pub status: u16,
    pub headers: Vec<Field>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push(Field::new(name, value));
        self
    }

    /// Serialize as a complete HEADERS frame: `:status` first, then the
    /// extra headers in insertion order.
    pub fn encode_headers_frame(&self) -> Vec<u8> {
        let mut fields = vec![Field::new(":status", self.status.to_string())];
        fields.extend(self.headers.iter().cloned());

        let mut payload = Vec::new();
        qpack::encode_field_section(&mut payload, &fields);

        let mut frame = Vec::new();
        encode_frame_header(&mut frame, Frame::HEADERS, payload.len());
        frame.extend_from_slice(&payload);
        frame
    }
}

/// Dispatch a plain (non-CONNECT) request by method and path.
pub fn dispatch_request(method: &str, path: &str) -> Response {
    if method != "GET" {
        return Response::new(405);
    }

    match path {
        "/" | "/.well-known/webtransport" => Response::new(200).header("content-type", "text/plain"),
        _ => Response::new(404),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_root_is_200() {
        let resp = dispatch_request("GET", "/");
        assert_eq!(resp.status, 200);
    }

    #[test]
    fn get_well_known_webtransport_is_200() {
        let resp = dispatch_request("GET", "/.well-known/webtransport");
        assert_eq!(resp.status, 200);
    }

    #[test]
    fn get_missing_path_is_404() {
        let resp = dispatch_request("GET", "/missing");
        assert_eq!(resp.status, 404);
    }

    #[test]
    fn non_get_method_is_405() {
        let resp = dispatch_request("POST", "/");
        assert_eq!(resp.status, 405);
    }

    #[test]
    fn encoded_frame_roundtrips_through_qpack() {
        let resp = Response::new(200).header("content-type", "text/plain");
        let frame = resp.encode_headers_frame();

        let (typ, len, header_len) = crate::wire::peek_frame_header(&frame.as_slice()).unwrap();
        assert_eq!(typ, Frame::HEADERS);

        let fields = qpack::decode_field_section(&frame[header_len..header_len + len as usize]).unwrap();
        assert_eq!(qpack::find(&fields, ":status"), Some("200"));
        assert_eq!(qpack::find(&fields, "content-type"), Some("text/plain"));
    }
}
