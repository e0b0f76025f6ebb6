//! A deliberately small QPACK (RFC 9204) codec.
//!
//! This server never inserts into the dynamic table (`qpack_max_dtable_capacity`
//! is advertised in SETTINGS but never used for encoding), so every
//! field section this server *produces* fits in a zero-length encoder-stream,
//! zero-`Required Insert Count` prefix followed by literal field lines.
//!
//! Decoding inbound field sections additionally supports indexed and
//! name-referenced static-table field lines (RFC 9204 Appendix A), since real
//! clients reference `:method`/`:scheme`/`:status` by index rather than
//! spelling them out. Huffman-coded strings are intentionally not supported —
//! see `DESIGN.md` — and are reported as `QpackError::Huffman` rather than
//! silently misdecoded.

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::wire::{VarInt, VarIntUnexpectedEnd};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QpackError {
    #[error("unexpected end of field section")]
    UnexpectedEnd,
    #[error("huffman-coded strings are not supported by this server")]
    Huffman,
    #[error("reference to the dynamic table, which this server never populates")]
    DynamicTableReference,
    #[error("static table index {0} out of range")]
    StaticTableIndex(u64),
    #[error("invalid header name or value")]
    InvalidField,
}

impl From<VarIntUnexpectedEnd> for QpackError {
    fn from(_: VarIntUnexpectedEnd) -> Self {
        QpackError::UnexpectedEnd
    }
}

/// A decoded or to-be-encoded header field.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub value: String,
}

impl Field {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// RFC 9204 Appendix A: the QPACK static table, indexed from 0.
pub const STATIC_TABLE: &[(&str, &str)] = &[
    (":authority", ""),
    (":path", "/"),
    ("age", "0"),
    ("content-disposition", ""),
    ("content-length", "0"),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("referer", ""),
    ("set-cookie", ""),
    (":method", "CONNECT"),
    (":method", "DELETE"),
    (":method", "GET"),
    (":method", "HEAD"),
    (":method", "OPTIONS"),
    (":method", "POST"),
    (":method", "PUT"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "103"),
    (":status", "200"),
    (":status", "304"),
    (":status", "404"),
    (":status", "503"),
    ("accept", "*/*"),
    ("accept", "application/dns-message"),
    ("accept-encoding", "gzip, deflate, br"),
    ("accept-ranges", "bytes"),
    ("access-control-allow-headers", "cache-control"),
    ("access-control-allow-headers", "content-type"),
    ("access-control-allow-origin", "*"),
    ("cache-control", "max-age=0"),
    ("cache-control", "max-age=2592000"),
    ("cache-control", "max-age=604800"),
    ("cache-control", "no-cache"),
    ("cache-control", "no-store"),
    ("cache-control", "public, max-age=31536000"),
    ("content-encoding", "br"),
    ("content-encoding", "gzip"),
    ("content-type", "application/dns-message"),
    ("content-type", "application/javascript"),
    ("content-type", "application/json"),
    ("content-type", "application/x-www-form-urlencoded"),
    ("content-type", "image/gif"),
    ("content-type", "image/jpeg"),
    ("content-type", "image/png"),
    ("content-type", "text/css"),
    ("content-type", "text/html; charset=utf-8"),
    ("content-type", "text/plain"),
    ("content-type", "text/plain;charset=utf-8"),
    ("range", "bytes=0-"),
    ("strict-transport-security", "max-age=31536000"),
    (
        "strict-transport-security",
        "max-age=31536000; includesubdomains",
    ),
    (
        "strict-transport-security",
        "max-age=31536000; includesubdomains; preload",
    ),
    ("vary", "accept-encoding"),
    ("vary", "origin"),
    ("x-content-type-options", "nosniff"),
    ("x-xss-protection", "1; mode=block"),
    (":status", "100"),
    (":status", "204"),
    (":status", "206"),
    (":status", "302"),
    (":status", "400"),
    (":status", "403"),
    (":status", "421"),
    (":status", "425"),
    (":status", "500"),
    ("accept-language", ""),
    ("access-control-allow-credentials", "FALSE"),
    ("access-control-allow-credentials", "TRUE"),
    ("access-control-allow-headers", "*"),
    ("access-control-allow-methods", "get"),
    ("access-control-allow-methods", "get, post, options"),
    ("access-control-allow-methods", "options"),
    ("access-control-expose-headers", "content-length"),
    ("access-control-request-headers", "content-type"),
    ("access-control-request-method", "get"),
    ("access-control-request-method", "post"),
    ("alt-svc", "clear"),
    ("authorization", ""),
    (
        "content-security-policy",
        "script-src 'none'; object-src 'none'; base-uri 'none'",
    ),
    ("early-data", "1"),
    ("expect-ct", ""),
    ("forwarded", ""),
    ("if-range", ""),
    ("origin", ""),
    ("purpose", "prefetch"),
    ("server", ""),
    ("timing-allow-origin", "*"),
    ("upgrade-insecure-requests", "1"),
    ("user-agent", ""),
    ("x-forwarded-for", ""),
    ("x-frame-options", "deny"),
    ("x-frame-options", "sameorigin"),
];

fn static_lookup(index: u64) -> Result<(&'static str, &'static str), QpackError> {
    STATIC_TABLE
        .get(index as usize)
        .copied()
        .ok_or(QpackError::StaticTableIndex(index))
}

/// Read an N-bit prefix integer (RFC 7541 §5.1 / RFC 9204 §4.1.1) out of `buf`,
/// given that the first byte's low `prefix_bits` bits hold the initial value.
fn decode_prefix_int<B: Buf>(buf: &mut B, prefix_bits: u8) -> Result<u64, QpackError> {
    if !buf.has_remaining() {
        return Err(QpackError::UnexpectedEnd);
    }
    let mask = (1u8 << prefix_bits) - 1;
    let first = buf.get_u8();
    let mut value = (first & mask) as u64;
    if value < mask as u64 {
        return Ok(value);
    }

    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(QpackError::UnexpectedEnd);
        }
        let byte = buf.get_u8();
        value += ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn encode_prefix_int<B: BufMut>(buf: &mut B, prefix_bits: u8, top_bits: u8, value: u64) {
    let mask = (1u8 << prefix_bits) - 1;
    if value < mask as u64 {
        buf.put_u8(top_bits | value as u8);
        return;
    }

    buf.put_u8(top_bits | mask);
    let mut remaining = value - mask as u64;
    while remaining >= 0x80 {
        buf.put_u8(((remaining & 0x7f) | 0x80) as u8);
        remaining >>= 7;
    }
    buf.put_u8(remaining as u8);
}

fn decode_string<B: Buf>(buf: &mut B) -> Result<String, QpackError> {
    if !buf.has_remaining() {
        return Err(QpackError::UnexpectedEnd);
    }
    let huffman = buf.chunk()[0] & 0x80 != 0;
    let len = decode_prefix_int(buf, 7)? as usize;
    if huffman {
        return Err(QpackError::Huffman);
    }
    if buf.remaining() < len {
        return Err(QpackError::UnexpectedEnd);
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw).map_err(|_| QpackError::InvalidField)
}

fn encode_string<B: BufMut>(buf: &mut B, s: &str) {
    // H=0: never Huffman-code our own output, so every compliant decoder can read it.
    encode_prefix_int(buf, 7, 0x00, s.len() as u64);
    buf.put_slice(s.as_bytes());
}

/// Decode a field section with Required Insert Count = 0 (RFC 9204 §4.5).
pub fn decode_field_section(mut buf: &[u8]) -> Result<Vec<Field>, QpackError> {
    let required_insert_count = decode_prefix_int(&mut buf, 8)?;
    if required_insert_count != 0 {
        return Err(QpackError::DynamicTableReference);
    }
    // Sign bit + Delta Base, 7-bit prefix; Base must be 0 since RIC is 0.
    let sign_and_base = decode_prefix_int(&mut buf, 7)?;
    if sign_and_base != 0 {
        return Err(QpackError::DynamicTableReference);
    }

    let mut fields = Vec::new();
    while buf.has_remaining() {
        let first = buf.chunk()[0];
        if first & 0x80 != 0 {
            // Indexed Field Line: 1 T ixxxxxx
            if first & 0x40 == 0 {
                return Err(QpackError::DynamicTableReference);
            }
            let index = decode_prefix_int(&mut buf, 6)?;
            let (name, value) = static_lookup(index)?;
            fields.push(Field::new(name, value));
        } else if first & 0x40 != 0 {
            // Literal Field Line With Name Reference: 01 N T ixxxx
            let static_ref = first & 0x10 != 0;
            let index = decode_prefix_int(&mut buf, 4)?;
            if !static_ref {
                return Err(QpackError::DynamicTableReference);
            }
            let (name, _) = static_lookup(index)?;
            let value = decode_string(&mut buf)?;
            fields.push(Field::new(name, value));
        } else if first & 0x20 != 0 {
            // Literal Field Line With Literal Name: 001 N H len
            if first & 0x08 != 0 {
                return Err(QpackError::Huffman);
            }
            let name_len = decode_prefix_int(&mut buf, 3)? as usize;
            if buf.remaining() < name_len {
                return Err(QpackError::UnexpectedEnd);
            }
            let mut name = vec![0u8; name_len];
            buf.copy_to_slice(&mut name);
            let name = String::from_utf8(name).map_err(|_| QpackError::InvalidField)?;
            let value = decode_string(&mut buf)?;
            fields.push(Field::new(name, value));
        } else {
            // Indexed/Literal with Post-Base Index reference the dynamic table.
            return Err(QpackError::DynamicTableReference);
        }
    }

    Ok(fields)
}

/// Encode a field section using only literal-with-literal-name instructions.
pub fn encode_field_section<B: BufMut>(buf: &mut B, fields: &[Field]) {
    // Required Insert Count = 0, Sign+Delta Base = 0.
    buf.put_u8(0);
    buf.put_u8(0);

    for field in fields {
        // 001 N=0 H=0, then 3-bit name length prefix.
        encode_prefix_int(buf, 3, 0x20, field.name.len() as u64);
        buf.put_slice(field.name.as_bytes());
        encode_string(buf, &field.value);
    }
}

pub fn varint_len(v: u64) -> usize {
    VarInt::try_from_u64(v).map(|v| v.size()).unwrap_or(8)
}

/// Convenience: fetch a pseudo-header's value from a decoded field section.
pub fn find<'a>(fields: &'a [Field], name: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|f| f.name.eq_ignore_ascii_case(name))
        .map(|f| f.value.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_literal_fields() {
        let fields = vec![
            Field::new(":method", "CONNECT"),
            Field::new(":protocol", "webtransport"),
            Field::new(":path", "/session"),
        ];

        let mut buf = Vec::new();
        encode_field_section(&mut buf, &fields);

        let decoded = decode_field_section(&buf).unwrap();
        assert_eq!(decoded.len(), fields.len());
        for (a, b) in fields.iter().zip(decoded.iter()) {
            assert_eq!(a.name, b.name);
            assert_eq!(a.value, b.value);
        }
    }

    #[test]
    fn decode_indexed_static_entry() {
        // Required Insert Count=0, Delta Base=0, then Indexed Field Line for
        // static index 17 (":method" "GET"): 1 1 010001.
        let buf = [0x00u8, 0x00, 0b1100_0000 | 17];
        let decoded = decode_field_section(&buf).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].name, ":method");
        assert_eq!(decoded[0].value, "GET");
    }

    #[test]
    fn decode_rejects_dynamic_table_reference() {
        // Indexed Field Line, T=0 (dynamic table).
        let buf = [0x00u8, 0x00, 0b1000_0000];
        assert_eq!(
            decode_field_section(&buf),
            Err(QpackError::DynamicTableReference)
        );
    }

    #[test]
    fn decode_rejects_nonzero_required_insert_count() {
        let buf = [0x05u8, 0x00];
        assert_eq!(
            decode_field_section(&buf),
            Err(QpackError::DynamicTableReference)
        );
    }

    #[test]
    fn decode_rejects_huffman_strings() {
        let mut buf = vec![0x00u8, 0x00];
        // Literal Field Line With Literal Name, H=1 on the name.
        buf.push(0b0010_1000 | 3);
        buf.extend_from_slice(b"foo");
        let err = decode_field_section(&buf).unwrap_err();
        assert_eq!(err, QpackError::Huffman);
    }

    #[test]
    fn prefix_int_roundtrip_large_value() {
        let mut buf = Vec::new();
        encode_prefix_int(&mut buf, 5, 0xA0, 1_000_000);
        let decoded = decode_prefix_int(&mut &buf[..], 5).unwrap();
        assert_eq!(decoded, 1_000_000);
    }

    #[test]
    fn find_looks_up_case_insensitively() {
        let fields = vec![Field::new(":Method", "GET")];
        assert_eq!(find(&fields, ":method"), Some("GET"));
    }
}
