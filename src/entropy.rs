//! Cryptographically strong randomness for trace IDs and diagnostics.
//!
//! Connection ID generation and stateless-reset token derivation are handled
//! internally by `tokio-quiche`'s `SimpleConnectionIdGenerator` (see
//! `server.rs`); this module exists for the randomness this crate itself
//! needs — currently, per-connection trace identifiers used in logging so a
//! single connection's log lines can be correlated without exposing its CID.

use boring::rand::rand_bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId([u8; 8]);

impl TraceId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 8];
        rand_bytes(&mut bytes).expect("BoringSSL RNG failure");
        Self(bytes)
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_ids_are_distinct() {
        let a = TraceId::generate();
        let b = TraceId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn display_is_16_hex_chars() {
        let id = TraceId::generate();
        assert_eq!(format!("{id}").len(), 16);
    }
}
