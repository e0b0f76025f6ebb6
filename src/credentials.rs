//! Certificate/key loading and ALPN selection.
//!
//! Grounded on `ez::tls::StaticCertHook`: a `tokio_quiche::quic::ConnectionHook`
//! that builds a `boring::ssl::SslContextBuilder` once and hands it back for
//! every accepted connection. Rather than loading a caller-supplied DER
//! chain from disk, this crate generates its own self-signed chain with
//! `rcgen` at startup, since it has no build step that could produce
//! embeddable DER bytes ahead of time.

use boring::ec::EcKey;
use boring::pkey::{PKey, Private};
use boring::ssl::{AlpnError, SslContextBuilder, SslMethod};
use boring::x509::X509;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;
use tokio_quiche::quic::ConnectionHook;
use tokio_quiche::settings::TlsCertificatePaths;

/// ALPN preference order this server advertises: HTTP/3 first, then the raw
/// echo protocol.
pub const ALPN_PREFERENCE: [&[u8]; 2] = [b"h3", b"echo"];

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("failed to generate self-signed certificate: {0}")]
    Generate(#[from] rcgen::Error),
    #[error("generated key could not be parsed as PKCS#8: {0}")]
    Key(String),
}

pub struct Credentials {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl Credentials {
    /// Generate a self-signed ECDSA P-256 leaf certificate, valid for 14 days,
    /// the same shape `gen-cert` (`src/bin/gen_cert.rs`) writes to disk.
    pub fn generate(subject_alt_names: Vec<String>) -> Result<Self, CredentialError> {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(subject_alt_names)?;

        let chain = vec![CertificateDer::from(cert.der().to_vec())];
        let key = PrivateKeyDer::try_from(key_pair.serialize_der())
            .map_err(|err| CredentialError::Key(err.to_string()))?;

        Ok(Self { chain, key })
    }

    pub fn sha256_fingerprint(&self) -> String {
        use boring::hash::{hash, MessageDigest};
        let digest = hash(MessageDigest::sha256(), self.chain[0].as_ref())
            .expect("BoringSSL digest failure");
        base64_encode(&digest)
    }
}

fn base64_encode(bytes: &[u8]) -> String {
    const ALPHABET: &[u8; 64] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::with_capacity((bytes.len() + 2) / 3 * 4);
    for chunk in bytes.chunks(3) {
        let b0 = chunk[0];
        let b1 = chunk.get(1).copied();
        let b2 = chunk.get(2).copied();

        out.push(ALPHABET[(b0 >> 2) as usize] as char);
        out.push(ALPHABET[(((b0 & 0x03) << 4) | (b1.unwrap_or(0) >> 4)) as usize] as char);
        out.push(match b1 {
            Some(b1) => ALPHABET[(((b1 & 0x0f) << 2) | (b2.unwrap_or(0) >> 6)) as usize] as char,
            None => '=',
        });
        out.push(match b2 {
            Some(b2) => ALPHABET[(b2 & 0x3f) as usize] as char,
            None => '=',
        });
    }
    out
}

fn der_to_boring_key(key: &PrivateKeyDer) -> Result<PKey<Private>, boring::error::ErrorStack> {
    match key {
        PrivateKeyDer::Pkcs8(d) => PKey::private_key_from_der(d.secret_pkcs8_der()),
        PrivateKeyDer::Sec1(d) => Ok(PKey::from_ec_key(EcKey::private_key_from_der(
            d.secret_sec1_der(),
        )?)?),
        _ => {
            tracing::warn!("unsupported private key format");
            Err(PKey::<Private>::private_key_from_der(&[]).unwrap_err())
        }
    }
}

/// Select the first server-preferred ALPN protocol the client also offers.
/// `client` is the wire-format ALPN extension: a sequence of length-prefixed
/// protocol names.
fn alpn_select<'a>(server: &[&[u8]], client: &'a [u8]) -> Option<&'a [u8]> {
    for server_proto in server {
        let mut rest = client;
        while !rest.is_empty() {
            let len = rest[0] as usize;
            if len == 0 || 1 + len > rest.len() {
                break;
            }
            let proto = &rest[1..1 + len];
            rest = &rest[1 + len..];
            if proto == *server_proto {
                return Some(proto);
            }
        }
    }
    None
}

/// The `ConnectionHook` this server installs: one static certificate, one
/// fixed ALPN preference list. Rejecting a connection whose ALPN doesn't
/// overlap our list is a fatal TLS alert, handled by returning
/// `AlpnError::NOACK` from the callback quiche/boring invokes.
pub struct CredentialHook {
    pub credentials: Credentials,
}

impl ConnectionHook for CredentialHook {
    fn create_custom_ssl_context_builder(
        &self,
        _settings: TlsCertificatePaths<'_>,
    ) -> Option<SslContextBuilder> {
        let mut builder = SslContextBuilder::new(SslMethod::tls())
            .inspect_err(|err| tracing::error!(%err, "failed to create SSL context"))
            .ok()?;

        let leaf = X509::from_der(self.credentials.chain.first()?.as_ref())
            .inspect_err(|err| tracing::error!(%err, "failed to parse leaf certificate DER"))
            .ok()?;
        builder
            .set_certificate(&leaf)
            .inspect_err(|err| tracing::error!(%err, "failed to set leaf certificate"))
            .ok()?;

        let key = der_to_boring_key(&self.credentials.key)
            .inspect_err(|err| tracing::error!(%err, "failed to parse private key"))
            .ok()?;
        builder
            .set_private_key(&key)
            .inspect_err(|err| tracing::error!(%err, "failed to set private key"))
            .ok()?;

        builder.set_alpn_select_callback(move |_, client| {
            alpn_select(&ALPN_PREFERENCE, client).ok_or(AlpnError::NOACK)
        });

        Some(builder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpn_select_prefers_h3_over_echo() {
        // wire format: len-prefixed strings "echo" then "h3"
        let client = b"\x04echo\x02h3";
        assert_eq!(alpn_select(&ALPN_PREFERENCE, client), Some(&b"h3"[..]));
    }

    #[test]
    fn alpn_select_falls_back_to_echo() {
        let client = b"\x04echo";
        assert_eq!(alpn_select(&ALPN_PREFERENCE, client), Some(&b"echo"[..]));
    }

    #[test]
    fn alpn_select_rejects_unknown_protocol() {
        let client = b"\x02h2";
        assert_eq!(alpn_select(&ALPN_PREFERENCE, client), None);
    }

    #[test]
    fn generated_credentials_roundtrip_fingerprint() {
        let creds = Credentials::generate(vec!["localhost".into()]).unwrap();
        let fp = creds.sha256_fingerprint();
        assert_eq!(fp.len(), 44); // 32 bytes base64-encoded with padding
    }
}
