//! Sidecar tool: generate a self-signed ECDSA P-256 certificate/key pair and
//! write them to disk, for callers that want to pin the fingerprint (e.g. a
//! WebTransport client using `serverCertificateHashes`) across restarts
//! instead of trusting a freshly generated one every time the server starts.

use std::io::Write;

use quic_echo_server::credentials::Credentials;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let cert_path = args.next().unwrap_or_else(|| "cert.der".to_string());
    let key_path = args.next().unwrap_or_else(|| "key.der".to_string());

    let credentials = match Credentials::generate(vec!["localhost".to_string()]) {
        Ok(c) => c,
        Err(err) => {
            eprintln!("failed to generate credentials: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = write_file(&cert_path, credentials.chain[0].as_ref()) {
        eprintln!("failed to write {cert_path}: {err}");
        std::process::exit(1);
    }
    if let Err(err) = write_file(&key_path, credentials.key.secret_der()) {
        eprintln!("failed to write {key_path}: {err}");
        std::process::exit(1);
    }

    println!("wrote {cert_path} and {key_path}");
    println!("sha256 fingerprint: {}", credentials.sha256_fingerprint());
}

fn write_file(path: &str, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    file.write_all(bytes)
}
