//! Entry point: initializes logging and runs the server until killed.
//!
//! Bind address defaults to `0.0.0.0:4433`; override with the
//! `QUIC_ECHO_BIND` environment variable.

use std::net::SocketAddr;

const DEFAULT_BIND: &str = "0.0.0.0:4433";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let bind = std::env::var("QUIC_ECHO_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string());
    let addr: SocketAddr = match bind.parse() {
        Ok(addr) => addr,
        Err(err) => {
            tracing::error!(%bind, %err, "invalid QUIC_ECHO_BIND address");
            std::process::exit(1);
        }
    };

    if let Err(err) = quic_echo_server::run(addr).await {
        tracing::error!(%err, "server failed to start");
        std::process::exit(1);
    }
}
