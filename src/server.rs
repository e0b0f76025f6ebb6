//! Binds the UDP socket, builds the TLS/transport configuration, and drives
//! the accept loop.
//!
//! Grounded on `ez::server::ServerBuilder::with_bind`/`build_with_hook` and
//! `Server::run_socket`, collapsed out of the typestate builder: this crate
//! always has exactly one listener and one fixed credential, so there is no
//! multi-listener/multi-cert-resolver configurability to preserve.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinSet;
use tokio_quiche::quic::SimpleConnectionIdGenerator;
use tokio_quiche::settings::{CertificateKind, Hooks, QuicSettings, TlsCertificatePaths};
use tokio_quiche::socket::{QuicListener, SocketCapabilities};

use crate::credentials::{CredentialError, CredentialHook, Credentials};
use crate::driver::EchoDriver;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to generate TLS credentials: {0}")]
    Credentials(#[from] CredentialError),
    #[error("socket setup failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Transport parameters this server advertises on every connection: generous
/// per-stream and connection flow-control windows, room for 100
/// peer-initiated bidi streams and 10 uni streams, a 30s idle timeout, and
/// datagram support sized for the largest QUIC packet.
fn quic_settings() -> QuicSettings {
    let mut settings = QuicSettings::default();
    settings.max_idle_timeout = Some(Duration::from_secs(30));
    settings.initial_max_data = 1024 * 1024;
    settings.initial_max_stream_data_bidi_local = 256 * 1024;
    settings.initial_max_stream_data_bidi_remote = 256 * 1024;
    settings.initial_max_stream_data_uni = 256 * 1024;
    settings.initial_max_streams_bidi = 100;
    settings.initial_max_streams_uni = 10;
    settings.active_connection_id_limit = 7;
    settings
}

/// Bind `addr` and run the accept loop until the process is killed. Each
/// accepted connection gets its own `EchoDriver`, independent of every other;
/// there is deliberately no cross-connection shared state.
pub async fn run(addr: SocketAddr) -> Result<(), ServerError> {
    let credentials = Credentials::generate(vec!["localhost".to_string()])?;
    tracing::info!(fingerprint = %credentials.sha256_fingerprint(), "generated self-signed certificate");

    let socket = std::net::UdpSocket::bind(addr)?;
    socket.set_nonblocking(true)?;
    let socket = tokio::net::UdpSocket::from_std(socket)?;

    #[cfg(target_os = "linux")]
    let capabilities = SocketCapabilities::apply_all_and_get_compatibility(&socket);
    #[cfg(not(target_os = "linux"))]
    let capabilities = SocketCapabilities::default();

    let listener = QuicListener {
        socket,
        socket_cookie: 0,
        capabilities,
    };

    let hook = CredentialHook { credentials };
    let hooks = Hooks {
        connection_hook: Some(Arc::new(hook)),
    };

    // `ConnectionHook::create_custom_ssl_context_builder` replaces this with
    // our own self-signed chain; the paths below are never read from disk.
    let dummy_tls = TlsCertificatePaths {
        cert: "",
        private_key: "",
        kind: CertificateKind::X509,
    };

    let params = tokio_quiche::ConnectionParams::new_server(quic_settings(), dummy_tls, hooks);
    let sockets = tokio_quiche::listen_with_capabilities(
        vec![listener],
        params,
        SimpleConnectionIdGenerator,
        tokio_quiche::metrics::DefaultMetrics,
    )?;

    tracing::info!(%addr, "listening");

    let mut tasks = JoinSet::new();
    for socket in sockets {
        tasks.spawn(run_socket(socket));
    }

    while let Some(result) = tasks.join_next().await {
        if let Err(err) = result.map_err(std::io::Error::other).and_then(|r| r) {
            tracing::error!(%err, "listener task failed");
        }
    }

    Ok(())
}

async fn run_socket(
    socket: tokio_quiche::QuicConnectionStream<tokio_quiche::metrics::DefaultMetrics>,
) -> std::io::Result<()> {
    let mut rx = socket.into_inner();
    while let Some(initial) = rx.recv().await {
        let initial = initial?;
        // `start` hands the driver to tokio-quiche's own connection task;
        // unlike `ez::server::Server`, nothing here needs a handle back to
        // the running connection, so the returned value is discarded.
        let _ = initial.start(EchoDriver::new());
    }
    Ok(())
}
