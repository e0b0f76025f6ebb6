//! A single-connection QUIC echo / HTTP-3 / WebTransport server.
//!
//! `server` binds the listener and wires up TLS credentials; `driver`
//! implements the per-connection QUIC/H3 callback surface; everything else is
//! support code shared between the two.

pub mod capsule;
pub mod clock;
pub mod connection;
pub mod credentials;
pub mod driver;
pub mod entropy;
pub mod h3;
pub mod qpack;
pub mod server;
pub mod stream;
pub mod wire;
pub mod write_engine;

pub use driver::EchoDriver;
pub use server::{run, ServerError};
